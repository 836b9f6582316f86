/// In-memory backend, also used to simulate an unreliable upstream in tests
use super::{AppendBuilder, Backend, CasResult, Change, WATCH_CAPACITY};
use crate::error::{Result, SyncError};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

pub struct MemoryBackend {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    next_id: AtomicU64,
    offline: AtomicBool,
    changes: RwLock<broadcast::Sender<Change>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            data: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            offline: AtomicBool::new(false),
            changes: RwLock::new(tx),
        }
    }

    /// While offline every call fails with a transient error
    pub fn set_offline(&self, offline: bool) {
        debug!("Memory backend offline={}", offline);
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Close every open watch, as a dropped connection would
    pub fn drop_watchers(&self) {
        let (tx, _) = broadcast::channel(WATCH_CAPACITY);
        if let Ok(mut changes) = self.changes.write() {
            *changes = tx;
        }
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::TransientUpstream("backend unreachable".to_string()));
        }
        Ok(())
    }

    fn publish(&self, key: &str, value: Option<Vec<u8>>) {
        if let Ok(changes) = self.changes.read() {
            // No receivers is fine
            let _ = changes.send(Change {
                key: key.to_string(),
                value,
            });
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> SyncError {
    SyncError::PermanentUpstream("memory backend lock poisoned".to_string())
}

impl Backend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_online()?;
        let data = self.data.read().map_err(|_| poisoned())?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_online()?;
        let mut data = self.data.write().map_err(|_| poisoned())?;
        data.insert(key.to_string(), value.clone());
        // Publish while holding the write lock so watchers see commit order
        self.publish(key, Some(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.check_online()?;
        let mut data = self.data.write().map_err(|_| poisoned())?;
        if data.remove(key).is_some() {
            self.publish(key, None);
        }
        Ok(())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
    ) -> Result<CasResult> {
        self.check_online()?;
        let mut data = self.data.write().map_err(|_| poisoned())?;
        let current = data.get(key).map(|v| v.as_slice());
        if current != expected {
            return Ok(Err(current.map(|v| v.to_vec())));
        }
        data.insert(key.to_string(), new.clone());
        self.publish(key, Some(new));
        Ok(Ok(()))
    }

    fn next_id(&self) -> Result<u64> {
        self.check_online()?;
        // Wait out any append that already holds a lower id
        let _data = self.data.write().map_err(|_| poisoned())?;
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn append(&self, prefix: &str, build: &mut AppendBuilder<'_>) -> Result<u64> {
        self.check_online()?;
        let mut data = self.data.write().map_err(|_| poisoned())?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let mut end = prefix.to_string();
        end.push(char::MAX);
        let last = data
            .range(prefix.to_string()..end)
            .next_back()
            .map(|(_, v)| v.clone());

        let (key, value) = build(id, last.as_deref())?;
        data.insert(key.clone(), value.clone());
        self.publish(&key, Some(value));
        Ok(id)
    }

    fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        self.check_online()?;
        let data = self.data.read().map_err(|_| poisoned())?;
        let start = match after {
            Some(a) if a >= prefix => Bound::Excluded(a.to_string()),
            _ => Bound::Included(prefix.to_string()),
        };
        let out = data
            .range((start, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit.unwrap_or(usize::MAX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(out)
    }

    fn scan_last(&self, prefix: &str, n: usize) -> Result<Vec<(String, Vec<u8>)>> {
        self.check_online()?;
        let data = self.data.read().map_err(|_| poisoned())?;
        let mut out: Vec<_> = data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if out.len() > n {
            out = out.split_off(out.len() - n);
        }
        Ok(out)
    }

    fn watch(&self) -> Result<broadcast::Receiver<Change>> {
        self.check_online()?;
        let changes = self.changes.read().map_err(|_| poisoned())?;
        Ok(changes.subscribe())
    }
}
