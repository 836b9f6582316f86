/// Persistent backend stored in a sled DB
use super::{AppendBuilder, Backend, CasResult, Change, WATCH_CAPACITY};
use crate::error::{storage_error, Result, SyncError};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Changes are published in-process only; sled allows a single process per DB.
#[derive(Clone)]
pub struct SledBackend {
    db: sled::Db,
    changes: broadcast::Sender<Change>,
    /// Held from id allocation until an appended entry is published
    appends: Arc<Mutex<()>>,
}

impl SledBackend {
    /// Open (or create) the store in `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("chatsync.db");
        debug!("Opening chat store at {:?}", db_path);

        let db = sled::open(&db_path).map_err(|e| storage_error("open chat store", e))?;

        info!("Chat store initialized at {:?}", db_path);
        Ok(Self::from_db(db))
    }

    /// Throwaway store, removed when dropped
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| storage_error("open temporary store", e))?;
        Ok(Self::from_db(db))
    }

    fn from_db(db: sled::Db) -> Self {
        let (changes, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            db,
            changes,
            appends: Arc::new(Mutex::new(())),
        }
    }

    fn append_lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.appends
            .lock()
            .map_err(|_| SyncError::PermanentUpstream("append lock poisoned".to_string()))
    }

    fn generate_id(&self) -> Result<u64> {
        // sled ids start at 0; keep 0 free as "no message"
        self.db
            .generate_id()
            .map(|id| id + 1)
            .map_err(|e| storage_error("generate_id", e))
    }

    /// Approximate size of the store on disk
    pub fn size_bytes(&self) -> Result<u64> {
        self.db
            .size_on_disk()
            .map_err(|e| storage_error("size_on_disk", e))
    }

    fn publish(&self, key: &str, value: Option<Vec<u8>>) {
        let _ = self.changes.send(Change {
            key: key.to_string(),
            value,
        });
    }
}

fn decode_entry(entry: sled::Result<(sled::IVec, sled::IVec)>) -> Result<(String, Vec<u8>)> {
    let (key, value) = entry.map_err(|e| storage_error("scan", e))?;
    Ok((String::from_utf8_lossy(&key).into_owned(), value.to_vec()))
}

impl Backend for SledBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .db
            .get(key.as_bytes())
            .map_err(|e| storage_error("get", e))?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.db
            .insert(key.as_bytes(), value.clone())
            .map_err(|e| storage_error("put", e))?;
        self.db.flush().map_err(|e| storage_error("flush", e))?;
        self.publish(key, Some(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let removed = self
            .db
            .remove(key.as_bytes())
            .map_err(|e| storage_error("remove", e))?;
        if removed.is_some() {
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
        let outcome = self
            .db
            .compare_and_swap(key.as_bytes(), expected, Some(new.clone()))
            .map_err(|e| storage_error("compare_and_swap", e))?;
        match outcome {
            Ok(()) => {
                self.db.flush().map_err(|e| storage_error("flush", e))?;
                self.publish(key, Some(new));
                Ok(Ok(()))
            }
            Err(conflict) => Ok(Err(conflict.current.map(|v| v.to_vec()))),
        }
    }

    fn next_id(&self) -> Result<u64> {
        let _appending = self.append_lock()?;
        self.generate_id()
    }

    fn append(&self, prefix: &str, build: &mut AppendBuilder<'_>) -> Result<u64> {
        let _appending = self.append_lock()?;
        let id = self.generate_id()?;
        let last = match self.db.scan_prefix(prefix.as_bytes()).next_back() {
            Some(entry) => Some(decode_entry(entry)?.1),
            None => None,
        };

        let (key, value) = build(id, last.as_deref())?;
        self.db
            .insert(key.as_bytes(), value.clone())
            .map_err(|e| storage_error("append", e))?;
        self.db.flush().map_err(|e| storage_error("flush", e))?;
        self.publish(&key, Some(value));
        Ok(id)
    }

    fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        match after {
            Some(a) if a >= prefix => {
                let iter = self
                    .db
                    .range::<&[u8], _>((
                        std::ops::Bound::Excluded(a.as_bytes()),
                        std::ops::Bound::Unbounded,
                    ));
                for entry in iter {
                    let (key, value) = decode_entry(entry)?;
                    if !key.starts_with(prefix) || out.len() >= limit {
                        break;
                    }
                    out.push((key, value));
                }
            }
            _ => {
                for entry in self.db.scan_prefix(prefix.as_bytes()) {
                    if out.len() >= limit {
                        break;
                    }
                    out.push(decode_entry(entry)?);
                }
            }
        }
        Ok(out)
    }

    fn scan_last(&self, prefix: &str, n: usize) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()).rev() {
            if out.len() >= n {
                break;
            }
            out.push(decode_entry(entry)?);
        }
        out.reverse();
        Ok(out)
    }

    fn watch(&self) -> Result<broadcast::Receiver<Change>> {
        Ok(self.changes.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sled_basic() {
        let temp_dir = TempDir::new().unwrap();
        let backend = SledBackend::open(temp_dir.path()).unwrap();

        backend.put("rooms/r1", b"room".to_vec()).unwrap();
        assert_eq!(backend.get("rooms/r1").unwrap(), Some(b"room".to_vec()));
        assert_eq!(backend.get("missing").unwrap(), None);

        backend.remove("rooms/r1").unwrap();
        assert!(backend.get("rooms/r1").unwrap().is_none());
    }

    #[test]
    fn test_sled_scan() {
        let backend = SledBackend::temporary().unwrap();
        for i in 1..=5u64 {
            backend
                .put(&format!("m/{:020}", i), i.to_string().into_bytes())
                .unwrap();
        }
        backend.put("n/1", b"other".to_vec()).unwrap();

        let page = backend
            .scan("m/", Some(&format!("m/{:020}", 2)), Some(2))
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].1, b"3".to_vec());
        assert_eq!(page[1].1, b"4".to_vec());

        let last = backend.scan_last("m/", 2).unwrap();
        assert_eq!(last[0].1, b"4".to_vec());
        assert_eq!(last[1].1, b"5".to_vec());
    }

    #[test]
    fn test_sled_compare_and_swap() {
        let backend = SledBackend::temporary().unwrap();
        assert!(backend.compare_and_swap("k", None, b"a".to_vec()).unwrap().is_ok());
        let lost = backend.compare_and_swap("k", None, b"b".to_vec()).unwrap();
        assert_eq!(lost, Err(Some(b"a".to_vec())));
    }

    #[test]
    fn test_sled_append_is_ordered_and_published() {
        let backend = SledBackend::temporary().unwrap();
        let mut rx = backend.watch().unwrap();

        let mut ids = Vec::new();
        for text in ["one", "two"] {
            let id = backend
                .append("m/", &mut |id, last| {
                    let expected = if text == "one" { None } else { Some(&b"one"[..]) };
                    assert_eq!(last, expected);
                    Ok((format!("m/{:020}", id), text.as_bytes().to_vec()))
                })
                .unwrap();
            ids.push(id);
        }
        assert!(ids[0] < ids[1]);

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.key, format!("m/{:020}", ids[0]));
        assert_eq!(second.value, Some(b"two".to_vec()));
    }

    #[test]
    fn test_sled_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let first_id = {
            let backend = SledBackend::open(temp_dir.path()).unwrap();
            backend.put("users/u1", b"alice".to_vec()).unwrap();
            backend.next_id().unwrap()
        };

        // Drop and reload
        let backend = SledBackend::open(temp_dir.path()).unwrap();
        assert_eq!(backend.get("users/u1").unwrap(), Some(b"alice".to_vec()));
        assert!(backend.next_id().unwrap() > first_id);
    }
}
