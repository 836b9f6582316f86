/// Message persistence: append-only, ordered log per room
use crate::backend::{get_json, put_json, Backend};
use crate::clock::MonotonicClock;
use crate::config::Config;
use crate::directory::RoomDirectory;
use crate::error::{Result, SyncError};
use crate::schema::{keys, Message, MessageCursor};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct MessageStore {
    backend: Arc<dyn Backend>,
    directory: RoomDirectory,
    clock: Arc<MonotonicClock>,
    preview_max_chars: usize,
    dedup_window: usize,
    page_size: usize,
    room_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    /// Summary updates that failed and still have to reach the room
    pending: Arc<Mutex<VecDeque<Message>>>,
}

fn poisoned(what: &str) -> SyncError {
    SyncError::PermanentUpstream(format!("{} lock poisoned", what))
}

impl MessageStore {
    pub fn new(
        backend: Arc<dyn Backend>,
        directory: RoomDirectory,
        clock: Arc<MonotonicClock>,
        config: &Config,
    ) -> Self {
        Self {
            backend,
            directory,
            clock,
            preview_max_chars: config.preview_max_chars,
            dedup_window: config.dedup_window,
            page_size: config.page_size,
            room_locks: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Append a message to a room.
    ///
    /// The message is persisted before this returns; the room summary is
    /// updated afterwards and retried later if that write fails. With a
    /// `client_message_id` already present among the recent messages, the
    /// earlier message is returned and nothing is written.
    pub fn append(
        &self,
        room_id: &str,
        sender_id: &str,
        text: &str,
        client_message_id: Option<&str>,
    ) -> Result<Message> {
        if text.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let room = self.directory.get_room(room_id)?;
        if !room.has_participant(sender_id) {
            return Err(SyncError::NotAParticipant {
                room_id: room_id.to_string(),
                user_id: sender_id.to_string(),
            });
        }
        let client_message_id = client_message_id.filter(|c| !c.is_empty());

        self.reconcile();
        self.clock.observe(room.last_activity_at);

        let lock = self.room_lock(room_id)?;
        let message = {
            let _guard = lock.lock().map_err(|_| poisoned("room"))?;

            if let Some(client_id) = client_message_id {
                if let Some(existing) = self.find_by_client_id(room_id, client_id)? {
                    debug!(
                        "Duplicate send {} in room {}, returning message {}",
                        client_id, room_id, existing.id
                    );
                    return Ok(existing);
                }
            }

            // Id, timestamp and write happen in one backend step, so messages
            // commit in id order with non-decreasing created_at even when
            // several engines share the backend.
            let mut stored = None;
            self.backend
                .append(&keys::messages_prefix(room_id), &mut |id, previous| {
                    if let Some(raw) = previous {
                        let previous: Message = serde_json::from_slice(raw)?;
                        self.clock.observe(previous.created_at);
                    }
                    let message = Message {
                        id,
                        room_id: room_id.to_string(),
                        sender_id: sender_id.to_string(),
                        text: text.to_string(),
                        created_at: self.clock.now_millis(),
                        client_message_id: client_message_id.map(str::to_string),
                    };
                    let raw = serde_json::to_vec(&message)?;
                    let key = keys::message(room_id, id);
                    stored = Some(message);
                    Ok((key, raw))
                })?;
            stored.ok_or_else(|| {
                SyncError::PermanentUpstream(format!("append to room {} stored nothing", room_id))
            })?
        };

        debug!("Stored message {} in room {}", message.id, room_id);
        self.publish_summary(message.clone());
        Ok(message)
    }

    /// Every message in the room, oldest first
    pub fn list_messages(&self, room_id: &str) -> Result<Vec<Message>> {
        self.directory.get_room(room_id)?;
        let mut out = Vec::new();
        for page in self.pages(room_id, self.page_size) {
            out.extend(page?);
        }
        Ok(out)
    }

    /// Lazy page-by-page history from the beginning
    pub fn pages(&self, room_id: &str, page_size: usize) -> MessagePages<'_> {
        self.pages_after(room_id, MessageCursor::START, page_size)
    }

    /// Lazy history resuming after `cursor`
    pub fn pages_after(
        &self,
        room_id: &str,
        cursor: MessageCursor,
        page_size: usize,
    ) -> MessagePages<'_> {
        MessagePages {
            store: self,
            room_id: room_id.to_string(),
            cursor,
            page_size: page_size.max(1),
            done: false,
        }
    }

    /// Up to `limit` messages with id greater than `after`
    pub fn fetch_page(
        &self,
        room_id: &str,
        after: MessageCursor,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let watermark = self.cleared_through(room_id)?;
        let after = after.0.max(watermark);
        let entries = self.backend.scan(
            &keys::messages_prefix(room_id),
            Some(&keys::message(room_id, after)),
            Some(limit),
        )?;

        let mut out = Vec::with_capacity(entries.len());
        for (_, raw) in entries {
            out.push(serde_json::from_slice::<Message>(&raw)?);
        }
        Ok(out)
    }

    /// Remove all messages of a room; the room itself stays.
    ///
    /// The clear takes effect at a watermark id: anything appended after it
    /// is kept.
    pub fn clear(&self, room_id: &str) -> Result<usize> {
        self.directory.get_room(room_id)?;
        let prefix = keys::messages_prefix(room_id);

        let lock = self.room_lock(room_id)?;
        let (watermark, removed) = {
            let _guard = lock.lock().map_err(|_| poisoned("room"))?;

            let watermark = self.backend.next_id()?;
            put_json(self.backend.as_ref(), &keys::cleared_through(room_id), &watermark)?;

            let mut removed = 0;
            'batches: loop {
                let batch = self.backend.scan(&prefix, None, Some(self.page_size))?;
                if batch.is_empty() {
                    break;
                }
                for (key, _) in batch {
                    let id = key[prefix.len()..].parse::<u64>().unwrap_or(u64::MAX);
                    if id > watermark {
                        break 'batches;
                    }
                    self.backend.remove(&key)?;
                    removed += 1;
                }
            }
            (watermark, removed)
        };

        if let Err(e) = self.directory.clear_preview(room_id, watermark) {
            warn!("Failed to reset preview of cleared room {}: {}", room_id, e);
        }

        info!("Cleared {} messages from room {}", removed, room_id);
        Ok(removed)
    }

    /// Retry summary updates that failed earlier; returns how many remain
    pub fn reconcile(&self) -> usize {
        let queued: Vec<Message> = match self.pending.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(_) => return 0,
        };
        if queued.is_empty() {
            return 0;
        }

        let mut failed = Vec::new();
        for message in queued {
            if let Err(e) = self.directory.record_message(&message, self.preview_max_chars) {
                debug!("Summary for message {} still failing: {}", message.id, e);
                failed.push(message);
            }
        }

        match self.pending.lock() {
            Ok(mut pending) => {
                pending.extend(failed);
                pending.len()
            }
            Err(_) => 0,
        }
    }

    /// Number of summary updates waiting for a retry
    pub fn pending_summaries(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn publish_summary(&self, message: Message) {
        if let Err(e) = self.directory.record_message(&message, self.preview_max_chars) {
            warn!(
                "Room summary update for message {} failed, queued for retry: {}",
                message.id, e
            );
            if let Ok(mut pending) = self.pending.lock() {
                pending.push_back(message);
            }
        }
    }

    fn cleared_through(&self, room_id: &str) -> Result<u64> {
        Ok(get_json::<u64>(self.backend.as_ref(), &keys::cleared_through(room_id))?.unwrap_or(0))
    }

    fn find_by_client_id(&self, room_id: &str, client_id: &str) -> Result<Option<Message>> {
        let recent = self
            .backend
            .scan_last(&keys::messages_prefix(room_id), self.dedup_window)?;
        for (_, raw) in recent.into_iter().rev() {
            let message: Message = serde_json::from_slice(&raw)?;
            if message.client_message_id.as_deref() == Some(client_id) {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    fn room_lock(&self, room_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self.room_locks.lock().map_err(|_| poisoned("room table"))?;
        Ok(locks.entry(room_id.to_string()).or_default().clone())
    }
}

/// Finite, restartable page iterator over a room's history
pub struct MessagePages<'a> {
    store: &'a MessageStore,
    room_id: String,
    cursor: MessageCursor,
    page_size: usize,
    done: bool,
}

impl MessagePages<'_> {
    /// Resume point: pass to `pages_after` to continue from here later
    pub fn cursor(&self) -> MessageCursor {
        self.cursor
    }
}

impl Iterator for MessagePages<'_> {
    type Item = Result<Vec<Message>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self
            .store
            .fetch_page(&self.room_id, self.cursor, self.page_size)
        {
            Ok(page) => {
                if page.len() < self.page_size {
                    self.done = true;
                }
                let last = page.last()?;
                self.cursor = MessageCursor(last.id);
                Some(Ok(page))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
