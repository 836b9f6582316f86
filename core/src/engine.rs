/// Engine facade: every component wired over one backend
use crate::backend::{Backend, MemoryBackend, SledBackend};
use crate::clock::MonotonicClock;
use crate::config::Config;
use crate::directory::RoomDirectory;
use crate::error::{Result, SyncError};
use crate::message_store::{MessagePages, MessageStore};
use crate::migrate;
use crate::schema::{ConversationSummary, Message, MessageCursor, Room, SeenState, User};
use crate::sync::{SessionSynchronizer, Subscription};
use crate::tracker::ReadTracker;
use crate::users::UserDirectory;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct ChatEngine {
    config: Config,
    backend: Arc<dyn Backend>,
    users: UserDirectory,
    directory: RoomDirectory,
    store: MessageStore,
    tracker: ReadTracker,
    synchronizer: SessionSynchronizer,
}

impl ChatEngine {
    /// Open the store named by `config`: sled under `data_dir`, else memory
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let backend: Arc<dyn Backend> = match &config.data_dir {
            Some(dir) => Arc::new(SledBackend::open(dir)?),
            None => Arc::new(MemoryBackend::new()),
        };
        Self::with_backend(config, backend)
    }

    /// Build the engine over an existing backend
    pub fn with_backend(config: Config, backend: Arc<dyn Backend>) -> Result<Self> {
        config.validate()?;
        let version = migrate::ensure_schema(backend.as_ref())?;

        let clock = Arc::new(MonotonicClock::new());
        let users = UserDirectory::new(backend.clone());
        let directory = RoomDirectory::new(backend.clone(), clock.clone());
        let store = MessageStore::new(backend.clone(), directory.clone(), clock, &config);
        let tracker = ReadTracker::new(directory.clone());
        let synchronizer =
            SessionSynchronizer::new(backend.clone(), directory.clone(), store.clone(), &config);

        info!("Chat engine ready (schema v{})", version);
        Ok(Self {
            config,
            backend,
            users,
            directory,
            store,
            tracker,
            synchronizer,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    // Users

    pub fn put_user(&self, user: &User) -> Result<()> {
        self.users.put_user(user)
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        self.users.get_user(user_id)
    }

    pub fn list_users_except(&self, user_id: &str) -> Result<Vec<User>> {
        self.users.list_users_except(user_id)
    }

    /// People `user_id` can start a chat with, filtered by name
    pub fn search_users(&self, user_id: &str, query: &str) -> Result<Vec<User>> {
        self.users.search_users(user_id, query)
    }

    // Rooms

    pub fn get_or_create_room(&self, self_id: &str, other_id: &str) -> Result<Room> {
        self.directory.get_or_create_room(self_id, other_id)
    }

    pub fn get_room(&self, room_id: &str) -> Result<Room> {
        self.directory.get_room(room_id)
    }

    pub fn list_rooms_for_user(&self, user_id: &str) -> Result<Vec<Room>> {
        self.store.reconcile();
        self.directory.list_rooms_for_user(user_id)
    }

    /// The other participant's profile, or a bare profile named after the id
    pub fn counterpart(&self, room: &Room, self_id: &str) -> Result<User> {
        let peer_id = room
            .counterpart(self_id)
            .ok_or_else(|| SyncError::NotAParticipant {
                room_id: room.id.clone(),
                user_id: self_id.to_string(),
            })?;
        Ok(self.users.get_user(peer_id)?.unwrap_or_else(|| User {
            id: peer_id.to_string(),
            name: peer_id.to_string(),
            avatar: String::new(),
        }))
    }

    /// Chat list rows for `user_id`, newest first, optionally filtered by a
    /// case-insensitive match on the other person's name
    pub fn conversations(&self, user_id: &str, query: &str) -> Result<Vec<ConversationSummary>> {
        let needle = query.trim().to_lowercase();
        let mut out = Vec::new();
        for room in self.list_rooms_for_user(user_id)? {
            let peer = self.counterpart(&room, user_id)?;
            if !needle.is_empty() && !peer.name.to_lowercase().contains(&needle) {
                continue;
            }
            out.push(ConversationSummary {
                room_id: room.id.clone(),
                unread: ReadTracker::is_unread(&room, user_id),
                peer_id: peer.id,
                peer_name: peer.name,
                peer_avatar: peer.avatar,
                last_preview: room.last_message_preview,
                last_activity_at: room.last_activity_at,
            });
        }
        Ok(out)
    }

    // Messages

    pub fn append(
        &self,
        room_id: &str,
        sender_id: &str,
        text: &str,
        client_message_id: Option<&str>,
    ) -> Result<Message> {
        self.store.append(room_id, sender_id, text, client_message_id)
    }

    pub fn list_messages(&self, room_id: &str) -> Result<Vec<Message>> {
        self.store.list_messages(room_id)
    }

    pub fn pages_after(&self, room_id: &str, cursor: MessageCursor) -> MessagePages<'_> {
        self.store.pages_after(room_id, cursor, self.config.page_size)
    }

    pub fn clear(&self, room_id: &str) -> Result<usize> {
        self.store.clear(room_id)
    }

    /// Retry room summary updates that failed earlier
    pub fn reconcile(&self) -> usize {
        self.store.reconcile()
    }

    // Live sync

    pub fn subscribe<F, E>(&self, room_id: &str, on_message: F, on_error: E) -> Result<Subscription>
    where
        F: FnMut(Message) + Send + 'static,
        E: FnOnce(SyncError) + Send + 'static,
    {
        self.synchronizer.subscribe(room_id, on_message, on_error)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.synchronizer.unsubscribe(subscription)
    }

    // Seen state

    pub fn mark_seen(&self, room_id: &str, user_id: &str) -> Result<Room> {
        self.tracker.mark_seen(room_id, user_id)
    }

    pub fn is_unread(&self, room_id: &str, user_id: &str) -> Result<bool> {
        self.tracker.is_unread_by_id(room_id, user_id)
    }

    pub fn seen_state(&self, room_id: &str, user_id: &str) -> Result<SeenState> {
        let room = self.directory.get_room(room_id)?;
        Ok(ReadTracker::seen_state(&room, user_id))
    }
}
