/// chatsync - two-party chat session synchronization
///
/// Rooms addressed by an unordered pair of users, an append-only ordered
/// message log per room, seen-state tracking and live subscriptions with
/// reconnect/backfill, over a pluggable key/value backend.

pub mod error;
pub mod config;
pub mod schema;
pub mod backend;
pub mod clock;
pub mod migrate;
pub mod users;
pub mod directory;
pub mod message_store;
pub mod tracker;
pub mod sync;
pub mod engine;
pub mod cli_app;

pub use config::Config;
pub use engine::ChatEngine;
pub use error::{Result, SyncError};
pub use schema::{ConversationSummary, Message, MessageCursor, Room, SeenState, User};
pub use sync::Subscription;
