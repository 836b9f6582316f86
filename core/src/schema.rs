/// Shared records for rooms, messages and users, plus the persisted key layout.
///
/// Every component reads and writes these types; there is no second copy of
/// the schema anywhere else in the crate.
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Version of the persisted layout described in [`keys`]
pub const SCHEMA_VERSION: u8 = 1;

/// A user profile as supplied by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    /// Avatar URI, empty when the user has none
    #[serde(default)]
    pub avatar: String,
}

/// A 1:1 conversation between exactly two users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    /// Both participants, sorted; never changes after creation
    pub participant_ids: [String; 2],
    pub last_message_preview: String,
    /// Epoch milliseconds of the newest message (or of creation)
    pub last_activity_at: i64,
    /// Id of the message that produced the current summary, 0 if none
    pub last_message_id: u64,
    /// Participant -> newest message id that participant has observed
    pub seen_by: BTreeMap<String, u64>,
    pub created_by: String,
    pub created_at: i64,
}

impl Room {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participant_ids.iter().any(|p| p == user_id)
    }

    /// The participant who is not `user_id`
    pub fn counterpart(&self, user_id: &str) -> Option<&str> {
        if !self.has_participant(user_id) {
            return None;
        }
        self.participant_ids
            .iter()
            .find(|p| p.as_str() != user_id)
            .map(|p| p.as_str())
    }

    pub fn seen_state(&self, user_id: &str) -> SeenState {
        match self.seen_by.get(user_id) {
            Some(seen) if *seen >= self.last_message_id => SeenState::Seen,
            _ => SeenState::Unseen,
        }
    }
}

/// Per-user view of a room's latest activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeenState {
    Seen,
    Unseen,
}

/// An immutable message inside a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Store-wide sequence number; ordering key
    pub id: u64,
    pub room_id: String,
    pub sender_id: String,
    pub text: String,
    /// Epoch milliseconds, non-decreasing in `id` order
    pub created_at: i64,
    /// Dedup token supplied by the sending client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

/// Summary of one conversation thread (for a chat list view)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub room_id: String,
    /// The other party's id
    pub peer_id: String,
    /// The other party's display name (falls back to the id)
    pub peer_name: String,
    pub peer_avatar: String,
    /// Preview text of the last message
    pub last_preview: String,
    /// Epoch milliseconds of the last activity
    pub last_activity_at: i64,
    pub unread: bool,
}

/// Restart point for paged history reads: the last message id already seen
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageCursor(pub u64);

impl MessageCursor {
    pub const START: MessageCursor = MessageCursor(0);
}

/// Ids end up inside backend keys, so `/` is not allowed.
pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(SyncError::InvalidParticipant(format!("{} id is empty", kind)));
    }
    if id.contains('/') {
        return Err(SyncError::InvalidParticipant(format!(
            "{} id must not contain '/': {}",
            kind, id
        )));
    }
    Ok(())
}

/// The pair in canonical order: smaller id first
pub fn sorted_pair(user_a: &str, user_b: &str) -> [String; 2] {
    let (lo, hi) = if user_a <= user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    };
    [lo.to_string(), hi.to_string()]
}

/// Canonical pair name: "dm:{len}:{min_id}:{len}:{max_id}".
/// Length prefixes keep ids containing ':' from colliding.
pub fn pair_key(user_a: &str, user_b: &str) -> String {
    let [lo, hi] = sorted_pair(user_a, user_b);
    format!("dm:{}:{}:{}:{}", lo.len(), lo, hi.len(), hi)
}

/// Room id for an unordered pair: base58 of the SHA-256 of the pair key
pub fn derive_room_id(user_a: &str, user_b: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pair_key(user_a, user_b).as_bytes());
    let hash = hasher.finalize();
    bs58::encode(&hash[..]).into_string()
}

/// Cut `text` to at most `max_chars` characters, marking the cut with an ellipsis
pub fn preview(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Backend key layout
pub mod keys {
    pub const SCHEMA_VERSION: &str = "meta/schema_version";

    pub fn user(user_id: &str) -> String {
        format!("users/{}", user_id)
    }

    pub const USERS_PREFIX: &str = "users/";

    pub fn room(room_id: &str) -> String {
        format!("rooms/{}", room_id)
    }

    pub fn messages_prefix(room_id: &str) -> String {
        format!("rooms/{}/messages/", room_id)
    }

    pub fn message(room_id: &str, message_id: u64) -> String {
        format!("rooms/{}/messages/{:020}", room_id, message_id)
    }

    pub fn cleared_through(room_id: &str) -> String {
        format!("rooms/{}/cleared_through", room_id)
    }

    pub fn user_rooms_prefix(user_id: &str) -> String {
        format!("user_rooms/{}/", user_id)
    }

    pub fn user_room(user_id: &str, room_id: &str) -> String {
        format!("user_rooms/{}/{}", user_id, room_id)
    }
}
