/// Room directory: one room per unordered pair of users
use crate::backend::{get_json, Backend};
use crate::clock::MonotonicClock;
use crate::error::{Result, SyncError};
use crate::schema::{self, keys, Message, Room};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attempts at a contended compare-and-swap before giving up
const MAX_CAS_ATTEMPTS: usize = 32;

#[derive(Clone)]
pub struct RoomDirectory {
    backend: Arc<dyn Backend>,
    clock: Arc<MonotonicClock>,
}

impl RoomDirectory {
    pub fn new(backend: Arc<dyn Backend>, clock: Arc<MonotonicClock>) -> Self {
        Self { backend, clock }
    }

    /// Return the room for `{user_a, user_b}`, creating it on first contact.
    ///
    /// `user_a` is the caller and becomes the creator when a room is made.
    /// Concurrent callers for the same pair all get the same room back.
    pub fn get_or_create_room(&self, user_a: &str, user_b: &str) -> Result<Room> {
        schema::validate_id("user", user_a)?;
        schema::validate_id("user", user_b)?;
        if user_a == user_b {
            return Err(SyncError::InvalidParticipant(format!(
                "cannot open a room with yourself ({})",
                user_a
            )));
        }

        let room_id = schema::derive_room_id(user_a, user_b);
        let key = keys::room(&room_id);

        let participant_ids = schema::sorted_pair(user_a, user_b);

        if let Some(room) = get_json::<Room>(self.backend.as_ref(), &key)? {
            check_pair(&room, &participant_ids)?;
            self.ensure_membership(&room)?;
            return Ok(room);
        }

        let now = self.clock.now_millis();
        let mut seen_by = BTreeMap::new();
        seen_by.insert(user_a.to_string(), 0);

        let fresh = Room {
            id: room_id.clone(),
            participant_ids,
            last_message_preview: String::new(),
            last_activity_at: now,
            last_message_id: 0,
            seen_by,
            created_by: user_a.to_string(),
            created_at: now,
        };
        let raw = serde_json::to_vec(&fresh)?;

        let room = match self.backend.compare_and_swap(&key, None, raw)? {
            Ok(()) => {
                info!("Created room {} for {}", room_id, schema::pair_key(user_a, user_b));
                fresh
            }
            Err(Some(existing)) => {
                debug!("Room {} created concurrently, adopting existing record", room_id);
                let room: Room = serde_json::from_slice(&existing)?;
                check_pair(&room, &fresh.participant_ids)?;
                room
            }
            Err(None) => {
                return Err(SyncError::PermanentUpstream(format!(
                    "compare_and_swap on {} failed without a current value",
                    key
                )))
            }
        };

        self.ensure_membership(&room)?;
        Ok(room)
    }

    /// Fetch a room by id
    pub fn get_room(&self, room_id: &str) -> Result<Room> {
        schema::validate_id("room", room_id)
            .map_err(|_| SyncError::RoomNotFound(room_id.to_string()))?;
        get_json::<Room>(self.backend.as_ref(), &keys::room(room_id))?
            .ok_or_else(|| SyncError::RoomNotFound(room_id.to_string()))
    }

    /// Rooms containing `user_id`, most recent activity first, ties by id
    pub fn list_rooms_for_user(&self, user_id: &str) -> Result<Vec<Room>> {
        schema::validate_id("user", user_id)?;
        let prefix = keys::user_rooms_prefix(user_id);

        let mut rooms = Vec::new();
        for (key, _) in self.backend.scan(&prefix, None, None)? {
            let room_id = &key[prefix.len()..];
            match get_json::<Room>(self.backend.as_ref(), &keys::room(room_id))? {
                Some(room) if room.has_participant(user_id) => rooms.push(room),
                Some(_) => warn!("Membership index lists {} for non-member {}", room_id, user_id),
                None => warn!("Membership index points at missing room {}", room_id),
            }
        }

        rooms.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(rooms)
    }

    /// Read-modify-write a room with compare-and-swap.
    ///
    /// `apply` returns false when it made no change; nothing is written then.
    pub fn update_room<F>(&self, room_id: &str, mut apply: F) -> Result<Room>
    where
        F: FnMut(&mut Room) -> bool,
    {
        let key = keys::room(room_id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self
                .backend
                .get(&key)?
                .ok_or_else(|| SyncError::RoomNotFound(room_id.to_string()))?;
            let mut room: Room = serde_json::from_slice(&raw)?;
            if !apply(&mut room) {
                return Ok(room);
            }
            let updated = serde_json::to_vec(&room)?;
            match self.backend.compare_and_swap(&key, Some(&raw), updated)? {
                Ok(()) => return Ok(room),
                Err(_) => debug!("Room {} changed underneath update, retrying", room_id),
            }
        }
        Err(SyncError::TransientUpstream(format!(
            "room {} too contended to update",
            room_id
        )))
    }

    /// Fold a newly stored message into the room summary (last write wins by id)
    pub fn record_message(&self, message: &Message, preview_max_chars: usize) -> Result<Room> {
        self.update_room(&message.room_id, |room| {
            let mut changed = false;

            let sender_seen = room.seen_by.get(&message.sender_id).copied().unwrap_or(0);
            if sender_seen < message.id {
                room.seen_by.insert(message.sender_id.clone(), message.id);
                changed = true;
            }

            if message.id > room.last_message_id {
                room.last_message_preview = schema::preview(&message.text, preview_max_chars);
                room.last_activity_at = room.last_activity_at.max(message.created_at);
                room.last_message_id = message.id;
                changed = true;
            }
            changed
        })
    }

    /// Blank the preview after the room's history was cleared
    pub fn clear_preview(&self, room_id: &str, cleared_through: u64) -> Result<Room> {
        self.update_room(room_id, |room| {
            if room.last_message_id > cleared_through || room.last_message_preview.is_empty() {
                return false;
            }
            room.last_message_preview.clear();
            true
        })
    }

    fn ensure_membership(&self, room: &Room) -> Result<()> {
        for participant in &room.participant_ids {
            let key = keys::user_room(participant, &room.id);
            if self.backend.get(&key)?.is_none() {
                self.backend.put(&key, Vec::new())?;
            }
        }
        Ok(())
    }
}

/// A stored room must belong to exactly the pair its id was derived from
fn check_pair(room: &Room, participant_ids: &[String; 2]) -> Result<()> {
    if &room.participant_ids != participant_ids {
        return Err(SyncError::PermanentUpstream(format!(
            "room {} belongs to {:?}, not {:?}",
            room.id, room.participant_ids, participant_ids
        )));
    }
    Ok(())
}
