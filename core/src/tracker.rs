/// Read/activity tracking: who has seen a room's latest message
use crate::directory::RoomDirectory;
use crate::error::{Result, SyncError};
use crate::schema::{Room, SeenState};
use tracing::debug;

#[derive(Clone)]
pub struct ReadTracker {
    directory: RoomDirectory,
}

impl ReadTracker {
    pub fn new(directory: RoomDirectory) -> Self {
        Self { directory }
    }

    /// Record that `user_id` has observed everything up to the room's last activity
    pub fn mark_seen(&self, room_id: &str, user_id: &str) -> Result<Room> {
        let room = self.directory.get_room(room_id)?;
        if !room.has_participant(user_id) {
            return Err(SyncError::NotAParticipant {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        if room.seen_state(user_id) == SeenState::Seen {
            return Ok(room);
        }

        let room = self.directory.update_room(room_id, |room| {
            let seen = room.seen_by.get(user_id).copied().unwrap_or(0);
            if seen >= room.last_message_id && room.seen_by.contains_key(user_id) {
                return false;
            }
            room.seen_by
                .insert(user_id.to_string(), seen.max(room.last_message_id));
            true
        })?;
        debug!("{} has seen room {} through {}", user_id, room_id, room.last_message_id);
        Ok(room)
    }

    /// Seen/unseen for a room already in hand
    pub fn seen_state(room: &Room, user_id: &str) -> SeenState {
        room.seen_state(user_id)
    }

    /// True while `user_id` has not seen the room's latest activity
    pub fn is_unread(room: &Room, user_id: &str) -> bool {
        room.seen_state(user_id) == SeenState::Unseen
    }

    /// Fetch the room and report whether it is unread for `user_id`
    pub fn is_unread_by_id(&self, room_id: &str, user_id: &str) -> Result<bool> {
        let room = self.directory.get_room(room_id)?;
        Ok(Self::is_unread(&room, user_id))
    }
}
