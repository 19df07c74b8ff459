//! Chat rooms
//!
//! Named rooms of sessions. A room springs into existence on its first join and is
//! removed when its last member leaves. Delivery is the caller's concern; this module
//! only tracks membership.

use std::collections::HashSet;

use dashmap::DashMap;
use tracing::debug;

use crate::error::ChatError;
use crate::net::session::SessionId;

/// Longest accepted room name
pub const MAX_ROOM_NAME_LEN: usize = 64;

/// Room membership table
#[derive(Debug, Default)]
pub struct ChatRooms {
    rooms: DashMap<String, HashSet<SessionId>>,
}

impl ChatRooms {
    pub fn new() -> Self {
        Self::default()
    }

    fn validate(room: &str) -> Result<(), ChatError> {
        if room.trim().is_empty() || room.len() > MAX_ROOM_NAME_LEN {
            return Err(ChatError::InvalidRoom);
        }
        Ok(())
    }

    /// Add a session to a room, creating the room if needed
    ///
    /// Returns false if the session was already a member.
    pub fn join(&self, room: &str, session: SessionId) -> Result<bool, ChatError> {
        Self::validate(room)?;
        let added = self.rooms.entry(room.to_string()).or_default().insert(session);
        if added {
            debug!(room = room, session_id = session, "Joined chat room");
        }
        Ok(added)
    }

    /// Remove a session from a room
    pub fn leave(&self, room: &str, session: SessionId) -> Result<(), ChatError> {
        Self::validate(room)?;

        let now_empty = {
            let mut members = self
                .rooms
                .get_mut(room)
                .ok_or_else(|| ChatError::NoSuchRoom(room.to_string()))?;
            if !members.remove(&session) {
                return Err(ChatError::NotMember(room.to_string()));
            }
            members.is_empty()
        };

        if now_empty {
            self.rooms.remove_if(room, |_, members| members.is_empty());
        }
        debug!(room = room, session_id = session, "Left chat room");
        Ok(())
    }

    /// Remove a session from every room it belongs to
    pub fn leave_all(&self, session: SessionId) -> usize {
        let mut left = 0;
        self.rooms.retain(|_, members| {
            if members.remove(&session) {
                left += 1;
            }
            !members.is_empty()
        });
        left
    }

    pub fn is_member(&self, room: &str, session: SessionId) -> bool {
        self.rooms
            .get(room)
            .map(|members| members.contains(&session))
            .unwrap_or(false)
    }

    /// Current members of a room (empty if it does not exist)
    pub fn members(&self, room: &str) -> Vec<SessionId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_creates_room() {
        let chat = ChatRooms::new();
        assert_eq!(chat.join("lobby", 1), Ok(true));
        assert_eq!(chat.join("lobby", 1), Ok(false));
        assert_eq!(chat.join("lobby", 2), Ok(true));

        let mut members = chat.members("lobby");
        members.sort();
        assert_eq!(members, vec![1, 2]);
        assert_eq!(chat.room_count(), 1);
    }

    #[test]
    fn test_leave_errors() {
        let chat = ChatRooms::new();
        assert_eq!(
            chat.leave("nowhere", 1),
            Err(ChatError::NoSuchRoom("nowhere".to_string()))
        );

        chat.join("lobby", 1).unwrap();
        assert_eq!(
            chat.leave("lobby", 2),
            Err(ChatError::NotMember("lobby".to_string()))
        );
        assert_eq!(chat.join("", 1), Err(ChatError::InvalidRoom));
    }

    #[test]
    fn test_empty_room_is_removed() {
        let chat = ChatRooms::new();
        chat.join("lobby", 1).unwrap();
        chat.leave("lobby", 1).unwrap();
        assert_eq!(chat.room_count(), 0);
        assert!(chat.members("lobby").is_empty());
    }

    #[test]
    fn test_leave_all() {
        let chat = ChatRooms::new();
        chat.join("a", 1).unwrap();
        chat.join("b", 1).unwrap();
        chat.join("b", 2).unwrap();

        assert_eq!(chat.leave_all(1), 2);
        assert_eq!(chat.room_count(), 1);
        assert!(chat.is_member("b", 2));
        assert!(!chat.is_member("b", 1));
    }
}
