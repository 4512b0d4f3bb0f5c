//! Room directory — which connections are currently viewing which conversation
//!
//! A room exists only while it has members. Joining creates it, and the last
//! member leaving drops it; there is no separate room lifecycle.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::protocol::RoomId;
use crate::registry::ConnectionId;

#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
    // Reverse index so a disconnect does not scan every room
    memberships: HashMap<ConnectionId, HashSet<RoomId>>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room. Returns `false` if it was already a member.
    pub fn join(&mut self, room: RoomId, id: ConnectionId) -> bool {
        let added = self.rooms.entry(room.clone()).or_default().insert(id);
        if added {
            self.memberships.entry(id).or_default().insert(room);
        }
        added
    }

    /// Remove a connection from one room. Returns `false` if it was not a member.
    pub fn leave(&mut self, room: &RoomId, id: ConnectionId) -> bool {
        let removed = match self.rooms.get_mut(room) {
            Some(members) => {
                let removed = members.remove(&id);
                if members.is_empty() {
                    self.rooms.remove(room);
                    debug!("Room {} is empty, dropped", room);
                }
                removed
            }
            None => false,
        };

        if removed {
            if let Some(joined) = self.memberships.get_mut(&id) {
                joined.remove(room);
                if joined.is_empty() {
                    self.memberships.remove(&id);
                }
            }
        }
        removed
    }

    /// Remove a connection from every room it joined. Returns how many rooms it left.
    pub fn leave_all(&mut self, id: ConnectionId) -> usize {
        let Some(joined) = self.memberships.remove(&id) else {
            return 0;
        };

        for room in &joined {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(&id);
                if members.is_empty() {
                    self.rooms.remove(room);
                    debug!("Room {} is empty, dropped", room);
                }
            }
        }
        joined.len()
    }

    /// Snapshot of a room's members. Unknown rooms are simply empty.
    pub fn members(&self, room: &RoomId) -> HashSet<ConnectionId> {
        self.rooms.get(room).cloned().unwrap_or_default()
    }

    /// Number of non-empty rooms
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(id: &str) -> RoomId {
        RoomId::from(id)
    }

    #[test]
    fn test_join_creates_room() {
        let mut dir = RoomDirectory::new();
        let a = ConnectionId::new();
        assert_eq!(dir.room_count(), 0);
        assert!(dir.join(room("chat-1"), a));
        assert_eq!(dir.room_count(), 1);
        assert!(dir.members(&room("chat-1")).contains(&a));
    }

    #[test]
    fn test_join_is_idempotent() {
        let mut dir = RoomDirectory::new();
        let a = ConnectionId::new();
        assert!(dir.join(room("chat-1"), a));
        assert!(!dir.join(room("chat-1"), a));
        assert_eq!(dir.members(&room("chat-1")).len(), 1);
        // Still a single membership record, so one leave_all undoes it
        assert_eq!(dir.leave_all(a), 1);
    }

    #[test]
    fn test_members_of_unknown_room_is_empty() {
        let dir = RoomDirectory::new();
        assert!(dir.members(&room("nope")).is_empty());
    }

    #[test]
    fn test_leave_drops_empty_room() {
        let mut dir = RoomDirectory::new();
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        dir.join(room("chat-1"), a);
        dir.join(room("chat-1"), b);

        assert!(dir.leave(&room("chat-1"), a));
        assert_eq!(dir.room_count(), 1);
        assert!(!dir.leave(&room("chat-1"), a));

        assert!(dir.leave(&room("chat-1"), b));
        assert_eq!(dir.room_count(), 0);
        assert_eq!(dir.leave_all(b), 0);
    }

    #[test]
    fn test_leave_unknown_room() {
        let mut dir = RoomDirectory::new();
        assert!(!dir.leave(&room("nope"), ConnectionId::new()));
    }

    #[test]
    fn test_leave_all() {
        let mut dir = RoomDirectory::new();
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        dir.join(room("chat-1"), a);
        dir.join(room("chat-2"), a);
        dir.join(room("chat-2"), b);

        assert_eq!(dir.leave_all(a), 2);
        assert_eq!(dir.room_count(), 1);
        assert!(dir.members(&room("chat-1")).is_empty());
        let members = dir.members(&room("chat-2"));
        assert_eq!(members.len(), 1);
        assert!(members.contains(&b));
    }

    #[test]
    fn test_leave_all_with_no_rooms() {
        let mut dir = RoomDirectory::new();
        assert_eq!(dir.leave_all(ConnectionId::new()), 0);
    }

    #[test]
    fn test_members_is_a_snapshot() {
        let mut dir = RoomDirectory::new();
        let a = ConnectionId::new();
        dir.join(room("chat-1"), a);
        let snapshot = dir.members(&room("chat-1"));
        dir.leave_all(a);
        assert!(snapshot.contains(&a));
        assert!(dir.members(&room("chat-1")).is_empty());
    }
}
