//! Conversation-room membership.
//!
//! A room is a broadcast group keyed by conversation id, purely a
//! connection-local concern: joining or leaving never mutates the persisted
//! conversation. Nothing is joined automatically on connect; membership is
//! driven by the join events and torn down wholesale on disconnect.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::registry::ConnectionId;

#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, HashSet<ConnectionId>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, conversation_id: Uuid, connection: ConnectionId) {
        self.rooms
            .write()
            .await
            .entry(conversation_id)
            .or_default()
            .insert(connection);
    }

    /// Unconditional for the caller; leaving a room it never joined is fine.
    pub async fn leave(&self, conversation_id: Uuid, connection: ConnectionId) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(&conversation_id) {
            members.remove(&connection);
            if members.is_empty() {
                rooms.remove(&conversation_id);
            }
        }
    }

    /// Disconnect teardown: drop the connection from every room.
    pub async fn leave_all(&self, connection: ConnectionId) {
        let mut rooms = self.rooms.write().await;
        rooms.retain(|_, members| {
            members.remove(&connection);
            !members.is_empty()
        });
    }

    pub async fn contains(&self, conversation_id: Uuid, connection: ConnectionId) -> bool {
        self.rooms
            .read()
            .await
            .get(&conversation_id)
            .map(|members| members.contains(&connection))
            .unwrap_or(false)
    }

    /// Snapshot of the room's current membership.
    pub async fn members(&self, conversation_id: Uuid) -> Vec<ConnectionId> {
        self.rooms
            .read()
            .await
            .get(&conversation_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_leave_round_trip() {
        let rooms = RoomRegistry::new();
        let room = Uuid::new_v4();
        let conn = ConnectionId::new();

        assert!(!rooms.contains(room, conn).await);
        rooms.join(room, conn).await;
        rooms.join(room, conn).await;
        assert!(rooms.contains(room, conn).await);
        assert_eq!(rooms.members(room).await, vec![conn]);

        rooms.leave(room, conn).await;
        assert!(!rooms.contains(room, conn).await);
        // Empty rooms are dropped entirely.
        assert_eq!(rooms.room_count().await, 0);
    }

    #[tokio::test]
    async fn leave_unjoined_room_is_a_no_op() {
        let rooms = RoomRegistry::new();
        rooms.leave(Uuid::new_v4(), ConnectionId::new()).await;
        assert_eq!(rooms.room_count().await, 0);
    }

    #[tokio::test]
    async fn leave_all_clears_every_room() {
        let rooms = RoomRegistry::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conn = ConnectionId::new();
        let other = ConnectionId::new();

        rooms.join(a, conn).await;
        rooms.join(b, conn).await;
        rooms.join(b, other).await;

        rooms.leave_all(conn).await;
        assert!(rooms.members(a).await.is_empty());
        assert_eq!(rooms.members(b).await, vec![other]);
    }
}
