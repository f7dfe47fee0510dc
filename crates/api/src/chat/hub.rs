//! Room hub for pub/sub fan-out
//!
//! Maintains the set of live connections subscribed to each room and
//! broadcasts events to all of them. Groups are keyed `chat_{room}`, the
//! same naming a shared pub/sub bus would use if fan-out were bridged
//! across processes.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::connection::Connection;
use super::events::ServerEvent;

/// Fan-out group key for a room.
fn group_name(room: &str) -> String {
    format!("chat_{room}")
}

/// Manages room groups for broadcasting events
pub struct RoomHub {
    /// Map of group key -> list of member connections
    rooms: Arc<RwLock<HashMap<String, Vec<Arc<Connection>>>>>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Add a connection to a room group
    pub async fn join(&self, room: &str, conn: Arc<Connection>) {
        let key = group_name(room);
        let mut rooms = self.rooms.write().await;
        rooms.entry(key.clone()).or_default().push(Arc::clone(&conn));

        let count = rooms.get(&key).map(|v| v.len()).unwrap_or(0);
        tracing::debug!(
            room = %room,
            session_id = %conn.session_id,
            room_size = count,
            "Connection joined room group"
        );
    }

    /// Remove a connection from a room group
    pub async fn leave(&self, room: &str, session_id: &Uuid) {
        let key = group_name(room);
        let mut rooms = self.rooms.write().await;
        if let Some(conns) = rooms.get_mut(&key) {
            conns.retain(|c| c.session_id != *session_id);

            // Clean up empty groups
            if conns.is_empty() {
                rooms.remove(&key);
                tracing::debug!(room = %room, "Removed empty room group");
            } else {
                tracing::debug!(
                    room = %room,
                    session_id = %session_id,
                    room_size = conns.len(),
                    "Connection left room group"
                );
            }
        }
    }

    /// Broadcast an event to every current member of a room group.
    ///
    /// Sends go through unbounded channels so no single slow recipient can
    /// stall fan-out. A member whose channel is closed is pruned from the
    /// group instead of receiving further events.
    pub async fn publish(&self, room: &str, event: ServerEvent) {
        let key = group_name(room);

        let stale: Vec<Uuid> = {
            let rooms = self.rooms.read().await;
            let Some(conns) = rooms.get(&key) else {
                tracing::debug!(room = %room, "No group for room - no subscribers");
                return;
            };

            conns
                .iter()
                .filter(|c| c.send(event.clone()).is_err())
                .map(|c| c.session_id)
                .collect()
        };

        if !stale.is_empty() {
            tracing::warn!(
                room = %room,
                pruned = stale.len(),
                "Pruned closed connections during broadcast"
            );
            let mut rooms = self.rooms.write().await;
            if let Some(conns) = rooms.get_mut(&key) {
                conns.retain(|c| !stale.contains(&c.session_id));
                if conns.is_empty() {
                    rooms.remove(&key);
                }
            }
        }
    }

    /// Remove a connection from all room groups
    pub async fn remove_connection(&self, session_id: &Uuid) {
        let mut rooms = self.rooms.write().await;
        for conns in rooms.values_mut() {
            conns.retain(|c| c.session_id != *session_id);
        }
        rooms.retain(|_, conns| !conns.is_empty());
    }

    /// Get group size (number of connections) for a room
    pub async fn room_size(&self, room: &str) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(&group_name(room)).map(|v| v.len()).unwrap_or(0)
    }

    /// Get total number of active room groups
    pub async fn room_count(&self) -> usize {
        let rooms = self.rooms.read().await;
        rooms.len()
    }
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_shared::UserId;
    use tokio::sync::mpsc;

    fn test_conn(room: &str, user: i64) -> (Arc<Connection>, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Connection::new(room, Some(UserId(user)), tx)), rx)
    }

    #[tokio::test]
    async fn test_join_and_leave() {
        let hub = RoomHub::new();
        let (conn, _rx) = test_conn("lobby", 1);

        assert_eq!(hub.room_size("lobby").await, 0);

        hub.join("lobby", Arc::clone(&conn)).await;
        assert_eq!(hub.room_size("lobby").await, 1);

        hub.leave("lobby", &conn.session_id).await;
        assert_eq!(hub.room_size("lobby").await, 0);
        assert_eq!(hub.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_members() {
        let hub = RoomHub::new();
        let (conn1, mut rx1) = test_conn("lobby", 1);
        let (conn2, mut rx2) = test_conn("lobby", 2);

        hub.join("lobby", conn1).await;
        hub.join("lobby", conn2).await;

        hub.publish(
            "lobby",
            ServerEvent::ChatMessage {
                message: "hello".to_string(),
                username: "alice".to_string(),
                timestamp: String::new(),
            },
        )
        .await;

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_does_not_cross_rooms() {
        let hub = RoomHub::new();
        let (conn1, mut rx1) = test_conn("lobby", 1);
        let (conn2, mut rx2) = test_conn("other", 2);

        hub.join("lobby", conn1).await;
        hub.join("other", conn2).await;

        hub.publish(
            "lobby",
            ServerEvent::Error {
                message: "only lobby".to_string(),
            },
        )
        .await;

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_prunes_closed_connections() {
        let hub = RoomHub::new();
        let (conn1, rx1) = test_conn("lobby", 1);
        let (conn2, mut rx2) = test_conn("lobby", 2);

        hub.join("lobby", conn1).await;
        hub.join("lobby", conn2).await;

        // First client goes away without leaving
        drop(rx1);

        hub.publish(
            "lobby",
            ServerEvent::Error {
                message: "ping".to_string(),
            },
        )
        .await;

        // The healthy member still got the event, the dead one was pruned
        assert!(rx2.try_recv().is_ok());
        assert_eq!(hub.room_size("lobby").await, 1);
    }

    #[tokio::test]
    async fn test_remove_connection_from_all_rooms() {
        let hub = RoomHub::new();
        let (conn, _rx) = test_conn("lobby", 1);

        hub.join("lobby", Arc::clone(&conn)).await;
        hub.join("side", Arc::clone(&conn)).await;
        assert_eq!(hub.room_count().await, 2);

        hub.remove_connection(&conn.session_id).await;
        assert_eq!(hub.room_count().await, 0);
    }
}
