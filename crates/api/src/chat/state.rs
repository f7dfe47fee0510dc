//! Process-local chat state
//!
//! Tracks all live connections and the room hub they fan out through.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::connection::Connection;
use super::hub::RoomHub;

/// Chat state shared across all connections in this process
#[derive(Clone)]
pub struct ChatState {
    /// All active connections indexed by session_id
    pub connections: Arc<RwLock<HashMap<Uuid, Arc<Connection>>>>,

    /// Room hub for group fan-out
    pub hub: Arc<RoomHub>,
}

impl ChatState {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            hub: Arc::new(RoomHub::new()),
        }
    }

    /// Add a connection
    pub async fn add_connection(&self, conn: Connection) -> Arc<Connection> {
        let conn = Arc::new(conn);
        let mut connections = self.connections.write().await;
        connections.insert(conn.session_id, Arc::clone(&conn));

        tracing::info!(
            session_id = %conn.session_id,
            room = %conn.room,
            total_connections = connections.len(),
            "Chat connection added"
        );

        conn
    }

    /// Remove a connection and drop it from every room group
    pub async fn remove_connection(&self, session_id: &Uuid) {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.remove(session_id) {
            self.hub.remove_connection(session_id).await;

            tracing::info!(
                session_id = %session_id,
                room = %conn.room,
                remaining_connections = connections.len(),
                "Chat connection removed"
            );
        }
    }

    /// Get total number of active connections
    pub async fn connection_count(&self) -> usize {
        let connections = self.connections.read().await;
        connections.len()
    }
}

impl Default for ChatState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_shared::UserId;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_add_and_remove_connection() {
        let state = ChatState::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let conn = Connection::new("lobby", Some(UserId(1)), tx);
        let session_id = conn.session_id;

        state.add_connection(conn).await;
        assert_eq!(state.connection_count().await, 1);

        state.remove_connection(&session_id).await;
        assert_eq!(state.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_connection_clears_hub_membership() {
        let state = ChatState::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let conn = state
            .add_connection(Connection::new("lobby", Some(UserId(1)), tx))
            .await;
        state.hub.join("lobby", Arc::clone(&conn)).await;
        assert_eq!(state.hub.room_size("lobby").await, 1);

        state.remove_connection(&conn.session_id).await;
        assert_eq!(state.hub.room_size("lobby").await, 0);
    }
}
