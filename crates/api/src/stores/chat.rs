//! Durable chat store
//!
//! Covers the rooms / identity / membership / persistence collaborators the
//! session consults: room resolution, display names, membership checks,
//! message rows, and the per-(room, user) history logs.
//!
//! Rooms, users, and membership are owned by external collaborators; the
//! relay only reads them. Messages and history are append-only and written
//! here, never edited or truncated.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use chatrelay_shared::{HistoryEntry, MessageId, RelayError, RoomId, RoomRef, UserId};

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Look up a room by its unique name.
    async fn resolve_room(&self, name: &str) -> Result<Option<RoomRef>, RelayError>;

    /// Display name for a user id, if the id resolves.
    async fn resolve_username(&self, user_id: UserId) -> Result<Option<String>, RelayError>;

    /// Whether the user is an authorized member of the room.
    async fn is_member(&self, room_id: RoomId, user_id: UserId) -> Result<bool, RelayError>;

    /// All current member ids of the room.
    async fn member_ids(&self, room_id: RoomId) -> Result<Vec<UserId>, RelayError>;

    /// Persist an immutable message row.
    async fn append_message(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        content: &str,
    ) -> Result<MessageId, RelayError>;

    /// Append one entry to a member's history log for the room.
    /// The log is created lazily by the first append; earlier messages are
    /// never backfilled.
    async fn append_history(
        &self,
        room_id: RoomId,
        user_id: UserId,
        entry: &HistoryEntry,
    ) -> Result<(), RelayError>;

    /// Full history log for (room, user) in append order.
    async fn read_history(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Vec<HistoryEntry>, RelayError>;
}

/// Postgres-backed chat store.
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn resolve_room(&self, name: &str) -> Result<Option<RoomRef>, RelayError> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT id, name FROM chat_rooms WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id, name)| RoomRef {
            id: RoomId(id),
            name,
        }))
    }

    async fn resolve_username(&self, user_id: UserId) -> Result<Option<String>, RelayError> {
        let username: Option<String> =
            sqlx::query_scalar("SELECT username FROM users WHERE id = $1")
                .bind(user_id.0)
                .fetch_optional(&self.pool)
                .await?;

        Ok(username)
    }

    async fn is_member(&self, room_id: RoomId, user_id: UserId) -> Result<bool, RelayError> {
        let is_member: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM room_members WHERE room_id = $1 AND user_id = $2)",
        )
        .bind(room_id.0)
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await?;

        Ok(is_member)
    }

    async fn member_ids(&self, room_id: RoomId) -> Result<Vec<UserId>, RelayError> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT user_id FROM room_members WHERE room_id = $1 ORDER BY user_id")
                .bind(room_id.0)
                .fetch_all(&self.pool)
                .await?;

        Ok(ids.into_iter().map(UserId).collect())
    }

    async fn append_message(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        content: &str,
    ) -> Result<MessageId, RelayError> {
        let id = MessageId(Uuid::new_v4());

        sqlx::query(
            "INSERT INTO messages (id, room_id, user_id, content) VALUES ($1, $2, $3, $4)",
        )
        .bind(id.0)
        .bind(room_id.0)
        .bind(sender_id.0)
        .bind(content)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn append_history(
        &self,
        room_id: RoomId,
        user_id: UserId,
        entry: &HistoryEntry,
    ) -> Result<(), RelayError> {
        sqlx::query(
            r#"
            INSERT INTO chat_history (room_id, user_id, username, message, client_timestamp)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(room_id.0)
        .bind(user_id.0)
        .bind(&entry.username)
        .bind(&entry.message)
        .bind(&entry.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn read_history(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Vec<HistoryEntry>, RelayError> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT username, message, client_timestamp
            FROM chat_history
            WHERE room_id = $1 AND user_id = $2
            ORDER BY position ASC
            "#,
        )
        .bind(room_id.0)
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(username, message, timestamp)| HistoryEntry {
                message,
                username,
                timestamp,
            })
            .collect())
    }
}

/// In-memory chat store (for development and tests without a database)
#[derive(Default)]
pub struct MemoryChatStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    next_room_id: i64,
    rooms: HashMap<String, RoomId>,
    users: HashMap<i64, String>,
    members: HashMap<i64, Vec<UserId>>,
    messages: Vec<(MessageId, RoomId, UserId, String)>,
    history: HashMap<(i64, i64), Vec<HistoryEntry>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user (identity collaborator stand-in).
    pub async fn add_user(&self, user_id: UserId, username: &str) {
        let mut inner = self.inner.lock().await;
        inner.users.insert(user_id.0, username.to_string());
    }

    /// Create a room (administrative collaborator stand-in).
    pub async fn add_room(&self, name: &str) -> RoomRef {
        let mut inner = self.inner.lock().await;
        inner.next_room_id += 1;
        let id = RoomId(inner.next_room_id);
        inner.rooms.insert(name.to_string(), id);
        RoomRef {
            id,
            name: name.to_string(),
        }
    }

    /// Add a room member (membership authority stand-in).
    pub async fn add_member(&self, room_id: RoomId, user_id: UserId) {
        let mut inner = self.inner.lock().await;
        inner.members.entry(room_id.0).or_default().push(user_id);
    }

    /// Delete a room, e.g. to simulate removal mid-session.
    pub async fn remove_room(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        inner.rooms.remove(name);
    }

    /// Number of persisted message rows.
    pub async fn message_count(&self) -> usize {
        self.inner.lock().await.messages.len()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn resolve_room(&self, name: &str) -> Result<Option<RoomRef>, RelayError> {
        let inner = self.inner.lock().await;
        Ok(inner.rooms.get(name).map(|id| RoomRef {
            id: *id,
            name: name.to_string(),
        }))
    }

    async fn resolve_username(&self, user_id: UserId) -> Result<Option<String>, RelayError> {
        let inner = self.inner.lock().await;
        Ok(inner.users.get(&user_id.0).cloned())
    }

    async fn is_member(&self, room_id: RoomId, user_id: UserId) -> Result<bool, RelayError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .members
            .get(&room_id.0)
            .is_some_and(|members| members.contains(&user_id)))
    }

    async fn member_ids(&self, room_id: RoomId) -> Result<Vec<UserId>, RelayError> {
        let inner = self.inner.lock().await;
        Ok(inner.members.get(&room_id.0).cloned().unwrap_or_default())
    }

    async fn append_message(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        content: &str,
    ) -> Result<MessageId, RelayError> {
        let mut inner = self.inner.lock().await;
        let id = MessageId::new();
        inner
            .messages
            .push((id, room_id, sender_id, content.to_string()));
        Ok(id)
    }

    async fn append_history(
        &self,
        room_id: RoomId,
        user_id: UserId,
        entry: &HistoryEntry,
    ) -> Result<(), RelayError> {
        let mut inner = self.inner.lock().await;
        inner
            .history
            .entry((room_id.0, user_id.0))
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn read_history(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Vec<HistoryEntry>, RelayError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .history
            .get(&(room_id.0, user_id.0))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_history_round_trip_in_append_order() {
        let store = MemoryChatStore::new();
        let room = store.add_room("lobby").await;
        let user = UserId(1);

        for n in 0..3 {
            let entry = HistoryEntry {
                message: format!("msg {n}"),
                username: "alice".to_string(),
                timestamp: String::new(),
            };
            store.append_history(room.id, user, &entry).await.unwrap();
        }

        let history = store.read_history(room.id, user).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].message, "msg 0");
        assert_eq!(history[2].message, "msg 2");
    }

    #[tokio::test]
    async fn test_history_is_per_room_and_user() {
        let store = MemoryChatStore::new();
        let lobby = store.add_room("lobby").await;
        let other = store.add_room("other").await;

        let entry = HistoryEntry {
            message: "hello".to_string(),
            username: "alice".to_string(),
            timestamp: String::new(),
        };
        store
            .append_history(lobby.id, UserId(1), &entry)
            .await
            .unwrap();

        assert!(store.read_history(other.id, UserId(1)).await.unwrap().is_empty());
        assert!(store.read_history(lobby.id, UserId(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_membership_checks() {
        let store = MemoryChatStore::new();
        let room = store.add_room("lobby").await;
        store.add_member(room.id, UserId(1)).await;

        assert!(store.is_member(room.id, UserId(1)).await.unwrap());
        assert!(!store.is_member(room.id, UserId(2)).await.unwrap());
        assert_eq!(store.member_ids(room.id).await.unwrap(), vec![UserId(1)]);
    }
}
