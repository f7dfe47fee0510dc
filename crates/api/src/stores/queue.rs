//! Offline message queue
//!
//! An ordered, per-user durable queue of messages that arrived while the
//! user had no live connection. FIFO per user; items are removed as they
//! are read, and a consumer that cannot deliver an item pushes it back to
//! the front so nothing is lost and order is preserved.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio_retry::Retry;

use chatrelay_shared::{QueuedMessage, RelayError, UserId};

use super::presence::retry_strategy;
use super::{keys, map_redis_err};

/// Per-user FIFO queue of pending messages.
#[async_trait]
pub trait OfflineQueue: Send + Sync {
    /// Append a message to the back of the owner's queue.
    async fn enqueue(&self, msg: &QueuedMessage) -> Result<(), RelayError>;

    /// Destructively take the oldest queued message, if any.
    async fn pop_front(&self, user_id: UserId) -> Result<Option<QueuedMessage>, RelayError>;

    /// Return an undelivered message to the front of its owner's queue.
    async fn push_front(&self, msg: &QueuedMessage) -> Result<(), RelayError>;
}

/// Redis-backed offline queue (one list per user).
///
/// Only single atomic list primitives are used (RPUSH/LPOP/LPUSH), so a
/// concurrent drain from two connections may double-deliver but can never
/// corrupt or lose an item.
pub struct RedisOfflineQueue {
    conn: ConnectionManager,
}

impl RedisOfflineQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl OfflineQueue for RedisOfflineQueue {
    async fn enqueue(&self, msg: &QueuedMessage) -> Result<(), RelayError> {
        let key = keys::queue(msg.user_id);
        let payload = serde_json::to_string(msg)
            .map_err(|e| RelayError::Internal(format!("encode queued message: {e}")))?;

        let _: () = Retry::spawn(retry_strategy(), || {
            let mut conn = self.conn.clone();
            let key = key.clone();
            let payload = payload.clone();
            async move { conn.rpush(&key, &payload).await }
        })
        .await
        .map_err(map_redis_err)?;

        tracing::debug!(user_id = %msg.user_id, room_id = %msg.room_id, "queued offline message");
        Ok(())
    }

    async fn pop_front(&self, user_id: UserId) -> Result<Option<QueuedMessage>, RelayError> {
        let key = keys::queue(user_id);

        let payload: Option<String> = Retry::spawn(retry_strategy(), || {
            let mut conn = self.conn.clone();
            let key = key.clone();
            async move { conn.lpop(&key, None).await }
        })
        .await
        .map_err(map_redis_err)?;

        match payload {
            Some(raw) => {
                let msg = serde_json::from_str(&raw)
                    .map_err(|e| RelayError::Store(format!("corrupt queued message: {e}")))?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    async fn push_front(&self, msg: &QueuedMessage) -> Result<(), RelayError> {
        let key = keys::queue(msg.user_id);
        let payload = serde_json::to_string(msg)
            .map_err(|e| RelayError::Internal(format!("encode queued message: {e}")))?;

        let _: () = Retry::spawn(retry_strategy(), || {
            let mut conn = self.conn.clone();
            let key = key.clone();
            let payload = payload.clone();
            async move { conn.lpush(&key, &payload).await }
        })
        .await
        .map_err(map_redis_err)?;

        Ok(())
    }
}

/// In-memory offline queue (for development and tests without Redis)
#[derive(Default)]
pub struct MemoryOfflineQueue {
    queues: Mutex<HashMap<i64, VecDeque<QueuedMessage>>>,
}

impl MemoryOfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending items for a user.
    pub async fn len(&self, user_id: UserId) -> usize {
        let queues = self.queues.lock().await;
        queues.get(&user_id.0).map(VecDeque::len).unwrap_or(0)
    }

    pub async fn is_empty(&self, user_id: UserId) -> bool {
        self.len(user_id).await == 0
    }
}

#[async_trait]
impl OfflineQueue for MemoryOfflineQueue {
    async fn enqueue(&self, msg: &QueuedMessage) -> Result<(), RelayError> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(msg.user_id.0)
            .or_default()
            .push_back(msg.clone());
        Ok(())
    }

    async fn pop_front(&self, user_id: UserId) -> Result<Option<QueuedMessage>, RelayError> {
        let mut queues = self.queues.lock().await;
        let item = queues.get_mut(&user_id.0).and_then(VecDeque::pop_front);
        if queues.get(&user_id.0).is_some_and(VecDeque::is_empty) {
            queues.remove(&user_id.0);
        }
        Ok(item)
    }

    async fn push_front(&self, msg: &QueuedMessage) -> Result<(), RelayError> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(msg.user_id.0)
            .or_default()
            .push_front(msg.clone());
        Ok(())
    }
}
