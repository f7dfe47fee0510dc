//! Presence store
//!
//! Tracks, per user, whether at least one live connection exists. Backed by
//! the shared fast store so presence stays correct across multiple relay
//! processes. The representation is a reference count, not a boolean flag:
//! a second device disconnecting must not clear presence for a still-open
//! first device.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use chatrelay_shared::{RelayError, UserId};

use super::{keys, map_redis_err};

/// Per-user live-connection tracking.
///
/// `connect`/`disconnect` are called exactly once per session; the count of
/// outstanding `connect`s determines `is_present`.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Record one more live connection for the user.
    async fn connect(&self, user_id: UserId) -> Result<(), RelayError>;

    /// Record that one of the user's connections ended.
    async fn disconnect(&self, user_id: UserId) -> Result<(), RelayError>;

    /// Whether the user currently has at least one live connection.
    async fn is_present(&self, user_id: UserId) -> Result<bool, RelayError>;
}

/// Bounded backoff for transient store failures.
pub(crate) fn retry_strategy() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(50).map(jitter).take(3)
}

/// Redis-backed presence store.
///
/// The count lives under one key per user and is only touched through
/// single atomic primitives (INCR/DECR/GET/DEL), so concurrent sessions for
/// the same user never race a read-modify-write.
pub struct RedisPresenceStore {
    conn: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisPresenceStore {
    pub fn new(conn: ConnectionManager, ttl_seconds: u64) -> Self {
        Self { conn, ttl_seconds }
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn connect(&self, user_id: UserId) -> Result<(), RelayError> {
        let key = keys::presence(user_id);

        let count: i64 = Retry::spawn(retry_strategy(), || {
            let mut conn = self.conn.clone();
            let key = key.clone();
            async move { conn.incr(&key, 1i64).await }
        })
        .await
        .map_err(map_redis_err)?;

        // Backstop TTL so a count leaked by a crashed instance expires.
        let ttl = self.ttl_seconds as i64;
        let _: () = Retry::spawn(retry_strategy(), || {
            let mut conn = self.conn.clone();
            let key = key.clone();
            async move { conn.expire(&key, ttl).await }
        })
        .await
        .map_err(map_redis_err)?;

        tracing::debug!(user_id = %user_id, connections = count, "presence connect");
        Ok(())
    }

    async fn disconnect(&self, user_id: UserId) -> Result<(), RelayError> {
        let key = keys::presence(user_id);

        let count: i64 = Retry::spawn(retry_strategy(), || {
            let mut conn = self.conn.clone();
            let key = key.clone();
            async move { conn.decr(&key, 1i64).await }
        })
        .await
        .map_err(map_redis_err)?;

        if count <= 0 {
            let _: () = Retry::spawn(retry_strategy(), || {
                let mut conn = self.conn.clone();
                let key = key.clone();
                async move { conn.del(&key).await }
            })
            .await
            .map_err(map_redis_err)?;
        }

        tracing::debug!(user_id = %user_id, connections = count.max(0), "presence disconnect");
        Ok(())
    }

    async fn is_present(&self, user_id: UserId) -> Result<bool, RelayError> {
        let key = keys::presence(user_id);

        let count: Option<i64> = Retry::spawn(retry_strategy(), || {
            let mut conn = self.conn.clone();
            let key = key.clone();
            async move { conn.get(&key).await }
        })
        .await
        .map_err(map_redis_err)?;

        Ok(count.unwrap_or(0) > 0)
    }
}

/// In-memory presence store (for development and tests without Redis)
#[derive(Default)]
pub struct MemoryPresenceStore {
    counts: Mutex<HashMap<i64, i64>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn connect(&self, user_id: UserId) -> Result<(), RelayError> {
        let mut counts = self.counts.lock().await;
        *counts.entry(user_id.0).or_insert(0) += 1;
        Ok(())
    }

    async fn disconnect(&self, user_id: UserId) -> Result<(), RelayError> {
        let mut counts = self.counts.lock().await;
        if let Some(count) = counts.get_mut(&user_id.0) {
            *count -= 1;
            if *count <= 0 {
                counts.remove(&user_id.0);
            }
        }
        Ok(())
    }

    async fn is_present(&self, user_id: UserId) -> Result<bool, RelayError> {
        let counts = self.counts.lock().await;
        Ok(counts.get(&user_id.0).copied().unwrap_or(0) > 0)
    }
}
