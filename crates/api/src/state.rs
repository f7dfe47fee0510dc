//! Shared application state
//!
//! Store handles are constructed once at process start and shared by
//! reference across all sessions; no per-connection reconstruction.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use sqlx::PgPool;

use crate::chat::session::SessionContext;
use crate::chat::state::ChatState;
use crate::config::Config;
use crate::stores::chat::{ChatStore, PgChatStore};
use crate::stores::presence::{PresenceStore, RedisPresenceStore};
use crate::stores::queue::{OfflineQueue, RedisOfflineQueue};

/// Global application state shared across all connections and routes
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,

    /// Durable store (rooms, membership, messages, history)
    pub pool: PgPool,

    /// Shared fast store handle, kept for health checks
    pub redis: ConnectionManager,

    pub store: Arc<dyn ChatStore>,
    pub presence: Arc<dyn PresenceStore>,
    pub queue: Arc<dyn OfflineQueue>,

    /// Process-local connection registry and room hub
    pub chat: ChatState,
}

impl AppState {
    pub fn new(config: Config, pool: PgPool, redis: ConnectionManager) -> Self {
        let presence = Arc::new(RedisPresenceStore::new(
            redis.clone(),
            config.presence_ttl_seconds,
        ));
        let queue = Arc::new(RedisOfflineQueue::new(redis.clone()));
        let store = Arc::new(PgChatStore::new(pool.clone()));

        Self {
            config: Arc::new(config),
            pool,
            redis,
            store,
            presence,
            queue,
            chat: ChatState::new(),
        }
    }

    /// Narrow view of the state consumed by connection sessions
    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            store: Arc::clone(&self.store),
            presence: Arc::clone(&self.presence),
            queue: Arc::clone(&self.queue),
            chat: self.chat.clone(),
            policy: self.config.delivery_policy,
        }
    }
}
