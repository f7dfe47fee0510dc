//! Store integrations for the relay core
//!
//! Each collaborator the session consults is a narrow trait with a
//! production implementation (Redis or Postgres) and an in-memory
//! implementation used by tests and redis-less development:
//!
//! - **presence**: per-user live-connection refcount (shared fast store)
//! - **queue**: per-user FIFO offline message queue (shared fast store)
//! - **chat**: rooms, identity, membership, messages, history (durable store)

pub mod chat;
pub mod keys;
pub mod presence;
pub mod queue;

use chatrelay_shared::RelayError;

pub use chat::ChatStore;
pub use presence::PresenceStore;
pub use queue::OfflineQueue;

pub(crate) fn map_redis_err(err: redis::RedisError) -> RelayError {
    RelayError::Store(format!("redis: {err}"))
}
