//! Chatrelay API Library
//!
//! This crate contains the chat relay server components: the WebSocket
//! session engine, room fan-out, and the presence/queue/history store
//! integrations behind it.

pub mod chat;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod stores;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
