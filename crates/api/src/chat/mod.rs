//! Real-time chat relay core
//!
//! One Connection Session per client WebSocket. A session authorizes the
//! user against room membership, marks presence, replays history and any
//! queued messages, then relays inbound traffic: live fan-out through the
//! room hub, or parked in the offline queue, depending on the delivery
//! policy.
//!
//! # Architecture
//!
//! - **Connection**: handle for one client socket (session id + sender)
//! - **Hub**: room-keyed pub/sub for broadcasting events
//! - **Session**: the connect/receive/disconnect state machine
//! - **Handler**: Axum WebSocket route handlers
//! - **Events**: wire-format frames for client/server communication

pub mod connection;
pub mod events;
pub mod handler;
pub mod hub;
pub mod session;
pub mod state;

pub use handler::{anonymous_chat_handler, chat_handler};
pub use session::{DeliveryPolicy, MembershipAction, Session, SessionContext};
pub use state::ChatState;
