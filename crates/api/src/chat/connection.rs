//! Chat connection handle
//!
//! Represents one live client socket: the session id, who is connected (if
//! anyone), which room the socket is bound to, and the channel used to push
//! events to the client.

use tokio::sync::mpsc;
use uuid::Uuid;

use chatrelay_shared::UserId;

use super::events::ServerEvent;

/// Handle for an active chat connection
#[derive(Debug)]
pub struct Connection {
    /// Unique session ID for this connection
    pub session_id: Uuid,

    /// Connected user; `None` for anonymous connections
    pub user_id: Option<UserId>,

    /// Room name this connection is bound to
    pub room: String,

    /// Channel to send events to this connection
    pub sender: mpsc::UnboundedSender<ServerEvent>,
}

impl Connection {
    pub fn new(
        room: impl Into<String>,
        user_id: Option<UserId>,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            user_id,
            room: room.into(),
            sender,
        }
    }

    /// Send an event to this connection.
    ///
    /// Never blocks; returns Err only when the client side is gone.
    #[allow(clippy::result_large_err)] // Error type is from tokio mpsc, containing the failed event
    pub fn send(&self, event: ServerEvent) -> Result<(), mpsc::error::SendError<ServerEvent>> {
        self.sender.send(event)
    }
}
