//! WebSocket handlers for Axum
//!
//! Upgrades `/chat/{room}/{user_id}` (and the anonymous `/chat/{room}`)
//! connections and pumps the socket: a writer task drains the session's
//! event channel while the read loop feeds inbound frames to the session
//! strictly in receipt order.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

use chatrelay_shared::{RelayError, UserId};

use crate::state::AppState;

use super::{connection::Connection, events::ServerEvent, session::Session};

/// WebSocket handler for an identified user: `/chat/{room_name}/{user_id}`
pub async fn chat_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((room_name, user_id)): Path<(String, i64)>,
) -> Result<Response, StatusCode> {
    // User ids are non-negative; identity issuance is someone else's job.
    if user_id < 0 {
        return Err(StatusCode::BAD_REQUEST);
    }

    tracing::info!(room = %room_name, user_id, "chat connection upgrade requested");
    Ok(ws.on_upgrade(move |socket| {
        run_session(socket, room_name, Some(UserId(user_id)), state)
    }))
}

/// WebSocket handler for an anonymous connection: `/chat/{room_name}`
///
/// Anonymous connections receive live room traffic only; membership checks,
/// presence, history replay, and offline queueing are all skipped.
pub async fn anonymous_chat_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(room_name): Path<String>,
) -> Response {
    tracing::info!(room = %room_name, "anonymous chat connection upgrade requested");
    ws.on_upgrade(move |socket| run_session(socket, room_name, None, state))
}

/// Drive one client connection through its session lifecycle.
async fn run_session(
    socket: WebSocket,
    room_name: String,
    user_id: Option<UserId>,
    state: AppState,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for pushing events to this connection
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let conn = Connection::new(room_name, user_id, tx);
    let conn = state.chat.add_connection(conn).await;
    let session_id = conn.session_id;

    // Writer task: serialize and forward events until the channel closes
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to serialize chat event");
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut session = Session::new(Arc::clone(&conn), state.session_context());

    if let Err(err) = session.join().await {
        match &err {
            RelayError::RoomNotFound | RelayError::Unauthorized(_) => {
                // The session already emitted its single error event.
                tracing::info!(session_id = %session_id, error = %err, "join rejected");
            }
            other => {
                tracing::error!(session_id = %session_id, error = %other, "join failed");
                let _ = conn.send(ServerEvent::Error {
                    message: "Connection failed".to_string(),
                });
            }
        }

        session.close().await;
        state.chat.remove_connection(&session_id).await;
        // Drop our channel handles so the writer flushes the error frame
        // and closes the socket.
        drop(session);
        drop(conn);
        let _ = send_task.await;
        return;
    }

    // Inbound frames are processed strictly in receipt order; two frames
    // from the same connection never overlap.
    while let Some(msg) = ws_receiver.next().await {
        if let Ok(msg) = msg {
            match msg {
                Message::Text(text) => session.handle_frame(&text).await,
                Message::Close(_) => {
                    tracing::info!(session_id = %session_id, "close frame received");
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    // Axum handles ping/pong automatically
                }
                _ => {} // Ignore binary messages
            }
        }
    }

    // Disconnect path: leave the room group and clear presence even if the
    // socket dropped mid-operation.
    session.close().await;
    state.chat.remove_connection(&session_id).await;
    send_task.abort();
}
