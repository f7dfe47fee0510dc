//! Connection session state machine
//!
//! One `Session` per client connection. The session owns the
//! connect/receive/disconnect protocol and the delivery decision engine:
//! on join it authorizes against room membership, marks presence, replays
//! the history backlog and any queued messages; on each inbound message it
//! persists, fans history out to every room member, and either broadcasts
//! live through the room hub or parks the message in the offline queue.
//!
//! Phases: `Connecting -> Authorizing -> Active -> Closed`. A failed
//! authorization emits a single `error` event and goes straight to
//! `Closed`; the session never retries, the client must reconnect.

use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use chatrelay_shared::{HistoryEntry, QueuedMessage, RelayError, RoomRef, UserId};

use super::connection::Connection;
use super::events::{ChatFrame, ServerEvent};
use super::state::ChatState;
use crate::stores::chat::ChatStore;
use crate::stores::presence::PresenceStore;
use crate::stores::queue::OfflineQueue;

/// Display name used when a user id does not resolve (or no id was given).
/// The message is still persisted and delivered under this name.
pub const ANONYMOUS: &str = "Anonymous";

/// Live-vs-queue branching for inbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Queue iff the *sender's* presence flag is off, otherwise broadcast
    /// live. This matches the historical relay behavior, where the branch
    /// keys off sender presence rather than each recipient's.
    SenderPresence,

    /// Broadcast live and additionally queue a copy for every room member
    /// whose presence flag is off.
    PerRecipient,
}

impl FromStr for DeliveryPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sender" => Ok(Self::SenderPresence),
            "recipient" => Ok(Self::PerRecipient),
            _ => Err(()),
        }
    }
}

/// Membership mutation reported by the membership authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipAction {
    Joined,
    Left,
}

/// Narrow view of shared state a session operates on.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<dyn ChatStore>,
    pub presence: Arc<dyn PresenceStore>,
    pub queue: Arc<dyn OfflineQueue>,
    pub chat: ChatState,
    pub policy: DeliveryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Authorizing,
    Active,
    Closed,
}

/// State machine for one client connection.
pub struct Session {
    conn: Arc<Connection>,
    ctx: SessionContext,
    phase: SessionPhase,
    joined_hub: bool,
    marked_present: bool,
}

impl Session {
    pub fn new(conn: Arc<Connection>, ctx: SessionContext) -> Self {
        Self {
            conn,
            ctx,
            phase: SessionPhase::Connecting,
            joined_hub: false,
            marked_present: false,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Run the join protocol: authorize, enter the room group, mark
    /// presence, replay history, then drain the offline queue.
    ///
    /// On authorization failure exactly one `error` event is emitted and
    /// the caller is expected to close the connection. Partial join state
    /// is released by `close`.
    pub async fn join(&mut self) -> Result<(), RelayError> {
        self.phase = SessionPhase::Authorizing;

        let Some(user_id) = self.conn.user_id else {
            // Anonymous connections skip membership, presence, history and
            // queueing entirely; they only take part in live fan-out.
            self.ctx
                .chat
                .hub
                .join(&self.conn.room, Arc::clone(&self.conn))
                .await;
            self.joined_hub = true;
            self.phase = SessionPhase::Active;
            return Ok(());
        };

        let room = match self.ctx.store.resolve_room(&self.conn.room).await? {
            Some(room) => room,
            None => {
                let _ = self.conn.send(ServerEvent::Error {
                    message: "Room does not exist".to_string(),
                });
                return Err(RelayError::RoomNotFound);
            }
        };

        if !self.ctx.store.is_member(room.id, user_id).await? {
            let _ = self.conn.send(ServerEvent::Error {
                message: "Not authorized for this room".to_string(),
            });
            return Err(RelayError::Unauthorized(room.name));
        }

        self.ctx
            .chat
            .hub
            .join(&self.conn.room, Arc::clone(&self.conn))
            .await;
        self.joined_hub = true;

        self.ctx.presence.connect(user_id).await?;
        self.marked_present = true;

        // Backlog first, then parked messages, then live traffic.
        let history = self.ctx.store.read_history(room.id, user_id).await?;
        let _ = self.conn.send(ServerEvent::ChatHistory { history });

        self.drain_queue(user_id).await?;

        self.phase = SessionPhase::Active;
        tracing::info!(
            session_id = %self.conn.session_id,
            user_id = %user_id,
            room = %room.name,
            "session active"
        );
        Ok(())
    }

    /// Process one inbound frame, in receipt order.
    ///
    /// Malformed frames are logged and dropped without closing the session.
    /// A room that no longer resolves yields an `error` event; the session
    /// stays open.
    pub async fn handle_frame(&self, text: &str) {
        let frame: ChatFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(
                    session_id = %self.conn.session_id,
                    error = %err,
                    "dropping malformed chat frame"
                );
                return;
            }
        };

        if let Err(err) = self.relay_message(frame).await {
            match err {
                RelayError::RoomNotFound => {
                    let _ = self.conn.send(ServerEvent::Error {
                        message: "Room does not exist".to_string(),
                    });
                }
                other => {
                    tracing::error!(
                        session_id = %self.conn.session_id,
                        error = %other,
                        "failed to relay message"
                    );
                    let _ = self.conn.send(ServerEvent::Error {
                        message: "Message delivery failed".to_string(),
                    });
                }
            }
        }
    }

    async fn relay_message(&self, frame: ChatFrame) -> Result<(), RelayError> {
        let timestamp = frame.timestamp.unwrap_or_else(now_rfc3339);

        let room = self
            .ctx
            .store
            .resolve_room(&self.conn.room)
            .await?
            .ok_or(RelayError::RoomNotFound)?;

        let Some(user_id) = self.conn.user_id else {
            // Anonymous senders are relayed live but never persisted.
            self.ctx
                .chat
                .hub
                .publish(
                    &room.name,
                    ServerEvent::ChatMessage {
                        message: frame.message,
                        username: ANONYMOUS.to_string(),
                        timestamp,
                    },
                )
                .await;
            return Ok(());
        };

        let username = self.display_name(user_id).await?;
        self.persist_fanout(&room, user_id, &username, &frame.message, &timestamp)
            .await?;

        match self.ctx.policy {
            DeliveryPolicy::SenderPresence => {
                if self.ctx.presence.is_present(user_id).await? {
                    self.ctx
                        .chat
                        .hub
                        .publish(
                            &room.name,
                            ServerEvent::ChatMessage {
                                message: frame.message,
                                username,
                                timestamp,
                            },
                        )
                        .await;
                } else {
                    self.ctx
                        .queue
                        .enqueue(&QueuedMessage {
                            user_id,
                            room_id: room.id,
                            sender_id: user_id,
                            message: frame.message,
                            timestamp,
                        })
                        .await?;
                }
            }
            DeliveryPolicy::PerRecipient => {
                self.ctx
                    .chat
                    .hub
                    .publish(
                        &room.name,
                        ServerEvent::ChatMessage {
                            message: frame.message.clone(),
                            username,
                            timestamp: timestamp.clone(),
                        },
                    )
                    .await;

                for member in self.ctx.store.member_ids(room.id).await? {
                    if !self.ctx.presence.is_present(member).await? {
                        self.ctx
                            .queue
                            .enqueue(&QueuedMessage {
                                user_id: member,
                                room_id: room.id,
                                sender_id: user_id,
                                message: frame.message.clone(),
                                timestamp: timestamp.clone(),
                            })
                            .await?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Persist a message row and append a history entry for every current
    /// room member. History rows are created lazily by the first append;
    /// members added later are not backfilled.
    async fn persist_fanout(
        &self,
        room: &RoomRef,
        sender_id: UserId,
        username: &str,
        content: &str,
        timestamp: &str,
    ) -> Result<(), RelayError> {
        let message_id = self
            .ctx
            .store
            .append_message(room.id, sender_id, content)
            .await?;
        tracing::debug!(
            message_id = %message_id,
            room = %room.name,
            sender = %sender_id,
            "persisted message"
        );

        let entry = HistoryEntry {
            message: content.to_string(),
            username: username.to_string(),
            timestamp: timestamp.to_string(),
        };
        for member in self.ctx.store.member_ids(room.id).await? {
            self.ctx
                .store
                .append_history(room.id, member, &entry)
                .await?;
        }
        Ok(())
    }

    /// Deliver every parked message for the user, oldest first. An item
    /// that cannot be delivered is pushed back to the front of the queue
    /// rather than lost.
    async fn drain_queue(&self, user_id: UserId) -> Result<(), RelayError> {
        let mut drained = 0usize;
        while let Some(item) = self.ctx.queue.pop_front(user_id).await? {
            if let Err(err) = self.deliver_queued(&item).await {
                if let Err(requeue_err) = self.ctx.queue.push_front(&item).await {
                    tracing::error!(
                        user_id = %user_id,
                        error = %requeue_err,
                        "failed to requeue undelivered message"
                    );
                }
                return Err(err);
            }
            drained += 1;
        }

        if drained > 0 {
            tracing::info!(user_id = %user_id, count = drained, "delivered queued messages");
        }
        Ok(())
    }

    async fn deliver_queued(&self, item: &QueuedMessage) -> Result<(), RelayError> {
        let username = self.display_name(item.sender_id).await?;

        // Drained items are persisted on delivery, same as a fresh send.
        self.ctx
            .store
            .append_message(item.room_id, item.sender_id, &item.message)
            .await?;
        let entry = HistoryEntry {
            message: item.message.clone(),
            username: username.clone(),
            timestamp: item.timestamp.clone(),
        };
        for member in self.ctx.store.member_ids(item.room_id).await? {
            self.ctx
                .store
                .append_history(item.room_id, member, &entry)
                .await?;
        }

        self.conn
            .send(ServerEvent::ChatMessage {
                message: item.message.clone(),
                username,
                timestamp: item.timestamp.clone(),
            })
            .map_err(|_| RelayError::Internal("connection closed during queue drain".to_string()))
    }

    async fn display_name(&self, user_id: UserId) -> Result<String, RelayError> {
        Ok(self
            .ctx
            .store
            .resolve_username(user_id)
            .await?
            .unwrap_or_else(|| ANONYMOUS.to_string()))
    }

    /// Leave the room group and release this connection's contribution to
    /// the user's presence state. Safe to call on any phase; runs on every
    /// exit path.
    pub async fn close(&mut self) {
        if self.phase == SessionPhase::Closed {
            return;
        }

        if self.joined_hub {
            self.ctx
                .chat
                .hub
                .leave(&self.conn.room, &self.conn.session_id)
                .await;
            self.joined_hub = false;
        }

        if self.marked_present {
            if let Some(user_id) = self.conn.user_id {
                if let Err(err) = self.ctx.presence.disconnect(user_id).await {
                    tracing::error!(
                        user_id = %user_id,
                        error = %err,
                        "failed to clear presence on disconnect"
                    );
                }
            }
            self.marked_present = false;
        }

        self.phase = SessionPhase::Closed;
        tracing::debug!(session_id = %self.conn.session_id, "session closed");
    }
}

/// Ingress for the membership authority: publish a membership change to the
/// room group so connected members see who joined or left.
pub async fn notify_membership_changed(
    ctx: &SessionContext,
    room: &RoomRef,
    user_id: UserId,
    action: MembershipAction,
) -> Result<(), RelayError> {
    let username = ctx
        .store
        .resolve_username(user_id)
        .await?
        .unwrap_or_else(|| ANONYMOUS.to_string());

    let event = match action {
        MembershipAction::Joined => ServerEvent::UserJoined {
            username,
            room: room.name.clone(),
        },
        MembershipAction::Left => ServerEvent::UserLeft {
            username,
            room: room.name.clone(),
        },
    };

    ctx.chat.hub.publish(&room.name, event).await;
    Ok(())
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::chat::MemoryChatStore;
    use crate::stores::presence::MemoryPresenceStore;
    use crate::stores::queue::MemoryOfflineQueue;
    use tokio::sync::mpsc;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        ctx: SessionContext,
        store: Arc<MemoryChatStore>,
        presence: Arc<MemoryPresenceStore>,
        queue: Arc<MemoryOfflineQueue>,
    }

    fn harness(policy: DeliveryPolicy) -> Harness {
        let store = Arc::new(MemoryChatStore::new());
        let presence = Arc::new(MemoryPresenceStore::new());
        let queue = Arc::new(MemoryOfflineQueue::new());
        let ctx = SessionContext {
            store: Arc::clone(&store) as Arc<dyn ChatStore>,
            presence: Arc::clone(&presence) as Arc<dyn PresenceStore>,
            queue: Arc::clone(&queue) as Arc<dyn OfflineQueue>,
            chat: ChatState::new(),
            policy,
        };
        Harness {
            ctx,
            store,
            presence,
            queue,
        }
    }

    async fn connect(
        h: &Harness,
        room: &str,
        user: i64,
    ) -> (Session, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = h
            .ctx
            .chat
            .add_connection(Connection::new(room, Some(UserId(user)), tx))
            .await;
        (Session::new(conn, h.ctx.clone()), rx)
    }

    fn frame(message: &str, timestamp: &str) -> String {
        format!(r#"{{"message":"{message}","timestamp":"{timestamp}"}}"#)
    }

    #[tokio::test]
    async fn test_unauthorized_join_emits_single_error_and_no_history() {
        let h = harness(DeliveryPolicy::SenderPresence);
        h.store.add_room("lobby").await;
        h.store.add_user(UserId(1), "alice").await;
        // alice is not a member

        let (mut session, mut rx) = connect(&h, "lobby", 1).await;
        assert!(session.join().await.is_err());
        assert_eq!(session.phase(), SessionPhase::Authorizing);

        assert!(matches!(rx.recv().await, Some(ServerEvent::Error { .. })));
        assert!(rx.try_recv().is_err(), "no further frames after the error");
        assert!(!h.presence.is_present(UserId(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_join_replays_history_before_queue() {
        let h = harness(DeliveryPolicy::SenderPresence);
        let room = h.store.add_room("lobby").await;
        h.store.add_user(UserId(1), "alice").await;
        h.store.add_member(room.id, UserId(1)).await;

        h.store
            .append_history(
                room.id,
                UserId(1),
                &HistoryEntry {
                    message: "old".to_string(),
                    username: "alice".to_string(),
                    timestamp: "T0".to_string(),
                },
            )
            .await
            .unwrap();
        h.queue
            .enqueue(&QueuedMessage {
                user_id: UserId(1),
                room_id: room.id,
                sender_id: UserId(1),
                message: "parked".to_string(),
                timestamp: "T1".to_string(),
            })
            .await
            .unwrap();

        let (mut session, mut rx) = connect(&h, "lobby", 1).await;
        session.join().await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Active);

        // History batch first
        match rx.recv().await {
            Some(ServerEvent::ChatHistory { history }) => {
                assert_eq!(history.len(), 1);
                assert_eq!(history[0].message, "old");
            }
            other => panic!("expected chat_history, got {other:?}"),
        }
        // Then the drained item
        match rx.recv().await {
            Some(ServerEvent::ChatMessage { message, .. }) => assert_eq!(message, "parked"),
            other => panic!("expected chat_message, got {other:?}"),
        }
        assert!(h.queue.is_empty(UserId(1)).await);
        assert!(h.presence.is_present(UserId(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_present_sender_broadcasts_and_does_not_queue() {
        let h = harness(DeliveryPolicy::SenderPresence);
        let room = h.store.add_room("lobby").await;
        h.store.add_user(UserId(1), "alice").await;
        h.store.add_user(UserId(2), "bob").await;
        h.store.add_member(room.id, UserId(1)).await;
        h.store.add_member(room.id, UserId(2)).await;

        let (mut alice, mut alice_rx) = connect(&h, "lobby", 1).await;
        let (mut bob, mut bob_rx) = connect(&h, "lobby", 2).await;
        alice.join().await.unwrap();
        bob.join().await.unwrap();
        // Skip the (empty) history batches
        let _ = alice_rx.recv().await;
        let _ = bob_rx.recv().await;

        alice.handle_frame(&frame("hello", "T")).await;

        match bob_rx.recv().await {
            Some(ServerEvent::ChatMessage {
                message,
                username,
                timestamp,
            }) => {
                assert_eq!(message, "hello");
                assert_eq!(username, "alice");
                assert_eq!(timestamp, "T");
            }
            other => panic!("expected chat_message, got {other:?}"),
        }

        assert!(h.queue.is_empty(UserId(1)).await);
        // History fan-out reached both members
        let bob_history = h.store.read_history(room.id, UserId(2)).await.unwrap();
        assert_eq!(bob_history.len(), 1);
        assert_eq!(bob_history[0].username, "alice");
        assert_eq!(bob_history[0].timestamp, "T");
    }

    #[tokio::test]
    async fn test_absent_sender_queues_instead_of_broadcasting() {
        let h = harness(DeliveryPolicy::SenderPresence);
        let room = h.store.add_room("lobby").await;
        h.store.add_user(UserId(3), "carol").await;
        h.store.add_member(room.id, UserId(3)).await;

        // Session without join: presence flag stays off
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = h
            .ctx
            .chat
            .add_connection(Connection::new("lobby", Some(UserId(3)), tx))
            .await;
        let session = Session::new(conn, h.ctx.clone());

        session.handle_frame(&frame("ping", "T")).await;

        // Persisted and in history, but parked in carol's own queue
        assert_eq!(h.store.message_count().await, 1);
        assert_eq!(
            h.store
                .read_history(room.id, UserId(3))
                .await
                .unwrap()
                .len(),
            1
        );
        let queued = h.queue.pop_front(UserId(3)).await.unwrap().unwrap();
        assert_eq!(queued.message, "ping");
        assert_eq!(queued.sender_id, UserId(3));
    }

    #[tokio::test]
    async fn test_per_recipient_policy_queues_for_absent_members() {
        let h = harness(DeliveryPolicy::PerRecipient);
        let room = h.store.add_room("lobby").await;
        h.store.add_user(UserId(1), "alice").await;
        h.store.add_user(UserId(2), "bob").await;
        h.store.add_member(room.id, UserId(1)).await;
        h.store.add_member(room.id, UserId(2)).await;

        let (mut alice, mut alice_rx) = connect(&h, "lobby", 1).await;
        alice.join().await.unwrap();
        let _ = alice_rx.recv().await; // history batch

        // bob is absent
        alice.handle_frame(&frame("hi bob", "T")).await;

        let queued = h.queue.pop_front(UserId(2)).await.unwrap().unwrap();
        assert_eq!(queued.message, "hi bob");
        assert_eq!(queued.sender_id, UserId(1));
        // alice is present, nothing queued for her
        assert!(h.queue.is_empty(UserId(1)).await);
    }

    #[tokio::test]
    async fn test_room_deleted_mid_session_keeps_connection_open() {
        let h = harness(DeliveryPolicy::SenderPresence);
        let room = h.store.add_room("lobby").await;
        h.store.add_user(UserId(1), "alice").await;
        h.store.add_member(room.id, UserId(1)).await;

        let (mut session, mut rx) = connect(&h, "lobby", 1).await;
        session.join().await.unwrap();
        let _ = rx.recv().await; // history batch

        h.store.remove_room("lobby").await;
        session.handle_frame(&frame("anyone?", "T")).await;

        match rx.recv().await {
            Some(ServerEvent::Error { message }) => {
                assert_eq!(message, "Room does not exist");
            }
            other => panic!("expected error event, got {other:?}"),
        }
        assert_eq!(session.phase(), SessionPhase::Active);
        assert_eq!(h.store.message_count().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped_silently() {
        let h = harness(DeliveryPolicy::SenderPresence);
        let room = h.store.add_room("lobby").await;
        h.store.add_user(UserId(1), "alice").await;
        h.store.add_member(room.id, UserId(1)).await;

        let (mut session, mut rx) = connect(&h, "lobby", 1).await;
        session.join().await.unwrap();
        let _ = rx.recv().await; // history batch

        session.handle_frame("{not json").await;

        assert!(rx.try_recv().is_err());
        assert_eq!(h.store.message_count().await, 0);
        assert_eq!(session.phase(), SessionPhase::Active);
    }

    #[tokio::test]
    async fn test_unresolvable_sender_falls_back_to_anonymous() {
        let h = harness(DeliveryPolicy::SenderPresence);
        let room = h.store.add_room("lobby").await;
        // user 9 exists in no directory
        h.store.add_member(room.id, UserId(9)).await;

        let (mut session, mut rx) = connect(&h, "lobby", 9).await;
        session.join().await.unwrap();
        let _ = rx.recv().await; // history batch

        session.handle_frame(&frame("who am i", "T")).await;

        match rx.recv().await {
            Some(ServerEvent::ChatMessage { username, .. }) => {
                assert_eq!(username, ANONYMOUS);
            }
            other => panic!("expected chat_message, got {other:?}"),
        }
        // Still persisted despite the unresolvable id
        assert_eq!(h.store.message_count().await, 1);
    }

    #[tokio::test]
    async fn test_close_clears_presence_and_hub_membership() {
        let h = harness(DeliveryPolicy::SenderPresence);
        let room = h.store.add_room("lobby").await;
        h.store.add_user(UserId(1), "alice").await;
        h.store.add_member(room.id, UserId(1)).await;

        let (mut session, _rx) = connect(&h, "lobby", 1).await;
        session.join().await.unwrap();
        assert!(h.presence.is_present(UserId(1)).await.unwrap());
        assert_eq!(h.ctx.chat.hub.room_size("lobby").await, 1);

        session.close().await;
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert!(!h.presence.is_present(UserId(1)).await.unwrap());
        assert_eq!(h.ctx.chat.hub.room_size("lobby").await, 0);

        // Idempotent
        session.close().await;
        assert!(!h.presence.is_present(UserId(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_membership_change_notifies_room_group() {
        let h = harness(DeliveryPolicy::SenderPresence);
        let room = h.store.add_room("lobby").await;
        h.store.add_user(UserId(1), "alice").await;
        h.store.add_user(UserId(2), "bob").await;
        h.store.add_member(room.id, UserId(1)).await;

        let (mut alice, mut alice_rx) = connect(&h, "lobby", 1).await;
        alice.join().await.unwrap();
        let _ = alice_rx.recv().await; // history batch

        notify_membership_changed(&h.ctx, &room, UserId(2), MembershipAction::Joined)
            .await
            .unwrap();

        match alice_rx.recv().await {
            Some(ServerEvent::UserJoined { username, room }) => {
                assert_eq!(username, "bob");
                assert_eq!(room, "lobby");
            }
            other => panic!("expected user_joined, got {other:?}"),
        }
    }

    #[test]
    fn test_delivery_policy_parsing() {
        assert_eq!(
            "sender".parse::<DeliveryPolicy>(),
            Ok(DeliveryPolicy::SenderPresence)
        );
        assert_eq!(
            "recipient".parse::<DeliveryPolicy>(),
            Ok(DeliveryPolicy::PerRecipient)
        );
        assert!("broadcast".parse::<DeliveryPolicy>().is_err());
    }
}
