//! Chat gateway: shared state and the per-event handlers.
//!
//! Each handler runs to completion for one inbound event. Handlers never
//! fail outward: validation and storage errors become a log line, plus a
//! negative or empty reply when the event carries an `ack`.

use std::sync::atomic::{AtomicUsize, Ordering};

use tutorchat_proto::event::{ClientEvent, Notification, SendAck, SendPayload, ServerEvent};
use tutorchat_proto::ids::{MessageId, RoomId, UserId};
use tutorchat_proto::message::{ChatRequest, MAX_CONTENT_CHARS, WireMessage};

use crate::access::RoomAccess;
use crate::connection::Connection;
use crate::handle::ConnectionHandle;
use crate::presence::{PresenceDirectory, PresenceRegistry};
use crate::rooms::{RoomDirectory, RoomRouter};
use crate::store::{MessageStore, NewMessage, StoreBackend};

/// Default maximum inbound frame size in bytes (64 KB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Tunables applied to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Inbound frames above this size are dropped.
    pub max_frame_size: usize,
    /// Maximum message content length in characters.
    pub max_content_chars: usize,
    /// Reject handshakes without a `token` query parameter.
    pub require_token: bool,
    /// Policy applied to every room-scoped event.
    pub room_access: RoomAccess,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_content_chars: MAX_CONTENT_CHARS,
            require_token: true,
            room_access: RoomAccess::Open,
        }
    }
}

/// Counters reported by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct GatewayStats {
    /// Open socket connections.
    pub connections: usize,
    /// Users with a presence entry.
    pub online_users: usize,
    /// Rooms with at least one joined connection.
    pub rooms: usize,
}

/// State shared by every connection of one gateway.
pub struct GatewayState<S = StoreBackend> {
    store: S,
    presence: Box<dyn PresenceDirectory>,
    rooms: Box<dyn RoomDirectory>,
    settings: GatewaySettings,
    open_connections: AtomicUsize,
}

impl<S: MessageStore> GatewayState<S> {
    /// Creates gateway state with in-process presence and room tables.
    pub fn new(store: S, settings: GatewaySettings) -> Self {
        Self::with_directories(
            store,
            Box::new(PresenceRegistry::new()),
            Box::new(RoomRouter::new()),
            settings,
        )
    }

    /// Creates gateway state with caller-supplied presence and room tables.
    pub fn with_directories(
        store: S,
        presence: Box<dyn PresenceDirectory>,
        rooms: Box<dyn RoomDirectory>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            store,
            presence,
            rooms,
            settings,
            open_connections: AtomicUsize::new(0),
        }
    }

    /// The message store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// The presence table.
    pub fn presence(&self) -> &dyn PresenceDirectory {
        self.presence.as_ref()
    }

    /// The room table.
    pub fn rooms(&self) -> &dyn RoomDirectory {
        self.rooms.as_ref()
    }

    /// Gateway tunables.
    pub const fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Current connection, presence, and room counts.
    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            connections: self.open_connections.load(Ordering::Relaxed),
            online_users: self.presence.online_count(),
            rooms: self.rooms.room_count(),
        }
    }

    pub(crate) fn connection_opened(&self) {
        self.open_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Forgets every registration and membership of a closed connection.
    pub fn connection_closed(&self, handle: &ConnectionHandle) {
        let rooms_left = self.rooms.release(handle);
        let identities = self.presence.unregister_handle(handle);
        self.open_connections.fetch_sub(1, Ordering::Relaxed);
        tracing::info!(
            conn_id = %handle.id(),
            rooms_left,
            identities,
            "connection closed"
        );
    }

    /// Pushes a notification to the connection registered for `user`.
    ///
    /// Returns `false` if the user has no live connection.
    pub fn notify(&self, user: &UserId, notification: Notification) -> bool {
        let Some(handle) = self.presence.resolve(user) else {
            tracing::debug!(user_id = %user, "notification target not connected");
            return false;
        };
        let delivered = handle.send(ServerEvent::Notification(notification));
        tracing::info!(user_id = %user, conn_id = %handle.id(), delivered, "notification pushed");
        delivered
    }

    /// Dispatches one decoded client event for `conn`.
    pub async fn handle_event(&self, conn: &mut Connection, event: ClientEvent) {
        tracing::debug!(conn_id = %conn.id(), phase = ?conn.phase(), event = event.name(), "event");
        match event {
            ClientEvent::Register { user_id } => self.on_register(conn, user_id),
            ClientEvent::JoinRoom { room_id } => self.on_join_room(conn, &room_id),
            ClientEvent::SendMessage { ack, message } => {
                let result = self.on_send_message(conn, message).await;
                conn.reply(ServerEvent::SendResult { ack, result });
            }
            ClientEvent::GetHistory { ack, room_id } => {
                let messages = self.on_get_history(conn, &room_id).await;
                conn.reply(ServerEvent::History { ack, messages });
            }
            ClientEvent::MarkAsRead {
                message_id,
                room_id,
            } => self.on_mark_as_read(conn, message_id, &room_id).await,
            ClientEvent::DeleteMessage {
                message_id,
                room_id,
            } => self.on_delete_message(conn, message_id, &room_id).await,
            ClientEvent::GetChatRequestsForTutor { ack, tutor_id } => {
                let requests = self.on_chat_requests(conn, &tutor_id).await;
                conn.reply(ServerEvent::ChatRequests { ack, requests });
            }
        }
    }

    fn on_register(&self, conn: &mut Connection, user: UserId) {
        if user.is_blank() {
            tracing::warn!(conn_id = %conn.id(), "ignoring register with blank userId");
            return;
        }
        if let Some(previous) = conn.user().filter(|u| **u != user) {
            tracing::info!(conn_id = %conn.id(), from = %previous, to = %user, "connection re-registered");
        }
        if let Some(replaced) = self.presence.register(user.clone(), conn.handle().clone())
            && replaced != *conn.handle()
        {
            tracing::info!(user_id = %user, replaced = %replaced.id(), "presence moved to newer connection");
        }
        tracing::info!(conn_id = %conn.id(), user_id = %user, "user registered");
        conn.registered(user);
    }

    fn on_join_room(&self, conn: &mut Connection, raw_room: &str) {
        let Some(room) = RoomId::parse(raw_room) else {
            tracing::warn!(conn_id = %conn.id(), "ignoring joinRoom with blank roomId");
            return;
        };
        if !self.admits(conn, &room, "joinRoom") {
            return;
        }
        let fresh = self.rooms.join(&room, conn.handle());
        tracing::info!(conn_id = %conn.id(), room_id = %room, fresh, "joined room");
        conn.joined();
    }

    /// Applies the room access policy to `event` from `conn`, logging a denial.
    fn admits(&self, conn: &Connection, room: &RoomId, event: &'static str) -> bool {
        let permitted = self.settings.room_access.permits(conn.user(), room);
        if !permitted {
            tracing::warn!(
                conn_id = %conn.id(),
                user_id = ?conn.user(),
                room_id = %room,
                event,
                "denied by room access policy"
            );
        }
        permitted
    }

    async fn on_send_message(&self, conn: &Connection, payload: SendPayload) -> SendAck {
        let message = match payload.into_message() {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(conn_id = %conn.id(), error = %e, "malformed sendMessage payload");
                return SendAck::rejected(format!("malformed message: {e}"));
            }
        };
        if let Some(user) = conn.user()
            && !message.sender_id.is_blank()
            && message.sender_id != *user
        {
            tracing::warn!(
                conn_id = %conn.id(),
                registered = %user,
                claimed = %message.sender_id,
                "senderId does not match registered identity, using registered"
            );
        }

        let new_message = match NewMessage::from_outgoing(
            message,
            conn.user(),
            self.settings.max_content_chars,
        ) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(conn_id = %conn.id(), error = %e, "rejected sendMessage");
                return SendAck::rejected(e.to_string());
            }
        };
        if !self.admits(conn, &new_message.room, "sendMessage") {
            return SendAck::rejected(format!("not a participant of room {}", new_message.room));
        }

        let stored = match self.store.append(new_message).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!(conn_id = %conn.id(), error = %e, "failed to persist message");
                return SendAck::rejected(e.to_string());
            }
        };

        let delivered = self
            .rooms
            .broadcast(&stored.room, &ServerEvent::ChatMessage(stored.to_wire()));
        tracing::info!(
            conn_id = %conn.id(),
            message_id = %stored.id,
            room_id = %stored.room,
            kind = %stored.body.kind(),
            delivered,
            "message stored and broadcast"
        );
        SendAck::accepted(stored.id)
    }

    async fn on_get_history(&self, conn: &Connection, raw_room: &str) -> Vec<WireMessage> {
        let Some(room) = RoomId::parse(raw_room) else {
            tracing::warn!(conn_id = %conn.id(), "getHistory with blank roomId");
            return Vec::new();
        };
        if !self.admits(conn, &room, "getHistory") {
            return Vec::new();
        }
        match self.store.history_for_room(&room).await {
            Ok(messages) => messages.iter().map(|m| m.to_wire()).collect(),
            Err(e) => {
                tracing::error!(conn_id = %conn.id(), room_id = %room, error = %e, "history lookup failed");
                Vec::new()
            }
        }
    }

    async fn on_mark_as_read(&self, conn: &Connection, message_id: MessageId, raw_room: &str) {
        let Some(room) = RoomId::parse(raw_room) else {
            tracing::warn!(conn_id = %conn.id(), %message_id, "markAsRead with blank roomId");
            return;
        };
        if !self.admits(conn, &room, "markAsRead") {
            return;
        }
        match self.store.mark_read(&message_id, &room).await {
            Ok(outcome) if outcome.found() => {
                let delivered = self
                    .rooms
                    .broadcast(&room, &ServerEvent::MessageSeen { message_id });
                tracing::debug!(%message_id, room_id = %room, ?outcome, delivered, "read receipt");
            }
            Ok(_) => {
                tracing::debug!(%message_id, room_id = %room, "markAsRead for unknown message");
            }
            Err(e) => {
                tracing::error!(%message_id, room_id = %room, error = %e, "markAsRead failed");
            }
        }
    }

    async fn on_delete_message(&self, conn: &Connection, message_id: MessageId, raw_room: &str) {
        let Some(room) = RoomId::parse(raw_room) else {
            tracing::warn!(conn_id = %conn.id(), %message_id, "deleteMessage with blank roomId");
            return;
        };
        if !self.admits(conn, &room, "deleteMessage") {
            return;
        }
        let Some(requester) = conn.user() else {
            tracing::warn!(conn_id = %conn.id(), %message_id, "deleteMessage before register");
            return;
        };
        match self.store.soft_delete(&message_id, &room, requester).await {
            Ok(true) => {
                let delivered = self
                    .rooms
                    .broadcast(&room, &ServerEvent::MessageDeleted { message_id });
                tracing::info!(%message_id, room_id = %room, user_id = %requester, delivered, "message deleted");
            }
            Ok(false) => {
                tracing::warn!(
                    %message_id,
                    room_id = %room,
                    user_id = %requester,
                    "deleteMessage refused (unknown, not the sender, or already deleted)"
                );
            }
            Err(e) => {
                tracing::error!(%message_id, room_id = %room, error = %e, "deleteMessage failed");
            }
        }
    }

    async fn on_chat_requests(&self, conn: &Connection, tutor: &UserId) -> Vec<ChatRequest> {
        if tutor.is_blank() {
            tracing::warn!(conn_id = %conn.id(), "getChatRequestsForTutor with blank tutorId");
            return Vec::new();
        }
        match self.store.recent_senders_to(tutor).await {
            Ok(senders) => senders
                .into_iter()
                .map(|s| ChatRequest {
                    id: s.room,
                    student_id: s.sender_id,
                    student_name: s.sender_name,
                    message: s.last_content,
                    time: s.last_timestamp,
                })
                .collect(),
            Err(e) => {
                tracing::error!(tutor_id = %tutor, error = %e, "chat request lookup failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use tokio::sync::mpsc::UnboundedReceiver;
    use tutorchat_proto::message::{MessageKind, OutgoingMessage, ValidationError};

    use super::*;
    use crate::store::{
        InMemoryMessageStore, MarkRead, SenderSummary, StoreError, StoredMessage,
    };

    fn state() -> GatewayState<InMemoryMessageStore> {
        GatewayState::new(InMemoryMessageStore::new(), GatewaySettings::default())
    }

    fn connect() -> (Connection, UnboundedReceiver<ServerEvent>) {
        let (handle, rx) = ConnectionHandle::channel();
        (Connection::new(handle), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn text(sender: &str, receiver: &str, room: &str, content: &str) -> OutgoingMessage {
        OutgoingMessage {
            sender_id: UserId::new(sender),
            sender_name: sender.to_uppercase(),
            receiver_id: Some(UserId::new(receiver)),
            room_id: room.to_string(),
            content: content.to_string(),
            ..OutgoingMessage::default()
        }
    }

    async fn join_as(
        state: &GatewayState<InMemoryMessageStore>,
        user: &str,
        room: &str,
    ) -> (Connection, UnboundedReceiver<ServerEvent>) {
        let (mut conn, rx) = connect();
        state
            .handle_event(&mut conn, ClientEvent::Register { user_id: UserId::new(user) })
            .await;
        state
            .handle_event(&mut conn, ClientEvent::JoinRoom { room_id: room.into() })
            .await;
        (conn, rx)
    }

    async fn send(
        state: &GatewayState<InMemoryMessageStore>,
        conn: &mut Connection,
        ack: u64,
        message: OutgoingMessage,
    ) {
        state
            .handle_event(conn, ClientEvent::SendMessage { ack, message: message.into() })
            .await;
    }

    fn send_result(events: &[ServerEvent], ack: u64) -> SendAck {
        events
            .iter()
            .find_map(|e| match e {
                ServerEvent::SendResult { ack: a, result } if *a == ack => Some(result.clone()),
                _ => None,
            })
            .expect("no sendResult for ack")
    }

    // =========================================================================
    // sendMessage
    // =========================================================================

    #[tokio::test]
    async fn send_broadcasts_to_room_and_acks() {
        let state = state();
        let (mut student, mut student_rx) = join_as(&state, "s1", "s1-t1").await;
        let (_tutor, mut tutor_rx) = join_as(&state, "t1", "s1-t1").await;

        send(&state, &mut student, 1, text("s1", "t1", "s1-t1", "hello")).await;

        let tutor_events = drain(&mut tutor_rx);
        assert!(matches!(
            &tutor_events[..],
            [ServerEvent::ChatMessage(m)] if m.content == "hello" && m.is_delivered && !m.is_read
        ));
        let ack = send_result(&drain(&mut student_rx), 1);
        assert!(ack.success);
        assert!(ack.message_id.is_some());
    }

    #[tokio::test]
    async fn blank_room_is_rejected_and_not_persisted() {
        let state = state();
        let (mut conn, mut rx) = join_as(&state, "s1", "s1-t1").await;

        send(&state, &mut conn, 9, text("s1", "t1", "", "hello")).await;

        let ack = send_result(&drain(&mut rx), 9);
        assert!(!ack.success);
        assert_eq!(ack.error.as_deref(), Some("roomId is required, received blank"));
        assert!(state.store().is_empty().await);
    }

    #[tokio::test]
    async fn registered_identity_overrides_claimed_sender() {
        let state = state();
        let (mut conn, mut rx) = join_as(&state, "s1", "s1-t1").await;

        send(&state, &mut conn, 1, text("mallory", "t1", "s1-t1", "spoof")).await;

        let events = drain(&mut rx);
        let ServerEvent::ChatMessage(wire) = &events[0] else {
            panic!("expected chatMessage first, got {events:?}");
        };
        assert_eq!(wire.sender_id, UserId::new("s1"));
    }

    #[tokio::test]
    async fn unregistered_blank_sender_is_rejected() {
        let state = state();
        let (mut conn, mut rx) = connect();
        let message = OutgoingMessage {
            room_id: "s1-t1".into(),
            content: "anon".into(),
            ..OutgoingMessage::default()
        };
        send(&state, &mut conn, 2, message).await;
        let ack = send_result(&drain(&mut rx), 2);
        assert_eq!(
            ack.error,
            Some(ValidationError::BlankSender.to_string())
        );
    }

    #[tokio::test]
    async fn image_without_url_gets_validation_error() {
        let state = state();
        let (mut conn, mut rx) = join_as(&state, "s1", "s1-t1").await;
        let message = OutgoingMessage {
            message_type: Some(MessageKind::Image),
            ..text("s1", "t1", "s1-t1", "")
        };
        send(&state, &mut conn, 3, message).await;
        let ack = send_result(&drain(&mut rx), 3);
        assert!(!ack.success);
        assert!(ack.error.unwrap().contains("image"));
    }

    #[tokio::test]
    async fn content_limit_follows_settings() {
        let settings = GatewaySettings {
            max_content_chars: 5,
            ..GatewaySettings::default()
        };
        let state = GatewayState::new(InMemoryMessageStore::new(), settings);
        let (mut conn, mut rx) = connect();
        send(&state, &mut conn, 4, text("s1", "t1", "s1-t1", "too long")).await;
        assert!(!send_result(&drain(&mut rx), 4).success);
    }

    // =========================================================================
    // getHistory / getChatRequestsForTutor
    // =========================================================================

    #[tokio::test]
    async fn history_ends_with_last_sent_message() {
        let state = state();
        let (mut conn, mut rx) = join_as(&state, "s1", "s1-t1").await;
        send(&state, &mut conn, 1, text("s1", "t1", "s1-t1", "first")).await;
        send(&state, &mut conn, 2, text("s1", "t1", "s1-t1", "second")).await;
        drain(&mut rx);

        state
            .handle_event(&mut conn, ClientEvent::GetHistory { ack: 3, room_id: "s1-t1".into() })
            .await;
        let events = drain(&mut rx);
        let [ServerEvent::History { ack: 3, messages }] = &events[..] else {
            panic!("expected history reply, got {events:?}");
        };
        let last = messages.last().unwrap();
        assert_eq!(last.content, "second");
        assert_eq!(last.sender_id, UserId::new("s1"));
    }

    #[tokio::test]
    async fn history_for_blank_room_is_empty() {
        let state = state();
        let (mut conn, mut rx) = connect();
        state
            .handle_event(&mut conn, ClientEvent::GetHistory { ack: 1, room_id: " ".into() })
            .await;
        assert_eq!(
            drain(&mut rx),
            vec![ServerEvent::History { ack: 1, messages: vec![] }]
        );
    }

    #[tokio::test]
    async fn chat_requests_one_per_student_newest_first() {
        let state = state();
        let (mut s1, _rx1) = join_as(&state, "s1", "s1-t1").await;
        let (mut s2, _rx2) = join_as(&state, "s2", "s2-t1").await;
        send(&state, &mut s1, 1, text("s1", "t1", "s1-t1", "older")).await;
        send(&state, &mut s2, 1, text("s2", "t1", "s2-t1", "from s2")).await;
        send(&state, &mut s1, 2, text("s1", "t1", "s1-t1", "newest")).await;

        let (mut tutor, mut tutor_rx) = connect();
        state
            .handle_event(
                &mut tutor,
                ClientEvent::GetChatRequestsForTutor { ack: 5, tutor_id: UserId::new("t1") },
            )
            .await;
        let events = drain(&mut tutor_rx);
        let [ServerEvent::ChatRequests { ack: 5, requests }] = &events[..] else {
            panic!("expected chatRequests reply, got {events:?}");
        };
        let summary: Vec<(&str, &str, &str)> = requests
            .iter()
            .map(|r| (r.id.as_str(), r.student_id.as_str(), r.message.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![("s1-t1", "s1", "newest"), ("s2-t1", "s2", "from s2")]
        );
        assert_eq!(requests[0].student_name, "S1");
    }

    // =========================================================================
    // markAsRead / deleteMessage
    // =========================================================================

    async fn stored_id(
        state: &GatewayState<InMemoryMessageStore>,
        conn: &mut Connection,
        rx: &mut UnboundedReceiver<ServerEvent>,
    ) -> MessageId {
        send(state, conn, 77, text("s1", "t1", "s1-t1", "read me")).await;
        send_result(&drain(rx), 77).message_id.unwrap()
    }

    #[tokio::test]
    async fn mark_as_read_broadcasts_seen_every_time() {
        let state = state();
        let (mut student, mut student_rx) = join_as(&state, "s1", "s1-t1").await;
        let (mut tutor, mut tutor_rx) = join_as(&state, "t1", "s1-t1").await;
        let id = stored_id(&state, &mut student, &mut student_rx).await;
        drain(&mut tutor_rx);

        for _ in 0..2 {
            state
                .handle_event(
                    &mut tutor,
                    ClientEvent::MarkAsRead { message_id: id, room_id: "s1-t1".into() },
                )
                .await;
        }

        let seen = ServerEvent::MessageSeen { message_id: id };
        assert_eq!(drain(&mut student_rx), vec![seen.clone(), seen]);
        let history = state.store().history_for_room(&RoomId::parse("s1-t1").unwrap()).await.unwrap();
        assert!(history[0].is_read());
    }

    #[tokio::test]
    async fn mark_as_read_wrong_room_is_silent() {
        let state = state();
        let (mut student, mut student_rx) = join_as(&state, "s1", "s1-t1").await;
        let id = stored_id(&state, &mut student, &mut student_rx).await;

        state
            .handle_event(
                &mut student,
                ClientEvent::MarkAsRead { message_id: id, room_id: "s9-t9".into() },
            )
            .await;
        assert!(drain(&mut student_rx).is_empty());
    }

    #[tokio::test]
    async fn delete_by_sender_broadcasts() {
        let state = state();
        let (mut student, mut student_rx) = join_as(&state, "s1", "s1-t1").await;
        let (mut tutor, mut tutor_rx) = join_as(&state, "t1", "s1-t1").await;
        let id = stored_id(&state, &mut student, &mut student_rx).await;
        drain(&mut tutor_rx);

        let delete = ClientEvent::DeleteMessage { message_id: id, room_id: "s1-t1".into() };
        state.handle_event(&mut tutor, delete.clone()).await;
        assert!(drain(&mut tutor_rx).is_empty());

        state.handle_event(&mut student, delete).await;
        assert_eq!(
            drain(&mut tutor_rx),
            vec![ServerEvent::MessageDeleted { message_id: id }]
        );
    }

    // =========================================================================
    // register / joinRoom / notify
    // =========================================================================

    #[tokio::test]
    async fn blank_join_is_ignored() {
        let state = state();
        let (mut conn, _rx) = connect();
        state
            .handle_event(&mut conn, ClientEvent::JoinRoom { room_id: "   ".into() })
            .await;
        assert_eq!(state.stats().rooms, 0);
    }

    #[tokio::test]
    async fn participants_policy_denies_outsider() {
        let settings = GatewaySettings {
            room_access: RoomAccess::Participants,
            ..GatewaySettings::default()
        };
        let state = GatewayState::new(InMemoryMessageStore::new(), settings);
        let (mut conn, _rx) = connect();
        state
            .handle_event(&mut conn, ClientEvent::Register { user_id: UserId::new("s2") })
            .await;
        state
            .handle_event(&mut conn, ClientEvent::JoinRoom { room_id: "s1-t1".into() })
            .await;
        assert!(state.rooms().members(&RoomId::parse("s1-t1").unwrap()).is_empty());
    }

    #[tokio::test]
    async fn participants_policy_guards_every_room_event() {
        let settings = GatewaySettings {
            room_access: RoomAccess::Participants,
            ..GatewaySettings::default()
        };
        let state = GatewayState::new(InMemoryMessageStore::new(), settings);
        let (mut student, mut student_rx) = join_as(&state, "s1", "s1-t1").await;
        send(&state, &mut student, 1, text("s1", "t1", "s1-t1", "private")).await;
        let id = send_result(&drain(&mut student_rx), 1).message_id.unwrap();

        let (mut outsider, mut outsider_rx) = connect();
        state
            .handle_event(&mut outsider, ClientEvent::Register { user_id: UserId::new("s2") })
            .await;
        state
            .handle_event(&mut outsider, ClientEvent::GetHistory { ack: 2, room_id: "s1-t1".into() })
            .await;
        send(&state, &mut outsider, 3, text("s2", "t1", "s1-t1", "intruding")).await;
        state
            .handle_event(
                &mut outsider,
                ClientEvent::MarkAsRead { message_id: id, room_id: "s1-t1".into() },
            )
            .await;

        let events = drain(&mut outsider_rx);
        assert!(events.contains(&ServerEvent::History { ack: 2, messages: vec![] }));
        let ack = send_result(&events, 3);
        assert!(!ack.success);
        assert!(ack.error.unwrap().contains("not a participant"));
        assert!(drain(&mut student_rx).is_empty());

        let history = state.store().history_for_room(&RoomId::parse("s1-t1").unwrap()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].is_read());

        state
            .handle_event(&mut student, ClientEvent::GetHistory { ack: 4, room_id: "s1-t1".into() })
            .await;
        let events = drain(&mut student_rx);
        let [ServerEvent::History { ack: 4, messages }] = &events[..] else {
            panic!("expected history reply, got {events:?}");
        };
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn notification_reaches_latest_registration_only() {
        let state = state();
        let (_old, mut old_rx) = join_as(&state, "t1", "s1-t1").await;
        let (_new, mut new_rx) = join_as(&state, "t1", "s1-t1").await;

        let notification = Notification {
            kind: "booking".into(),
            title: "New booking".into(),
            message: "s1 booked a session".into(),
            extra: serde_json::Map::new(),
        };
        assert!(state.notify(&UserId::new("t1"), notification.clone()));
        assert!(drain(&mut old_rx).is_empty());
        assert_eq!(drain(&mut new_rx), vec![ServerEvent::Notification(notification)]);
        assert!(!state.notify(
            &UserId::new("nobody"),
            Notification {
                kind: "x".into(),
                title: String::new(),
                message: String::new(),
                extra: serde_json::Map::new(),
            }
        ));
    }

    #[tokio::test]
    async fn close_releases_rooms_and_presence() {
        let state = state();
        state.connection_opened();
        let (conn, _rx) = join_as(&state, "s1", "s1-t1").await;
        assert_eq!(state.stats(), GatewayStats { connections: 1, online_users: 1, rooms: 1 });

        state.connection_closed(conn.handle());
        assert_eq!(state.stats(), GatewayStats { connections: 0, online_users: 0, rooms: 0 });
    }

    // =========================================================================
    // Store failures
    // =========================================================================

    /// A store whose every operation fails while `failing` is set.
    struct FailingStore {
        inner: InMemoryMessageStore,
        failing: AtomicBool,
    }

    impl FailingStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.failing.load(Ordering::Relaxed) {
                Err(StoreError::Unavailable("simulated outage".into()))
            } else {
                Ok(())
            }
        }
    }

    impl MessageStore for FailingStore {
        async fn append(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
            self.check()?;
            self.inner.append(message).await
        }

        async fn history_for_room(&self, room: &RoomId) -> Result<Vec<StoredMessage>, StoreError> {
            self.check()?;
            self.inner.history_for_room(room).await
        }

        async fn mark_read(&self, id: &MessageId, room: &RoomId) -> Result<MarkRead, StoreError> {
            self.check()?;
            self.inner.mark_read(id, room).await
        }

        async fn soft_delete(
            &self,
            id: &MessageId,
            room: &RoomId,
            requester: &UserId,
        ) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.soft_delete(id, room, requester).await
        }

        async fn recent_senders_to(
            &self,
            receiver: &UserId,
        ) -> Result<Vec<SenderSummary>, StoreError> {
            self.check()?;
            self.inner.recent_senders_to(receiver).await
        }
    }

    #[tokio::test]
    async fn store_outage_yields_negative_ack_and_empty_replies() {
        let store = FailingStore {
            inner: InMemoryMessageStore::new(),
            failing: AtomicBool::new(true),
        };
        let state = GatewayState::new(store, GatewaySettings::default());
        let (mut conn, mut rx) = connect();

        state
            .handle_event(
                &mut conn,
                ClientEvent::SendMessage { ack: 1, message: text("s1", "t1", "s1-t1", "hi").into() },
            )
            .await;
        state
            .handle_event(&mut conn, ClientEvent::GetHistory { ack: 2, room_id: "s1-t1".into() })
            .await;
        state
            .handle_event(
                &mut conn,
                ClientEvent::GetChatRequestsForTutor { ack: 3, tutor_id: UserId::new("t1") },
            )
            .await;

        let events = drain(&mut rx);
        let ack = send_result(&events, 1);
        assert!(!ack.success);
        assert!(ack.error.unwrap().contains("simulated outage"));
        assert!(events.contains(&ServerEvent::History { ack: 2, messages: vec![] }));
        assert!(events.contains(&ServerEvent::ChatRequests { ack: 3, requests: vec![] }));

        state.store().failing.store(false, Ordering::Relaxed);
        state
            .handle_event(
                &mut conn,
                ClientEvent::SendMessage { ack: 4, message: text("s1", "t1", "s1-t1", "hi").into() },
            )
            .await;
        assert!(send_result(&drain(&mut rx), 4).success);
    }
}
