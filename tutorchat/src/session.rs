//! Client chat session for one two-party room.
//!
//! Keeps the local, ordered list of messages, sends optimistically and
//! reconciles server echoes with the optimistic entries.

use tutorchat_proto::event::{ClientEvent, Notification, SendAck, ServerEvent};
use tutorchat_proto::ids::{MessageId, RoomId, Timestamp, UserId};
use tutorchat_proto::message::{ChatRequest, MessageKind, OutgoingMessage, WireMessage};
use uuid::Uuid;

use crate::connection::{ChatLink, ConnectionError};

/// Errors surfaced by [`ChatSession`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The connection failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Text messages need visible content.
    #[error("message is empty")]
    BlankContent,

    /// No local message matches the given reference.
    #[error("no such message")]
    UnknownMessage,

    /// Only failed messages can be retried.
    #[error("message is not in a failed state")]
    NotRetryable,

    /// Only the sender may delete a message.
    #[error("only your own messages can be deleted")]
    NotOwnMessage,
}

/// Delivery state of a local message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    /// Shown locally, waiting for the gateway's acknowledgement.
    Pending,
    /// Stored and broadcast by the gateway.
    Sent,
    /// The receiver acknowledged it.
    Read,
    /// Refused or timed out; kept for retry.
    Failed(String),
}

/// One entry of the local message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMessage {
    /// Reference chosen at send time (own messages only).
    pub client_ref: Option<Uuid>,
    /// Server identifier, once known.
    pub id: Option<MessageId>,
    /// Who wrote the message.
    pub sender_id: UserId,
    /// Sender display name at send time.
    pub sender_name: String,
    /// The other participant, if named.
    pub receiver_id: Option<UserId>,
    /// Text or caption; empty once deleted.
    pub content: String,
    /// Kind of message.
    pub kind: MessageKind,
    /// Attachment URL for image and file messages; cleared once deleted.
    pub file_url: Option<String>,
    /// Local send time while pending, server time afterwards.
    pub timestamp: Timestamp,
    /// Delivery progress as seen by this client.
    pub state: DeliveryState,
    /// The sender deleted it.
    pub deleted: bool,
}

impl LocalMessage {
    fn pending(outgoing: &OutgoingMessage, client_ref: Uuid) -> Self {
        Self {
            client_ref: Some(client_ref),
            id: None,
            sender_id: outgoing.sender_id.clone(),
            sender_name: outgoing.sender_name.clone(),
            receiver_id: outgoing.receiver_id.clone(),
            content: outgoing.content.clone(),
            kind: outgoing.message_type.unwrap_or_default(),
            file_url: outgoing.file_url.clone(),
            timestamp: outgoing.timestamp.unwrap_or_else(Timestamp::now),
            state: DeliveryState::Pending,
            deleted: false,
        }
    }

    fn from_wire(wire: WireMessage) -> Self {
        let state = if wire.is_read {
            DeliveryState::Read
        } else {
            DeliveryState::Sent
        };
        Self {
            client_ref: wire.client_ref,
            id: Some(wire.id),
            sender_id: wire.sender_id,
            sender_name: wire.sender_name,
            receiver_id: wire.receiver_id,
            content: wire.content,
            kind: wire.message_type,
            file_url: wire.file_url,
            timestamp: wire.timestamp,
            state,
            deleted: wire.is_deleted,
        }
    }

    /// Returns `true` if `user` sent this message.
    pub fn is_from(&self, user: &UserId) -> bool {
        &self.sender_id == user
    }
}

/// What [`ChatSession::apply`] changed, for the caller to render.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// A new message was appended at this index.
    Appended(usize),
    /// The message at this index changed state.
    Changed(usize),
    /// An out-of-band notification arrived.
    Notification(Notification),
    /// Nothing visible changed.
    Ignored,
}

/// Chat with one peer over a [`ChatLink`].
pub struct ChatSession<L: ChatLink> {
    link: L,
    me: UserId,
    display_name: String,
    peer: UserId,
    room: RoomId,
    messages: Vec<LocalMessage>,
    last_error: Option<String>,
}

impl<L: ChatLink> ChatSession<L> {
    /// Registers, joins the room shared with `peer`, then loads its history.
    ///
    /// The three steps run strictly in that order. Unread history addressed
    /// to `me` is acknowledged right away.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Connection`] if any step fails.
    pub async fn open(
        link: L,
        me: UserId,
        display_name: impl Into<String>,
        peer: UserId,
    ) -> Result<Self, SessionError> {
        let room = RoomId::for_pair(&me, &peer);
        link.emit(ClientEvent::Register { user_id: me.clone() })?;
        link.emit(ClientEvent::JoinRoom {
            room_id: room.as_str().to_string(),
        })?;
        let history = link.history(&room).await?;
        tracing::info!(room = %room, messages = history.len(), "chat session opened");

        let mut session = Self {
            link,
            me,
            display_name: display_name.into(),
            peer,
            room,
            messages: Vec::with_capacity(history.len()),
            last_error: None,
        };
        for wire in history {
            let unread = session.is_addressed_to_me(&wire) && !wire.is_read;
            let id = wire.id;
            session.messages.push(LocalMessage::from_wire(wire));
            if unread {
                session.mark_read(id);
            }
        }
        Ok(session)
    }

    /// The local identity.
    pub const fn me(&self) -> &UserId {
        &self.me
    }

    /// The other participant.
    pub const fn peer(&self) -> &UserId {
        &self.peer
    }

    /// The shared room.
    pub const fn room(&self) -> &RoomId {
        &self.room
    }

    /// Local messages in display order.
    pub fn messages(&self) -> &[LocalMessage] {
        &self.messages
    }

    /// The most recent send or receipt error.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// The underlying link.
    pub const fn link(&self) -> &L {
        &self.link
    }

    /// Reference of the most recent failed message, if any.
    pub fn last_failed(&self) -> Option<Uuid> {
        self.messages
            .iter()
            .rev()
            .find(|m| matches!(m.state, DeliveryState::Failed(_)))
            .and_then(|m| m.client_ref)
    }

    /// Sends a text message optimistically.
    ///
    /// The entry is appended as [`DeliveryState::Pending`] before the
    /// gateway answers. A positive acknowledgement moves it to `Sent`; a
    /// negative one or a timeout moves it to `Failed` and records the reason
    /// in [`last_error`](Self::last_error).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::BlankContent`] for whitespace-only text.
    pub async fn send_text(&mut self, content: &str) -> Result<Uuid, SessionError> {
        if content.trim().is_empty() {
            return Err(SessionError::BlankContent);
        }
        let outgoing =
            OutgoingMessage::text(&self.me, &self.display_name, &self.peer, &self.room, content);
        Ok(self.send_outgoing(outgoing).await)
    }

    /// Sends an image or file message with an optional caption.
    pub async fn send_attachment(
        &mut self,
        kind: MessageKind,
        url: &str,
        file_name: Option<String>,
        caption: &str,
    ) -> Uuid {
        let mut outgoing =
            OutgoingMessage::text(&self.me, &self.display_name, &self.peer, &self.room, caption);
        outgoing.message_type = Some(kind);
        outgoing.file_url = Some(url.to_string());
        outgoing.file_name = file_name;
        self.send_outgoing(outgoing).await
    }

    async fn send_outgoing(&mut self, mut outgoing: OutgoingMessage) -> Uuid {
        let client_ref = Uuid::now_v7();
        outgoing.client_ref = Some(client_ref);
        self.messages
            .push(LocalMessage::pending(&outgoing, client_ref));
        self.deliver(client_ref, outgoing).await;
        client_ref
    }

    /// Resends a failed message under the same reference.
    ///
    /// # Errors
    ///
    /// - [`SessionError::UnknownMessage`] if no message has that reference.
    /// - [`SessionError::NotRetryable`] if it has not failed.
    pub async fn retry(&mut self, client_ref: Uuid) -> Result<(), SessionError> {
        let index = self
            .position_by_ref(client_ref)
            .ok_or(SessionError::UnknownMessage)?;
        let entry = &mut self.messages[index];
        if !matches!(entry.state, DeliveryState::Failed(_)) {
            return Err(SessionError::NotRetryable);
        }
        entry.state = DeliveryState::Pending;
        let outgoing = OutgoingMessage {
            sender_id: entry.sender_id.clone(),
            sender_name: entry.sender_name.clone(),
            receiver_id: entry.receiver_id.clone(),
            room_id: self.room.as_str().to_string(),
            content: entry.content.clone(),
            timestamp: Some(entry.timestamp),
            message_type: Some(entry.kind),
            file_url: entry.file_url.clone(),
            client_ref: Some(client_ref),
            ..OutgoingMessage::default()
        };
        tracing::info!(%client_ref, "retrying message");
        self.deliver(client_ref, outgoing).await;
        Ok(())
    }

    async fn deliver(&mut self, client_ref: Uuid, outgoing: OutgoingMessage) {
        let outcome = self.link.send_message(outgoing).await;
        let Some(index) = self.position_by_ref(client_ref) else {
            return;
        };
        match outcome {
            Ok(SendAck {
                success: true,
                message_id,
                ..
            }) => {
                let entry = &mut self.messages[index];
                if entry.id.is_none() {
                    entry.id = message_id;
                }
                if entry.state == DeliveryState::Pending {
                    entry.state = DeliveryState::Sent;
                }
            }
            Ok(SendAck { error, .. }) => {
                self.fail(index, error.unwrap_or_else(|| "message rejected".to_string()));
            }
            Err(e) => self.fail(index, e.to_string()),
        }
    }

    fn fail(&mut self, index: usize, reason: String) {
        tracing::warn!(reason = %reason, "message not delivered");
        self.messages[index].state = DeliveryState::Failed(reason.clone());
        self.last_error = Some(reason);
    }

    /// Asks the gateway to soft-delete one of our messages.
    ///
    /// The local flag flips when the `messageDeleted` broadcast arrives.
    ///
    /// # Errors
    ///
    /// - [`SessionError::UnknownMessage`] if the id is not in the list.
    /// - [`SessionError::NotOwnMessage`] if someone else sent it.
    pub fn delete(&self, message_id: MessageId) -> Result<(), SessionError> {
        let index = self
            .position_by_id(&message_id)
            .ok_or(SessionError::UnknownMessage)?;
        if !self.messages[index].is_from(&self.me) {
            return Err(SessionError::NotOwnMessage);
        }
        self.link.emit(ClientEvent::DeleteMessage {
            message_id,
            room_id: self.room.as_str().to_string(),
        })?;
        Ok(())
    }

    /// Lists who has messaged the local user, most recent first.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Connection`] if the request fails.
    pub async fn chat_requests(&self) -> Result<Vec<ChatRequest>, SessionError> {
        Ok(self.link.chat_requests(&self.me).await?)
    }

    /// Applies a pushed server event to the local state.
    pub fn apply(&mut self, event: ServerEvent) -> SessionUpdate {
        match event {
            ServerEvent::ChatMessage(wire) => self.on_chat_message(wire),
            ServerEvent::MessageSeen { message_id } => {
                self.update_by_id(&message_id, |m| m.state = DeliveryState::Read)
            }
            ServerEvent::MessageDeleted { message_id } => {
                self.update_by_id(&message_id, |m| {
                    m.deleted = true;
                    m.content.clear();
                    m.file_url = None;
                })
            }
            ServerEvent::Notification(notification) => SessionUpdate::Notification(notification),
            other => {
                tracing::debug!(event = ?other, "unsolicited reply ignored");
                SessionUpdate::Ignored
            }
        }
    }

    fn on_chat_message(&mut self, wire: WireMessage) -> SessionUpdate {
        if wire.room_id != self.room {
            tracing::debug!(room = %wire.room_id, "message for another room ignored");
            return SessionUpdate::Ignored;
        }
        let unread = self.is_addressed_to_me(&wire) && !wire.is_read;
        let id = wire.id;

        let update = if let Some(index) = wire.client_ref.and_then(|r| self.position_by_ref(r)) {
            let entry = &mut self.messages[index];
            entry.id = Some(wire.id);
            entry.timestamp = wire.timestamp;
            if wire.is_read {
                entry.state = DeliveryState::Read;
            } else if entry.state != DeliveryState::Read {
                entry.state = DeliveryState::Sent;
            }
            SessionUpdate::Changed(index)
        } else if self.position_by_id(&id).is_some() {
            SessionUpdate::Ignored
        } else {
            self.messages.push(LocalMessage::from_wire(wire));
            SessionUpdate::Appended(self.messages.len() - 1)
        };

        if unread {
            self.mark_read(id);
        }
        update
    }

    fn mark_read(&mut self, message_id: MessageId) {
        let event = ClientEvent::MarkAsRead {
            message_id,
            room_id: self.room.as_str().to_string(),
        };
        if let Err(e) = self.link.emit(event) {
            tracing::warn!(%message_id, err = %e, "failed to acknowledge message");
            self.last_error = Some(e.to_string());
        }
    }

    /// Disconnects. There is no automatic reconnect.
    pub fn close(&self) {
        self.link.close();
    }

    fn is_addressed_to_me(&self, wire: &WireMessage) -> bool {
        wire.sender_id != self.me && wire.receiver_id.as_ref().is_none_or(|r| r == &self.me)
    }

    fn position_by_ref(&self, client_ref: Uuid) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.client_ref == Some(client_ref))
    }

    fn position_by_id(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id.as_ref() == Some(id))
    }

    fn update_by_id(
        &mut self,
        id: &MessageId,
        change: impl FnOnce(&mut LocalMessage),
    ) -> SessionUpdate {
        match self.position_by_id(id) {
            Some(index) => {
                change(&mut self.messages[index]);
                SessionUpdate::Changed(index)
            }
            None => SessionUpdate::Ignored,
        }
    }
}
