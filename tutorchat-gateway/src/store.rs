//! Durable chat message store.
//!
//! [`MessageStore`] is the persistence contract used by the gateway: append,
//! ordered history per room, read receipts, soft delete, and the
//! reverse-chronological sender scan behind tutor chat requests. Two
//! implementations exist: [`InMemoryMessageStore`] (tests and throwaway
//! deployments) and [`crate::sqlite::SqliteMessageStore`]. [`StoreBackend`]
//! selects one at runtime from configuration.

use std::collections::HashSet;

use tokio::sync::RwLock;
use tutorchat_proto::ids::{MessageId, RoomId, Timestamp, UserId};
use tutorchat_proto::message::{
    BookingContext, MessageBody, OutgoingMessage, ValidationError, WireMessage,
};
use uuid::Uuid;

use crate::sqlite::SqliteMessageStore;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be opened or reached.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A write operation failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A read operation failed.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// A stored row could not be turned back into a message.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// A validated message ready to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    /// Room the message belongs to.
    pub room: RoomId,
    /// Sender identity.
    pub sender_id: UserId,
    /// Sender display name snapshot.
    pub sender_name: String,
    /// The other participant, if named.
    pub receiver_id: Option<UserId>,
    /// Validated body.
    pub body: MessageBody,
    /// Client-side creation time, informational only.
    pub client_timestamp: Option<Timestamp>,
    /// Message this one answers.
    pub reply_to: Option<MessageId>,
    /// Booking the message refers to.
    pub booking_context: Option<BookingContext>,
    /// Client reference echoed back to the sender.
    pub client_ref: Option<Uuid>,
}

impl NewMessage {
    /// Builds a new message from a client payload.
    ///
    /// `sender` is the identity the connection registered with; when present
    /// it replaces the claimed `senderId`.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for a blank room or sender, or a body
    /// that does not satisfy its kind's requirements.
    pub fn from_outgoing(
        message: OutgoingMessage,
        sender: Option<&UserId>,
        max_chars: usize,
    ) -> Result<Self, ValidationError> {
        let (room, body) = message.validate(max_chars)?;
        let sender_id = sender.cloned().unwrap_or(message.sender_id);
        if sender_id.is_blank() {
            return Err(ValidationError::BlankSender);
        }
        Ok(Self {
            room,
            sender_id,
            sender_name: message.sender_name,
            receiver_id: message.receiver_id.filter(|r| !r.is_blank()),
            body,
            client_timestamp: message.timestamp,
            reply_to: message.reply_to,
            booking_context: message.booking_context,
            client_ref: message.client_ref,
        })
    }

    /// Creates a text message; mostly useful in tests and seeding.
    #[must_use]
    pub fn text(room: &RoomId, sender: &UserId, receiver: &UserId, content: &str) -> Self {
        Self {
            room: room.clone(),
            sender_id: sender.clone(),
            sender_name: sender.as_str().to_string(),
            receiver_id: Some(receiver.clone()),
            body: MessageBody::Text {
                content: content.to_string(),
            },
            client_timestamp: None,
            reply_to: None,
            booking_context: None,
            client_ref: None,
        }
    }

    /// Stamps the message as accepted at `now`.
    #[must_use]
    pub fn accept(self, now: Timestamp) -> StoredMessage {
        StoredMessage {
            id: MessageId::new(),
            room: self.room,
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            receiver_id: self.receiver_id,
            body: self.body,
            client_timestamp: self.client_timestamp,
            reply_to: self.reply_to,
            booking_context: self.booking_context,
            client_ref: self.client_ref,
            created_at: now,
            delivered_at: now,
            read_at: None,
            deleted_at: None,
        }
    }
}

/// A message as persisted by the store.
///
/// Delivery is implied by existence: a stored message was accepted by the
/// server at `delivered_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Server-assigned identifier.
    pub id: MessageId,
    /// Room the message belongs to.
    pub room: RoomId,
    /// Sender identity.
    pub sender_id: UserId,
    /// Sender display name snapshot.
    pub sender_name: String,
    /// Receiver identity.
    pub receiver_id: Option<UserId>,
    /// Validated body.
    pub body: MessageBody,
    /// Client-side creation time.
    pub client_timestamp: Option<Timestamp>,
    /// Message this one answers.
    pub reply_to: Option<MessageId>,
    /// Booking the message refers to.
    pub booking_context: Option<BookingContext>,
    /// Client reference.
    pub client_ref: Option<Uuid>,
    /// Server creation time.
    pub created_at: Timestamp,
    /// Server acceptance time.
    pub delivered_at: Timestamp,
    /// First read acknowledgement.
    pub read_at: Option<Timestamp>,
    /// Soft-delete time.
    pub deleted_at: Option<Timestamp>,
}

impl StoredMessage {
    /// Returns `true` once the receiver acknowledged the message.
    #[must_use]
    pub const fn is_read(&self) -> bool {
        self.read_at.is_some()
    }

    /// Returns `true` if the sender deleted the message.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Converts to the normalized shape sent over the socket.
    ///
    /// A deleted message keeps its metadata but carries no content or
    /// attachment.
    #[must_use]
    pub fn to_wire(&self) -> WireMessage {
        let deleted = self.is_deleted();
        let attachment = self.body.attachment().filter(|_| !deleted);
        let content = if deleted { "" } else { self.body.content() };
        WireMessage {
            id: self.id,
            room_id: self.room.clone(),
            sender_id: self.sender_id.clone(),
            sender_name: self.sender_name.clone(),
            receiver_id: self.receiver_id.clone(),
            content: content.to_string(),
            message_type: self.body.kind(),
            file_url: attachment.map(|a| a.url.clone()),
            file_name: attachment.and_then(|a| a.file_name.clone()),
            file_size: attachment.and_then(|a| a.file_size),
            reply_to: self.reply_to,
            booking_context: self.booking_context.clone(),
            client_ref: self.client_ref,
            timestamp: self.created_at,
            is_delivered: true,
            delivered_at: Some(self.delivered_at),
            is_read: self.is_read(),
            read_at: self.read_at,
            is_deleted: self.is_deleted(),
            deleted_at: self.deleted_at,
        }
    }
}

/// Outcome of a read acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkRead {
    /// The message was unread and is now read.
    Marked,
    /// The message was already read; nothing changed.
    AlreadyRead,
    /// No message with that id exists in that room.
    NotFound,
}

impl MarkRead {
    /// Returns `true` if the message exists in the room.
    #[must_use]
    pub const fn found(self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

/// Shown in place of the text of a deleted message.
pub const DELETED_PLACEHOLDER: &str = "[message deleted]";

/// Most recent message from one sender to a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderSummary {
    /// Room of the most recent message.
    pub room: RoomId,
    /// The sender.
    pub sender_id: UserId,
    /// Sender display name on that message.
    pub sender_name: String,
    /// Content of that message, or [`DELETED_PLACEHOLDER`] once deleted.
    pub last_content: String,
    /// Creation time of that message.
    pub last_timestamp: Timestamp,
}

impl SenderSummary {
    /// Builds a summary from the most recent message of a sender.
    #[must_use]
    pub fn from_message(message: &StoredMessage) -> Self {
        Self {
            room: message.room.clone(),
            sender_id: message.sender_id.clone(),
            sender_name: message.sender_name.clone(),
            last_content: if message.is_deleted() {
                DELETED_PLACEHOLDER.to_string()
            } else {
                message.body.content().to_string()
            },
            last_timestamp: message.created_at,
        }
    }
}

/// Keeps the first occurrence per sender of a most-recent-first sequence.
pub fn first_per_sender<'a>(
    newest_first: impl IntoIterator<Item = &'a StoredMessage>,
) -> Vec<SenderSummary> {
    let mut seen = HashSet::new();
    newest_first
        .into_iter()
        .filter(|m| seen.insert(m.sender_id.clone()))
        .map(SenderSummary::from_message)
        .collect()
}

/// Trait for persisting chat messages and their read/delete state.
pub trait MessageStore: Send + Sync {
    /// Stores a validated message and returns it stamped as delivered.
    fn append(
        &self,
        message: NewMessage,
    ) -> impl std::future::Future<Output = Result<StoredMessage, StoreError>> + Send;

    /// Returns every message of a room in ascending creation order.
    ///
    /// Soft-deleted messages are included (flagged).
    fn history_for_room(
        &self,
        room: &RoomId,
    ) -> impl std::future::Future<Output = Result<Vec<StoredMessage>, StoreError>> + Send;

    /// Marks a message read; idempotent, `read_at` is only set once.
    fn mark_read(
        &self,
        id: &MessageId,
        room: &RoomId,
    ) -> impl std::future::Future<Output = Result<MarkRead, StoreError>> + Send;

    /// Soft-deletes a message if `requester` sent it and it is not deleted yet.
    ///
    /// Returns `true` if the message changed.
    fn soft_delete(
        &self,
        id: &MessageId,
        room: &RoomId,
        requester: &UserId,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    /// Returns one summary per distinct sender to `receiver`, most recent first.
    fn recent_senders_to(
        &self,
        receiver: &UserId,
    ) -> impl std::future::Future<Output = Result<Vec<SenderSummary>, StoreError>> + Send;
}

/// In-memory implementation of [`MessageStore`].
///
/// Messages live in a `Vec` in append order, which is creation order. All
/// data is lost when the process exits.
pub struct InMemoryMessageStore {
    messages: RwLock<Vec<StoredMessage>>,
}

impl InMemoryMessageStore {
    /// Create a new, empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
        }
    }

    /// Returns the number of stored messages.
    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    /// Returns `true` if nothing has been stored.
    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for InMemoryMessageStore {
    async fn append(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        let stored = message.accept(Timestamp::now());
        self.messages.write().await.push(stored.clone());
        Ok(stored)
    }

    async fn history_for_room(&self, room: &RoomId) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.room == *room)
            .cloned()
            .collect())
    }

    async fn mark_read(&self, id: &MessageId, room: &RoomId) -> Result<MarkRead, StoreError> {
        let mut messages = self.messages.write().await;
        let Some(message) = messages.iter_mut().find(|m| m.id == *id && m.room == *room) else {
            return Ok(MarkRead::NotFound);
        };
        if message.read_at.is_some() {
            return Ok(MarkRead::AlreadyRead);
        }
        message.read_at = Some(Timestamp::now());
        drop(messages);
        Ok(MarkRead::Marked)
    }

    async fn soft_delete(
        &self,
        id: &MessageId,
        room: &RoomId,
        requester: &UserId,
    ) -> Result<bool, StoreError> {
        let mut messages = self.messages.write().await;
        let target = messages.iter_mut().find(|m| {
            m.id == *id && m.room == *room && m.sender_id == *requester && m.deleted_at.is_none()
        });
        let changed = target.is_some_and(|m| {
            m.deleted_at = Some(Timestamp::now());
            true
        });
        drop(messages);
        Ok(changed)
    }

    async fn recent_senders_to(&self, receiver: &UserId) -> Result<Vec<SenderSummary>, StoreError> {
        let messages = self.messages.read().await;
        Ok(first_per_sender(
            messages
                .iter()
                .rev()
                .filter(|m| m.receiver_id.as_ref() == Some(receiver)),
        ))
    }
}

/// Which store implementation to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSpec {
    /// Process-lifetime store.
    Memory,
    /// SQLite database at the given `sqlite:` URL.
    Sqlite(String),
}

impl std::str::FromStr for StoreSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("memory") {
            Ok(Self::Memory)
        } else if s.starts_with("sqlite:") {
            Ok(Self::Sqlite(s.to_string()))
        } else {
            Err(format!(
                "unsupported store {s:?} (expected \"memory\" or a sqlite: URL)"
            ))
        }
    }
}

/// Store selected at runtime from configuration.
pub enum StoreBackend {
    /// See [`InMemoryMessageStore`].
    Memory(InMemoryMessageStore),
    /// See [`SqliteMessageStore`].
    Sqlite(SqliteMessageStore),
}

impl StoreBackend {
    /// Opens the store described by `spec`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database cannot be opened
    /// or its schema cannot be created.
    pub async fn open(spec: &StoreSpec) -> Result<Self, StoreError> {
        match spec {
            StoreSpec::Memory => Ok(Self::Memory(InMemoryMessageStore::new())),
            StoreSpec::Sqlite(url) => Ok(Self::Sqlite(SqliteMessageStore::connect(url).await?)),
        }
    }
}

impl MessageStore for StoreBackend {
    async fn append(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        match self {
            Self::Memory(s) => s.append(message).await,
            Self::Sqlite(s) => s.append(message).await,
        }
    }

    async fn history_for_room(&self, room: &RoomId) -> Result<Vec<StoredMessage>, StoreError> {
        match self {
            Self::Memory(s) => s.history_for_room(room).await,
            Self::Sqlite(s) => s.history_for_room(room).await,
        }
    }

    async fn mark_read(&self, id: &MessageId, room: &RoomId) -> Result<MarkRead, StoreError> {
        match self {
            Self::Memory(s) => s.mark_read(id, room).await,
            Self::Sqlite(s) => s.mark_read(id, room).await,
        }
    }

    async fn soft_delete(
        &self,
        id: &MessageId,
        room: &RoomId,
        requester: &UserId,
    ) -> Result<bool, StoreError> {
        match self {
            Self::Memory(s) => s.soft_delete(id, room, requester).await,
            Self::Sqlite(s) => s.soft_delete(id, room, requester).await,
        }
    }

    async fn recent_senders_to(&self, receiver: &UserId) -> Result<Vec<SenderSummary>, StoreError> {
        match self {
            Self::Memory(s) => s.recent_senders_to(receiver).await,
            Self::Sqlite(s) => s.recent_senders_to(receiver).await,
        }
    }
}
