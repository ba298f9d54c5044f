//! Chat message model: kinds, bodies, validation, and the normalized wire
//! shape sent to clients.
//!
//! A message body is a tagged union keyed by [`MessageKind`]. The only way to
//! obtain a [`MessageBody`] is [`MessageBody::build`], which enforces the
//! per-kind required fields, so an invalid body cannot reach the store.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{MessageId, RoomId, Timestamp, UserId};

/// Default maximum message content length, in characters.
pub const MAX_CONTENT_CHARS: usize = 2000;

/// The kind of a chat message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// Plain text typed by a participant.
    #[default]
    Text,
    /// An uploaded image.
    Image,
    /// An uploaded file.
    File,
    /// A booking lifecycle event (request, confirmation, cancellation...).
    BookingEvent,
    /// A message generated by the platform.
    System,
}

impl MessageKind {
    /// Returns `true` if messages of this kind must carry an attachment.
    #[must_use]
    pub const fn requires_attachment(self) -> bool {
        !matches!(self, Self::Text | Self::System)
    }

    /// Returns the wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::BookingEvent => "booking-event",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            "booking-event" => Ok(Self::BookingEvent),
            "system" => Ok(Self::System),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

/// An uploaded file referenced by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Retrievable URL of the uploaded file.
    pub url: String,
    /// Original file name, if known.
    pub file_name: Option<String>,
    /// Size in bytes, if known.
    pub file_size: Option<u64>,
}

/// Lifecycle step of a booking that a message refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingAction {
    /// A student requested a session.
    Requested,
    /// The booking was paid for or accepted.
    Confirmed,
    /// The booking was cancelled by either party.
    Cancelled,
    /// The session took place.
    Completed,
    /// The session moved to a different slot.
    Rescheduled,
}

impl BookingAction {
    /// Returns the wire name of this action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Rescheduled => "rescheduled",
        }
    }
}

impl std::str::FromStr for BookingAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(Self::Requested),
            "confirmed" => Ok(Self::Confirmed),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            "rescheduled" => Ok(Self::Rescheduled),
            other => Err(format!("unknown booking action: {other}")),
        }
    }
}

/// The booking a message was sent about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingContext {
    /// Identifier of the booking in the external booking service.
    pub booking_id: String,
    /// Which lifecycle step the message reports.
    pub action: BookingAction,
}

/// Error returned when a message fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The room key was missing or blank.
    #[error("roomId is required, received blank")]
    BlankRoom,
    /// The sender identity was missing or blank.
    #[error("senderId is required, received blank")]
    BlankSender,
    /// A kind that needs an attachment arrived without a usable URL.
    #[error("{kind} messages require an attachment url")]
    MissingAttachment {
        /// The kind that was requested.
        kind: MessageKind,
    },
    /// Content exceeds the maximum allowed length.
    #[error("message too long ({chars} characters, max {max})")]
    ContentTooLong {
        /// Actual length in characters.
        chars: usize,
        /// Maximum allowed length in characters.
        max: usize,
    },
}

/// Validated message body, keyed by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Text content; may be empty (blank text is guarded client-side).
    Text {
        /// The text.
        content: String,
    },
    /// An image with an optional caption.
    Image {
        /// The uploaded image.
        attachment: Attachment,
        /// Caption text (may be empty).
        caption: String,
    },
    /// A file with an optional caption.
    File {
        /// The uploaded file.
        attachment: Attachment,
        /// Caption text (may be empty).
        caption: String,
    },
    /// A booking event notice.
    BookingEvent {
        /// Supporting document (receipt, invoice...).
        attachment: Attachment,
        /// Human-readable description.
        content: String,
    },
    /// A platform-generated notice.
    System {
        /// The notice text.
        content: String,
    },
}

impl MessageBody {
    /// Builds a body of the given kind, enforcing its required fields.
    ///
    /// The attachment is ignored for `text` and `system` messages.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MissingAttachment`] if a kind other than
    /// `text`/`system` has no attachment or a blank URL, and
    /// [`ValidationError::ContentTooLong`] if `content` exceeds `max_chars`.
    pub fn build(
        kind: MessageKind,
        content: String,
        attachment: Option<Attachment>,
        max_chars: usize,
    ) -> Result<Self, ValidationError> {
        let chars = content.chars().count();
        if chars > max_chars {
            return Err(ValidationError::ContentTooLong {
                chars,
                max: max_chars,
            });
        }

        let attachment = attachment.filter(|a| !a.url.trim().is_empty());
        let require = |attachment: Option<Attachment>| {
            attachment.ok_or(ValidationError::MissingAttachment { kind })
        };

        Ok(match kind {
            MessageKind::Text => Self::Text { content },
            MessageKind::System => Self::System { content },
            MessageKind::Image => Self::Image {
                attachment: require(attachment)?,
                caption: content,
            },
            MessageKind::File => Self::File {
                attachment: require(attachment)?,
                caption: content,
            },
            MessageKind::BookingEvent => Self::BookingEvent {
                attachment: require(attachment)?,
                content,
            },
        })
    }

    /// Returns the kind of this body.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Image { .. } => MessageKind::Image,
            Self::File { .. } => MessageKind::File,
            Self::BookingEvent { .. } => MessageKind::BookingEvent,
            Self::System { .. } => MessageKind::System,
        }
    }

    /// Returns the text part (content or caption).
    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Self::Text { content }
            | Self::System { content }
            | Self::BookingEvent { content, .. }
            | Self::Image {
                caption: content, ..
            }
            | Self::File {
                caption: content, ..
            } => content,
        }
    }

    /// Returns the attachment, if this kind carries one.
    #[must_use]
    pub const fn attachment(&self) -> Option<&Attachment> {
        match self {
            Self::Image { attachment, .. }
            | Self::File { attachment, .. }
            | Self::BookingEvent { attachment, .. } => Some(attachment),
            Self::Text { .. } | Self::System { .. } => None,
        }
    }
}

/// Message payload a client submits with `sendMessage`.
///
/// Every field is optional on the wire, `senderId` included, so that an
/// incomplete payload still reaches the gateway and gets a negative
/// acknowledgement instead of being dropped as undecodable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// Claimed sender (overridden by the registered identity server-side).
    #[serde(default)]
    pub sender_id: UserId,
    /// Display name snapshot of the sender.
    #[serde(default)]
    pub sender_name: String,
    /// The other participant, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    /// Raw room key as typed by the client.
    #[serde(default)]
    pub room_id: String,
    /// Text or caption.
    #[serde(default)]
    pub content: String,
    /// Client-side creation time (informational).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    /// Kind of message; `text` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageKind>,
    /// Attachment URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    /// Attachment file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Attachment size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    /// Message this one answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    /// Booking the message refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_context: Option<BookingContext>,
    /// Client-generated reference echoed back in the broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<Uuid>,
}

impl OutgoingMessage {
    /// Creates a text message addressed to `receiver` in `room`.
    #[must_use]
    pub fn text(
        sender: &UserId,
        sender_name: &str,
        receiver: &UserId,
        room: &RoomId,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sender_id: sender.clone(),
            sender_name: sender_name.to_string(),
            receiver_id: Some(receiver.clone()),
            room_id: room.as_str().to_string(),
            content: content.into(),
            timestamp: Some(Timestamp::now()),
            message_type: Some(MessageKind::Text),
            ..Self::default()
        }
    }

    /// Returns the attachment described by the `file*` fields, if any.
    #[must_use]
    pub fn attachment(&self) -> Option<Attachment> {
        self.file_url.as_ref().map(|url| Attachment {
            url: url.clone(),
            file_name: self.file_name.clone(),
            file_size: self.file_size,
        })
    }

    /// Validates the room key and builds the body.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::BlankRoom`] for a blank room, or any error
    /// from [`MessageBody::build`].
    pub fn validate(&self, max_chars: usize) -> Result<(RoomId, MessageBody), ValidationError> {
        let room = RoomId::parse(&self.room_id).ok_or(ValidationError::BlankRoom)?;
        let body = MessageBody::build(
            self.message_type.unwrap_or_default(),
            self.content.clone(),
            self.attachment(),
            max_chars,
        )?;
        Ok((room, body))
    }
}

/// A persisted message in the normalized shape sent to clients.
///
/// Identity references are always plain identifiers, never nested objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    /// Server-assigned identifier.
    pub id: MessageId,
    /// Room the message belongs to.
    pub room_id: RoomId,
    /// Sender identity.
    pub sender_id: UserId,
    /// Sender display name at send time.
    pub sender_name: String,
    /// Receiver identity, `null` if the sender named none.
    #[serde(default)]
    pub receiver_id: Option<UserId>,
    /// Text or caption.
    pub content: String,
    /// Kind of message.
    pub message_type: MessageKind,
    /// Attachment URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    /// Attachment file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Attachment size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    /// Message this one answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    /// Booking the message refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_context: Option<BookingContext>,
    /// Client reference supplied at send time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<Uuid>,
    /// Server creation time.
    pub timestamp: Timestamp,
    /// Accepted and stored by the server.
    pub is_delivered: bool,
    /// When the server accepted the message.
    #[serde(default)]
    pub delivered_at: Option<Timestamp>,
    /// Acknowledged by the receiving client.
    pub is_read: bool,
    /// When the first read acknowledgement arrived.
    #[serde(default)]
    pub read_at: Option<Timestamp>,
    /// Soft-deleted by its sender.
    #[serde(default)]
    pub is_deleted: bool,
    /// When the message was soft-deleted.
    #[serde(default)]
    pub deleted_at: Option<Timestamp>,
}

/// Per-sender summary of incoming messages to a tutor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Room of the most recent message from this sender.
    pub id: RoomId,
    /// The sender (usually a student).
    pub student_id: UserId,
    /// The sender's display name on that message.
    pub student_name: String,
    /// Content of the most recent message.
    pub message: String,
    /// Creation time of the most recent message.
    pub time: Timestamp,
}
