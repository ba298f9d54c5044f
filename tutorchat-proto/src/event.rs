//! Socket events exchanged between chat clients and the gateway.
//!
//! Every frame is a JSON text frame of the form
//! `{"event": "<name>", "data": { ... }}`. Requests that expect an answer
//! carry a client-chosen `ack` number, which the gateway echoes in the
//! matching reply event.

use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, UserId};
use crate::message::{ChatRequest, OutgoingMessage, WireMessage};

/// Events a client may send to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Bind this connection to a user identity for notification routing.
    Register {
        /// Identity to register.
        user_id: UserId,
    },
    /// Join the room so that broadcasts to it reach this connection.
    JoinRoom {
        /// Raw room key (may be blank; the gateway checks it).
        #[serde(default)]
        room_id: String,
    },
    /// Persist and broadcast a message. Answered by [`ServerEvent::SendResult`].
    SendMessage {
        /// Request correlation number.
        ack: u64,
        /// The message payload.
        #[serde(default)]
        message: SendPayload,
    },
    /// Fetch the history of a room. Answered by [`ServerEvent::History`].
    GetHistory {
        /// Request correlation number.
        ack: u64,
        /// Raw room key.
        #[serde(default)]
        room_id: String,
    },
    /// Acknowledge that a message was displayed.
    MarkAsRead {
        /// The message that was read.
        message_id: MessageId,
        /// Room of that message.
        #[serde(default)]
        room_id: String,
    },
    /// Soft-delete a message this connection's user sent.
    DeleteMessage {
        /// The message to delete.
        message_id: MessageId,
        /// Room of that message.
        #[serde(default)]
        room_id: String,
    },
    /// List who has messaged a tutor. Answered by [`ServerEvent::ChatRequests`].
    GetChatRequestsForTutor {
        /// Request correlation number.
        ack: u64,
        /// The tutor whose incoming senders to list.
        tutor_id: UserId,
    },
}

impl ClientEvent {
    /// Returns the wire name of this event, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::JoinRoom { .. } => "joinRoom",
            Self::SendMessage { .. } => "sendMessage",
            Self::GetHistory { .. } => "getHistory",
            Self::MarkAsRead { .. } => "markAsRead",
            Self::DeleteMessage { .. } => "deleteMessage",
            Self::GetChatRequestsForTutor { .. } => "getChatRequestsForTutor",
        }
    }
}

/// Payload of a `sendMessage` request.
///
/// A payload that does not fit [`OutgoingMessage`] (an unknown
/// `messageType`, a string `timestamp`, ...) still decodes, as
/// [`SendPayload::Malformed`], so the gateway can answer it with a negative
/// acknowledgement instead of dropping the whole frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SendPayload {
    /// A well-formed message.
    Message(OutgoingMessage),
    /// Anything else, kept verbatim.
    Malformed(serde_json::Value),
}

impl SendPayload {
    /// Returns the message, or the decode error for a malformed payload.
    ///
    /// # Errors
    ///
    /// Returns the [`serde_json::Error`] describing why the payload is not a
    /// valid [`OutgoingMessage`].
    pub fn into_message(self) -> Result<OutgoingMessage, serde_json::Error> {
        match self {
            Self::Message(message) => Ok(message),
            Self::Malformed(value) => serde_json::from_value(value),
        }
    }
}

impl Default for SendPayload {
    fn default() -> Self {
        Self::Malformed(serde_json::Value::Null)
    }
}

impl From<OutgoingMessage> for SendPayload {
    fn from(message: OutgoingMessage) -> Self {
        Self::Message(message)
    }
}

/// Result of a `sendMessage` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAck {
    /// Whether the message was persisted and broadcast.
    pub success: bool,
    /// Why the message was refused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Identifier of the stored message on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
}

impl SendAck {
    /// A positive acknowledgement for the stored message.
    #[must_use]
    pub const fn accepted(message_id: MessageId) -> Self {
        Self {
            success: true,
            error: None,
            message_id: Some(message_id),
        }
    }

    /// A negative acknowledgement carrying the failure reason.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            message_id: None,
        }
    }
}

/// An out-of-band alert pushed to one user (booking updates, system notices).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Category of the alert, e.g. `booking`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Short headline.
    pub title: String,
    /// Body text.
    pub message: String,
    /// Any additional fields supplied by the producer.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Events the gateway sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// A new message was stored in a room this connection joined.
    ChatMessage(WireMessage),
    /// A message's read status flipped (sent on every `markAsRead`).
    MessageSeen {
        /// The message that was read.
        message_id: MessageId,
    },
    /// A message was soft-deleted by its sender.
    MessageDeleted {
        /// The deleted message.
        message_id: MessageId,
    },
    /// Out-of-band alert for the registered user.
    Notification(Notification),
    /// Reply to `sendMessage`.
    SendResult {
        /// Correlation number of the request.
        ack: u64,
        /// The outcome.
        #[serde(flatten)]
        result: SendAck,
    },
    /// Reply to `getHistory`.
    History {
        /// Correlation number of the request.
        ack: u64,
        /// Messages in ascending creation order.
        messages: Vec<WireMessage>,
    },
    /// Reply to `getChatRequestsForTutor`.
    ChatRequests {
        /// Correlation number of the request.
        ack: u64,
        /// One entry per sender, most recent first.
        requests: Vec<ChatRequest>,
    },
}

impl ServerEvent {
    /// Returns the correlation number if this event answers a request.
    #[must_use]
    pub const fn ack(&self) -> Option<u64> {
        match self {
            Self::SendResult { ack, .. } | Self::History { ack, .. } | Self::ChatRequests { ack, .. } => {
                Some(*ack)
            }
            Self::ChatMessage(_)
            | Self::MessageSeen { .. }
            | Self::MessageDeleted { .. }
            | Self::Notification(_) => None,
        }
    }
}
