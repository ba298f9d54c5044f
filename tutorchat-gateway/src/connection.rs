//! Per-socket connection lifecycle.
//!
//! A connection moves through these phases:
//!
//! ```text
//! Authenticated --register--> Registered --joinRoom--> Active
//!       |                                                 ^
//!       +-----joinRoom--> RoomJoined --register-----------+
//!
//! any phase --socket closed--> Disconnected
//! ```
//!
//! Events are accepted in every phase; the phase is kept for diagnostics.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tutorchat_proto::codec;
use tutorchat_proto::event::ServerEvent;
use tutorchat_proto::ids::UserId;

use crate::gateway::GatewayState;
use crate::handle::{ConnectionHandle, ConnectionId};
use crate::store::MessageStore;

/// Where a connection stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Handshake accepted, nothing else happened yet.
    Authenticated,
    /// A user identity was registered; no room joined.
    Registered,
    /// A room was joined without registering an identity.
    RoomJoined,
    /// Registered and joined to at least one room.
    Active,
    /// The socket closed. Terminal.
    Disconnected,
}

impl ConnectionPhase {
    /// Phase after a successful `register`.
    #[must_use]
    pub const fn on_register(self) -> Self {
        match self {
            Self::Authenticated | Self::Registered => Self::Registered,
            Self::RoomJoined | Self::Active => Self::Active,
            Self::Disconnected => Self::Disconnected,
        }
    }

    /// Phase after a successful `joinRoom`.
    #[must_use]
    pub const fn on_join(self) -> Self {
        match self {
            Self::Authenticated | Self::RoomJoined => Self::RoomJoined,
            Self::Registered | Self::Active => Self::Active,
            Self::Disconnected => Self::Disconnected,
        }
    }
}

/// Gateway-side view of one socket.
#[derive(Debug)]
pub struct Connection {
    handle: ConnectionHandle,
    user: Option<UserId>,
    phase: ConnectionPhase,
}

impl Connection {
    /// Wraps a freshly accepted socket's handle.
    #[must_use]
    pub const fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            user: None,
            phase: ConnectionPhase::Authenticated,
        }
    }

    /// Connection id, for logging.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    /// The outbound handle of this socket.
    #[must_use]
    pub const fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Identity registered on this connection, if any.
    #[must_use]
    pub const fn user(&self) -> Option<&UserId> {
        self.user.as_ref()
    }

    /// Current lifecycle phase.
    #[must_use]
    pub const fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub(crate) fn registered(&mut self, user: UserId) {
        self.user = Some(user);
        self.phase = self.phase.on_register();
    }

    pub(crate) const fn joined(&mut self) {
        self.phase = self.phase.on_join();
    }

    pub(crate) const fn disconnected(&mut self) {
        self.phase = ConnectionPhase::Disconnected;
    }

    /// Queues a reply for this socket only.
    pub fn reply(&self, event: ServerEvent) {
        if !self.handle.send(event) {
            tracing::debug!(conn_id = %self.id(), "reply dropped, connection closing");
        }
    }
}

/// Drives an upgraded socket until it closes.
///
/// A writer task drains the connection's outbound queue into the socket
/// while a reader task decodes frames and runs the handlers one event at a
/// time. When either side stops, the other is aborted and the connection's
/// presence and room entries are released.
pub async fn handle_socket<S>(socket: WebSocket, state: Arc<GatewayState<S>>, claimed_user: Option<UserId>)
where
    S: MessageStore + 'static,
{
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (handle, mut rx) = ConnectionHandle::channel();
    let conn_id = handle.id();
    state.connection_opened();
    tracing::info!(%conn_id, claimed_user = ?claimed_user, "connection accepted");

    let mut write_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = match codec::encode_server(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(%conn_id, error = %e, "failed to encode server event");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                tracing::warn!(%conn_id, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut conn = Connection::new(handle.clone());
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => handle_frame(&reader_state, &mut conn, text.as_str()).await,
                Message::Binary(data) => {
                    tracing::warn!(%conn_id, len = data.len(), "ignoring binary frame");
                }
                Message::Close(_) => {
                    tracing::info!(%conn_id, "received close frame");
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
        conn.disconnected();
        tracing::debug!(%conn_id, user_id = ?conn.user(), phase = ?conn.phase(), "reader finished");
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.connection_closed(&handle);
}

/// Decodes one text frame and dispatches it. Bad frames are logged and dropped.
async fn handle_frame<S: MessageStore>(state: &GatewayState<S>, conn: &mut Connection, frame: &str) {
    match codec::decode_client(frame, state.settings().max_frame_size) {
        Ok(event) => state.handle_event(conn, event).await,
        Err(e) => {
            tracing::warn!(conn_id = %conn.id(), error = %e, "dropping undecodable frame");
        }
    }
}
