//! WebSocket connection to the chat gateway.
//!
//! [`ChatConnection::connect`] opens one socket, then two background tasks
//! take over: a writer draining an outbound frame queue and a reader that
//! routes replies to the request awaiting that `ack` and pushes every other
//! server event to the caller's event channel.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tutorchat_proto::codec::{self, CodecError};
use tutorchat_proto::event::{ClientEvent, SendAck, ServerEvent};
use tutorchat_proto::ids::{RoomId, UserId};
use tutorchat_proto::message::{ChatRequest, OutgoingMessage, WireMessage};

/// Default timeout for opening the socket.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a reply to an acknowledged request.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur on the gateway connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The gateway URL could not be parsed.
    #[error("invalid gateway url: {0}")]
    InvalidUrl(String),

    /// The operation timed out before completing.
    #[error("gateway operation timed out")]
    Timeout,

    /// The gateway could not be reached.
    #[error("gateway unreachable: {0}")]
    Unreachable(String),

    /// The gateway refused the handshake (e.g. 401 for a missing token).
    #[error("handshake rejected with HTTP status {0}")]
    Rejected(u16),

    /// The connection has been closed.
    #[error("connection closed")]
    Closed,

    /// The gateway answered with an unexpected event.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Any other socket failure.
    #[error("socket error: {0}")]
    Io(String),
}

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Gateway socket URL, e.g. `ws://127.0.0.1:9100/ws`.
    pub url: String,
    /// Auth token passed as the `token` query parameter.
    pub token: String,
    /// Local identity passed as the `userId` query parameter.
    pub user_id: UserId,
    /// Timeout for opening the socket.
    pub connect_timeout: Duration,
    /// Timeout for acknowledged requests.
    pub ack_timeout: Duration,
}

impl ConnectOptions {
    /// Options with default timeouts.
    pub fn new(url: impl Into<String>, token: impl Into<String>, user_id: UserId) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            user_id,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    /// Builds the handshake URL with the `token` and `userId` query parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidUrl`] if `url` does not parse.
    pub fn handshake_url(&self) -> Result<url::Url, ConnectionError> {
        let mut url = url::Url::parse(&self.url)
            .map_err(|e| ConnectionError::InvalidUrl(format!("{}: {e}", self.url)))?;
        {
            let mut query = url.query_pairs_mut();
            if !self.token.is_empty() {
                query.append_pair("token", &self.token);
            }
            query.append_pair("userId", self.user_id.as_str());
        }
        Ok(url)
    }
}

/// Request/push operations a chat session needs from its connection.
pub trait ChatLink: Send + Sync {
    /// Sends an event that has no reply (`register`, `joinRoom`,
    /// `markAsRead`, `deleteMessage`).
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] if the connection is gone.
    fn emit(&self, event: ClientEvent) -> Result<(), ConnectionError>;

    /// Sends `sendMessage` and waits for its acknowledgement.
    fn send_message(
        &self,
        message: OutgoingMessage,
    ) -> impl Future<Output = Result<SendAck, ConnectionError>> + Send;

    /// Fetches the history of `room`.
    fn history(
        &self,
        room: &RoomId,
    ) -> impl Future<Output = Result<Vec<WireMessage>, ConnectionError>> + Send;

    /// Fetches the chat requests addressed to `tutor`.
    fn chat_requests(
        &self,
        tutor: &UserId,
    ) -> impl Future<Output = Result<Vec<ChatRequest>, ConnectionError>> + Send;

    /// Closes the connection. Further calls fail with [`ConnectionError::Closed`].
    fn close(&self);
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<ServerEvent>>>>;

/// Live socket to the gateway.
pub struct ChatConnection {
    outbound: mpsc::UnboundedSender<Message>,
    pending: PendingReplies,
    next_ack: AtomicU64,
    connected: Arc<AtomicBool>,
    ack_timeout: Duration,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl ChatConnection {
    /// Opens the socket and starts the background reader and writer.
    ///
    /// Returns the connection and the channel on which pushed events
    /// (`chatMessage`, `messageSeen`, `messageDeleted`, `notification`)
    /// arrive.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Timeout`] if the handshake does not complete in time.
    /// - [`ConnectionError::Rejected`] if the gateway refuses the handshake.
    /// - [`ConnectionError::Unreachable`] if nothing listens at the address.
    pub async fn connect(
        options: &ConnectOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), ConnectionError> {
        let url = options.handshake_url()?;
        let (ws_stream, _response) =
            tokio::time::timeout(options.connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| {
                    tracing::warn!(url = %options.url, "gateway connect timed out");
                    ConnectionError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url = %options.url, err = %e, "gateway connect failed");
                    map_ws_connect_error(e)
                })?;
        tracing::info!(url = %options.url, user_id = %options.user_id, "connected to gateway");

        let (mut ws_sender, ws_reader) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let writer_connected = Arc::clone(&connected);
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = ws_sender.send(msg).await {
                    tracing::warn!(err = %e, "gateway write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            writer_connected.store(false, Ordering::Relaxed);
        });

        let reader_handle = tokio::spawn(reader_loop(
            ws_reader,
            Arc::clone(&pending),
            events_tx,
            Arc::clone(&connected),
        ));

        Ok((
            Self {
                outbound,
                pending,
                next_ack: AtomicU64::new(1),
                connected,
                ack_timeout: options.ack_timeout,
                reader_handle,
            },
            events_rx,
        ))
    }

    /// Returns `true` while the socket is open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn send_frame(&self, event: &ClientEvent) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::Closed);
        }
        let frame = codec::encode_client(event)?;
        self.outbound
            .send(Message::Text(frame.into()))
            .map_err(|_| ConnectionError::Closed)
    }

    /// Sends a request built from a fresh ack number and waits for its reply.
    async fn request(
        &self,
        build: impl FnOnce(u64) -> ClientEvent + Send,
    ) -> Result<ServerEvent, ConnectionError> {
        let ack = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(ack, tx);

        let event = build(ack);
        if let Err(e) = self.send_frame(&event) {
            self.pending.lock().remove(&ack);
            return Err(e);
        }
        tracing::debug!(ack, event = event.name(), "request sent");

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => {
                self.pending.lock().remove(&ack);
                tracing::warn!(ack, "request timed out");
                Err(ConnectionError::Timeout)
            }
        }
    }
}

impl ChatLink for ChatConnection {
    fn emit(&self, event: ClientEvent) -> Result<(), ConnectionError> {
        self.send_frame(&event)
    }

    async fn send_message(&self, message: OutgoingMessage) -> Result<SendAck, ConnectionError> {
        match self
            .request(|ack| ClientEvent::SendMessage { ack, message: message.into() })
            .await?
        {
            ServerEvent::SendResult { result, .. } => Ok(result),
            other => Err(unexpected(&other)),
        }
    }

    async fn history(&self, room: &RoomId) -> Result<Vec<WireMessage>, ConnectionError> {
        let room_id = room.as_str().to_string();
        match self
            .request(|ack| ClientEvent::GetHistory { ack, room_id })
            .await?
        {
            ServerEvent::History { messages, .. } => Ok(messages),
            other => Err(unexpected(&other)),
        }
    }

    async fn chat_requests(&self, tutor: &UserId) -> Result<Vec<ChatRequest>, ConnectionError> {
        let tutor_id = tutor.clone();
        match self
            .request(|ack| ClientEvent::GetChatRequestsForTutor { ack, tutor_id })
            .await?
        {
            ServerEvent::ChatRequests { requests, .. } => Ok(requests),
            other => Err(unexpected(&other)),
        }
    }

    fn close(&self) {
        if self.connected.swap(false, Ordering::Relaxed) {
            let _ = self.outbound.send(Message::Close(None));
            tracing::info!("closing gateway connection");
        }
    }
}

impl Drop for ChatConnection {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

fn unexpected(event: &ServerEvent) -> ConnectionError {
    ConnectionError::UnexpectedReply(format!("{event:?}"))
}

/// Background task routing inbound frames.
///
/// Replies go to the pending request with the same `ack`; everything else
/// goes to `events`. Malformed frames are logged and skipped. On exit the
/// pending table is cleared so waiting requests fail with `Closed`.
async fn reader_loop<R>(
    mut ws_reader: R,
    pending: PendingReplies,
    events: mpsc::UnboundedSender<ServerEvent>,
    connected: Arc<AtomicBool>,
) where
    R: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match codec::decode_server(text.as_str()) {
                Ok(event) => match event.ack() {
                    Some(ack) => {
                        let waiter = pending.lock().remove(&ack);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(event);
                            }
                            None => tracing::debug!(ack, "reply for unknown or expired request"),
                        }
                    }
                    None => {
                        if events.send(event).is_err() {
                            tracing::debug!("event receiver dropped");
                        }
                    }
                },
                Err(e) => tracing::warn!(err = %e, "malformed gateway frame, skipping"),
            },
            Ok(Message::Close(_)) => {
                tracing::info!("gateway closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(err = %e, "gateway read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    pending.lock().clear();
    tracing::info!("gateway reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`ConnectionError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> ConnectionError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err)
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable
            ) =>
        {
            ConnectionError::Unreachable(io_err.to_string())
        }
        WsError::Http(response) => ConnectionError::Rejected(response.status().as_u16()),
        WsError::Url(e) => ConnectionError::InvalidUrl(e.to_string()),
        other => ConnectionError::Io(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_url_carries_token_and_user() {
        let options = ConnectOptions::new("ws://127.0.0.1:9100/ws", "tok en", UserId::new("s1"));
        let url = options.handshake_url().unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("token".to_string(), "tok en".to_string()),
                ("userId".to_string(), "s1".to_string())
            ]
        );
    }

    #[test]
    fn empty_token_is_omitted() {
        let options = ConnectOptions::new("ws://localhost/ws", "", UserId::new("s1"));
        let url = options.handshake_url().unwrap();
        assert!(url.query_pairs().all(|(k, _)| k != "token"));
    }

    #[test]
    fn invalid_url_is_reported() {
        let options = ConnectOptions::new("not a url", "t", UserId::new("s1"));
        assert!(matches!(
            options.handshake_url(),
            Err(ConnectionError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let options = ConnectOptions::new(format!("ws://{addr}/ws"), "t", UserId::new("s1"));
        let result = ChatConnection::connect(&options).await;
        assert!(matches!(result, Err(ConnectionError::Unreachable(_))));
    }

    #[tokio::test]
    async fn replies_route_by_ack_and_pushes_go_to_events() {
        use tokio_tungstenite::tungstenite as ws;
        use tutorchat_proto::ids::MessageId;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen_id = MessageId::new();

        // Minimal fake gateway: pushes one event, then answers one history request.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            let push = codec::encode_server(&ServerEvent::MessageSeen { message_id: seen_id }).unwrap();
            socket.send(ws::Message::Text(push.into())).await.unwrap();
            while let Some(Ok(ws::Message::Text(text))) = socket.next().await {
                if let Ok(ClientEvent::GetHistory { ack, .. }) = codec::decode_client(text.as_str(), 1 << 16) {
                    let reply = codec::encode_server(&ServerEvent::History { ack, messages: vec![] }).unwrap();
                    socket.send(ws::Message::Text(reply.into())).await.unwrap();
                }
            }
        });

        let options = ConnectOptions::new(format!("ws://{addr}/ws"), "t", UserId::new("s1"));
        let (conn, mut events) = ChatConnection::connect(&options).await.unwrap();
        let history = conn.history(&RoomId::parse("s1-t1").unwrap()).await.unwrap();
        assert!(history.is_empty());

        let pushed = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pushed, ServerEvent::MessageSeen { message_id: seen_id });

        conn.close();
        assert!(!conn.is_connected());
        assert!(matches!(
            conn.emit(ClientEvent::JoinRoom { room_id: "x".into() }),
            Err(ConnectionError::Closed)
        ));
        server.abort();
    }
}
