//! HTTP surface of the gateway: the socket handshake, the notification
//! hook, and a health endpoint.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use tutorchat_proto::event::Notification;
use tutorchat_proto::ids::UserId;

use crate::connection::handle_socket;
use crate::gateway::{GatewaySettings, GatewayState};
use crate::store::{InMemoryMessageStore, MessageStore, StoreBackend};

/// Query parameters of `GET /ws`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeParams {
    /// Auth token issued by the external identity provider.
    #[serde(default)]
    pub token: Option<String>,
    /// Identity the client claims; informational until `register`.
    #[serde(default)]
    pub user_id: Option<String>,
}

impl HandshakeParams {
    fn has_token(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

/// Body of `POST /notify`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyRequest {
    /// Recipient.
    pub user_id: UserId,
    /// Payload forwarded verbatim as a `notification` event.
    pub notification: Notification,
}

/// Builds the gateway router over `state`.
pub fn router<S>(state: Arc<GatewayState<S>>) -> Router
where
    S: MessageStore + 'static,
{
    Router::new()
        .route("/ws", get(ws_handler::<S>))
        .route("/notify", post(notify_handler::<S>))
        .route("/health", get(health_handler::<S>))
        .with_state(state)
}

/// Starts a gateway with an in-memory store and default settings.
///
/// Binds to the given address (use `"127.0.0.1:0"` for a random port in
/// tests). Returns the bound address and a join handle for the server task.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let state = GatewayState::new(
        StoreBackend::Memory(InMemoryMessageStore::new()),
        GatewaySettings::default(),
    );
    start_server_with_state(addr, Arc::new(state)).await
}

/// Starts the gateway with a pre-built [`GatewayState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the address.
pub async fn start_server_with_state<S>(
    addr: &str,
    state: Arc<GatewayState<S>>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
>
where
    S: MessageStore + 'static,
{
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "gateway server error");
        }
    });

    Ok((bound_addr, handle))
}

/// `GET /ws`: refuses handshakes without a token, upgrades the rest.
async fn ws_handler<S>(
    ws: WebSocketUpgrade,
    Query(params): Query<HandshakeParams>,
    State(state): State<Arc<GatewayState<S>>>,
) -> Response
where
    S: MessageStore + 'static,
{
    if state.settings().require_token && !params.has_token() {
        tracing::warn!(user_id = ?params.user_id, "handshake rejected: missing auth token");
        return (StatusCode::UNAUTHORIZED, "missing auth token").into_response();
    }
    let claimed = params
        .user_id
        .map(UserId::new)
        .filter(|u| !u.is_blank());
    ws.on_upgrade(move |socket| handle_socket(socket, state, claimed))
}

/// `POST /notify`: 202 when a live connection took the event, 404 otherwise.
async fn notify_handler<S>(
    State(state): State<Arc<GatewayState<S>>>,
    Json(request): Json<NotifyRequest>,
) -> StatusCode
where
    S: MessageStore + 'static,
{
    if state.notify(&request.user_id, request.notification) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn health_handler<S>(State(state): State<Arc<GatewayState<S>>>) -> impl IntoResponse
where
    S: MessageStore + 'static,
{
    Json(state.stats())
}
