// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Connection lifecycle: token-gated handshake, unreachable gateway, and
//! out-of-band notifications routed to the last registered connection.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tutorchat::connection::{ChatConnection, ChatLink, ConnectOptions, ConnectionError};
use tutorchat_gateway::server::start_server;
use tutorchat_proto::event::{ClientEvent, ServerEvent};
use tutorchat_proto::ids::{RoomId, UserId};

// =============================================================================
// Helpers
// =============================================================================

async fn registered(url: &str, user: &str) -> (ChatConnection, UnboundedReceiver<ServerEvent>) {
    let options = ConnectOptions::new(url, "test-token", UserId::new(user));
    let (conn, events) = ChatConnection::connect(&options).await.unwrap();
    conn.emit(ClientEvent::Register { user_id: UserId::new(user) }).unwrap();
    // A reply proves the preceding register was handled.
    conn.history(&RoomId::parse("s1-t1").unwrap()).await.unwrap();
    (conn, events)
}

/// POSTs a JSON body and returns the status code.
async fn post(addr: SocketAddr, path: &str, body: &str) -> u16 {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn handshake_without_token_is_rejected() {
    let (addr, _handle) = start_server("127.0.0.1:0").await.unwrap();
    let options = ConnectOptions::new(format!("ws://{addr}/ws"), "", UserId::new("s1"));

    let result = ChatConnection::connect(&options).await;
    assert!(matches!(result, Err(ConnectionError::Rejected(401))));
}

#[tokio::test]
async fn handshake_times_out_against_silent_server() {
    // Accepts TCP but never answers the upgrade.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _silent = tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let mut options = ConnectOptions::new(format!("ws://{addr}/ws"), "t", UserId::new("s1"));
    options.connect_timeout = Duration::from_millis(200);
    let result = ChatConnection::connect(&options).await;
    assert!(matches!(result, Err(ConnectionError::Timeout)));
}

#[tokio::test]
async fn notification_reaches_only_latest_connection() {
    let (addr, _handle) = start_server("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{addr}/ws");

    let (_old, mut old_events) = registered(&url, "t1").await;
    let (_new, mut new_events) = registered(&url, "t1").await;

    let body = r#"{"userId":"t1","notification":{"type":"booking","title":"New booking","message":"Sam booked Tuesday 5pm","bookingId":"b-42"}}"#;
    assert_eq!(post(addr, "/notify", body).await, 202);

    let event = tokio::time::timeout(Duration::from_secs(5), new_events.recv())
        .await
        .unwrap()
        .unwrap();
    let ServerEvent::Notification(notification) = event else {
        panic!("expected notification, got {event:?}");
    };
    assert_eq!(notification.kind, "booking");
    assert_eq!(notification.title, "New booking");
    assert_eq!(notification.extra["bookingId"], "b-42");

    let stale = tokio::time::timeout(Duration::from_millis(200), old_events.recv()).await;
    assert!(stale.is_err(), "older connection must not receive the notification");
}

#[tokio::test]
async fn notification_for_offline_user_is_not_found() {
    let (addr, _handle) = start_server("127.0.0.1:0").await.unwrap();
    let body = r#"{"userId":"nobody","notification":{"type":"system","title":"t","message":"m"}}"#;
    assert_eq!(post(addr, "/notify", body).await, 404);
}

#[tokio::test]
async fn gateway_survives_client_disconnect() {
    let (addr, _handle) = start_server("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{addr}/ws");

    let (first, _events) = registered(&url, "s1").await;
    first.close();
    drop(first);

    let (second, _events) = registered(&url, "s1").await;
    assert!(second.is_connected());
}
