// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Chat requests: a tutor lists who has messaged them, one entry per sender,
//! most recent first.

use tutorchat::connection::{ChatConnection, ConnectOptions};
use tutorchat::session::ChatSession;
use tutorchat_gateway::server::start_server;
use tutorchat_proto::ids::UserId;

async fn open(url: &str, me: &str, name: &str, peer: &str) -> ChatSession<ChatConnection> {
    let options = ConnectOptions::new(url, "test-token", UserId::new(me));
    let (conn, _events) = ChatConnection::connect(&options).await.unwrap();
    ChatSession::open(conn, UserId::new(me), name, UserId::new(peer))
        .await
        .unwrap()
}

#[tokio::test]
async fn tutor_sees_latest_message_per_student() {
    let (addr, _handle) = start_server("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{addr}/ws");

    let mut sam = open(&url, "s1", "Sam", "t1").await;
    let mut ria = open(&url, "s2", "Ria", "t1").await;

    sam.send_text("Hi, are you free Monday?").await.unwrap();
    ria.send_text("Hello!").await.unwrap();
    sam.send_text("Or Tuesday?").await.unwrap();

    let tutor = open(&url, "t1", "Tia", "s1").await;
    let requests = tutor.chat_requests().await.unwrap();

    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].student_id, UserId::new("s1"));
    assert_eq!(requests[0].student_name, "Sam");
    assert_eq!(requests[0].message, "Or Tuesday?");
    assert_eq!(requests[0].id.as_str(), "s1-t1");
    assert_eq!(requests[1].student_id, UserId::new("s2"));
    assert_eq!(requests[1].message, "Hello!");
    assert!(requests[0].time >= requests[1].time);
}

#[tokio::test]
async fn tutor_replies_do_not_count_as_requests() {
    let (addr, _handle) = start_server("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{addr}/ws");

    let mut tutor = open(&url, "t1", "Tia", "s1").await;
    tutor.send_text("Welcome to the course").await.unwrap();

    assert!(tutor.chat_requests().await.unwrap().is_empty());
}
