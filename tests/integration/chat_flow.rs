// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::doc_markdown
)]

//! End-to-end message flow between a student and a tutor through a live
//! in-process gateway: optimistic send, echo reconciliation, history order,
//! negative acknowledgements, and deletion.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tutorchat::connection::{ChatConnection, ChatLink, ConnectOptions};
use tutorchat::session::{ChatSession, DeliveryState, SessionUpdate};
use tutorchat_gateway::server::start_server;
use tutorchat_proto::event::ServerEvent;
use tutorchat_proto::ids::UserId;
use tutorchat_proto::message::OutgoingMessage;

type Events = UnboundedReceiver<ServerEvent>;

// =============================================================================
// Helpers
// =============================================================================

async fn start_gateway() -> String {
    let (addr, _handle) = start_server("127.0.0.1:0").await.unwrap();
    format!("ws://{addr}/ws")
}

async fn connect(url: &str, user: &str) -> (ChatConnection, Events) {
    let options = ConnectOptions::new(url, "test-token", UserId::new(user));
    ChatConnection::connect(&options).await.unwrap()
}

async fn open_session(url: &str, me: &str, peer: &str) -> (ChatSession<ChatConnection>, Events) {
    let (conn, events) = connect(url, me).await;
    let session = ChatSession::open(conn, UserId::new(me), me.to_uppercase(), UserId::new(peer))
        .await
        .unwrap();
    (session, events)
}

/// Applies incoming events until `done` holds for the session.
async fn pump_until(
    session: &mut ChatSession<ChatConnection>,
    events: &mut Events,
    done: impl Fn(&ChatSession<ChatConnection>) -> bool,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done(session) {
            let event = events.recv().await.expect("event channel closed");
            session.apply(event);
        }
    })
    .await
    .expect("timed out waiting for session state");
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn message_reaches_peer_and_comes_back_read() {
    let url = start_gateway().await;
    let (mut student, mut student_events) = open_session(&url, "s1", "t1").await;
    let (mut tutor, mut tutor_events) = open_session(&url, "t1", "s1").await;
    assert_eq!(student.room(), tutor.room());

    student.send_text("Can we meet Tuesday?").await.unwrap();
    assert_eq!(student.messages()[0].state, DeliveryState::Sent);

    pump_until(&mut tutor, &mut tutor_events, |s| !s.messages().is_empty()).await;
    assert_eq!(tutor.messages()[0].content, "Can we meet Tuesday?");
    assert_eq!(tutor.messages()[0].sender_name, "S1");

    // The tutor acknowledges on receipt; the student sees the read receipt.
    pump_until(&mut student, &mut student_events, |s| {
        s.messages()[0].state == DeliveryState::Read
    })
    .await;
    assert_eq!(student.messages().len(), 1, "echo must reconcile, not duplicate");
}

#[tokio::test]
async fn history_lists_messages_in_send_order() {
    let url = start_gateway().await;
    let (mut student, _student_events) = open_session(&url, "s1", "t1").await;

    student.send_text("first").await.unwrap();
    student.send_text("second").await.unwrap();

    let (tutor, _tutor_events) = open_session(&url, "t1", "s1").await;
    let contents: Vec<&str> = tutor.messages().iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second"]);
    assert_eq!(tutor.messages().last().unwrap().id, student.messages()[1].id);
}

#[tokio::test]
async fn blank_room_is_refused_with_reason() {
    let url = start_gateway().await;
    let (conn, _events) = connect(&url, "s1").await;

    let message = OutgoingMessage {
        sender_id: UserId::new("s1"),
        content: "hello".to_string(),
        ..OutgoingMessage::default()
    };
    let ack = conn.send_message(message).await.unwrap();

    assert!(!ack.success);
    assert!(ack.error.unwrap().contains("roomId"));
    assert!(ack.message_id.is_none());
}

#[tokio::test]
async fn refused_message_stays_failed_and_is_not_broadcast() {
    let url = start_gateway().await;
    let (mut student, _student_events) = open_session(&url, "s1", "t1").await;
    let (tutor, _tutor_events) = open_session(&url, "t1", "s1").await;

    let too_long = "x".repeat(2001);
    student.send_text(&too_long).await.unwrap();

    let DeliveryState::Failed(reason) = &student.messages()[0].state else {
        panic!("expected failed state, got {:?}", student.messages()[0].state);
    };
    assert!(reason.contains("too long"));
    assert_eq!(student.last_error(), Some(reason.as_str()));

    let history = tutor.link().history(tutor.room()).await.unwrap();
    assert!(history.is_empty());
}

#[tokio::test]
async fn deletion_is_broadcast_to_both_sides() {
    let url = start_gateway().await;
    let (mut student, mut student_events) = open_session(&url, "s1", "t1").await;
    let (mut tutor, mut tutor_events) = open_session(&url, "t1", "s1").await;

    student.send_text("oops").await.unwrap();
    let id = student.messages()[0].id.unwrap();
    pump_until(&mut tutor, &mut tutor_events, |s| !s.messages().is_empty()).await;

    student.delete(id).unwrap();

    pump_until(&mut student, &mut student_events, |s| s.messages()[0].deleted).await;
    pump_until(&mut tutor, &mut tutor_events, |s| s.messages()[0].deleted).await;

    let history = tutor.link().history(tutor.room()).await.unwrap();
    assert!(history[0].is_deleted);
    assert!(history[0].content.is_empty());
}

#[tokio::test]
async fn close_ends_the_event_stream() {
    let url = start_gateway().await;
    let (student, mut student_events) = open_session(&url, "s1", "t1").await;

    student.close();
    assert!(!student.link().is_connected());

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = student_events.recv().await {
            assert!(!matches!(event, ServerEvent::SendResult { .. }));
        }
    })
    .await;
    assert!(ended.is_ok());
}

#[tokio::test]
async fn peer_message_is_reported_as_appended() {
    let url = start_gateway().await;
    let (mut student, mut student_events) = open_session(&url, "s1", "t1").await;
    let (mut tutor, _tutor_events) = open_session(&url, "t1", "s1").await;

    tutor.send_text("Welcome!").await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = student_events.recv().await.unwrap();
            if matches!(event, ServerEvent::ChatMessage(_)) {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(student.apply(event), SessionUpdate::Appended(0));
}
