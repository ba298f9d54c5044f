// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Read receipts: `markAsRead` persists the read flag once and every call is
//! answered with a `messageSeen` broadcast to the room.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tutorchat::connection::{ChatConnection, ChatLink, ConnectOptions};
use tutorchat_gateway::server::start_server;
use tutorchat_proto::event::{ClientEvent, ServerEvent};
use tutorchat_proto::ids::{MessageId, RoomId, UserId};
use tutorchat_proto::message::OutgoingMessage;

// =============================================================================
// Helpers
// =============================================================================

async fn joined(url: &str, user: &str, room: &RoomId) -> (ChatConnection, UnboundedReceiver<ServerEvent>) {
    let options = ConnectOptions::new(url, "test-token", UserId::new(user));
    let (conn, events) = ChatConnection::connect(&options).await.unwrap();
    conn.emit(ClientEvent::Register { user_id: UserId::new(user) }).unwrap();
    conn.emit(ClientEvent::JoinRoom { room_id: room.as_str().to_string() }).unwrap();
    // Requests are handled in order, so a reply proves the join landed.
    conn.history(room).await.unwrap();
    (conn, events)
}

async fn next_seen(events: &mut UnboundedReceiver<ServerEvent>) -> MessageId {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let ServerEvent::MessageSeen { message_id } = events.recv().await.unwrap() {
                return message_id;
            }
        }
    })
    .await
    .expect("no messageSeen within timeout")
}

async fn send_from_student(conn: &ChatConnection, room: &RoomId, text: &str) -> MessageId {
    let message = OutgoingMessage::text(&UserId::new("s1"), "Sam", &UserId::new("t1"), room, text);
    let ack = conn.send_message(message).await.unwrap();
    assert!(ack.success, "send refused: {:?}", ack.error);
    ack.message_id.unwrap()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn mark_as_read_broadcasts_seen_and_updates_history() {
    let (addr, _handle) = start_server("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{addr}/ws");
    let room = RoomId::for_pair(&UserId::new("s1"), &UserId::new("t1"));

    let (student, mut student_events) = joined(&url, "s1", &room).await;
    let (tutor, _tutor_events) = joined(&url, "t1", &room).await;

    let id = send_from_student(&student, &room, "hello").await;
    tutor
        .emit(ClientEvent::MarkAsRead { message_id: id, room_id: room.as_str().to_string() })
        .unwrap();

    assert_eq!(next_seen(&mut student_events).await, id);

    let history = tutor.history(&room).await.unwrap();
    assert!(history[0].is_read);
    assert!(history[0].read_at.is_some());
}

#[tokio::test]
async fn repeated_mark_keeps_first_read_time() {
    let (addr, _handle) = start_server("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{addr}/ws");
    let room = RoomId::for_pair(&UserId::new("s1"), &UserId::new("t1"));

    let (student, mut student_events) = joined(&url, "s1", &room).await;
    let (tutor, _tutor_events) = joined(&url, "t1", &room).await;
    let id = send_from_student(&student, &room, "hello").await;

    let mark = || ClientEvent::MarkAsRead { message_id: id, room_id: room.as_str().to_string() };
    tutor.emit(mark()).unwrap();
    assert_eq!(next_seen(&mut student_events).await, id);
    let first = tutor.history(&room).await.unwrap()[0].read_at;

    tutor.emit(mark()).unwrap();
    assert_eq!(next_seen(&mut student_events).await, id);
    let second = tutor.history(&room).await.unwrap()[0].read_at;

    assert_eq!(first, second);
}

#[tokio::test]
async fn mark_with_wrong_room_changes_nothing() {
    let (addr, _handle) = start_server("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{addr}/ws");
    let room = RoomId::for_pair(&UserId::new("s1"), &UserId::new("t1"));

    let (student, _student_events) = joined(&url, "s1", &room).await;
    let (tutor, _tutor_events) = joined(&url, "t1", &room).await;
    let id = send_from_student(&student, &room, "hello").await;

    tutor
        .emit(ClientEvent::MarkAsRead { message_id: id, room_id: "s2-t1".to_string() })
        .unwrap();
    tutor
        .emit(ClientEvent::MarkAsRead { message_id: MessageId::new(), room_id: room.as_str().to_string() })
        .unwrap();

    let history = tutor.history(&room).await.unwrap();
    assert!(!history[0].is_read);
}
