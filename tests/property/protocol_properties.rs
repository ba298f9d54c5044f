//! Property-based tests for the chat protocol.
//!
//! Uses proptest to verify:
//! 1. Room keys do not depend on participant order.
//! 2. Both participants of a canonical key are recognized as members.
//! 3. Arbitrary input never panics the decoders.
//! 4. Attachment-bearing kinds never validate without an attachment.

use proptest::prelude::*;
use tutorchat_proto::codec;
use tutorchat_proto::ids::{RoomId, UserId};
use tutorchat_proto::message::{MAX_CONTENT_CHARS, MessageBody, MessageKind, ValidationError};

/// Strategy for identities as issued by the auth provider (no separator).
fn arb_user_id() -> impl Strategy<Value = UserId> {
    "[a-zA-Z0-9_]{1,24}".prop_map(UserId::new)
}

fn arb_attachment_kind() -> impl Strategy<Value = MessageKind> {
    prop_oneof![
        Just(MessageKind::Image),
        Just(MessageKind::File),
        Just(MessageKind::BookingEvent),
    ]
}

proptest! {
    #[test]
    fn room_key_symmetric(a in arb_user_id(), b in arb_user_id()) {
        prop_assert_eq!(RoomId::for_pair(&a, &b), RoomId::for_pair(&b, &a));
    }

    #[test]
    fn room_key_contains_both_participants(a in arb_user_id(), b in arb_user_id()) {
        let room = RoomId::for_pair(&a, &b);
        prop_assert!(room.has_participant(&a));
        prop_assert!(room.has_participant(&b));
    }

    #[test]
    fn room_key_parses_back(a in arb_user_id(), b in arb_user_id()) {
        let room = RoomId::for_pair(&a, &b);
        prop_assert_eq!(RoomId::parse(room.as_str()), Some(room));
    }

    #[test]
    fn client_decoder_never_panics(frame in ".*") {
        let _ = codec::decode_client(&frame, 64 * 1024);
    }

    #[test]
    fn server_decoder_never_panics(frame in ".*") {
        let _ = codec::decode_server(&frame);
    }

    #[test]
    fn attachment_kinds_reject_missing_attachment(
        kind in arb_attachment_kind(),
        content in ".{0,64}",
    ) {
        let result = MessageBody::build(kind, content, None, MAX_CONTENT_CHARS);
        prop_assert_eq!(result, Err(ValidationError::MissingAttachment { kind }));
    }
}
