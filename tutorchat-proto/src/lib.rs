//! Shared protocol definitions for the `TutorChat` socket channel.

pub mod codec;
pub mod event;
pub mod ids;
pub mod message;
