//! `TutorChat` client library.
//!
//! A [`connection::ChatConnection`] carries events to and from the gateway;
//! a [`session::ChatSession`] keeps the local view of one two-party room.

pub mod config;
pub mod connection;
pub mod render;
pub mod session;
