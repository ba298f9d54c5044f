//! `TutorChat` gateway library.
//!
//! Exposes the chat gateway for use in tests and embedding. The gateway
//! accepts authenticated WebSocket connections, persists chat messages, and
//! fans them out to the connections joined to each two-party room.

pub mod access;
pub mod config;
pub mod connection;
pub mod gateway;
pub mod handle;
pub mod presence;
pub mod rooms;
pub mod server;
pub mod sqlite;
pub mod store;
