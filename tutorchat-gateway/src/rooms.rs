//! Room router: fan-out of events to the connections joined to a room.
//!
//! Membership is per connection, not per user, and ends when the connection
//! closes. Rooms are created on first join and forgotten when their last
//! member leaves.

use std::collections::HashMap;

use parking_lot::RwLock;
use tutorchat_proto::event::ServerEvent;
use tutorchat_proto::ids::RoomId;

use crate::handle::{ConnectionHandle, ConnectionId};

/// Membership table consulted for room broadcasts.
pub trait RoomDirectory: Send + Sync {
    /// Adds `handle` to `room`. Returns `false` if it was already a member.
    fn join(&self, room: &RoomId, handle: &ConnectionHandle) -> bool;

    /// Sends `event` to every handle joined to `room` right now.
    ///
    /// Returns how many handles accepted the event.
    fn broadcast(&self, room: &RoomId, event: &ServerEvent) -> usize;

    /// Removes `handle` from every room. Returns how many rooms it left.
    fn release(&self, handle: &ConnectionHandle) -> usize;

    /// Connections currently joined to `room`.
    fn members(&self, room: &RoomId) -> Vec<ConnectionId>;

    /// Number of rooms with at least one member.
    fn room_count(&self) -> usize;
}

/// In-process [`RoomDirectory`].
#[derive(Default)]
pub struct RoomRouter {
    rooms: RwLock<HashMap<RoomId, HashMap<ConnectionId, ConnectionHandle>>>,
}

impl RoomRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(&self, room: &RoomId, dead: &[ConnectionId]) {
        let mut rooms = self.rooms.write();
        if let Some(members) = rooms.get_mut(room) {
            for id in dead {
                members.remove(id);
            }
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }
}

impl RoomDirectory for RoomRouter {
    fn join(&self, room: &RoomId, handle: &ConnectionHandle) -> bool {
        self.rooms
            .write()
            .entry(room.clone())
            .or_default()
            .insert(handle.id(), handle.clone())
            .is_none()
    }

    fn broadcast(&self, room: &RoomId, event: &ServerEvent) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let rooms = self.rooms.read();
            let Some(members) = rooms.get(room) else {
                return 0;
            };
            for (id, handle) in members {
                if handle.send(event.clone()) {
                    delivered += 1;
                } else {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            tracing::debug!(room_id = %room, pruned = dead.len(), "pruning closed connections");
            self.prune(room, &dead);
        }
        delivered
    }

    fn release(&self, handle: &ConnectionHandle) -> usize {
        let mut rooms = self.rooms.write();
        let mut left = 0;
        rooms.retain(|_, members| {
            if members.remove(&handle.id()).is_some() {
                left += 1;
            }
            !members.is_empty()
        });
        left
    }

    fn members(&self, room: &RoomId) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .rooms
            .read()
            .get(room)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    fn room_count(&self) -> usize {
        self.rooms.read().len()
    }
}
