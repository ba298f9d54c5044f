//! Presence registry: which connection currently speaks for a user.
//!
//! Only used to route out-of-band notifications. Last registration wins; a
//! user with two open sockets receives notifications on the most recent one.

use std::collections::HashMap;

use parking_lot::RwLock;
use tutorchat_proto::ids::UserId;

use crate::handle::ConnectionHandle;

/// Lookup from user identity to the connection that should receive
/// notifications for it.
pub trait PresenceDirectory: Send + Sync {
    /// Maps `user` to `handle`, returning the handle it replaced.
    fn register(&self, user: UserId, handle: ConnectionHandle) -> Option<ConnectionHandle>;

    /// Returns the handle currently registered for `user`.
    fn resolve(&self, user: &UserId) -> Option<ConnectionHandle>;

    /// Removes every entry that points at `handle`.
    ///
    /// Entries that were since re-registered to another handle are kept.
    /// Returns how many entries were removed.
    fn unregister_handle(&self, handle: &ConnectionHandle) -> usize;

    /// Number of registered users.
    fn online_count(&self) -> usize;
}

/// In-process [`PresenceDirectory`].
#[derive(Default)]
pub struct PresenceRegistry {
    entries: RwLock<HashMap<UserId, ConnectionHandle>>,
}

impl PresenceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PresenceDirectory for PresenceRegistry {
    fn register(&self, user: UserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.entries.write().insert(user, handle)
    }

    fn resolve(&self, user: &UserId) -> Option<ConnectionHandle> {
        self.entries.read().get(user).cloned()
    }

    fn unregister_handle(&self, handle: &ConnectionHandle) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, h| h != handle);
        before - entries.len()
    }

    fn online_count(&self) -> usize {
        self.entries.read().len()
    }
}
