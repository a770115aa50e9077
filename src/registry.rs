//! Registry of live connections owned by a factory.
//!
//! Entries are non-owning weak references so a connection's tasks decide its
//! lifetime; the registry only needs to find still-live handles, chiefly to
//! force-close everything on shutdown. Dead entries are pruned lazily at
//! lookup time or explicitly on teardown.

use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::connection::{ConnectionHandle, ConnectionId};

/// Concurrent map of connection handles keyed by [`ConnectionId`].
#[derive(Default)]
pub struct ConnectionRegistry(DashMap<ConnectionId, Weak<ConnectionHandle>>);

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Retrieve the handle for `id` if the connection is still alive.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let guard = self.0.get(id);
        let handle = guard.as_ref().and_then(|weak| weak.upgrade());
        drop(guard);
        if handle.is_none() {
            self.0.remove_if(id, |_, weak| weak.strong_count() == 0);
        }
        handle
    }

    /// Insert a handle for a newly established connection.
    pub fn insert(&self, handle: &Arc<ConnectionHandle>) {
        self.0.insert(handle.id(), Arc::downgrade(handle));
    }

    /// Remove a handle, typically when its read loop ends.
    pub fn remove(&self, id: &ConnectionId) { self.0.remove(id); }

    /// Number of live connections currently registered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    /// Whether no live connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Signal close on every live connection and clear the registry.
    pub fn close_all(&self) {
        self.0.retain(|_, weak| {
            if let Some(handle) = weak.upgrade() {
                handle.close();
            }
            false
        });
    }
}
