//! Correlation between in-flight requests and their reply destinations.
//!
//! Every dispatched request is keyed by the originating connection and a
//! per-connection sequence number. The registry stores the one-shot slot
//! that resolves the reply; taking the slot consumes the entry, which is
//! what makes replies exactly-once. Entries for a closing connection are
//! evicted in bulk so orphans never accumulate.

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::connection::ConnectionId;

/// Identifies one request within one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CorrelationId {
    connection: ConnectionId,
    sequence: u64,
}

impl CorrelationId {
    /// Create a correlation id for `sequence` on `connection`.
    #[must_use]
    pub fn new(connection: ConnectionId, sequence: u64) -> Self {
        Self {
            connection,
            sequence,
        }
    }

    /// The connection this request arrived on.
    #[must_use]
    pub fn connection(&self) -> ConnectionId { self.connection }

    /// The request's position within its connection.
    #[must_use]
    pub fn sequence(&self) -> u64 { self.sequence }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.connection, self.sequence)
    }
}

/// Resolution of one pending reply slot.
#[derive(Debug)]
pub(crate) enum ReplyOutcome {
    /// A reply payload to encode and write.
    Reply(Bytes),
    /// No reply will be produced; the cycle still completes.
    Dropped,
}

/// Concurrent map from in-flight requests to their reply slots.
#[derive(Default)]
pub struct CorrelationRegistry(DashMap<CorrelationId, oneshot::Sender<ReplyOutcome>>);

impl CorrelationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Number of requests currently awaiting a reply.
    #[must_use]
    pub fn pending(&self) -> usize { self.0.len() }

    pub(crate) fn register(&self, id: CorrelationId, slot: oneshot::Sender<ReplyOutcome>) {
        self.0.insert(id, slot);
    }

    /// Remove and return the reply slot for `id`, if still in flight.
    pub(crate) fn take(&self, id: &CorrelationId) -> Option<oneshot::Sender<ReplyOutcome>> {
        self.0.remove(id).map(|(_, slot)| slot)
    }

    /// Drop every entry belonging to `connection`.
    ///
    /// Dropping a slot resolves its receiver with a cancellation, letting the
    /// connection's sequencer drain without writing anything.
    pub(crate) fn evict_connection(&self, connection: ConnectionId) {
        self.0.retain(|id, _| id.connection() != connection);
    }

    /// Drop every entry; used when the gateway stops.
    pub(crate) fn clear(&self) { self.0.clear(); }
}
