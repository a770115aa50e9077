//! Message envelope published to the request channel.
//!
//! An [`Envelope`] pairs a decoded payload with a [`ReplyTo`] header naming
//! the destination for the eventual reply. The header is an indirect
//! reference (a correlation id resolved through the [`CorrelationRegistry`]
//! at reply time), never a live connection handle, so a reply that arrives
//! after the connection has closed fails cleanly instead of touching a dead
//! socket.

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;

use crate::{
    connection::ConnectionId,
    correlation::{CorrelationId, CorrelationRegistry, ReplyOutcome},
};

/// Error resolving a reply destination.
#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    /// The destination connection closed, or the request was already
    /// answered.
    #[error("reply destination {0} is gone")]
    Gone(CorrelationId),
}

/// Handle for routing a reply back to the connection that sent the request.
///
/// Cloneable so it can travel through error flows, but each request accepts
/// at most one resolution: the first `reply` consumes the underlying slot and
/// any later attempt reports [`ReplyError::Gone`].
#[derive(Clone)]
pub struct ReplyTo {
    correlation: CorrelationId,
    registry: Arc<CorrelationRegistry>,
}

impl ReplyTo {
    pub(crate) fn new(correlation: CorrelationId, registry: Arc<CorrelationRegistry>) -> Self {
        Self {
            correlation,
            registry,
        }
    }

    /// The correlation id naming this destination.
    #[must_use]
    pub fn correlation(&self) -> CorrelationId { self.correlation }

    /// The connection awaiting the reply.
    #[must_use]
    pub fn connection(&self) -> ConnectionId { self.correlation.connection() }

    /// Route `payload` back to the originating connection.
    ///
    /// The payload is written in request order by the connection's writer;
    /// single-use connections close once the write completes.
    ///
    /// # Errors
    ///
    /// Returns [`ReplyError::Gone`] if the connection has closed or the
    /// request was already answered.
    pub fn reply(self, payload: impl Into<Bytes>) -> Result<(), ReplyError> {
        let slot = self
            .registry
            .take(&self.correlation)
            .ok_or(ReplyError::Gone(self.correlation))?;
        slot.send(ReplyOutcome::Reply(payload.into()))
            .map_err(|_| ReplyError::Gone(self.correlation))
    }

    /// Complete the cycle without writing anything.
    ///
    /// Used when a processing failure has no error channel to produce a
    /// reply; a single-use connection still closes.
    pub(crate) fn abandon(self) {
        if let Some(slot) = self.registry.take(&self.correlation) {
            let _ = slot.send(ReplyOutcome::Dropped);
        }
    }
}

impl std::fmt::Debug for ReplyTo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyTo")
            .field("correlation", &self.correlation)
            .finish_non_exhaustive()
    }
}

/// One inbound request as published to the request channel.
#[derive(Clone, Debug)]
pub struct Envelope {
    payload: Bytes,
    peer_addr: Option<SocketAddr>,
    reply_to: ReplyTo,
}

impl Envelope {
    pub(crate) fn new(payload: Bytes, peer_addr: Option<SocketAddr>, reply_to: ReplyTo) -> Self {
        Self {
            payload,
            peer_addr,
            reply_to,
        }
    }

    /// The decoded frame payload, terminator stripped.
    #[must_use]
    pub fn payload(&self) -> &Bytes { &self.payload }

    /// Address of the peer that sent the request, when known.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> { self.peer_addr }

    /// The reply destination header.
    #[must_use]
    pub fn reply_to(&self) -> ReplyTo { self.reply_to.clone() }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;

    fn staged() -> (ReplyTo, oneshot::Receiver<ReplyOutcome>) {
        let registry = Arc::new(CorrelationRegistry::new());
        let correlation = CorrelationId::new(ConnectionId::new(1), 0);
        let (tx, rx) = oneshot::channel();
        registry.register(correlation, tx);
        (ReplyTo::new(correlation, registry), rx)
    }

    #[tokio::test]
    async fn reply_resolves_the_staged_slot() {
        let (reply_to, rx) = staged();
        reply_to.reply("Echo:Test1").expect("reply");
        let outcome = rx.await.expect("resolved");
        assert!(matches!(outcome, ReplyOutcome::Reply(p) if p == "Echo:Test1"));
    }

    #[test]
    fn second_reply_reports_gone() {
        let (reply_to, _rx) = staged();
        let duplicate = reply_to.clone();
        reply_to.reply("first").expect("first reply");
        assert!(matches!(
            duplicate.reply("second"),
            Err(ReplyError::Gone(_))
        ));
    }

    #[test]
    fn reply_after_connection_close_reports_gone() {
        let (reply_to, rx) = staged();
        drop(rx);
        // Slot still registered but the receiver is gone.
        assert!(matches!(reply_to.reply("late"), Err(ReplyError::Gone(_))));
    }

    #[tokio::test]
    async fn abandon_resolves_without_payload() {
        let (reply_to, rx) = staged();
        reply_to.abandon();
        assert!(matches!(rx.await, Ok(ReplyOutcome::Dropped)));
    }
}
