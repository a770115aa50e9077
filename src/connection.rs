//! Connection handles and per-connection I/O tasks.
//!
//! Each accepted or dialed socket is split into a read half, returned to the
//! connection factory to drive, and a write side owned by two tasks spawned
//! here: a *sequencer* that awaits pending reply slots in request order, and
//! a *writer* that performs every socket write for the connection. Replies
//! therefore leave the socket in the order their requests were read, while
//! downstream processing remains free to complete out of order.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use futures::SinkExt;
use log::{debug, warn};
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{mpsc, oneshot},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
    task::TaskTracker,
};

use crate::{codec::DelimitedCodec, correlation::ReplyOutcome};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier assigned to a connection, unique within the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a [`ConnectionId`] with the provided value.
    #[must_use]
    pub fn new(id: u64) -> Self { Self(id) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }

    fn next() -> Self { Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)) }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// How the connection came to exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Accepted by a listening server factory.
    ServerAccepted,
    /// Dialed outbound by a client factory.
    ClientDialed,
}

/// Settings applied to every connection a factory establishes.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionSettings {
    pub(crate) single_use: bool,
    pub(crate) codec: DelimitedCodec,
    pub(crate) write_queue: usize,
    pub(crate) pipeline_depth: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            single_use: false,
            codec: DelimitedCodec::crlf(),
            write_queue: 32,
            pipeline_depth: 64,
        }
    }
}

/// A reply slot staged for in-order delivery.
pub(crate) type PendingReply = oneshot::Receiver<ReplyOutcome>;

/// Error staging a reply slot on a connection.
#[derive(Debug, thiserror::Error)]
pub(crate) enum StageError {
    /// The pipeline already holds the maximum number of in-flight requests.
    #[error("reply pipeline is full")]
    PipelineFull,
    /// The connection is closing; no further requests can be staged.
    #[error("connection is closed")]
    Closed,
}

struct WriteCommand {
    payload: Bytes,
    close_after: bool,
}

/// Shared handle to one live connection.
///
/// The handle never owns the socket; it carries the identity, reuse policy,
/// and the queue endpoints feeding the connection's writer tasks. Cloned
/// `Arc`s of the handle are held by the factory's registry (weakly) and by
/// in-flight dispatches; closing is signalled through a cancellation token
/// so every task observes it.
pub struct ConnectionHandle {
    id: ConnectionId,
    role: ConnectionRole,
    peer_addr: Option<SocketAddr>,
    single_use: bool,
    sequence: AtomicU64,
    pending_tx: mpsc::Sender<PendingReply>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    /// The connection's process-unique identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId { self.id }

    /// Whether this connection was accepted or dialed.
    #[must_use]
    pub fn role(&self) -> ConnectionRole { self.role }

    /// Remote address, when the socket could report one.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> { self.peer_addr }

    /// Whether the connection closes after one request/reply cycle.
    #[must_use]
    pub fn is_single_use(&self) -> bool { self.single_use }

    /// Request the connection be closed.
    ///
    /// Idempotent; the writer, sequencer, and read loop all observe the
    /// signal and wind down.
    pub fn close(&self) { self.closed.cancel(); }

    /// Whether close has been requested or observed.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.closed.is_cancelled() }

    /// Wait until the connection is closed.
    pub async fn closed(&self) { self.closed.cancelled().await; }

    pub(crate) fn next_sequence(&self) -> u64 { self.sequence.fetch_add(1, Ordering::Relaxed) }

    /// Token cancelled when the connection closes.
    pub(crate) fn closed_token(&self) -> CancellationToken { self.closed.clone() }

    /// Stage a reply slot behind every previously staged request.
    pub(crate) fn stage_reply(&self, slot: PendingReply) -> Result<(), StageError> {
        use mpsc::error::TrySendError;
        self.pending_tx.try_send(slot).map_err(|error| match error {
            TrySendError::Full(_) => StageError::PipelineFull,
            TrySendError::Closed(_) => StageError::Closed,
        })
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer_addr", &self.peer_addr)
            .field("single_use", &self.single_use)
            .finish_non_exhaustive()
    }
}

/// Framed read half handed back to the factory that owns the connection.
pub(crate) type ConnectionReader = FramedRead<OwnedReadHalf, DelimitedCodec>;

/// Split `stream` and spawn the connection's writer and sequencer tasks.
///
/// Returns the shared handle and the framed read half; the caller decides
/// whether a dedicated task or a shared reactor drives the reads.
pub(crate) fn establish(
    stream: TcpStream,
    role: ConnectionRole,
    settings: &ConnectionSettings,
    tracker: &TaskTracker,
) -> (Arc<ConnectionHandle>, ConnectionReader) {
    let peer_addr = stream.peer_addr().ok();
    let (read_half, write_half) = stream.into_split();
    let reader = FramedRead::new(read_half, settings.codec.clone());
    let writer = FramedWrite::new(write_half, settings.codec.clone());

    let (write_tx, write_rx) = mpsc::channel(settings.write_queue);
    let (pending_tx, pending_rx) = mpsc::channel(settings.pipeline_depth);
    let closed = CancellationToken::new();

    let handle = Arc::new(ConnectionHandle {
        id: ConnectionId::next(),
        role,
        peer_addr,
        single_use: settings.single_use,
        sequence: AtomicU64::new(0),
        pending_tx,
        closed: closed.clone(),
    });

    debug!(
        "connection {} established: role={role:?}, peer={peer_addr:?}, single_use={}",
        handle.id(),
        settings.single_use
    );
    #[cfg(feature = "metrics")]
    crate::metrics::inc_connections();

    tracker.spawn(write_loop(writer, write_rx, closed.clone(), handle.id()));
    tracker.spawn(sequence_replies(
        pending_rx,
        write_tx,
        closed,
        settings.single_use,
        handle.id(),
    ));

    (handle, reader)
}

/// Await staged reply slots in request order and forward them to the writer.
async fn sequence_replies(
    mut pending: mpsc::Receiver<PendingReply>,
    writes: mpsc::Sender<WriteCommand>,
    closed: CancellationToken,
    single_use: bool,
    id: ConnectionId,
) {
    loop {
        let slot = tokio::select! {
            biased;
            () = closed.cancelled() => break,
            next = pending.recv() => match next {
                Some(slot) => slot,
                None => break,
            },
        };
        let outcome = tokio::select! {
            biased;
            () = closed.cancelled() => break,
            resolved = slot => resolved.unwrap_or(ReplyOutcome::Dropped),
        };
        match outcome {
            ReplyOutcome::Reply(payload) => {
                let command = WriteCommand {
                    payload,
                    close_after: single_use,
                };
                if writes.send(command).await.is_err() {
                    closed.cancel();
                    break;
                }
                if single_use {
                    break;
                }
            }
            ReplyOutcome::Dropped => {
                debug!("connection {id}: request completed without a reply");
                if single_use {
                    closed.cancel();
                    break;
                }
            }
        }
    }
}

/// Single writer for the connection; every outbound frame funnels through
/// here so concurrent replies can never interleave partial writes.
async fn write_loop(
    mut framed: FramedWrite<OwnedWriteHalf, DelimitedCodec>,
    mut commands: mpsc::Receiver<WriteCommand>,
    closed: CancellationToken,
    id: ConnectionId,
) {
    loop {
        tokio::select! {
            biased;
            () = closed.cancelled() => break,
            command = commands.recv() => {
                let Some(WriteCommand { payload, close_after }) = command else {
                    break;
                };
                if let Err(error) = framed.send(payload).await {
                    warn!("connection {id}: reply write failed, closing: {error}");
                    #[cfg(feature = "metrics")]
                    crate::metrics::inc_errors();
                    closed.cancel();
                    break;
                }
                #[cfg(feature = "metrics")]
                crate::metrics::inc_frames(crate::metrics::Direction::Outbound);
                if close_after {
                    debug!("connection {id}: single-use cycle complete, closing");
                    closed.cancel();
                    break;
                }
            }
        }
    }
    #[cfg(feature = "metrics")]
    crate::metrics::dec_connections();
}
