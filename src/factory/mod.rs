//! Connection factories: listen-and-accept, dial, framing, and teardown.
//!
//! A factory owns the sockets. It decodes frames and feeds them to a
//! [`FrameSink`] (the gateway), which never learns whether a dedicated task
//! or a shared reactor produced them. Two server implementations share every
//! other piece of machinery:
//!
//! - [`TcpServerFactory`] spawns one read task per accepted connection.
//! - [`ReactorServerFactory`] multiplexes every connection's reads through a
//!   single reactor task and a bounded worker pool.
//!
//! [`TcpClientFactory`] dials a single outbound connection on demand; the
//! gateway's client-mode supervisor drives it.

mod client;
mod reactor;
mod server;

use std::{net::SocketAddr, sync::Arc, time::Duration};

pub use client::TcpClientFactory;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, StreamExt, future::BoxFuture};
use log::{debug, warn};
pub use reactor::{DEFAULT_WORKER_POOL, ReactorServerFactory};
pub use server::TcpServerFactory;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;

use crate::{
    codec::{DEFAULT_MAX_FRAME_LENGTH, DelimitedCodec},
    connection::{ConnectionHandle, ConnectionReader, ConnectionSettings},
    error::GatewayError,
    registry::ConnectionRegistry,
};

/// Receives decoded frames and connection-closed notifications.
///
/// `on_frame` must stage the dispatch synchronously, in the order frames
/// were read from the connection, and return the remaining asynchronous
/// work. A dedicated-task factory awaits the returned future inline; the
/// reactor factory hands it to its worker pool. Per-connection FIFO ordering
/// holds either way because staging happened before `on_frame` returned.
pub trait FrameSink: Send + Sync + 'static {
    /// Accept one decoded frame from `connection`.
    fn on_frame(
        &self,
        connection: &Arc<ConnectionHandle>,
        payload: Bytes,
    ) -> BoxFuture<'static, ()>;

    /// Note that `connection` has closed; pending state for it is released.
    fn on_closed(&self, connection: &Arc<ConnectionHandle>);
}

/// Configuration shared by every factory implementation.
#[derive(Clone, Debug)]
pub struct FactoryConfig {
    single_use: bool,
    terminator: Bytes,
    max_frame_length: usize,
    pipeline_depth: usize,
}

impl FactoryConfig {
    /// Start from the defaults: persistent connections, CRLF framing.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Close each connection after exactly one request/reply cycle.
    #[must_use]
    pub fn single_use(mut self, single_use: bool) -> Self {
        self.single_use = single_use;
        self
    }

    /// Replace the frame terminator.
    #[must_use]
    pub fn terminator(mut self, terminator: impl Into<Bytes>) -> Self {
        self.terminator = terminator.into();
        self
    }

    /// Replace the maximum frame payload length.
    #[must_use]
    pub fn max_frame_length(mut self, limit: usize) -> Self {
        self.max_frame_length = limit;
        self
    }

    /// Replace the number of requests a connection may have in flight.
    #[must_use]
    pub fn pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth.max(1);
        self
    }

    pub(crate) fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            single_use: self.single_use,
            codec: DelimitedCodec::new(self.terminator.clone())
                .max_frame_length(self.max_frame_length),
            pipeline_depth: self.pipeline_depth,
            ..ConnectionSettings::default()
        }
    }
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            single_use: false,
            terminator: Bytes::from_static(crate::codec::CRLF),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            pipeline_depth: 64,
        }
    }
}

/// Server-role factory: binds, accepts, and owns inbound connections.
#[async_trait]
pub trait ServerConnectionFactory: Send + Sync + 'static {
    /// Bind the listening socket and begin accepting.
    ///
    /// Returning `Ok` is the ready signal: the socket is bound and
    /// [`local_addr`](Self::local_addr) reports the (possibly ephemeral)
    /// port.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Bind`] if the listening socket cannot be
    /// bound; this is fatal for the gateway start.
    async fn start(&self, sink: Arc<dyn FrameSink>) -> Result<(), GatewayError>;

    /// Stop accepting, drain for at most `grace`, then close every owned
    /// connection.
    async fn stop(&self, grace: Duration);

    /// Bound address once [`start`](Self::start) has succeeded.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Registry of this factory's live connections.
    fn registry(&self) -> Arc<ConnectionRegistry>;
}

/// Client-role factory: dials one outbound connection per request.
#[async_trait]
pub trait ClientConnectionFactory: Send + Sync + 'static {
    /// Dial the configured endpoint and start reading frames into `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Connect`] when the endpoint is unreachable;
    /// the client-mode supervisor retries after its configured interval.
    async fn connect(&self, sink: Arc<dyn FrameSink>)
    -> Result<Arc<ConnectionHandle>, GatewayError>;

    /// Close any open connection and drain for at most `grace`.
    async fn stop(&self, grace: Duration);

    /// Registry of this factory's live connections.
    fn registry(&self) -> Arc<ConnectionRegistry>;
}

/// Read loop shared by the dedicated-task factories.
///
/// Reads are strictly sequential: the next frame is not pulled until the
/// dispatch staged for the previous one has been driven to completion by
/// this task. A decode failure closes only this connection.
pub(crate) async fn drive_reads(
    mut reader: ConnectionReader,
    handle: Arc<ConnectionHandle>,
    sink: Arc<dyn FrameSink>,
    registry: Arc<ConnectionRegistry>,
) {
    loop {
        tokio::select! {
            biased;
            () = handle.closed() => break,
            item = reader.next() => match item {
                Some(Ok(payload)) => {
                    #[cfg(feature = "metrics")]
                    crate::metrics::inc_frames(crate::metrics::Direction::Inbound);
                    sink.on_frame(&handle, payload).await;
                }
                Some(Err(error)) => {
                    warn!(
                        "connection {}: frame decode failed, closing: {error}",
                        handle.id()
                    );
                    #[cfg(feature = "metrics")]
                    crate::metrics::inc_errors();
                    handle.close();
                    break;
                }
                None => {
                    debug!("connection {}: peer closed the stream", handle.id());
                    handle.close();
                    break;
                }
            },
        }
    }
    registry.remove(&handle.id());
    sink.on_closed(&handle);
}

/// Run a connection-bound future, containing any panic to that connection.
///
/// A panicking downstream handler must not take the factory down with it;
/// the panic is reported and the connection closed, everything else keeps
/// running.
pub(crate) fn guarded<F>(
    task: F,
    handle: Arc<ConnectionHandle>,
) -> impl Future<Output = ()> + Send
where
    F: Future<Output = ()> + Send,
{
    async move {
        let result = std::panic::AssertUnwindSafe(task).catch_unwind().await;
        if let Err(panic) = result {
            let panic_msg = panic
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("<non-string panic>");
            tracing::error!(
                panic = %panic_msg,
                peer_addr = ?handle.peer_addr(),
                "connection task panicked"
            );
            handle.close();
        }
    }
}

/// Common teardown: stop intake, drain within `grace`, then force-close.
pub(crate) async fn drain_and_close(
    tracker: &TaskTracker,
    registry: &ConnectionRegistry,
    grace: Duration,
) {
    tracker.close();
    if timeout(grace, tracker.wait()).await.is_err() {
        debug!("grace period elapsed; force-closing remaining connections");
        registry.close_all();
        if timeout(grace, tracker.wait()).await.is_err() {
            warn!("connection tasks still pending after forced close");
        }
    }
    registry.close_all();
}
