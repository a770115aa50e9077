//! Shared-reactor server factory.
//!
//! One reactor task multiplexes every connection's framed reads through a
//! `SelectAll` and hands each staged dispatch to a semaphore-bounded worker
//! pool. Staging happens on the reactor in read order, so per-connection
//! FIFO write ordering is preserved even though dispatches complete
//! concurrently.

use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    StreamExt,
    future,
    stream::{self, BoxStream, SelectAll},
};
use log::warn;
use tokio::{net::TcpListener, sync::Semaphore, time::sleep};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{FactoryConfig, FrameSink, ServerConnectionFactory, drain_and_close, guarded};
use crate::{
    codec::CodecError,
    connection::{ConnectionHandle, ConnectionReader, ConnectionRole, ConnectionSettings, establish},
    error::GatewayError,
    registry::ConnectionRegistry,
};

/// Default number of concurrently executing dispatches.
pub const DEFAULT_WORKER_POOL: usize = 16;

enum ReadEvent {
    Frame(Arc<ConnectionHandle>, Result<Bytes, CodecError>),
    Closed(Arc<ConnectionHandle>),
}

type ConnectionFrames = BoxStream<'static, ReadEvent>;

/// Server factory multiplexing all connections on one reactor task.
pub struct ReactorServerFactory {
    addr: SocketAddr,
    config: FactoryConfig,
    worker_pool: usize,
    registry: Arc<ConnectionRegistry>,
    local_addr: OnceLock<SocketAddr>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl ReactorServerFactory {
    /// Create a factory that will listen on `addr` (port 0 binds an
    /// ephemeral port).
    #[must_use]
    pub fn new(addr: SocketAddr, config: FactoryConfig) -> Self {
        Self {
            addr,
            config,
            worker_pool: DEFAULT_WORKER_POOL,
            registry: Arc::new(ConnectionRegistry::new()),
            local_addr: OnceLock::new(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Replace the worker pool size bounding concurrent dispatches.
    #[must_use]
    pub fn worker_pool(mut self, workers: usize) -> Self {
        self.worker_pool = workers.max(1);
        self
    }
}

#[async_trait]
impl ServerConnectionFactory for ReactorServerFactory {
    async fn start(&self, sink: Arc<dyn FrameSink>) -> Result<(), GatewayError> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: self.addr,
                source,
            })?;
        if let Ok(local) = listener.local_addr() {
            let _ = self.local_addr.set(local);
        }

        self.tracker.spawn(reactor_loop(
            listener,
            sink,
            self.config.connection_settings(),
            Arc::clone(&self.registry),
            self.shutdown.clone(),
            self.tracker.clone(),
            Arc::new(Semaphore::new(self.worker_pool)),
        ));
        Ok(())
    }

    async fn stop(&self, grace: Duration) {
        self.shutdown.cancel();
        drain_and_close(&self.tracker, &self.registry, grace).await;
    }

    fn local_addr(&self) -> Option<SocketAddr> { self.local_addr.get().copied() }

    fn registry(&self) -> Arc<ConnectionRegistry> { Arc::clone(&self.registry) }
}

/// Wrap a connection's framed reads as a reactor event stream.
///
/// The stream stops at peer EOF or when the connection is closed locally,
/// then emits a final `Closed` event for cleanup.
fn connection_frames(handle: &Arc<ConnectionHandle>, reader: ConnectionReader) -> ConnectionFrames {
    let for_frames = Arc::clone(handle);
    let on_close = Arc::clone(handle);
    let cancelled = handle.closed_token().cancelled_owned();
    reader
        .map(move |result| ReadEvent::Frame(Arc::clone(&for_frames), result))
        .take_until(Box::pin(cancelled))
        .chain(stream::once(future::ready(ReadEvent::Closed(on_close))))
        .boxed()
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus operations internally"
)]
async fn reactor_loop(
    listener: TcpListener,
    sink: Arc<dyn FrameSink>,
    settings: ConnectionSettings,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    workers: Arc<Semaphore>,
) {
    let mut reads: SelectAll<ConnectionFrames> = SelectAll::new();
    let mut delay = Duration::from_millis(10);
    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => break,

            res = listener.accept() => match res {
                Ok((stream, _)) => {
                    let (handle, reader) =
                        establish(stream, ConnectionRole::ServerAccepted, &settings, &tracker);
                    registry.insert(&handle);
                    reads.push(connection_frames(&handle, reader));
                    delay = Duration::from_millis(10);
                }
                Err(error) => {
                    warn!("accept error: {error}");
                    sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(1));
                }
            },

            Some(event) = reads.next(), if !reads.is_empty() => match event {
                ReadEvent::Frame(handle, Ok(payload)) => {
                    #[cfg(feature = "metrics")]
                    crate::metrics::inc_frames(crate::metrics::Direction::Inbound);
                    // Staging happens here, on the reactor, in read order;
                    // only the submission runs on the worker pool.
                    let staged = sink.on_frame(&handle, payload);
                    let Ok(permit) = Arc::clone(&workers).acquire_owned().await else {
                        break;
                    };
                    let dispatch = async move {
                        let _permit = permit;
                        staged.await;
                    };
                    tracker.spawn(guarded(dispatch, handle));
                }
                ReadEvent::Frame(handle, Err(error)) => {
                    warn!(
                        "connection {}: frame decode failed, closing: {error}",
                        handle.id()
                    );
                    #[cfg(feature = "metrics")]
                    crate::metrics::inc_errors();
                    handle.close();
                }
                ReadEvent::Closed(handle) => {
                    handle.close();
                    registry.remove(&handle.id());
                    sink.on_closed(&handle);
                }
            },
        }
    }
}
