//! Dedicated-task server factory: one read task per accepted connection.

use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use async_trait::async_trait;
use log::warn;
use tokio::{net::TcpListener, time::sleep};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{
    FactoryConfig, FrameSink, ServerConnectionFactory, drain_and_close, drive_reads, guarded,
};
use crate::{
    connection::{ConnectionRole, ConnectionSettings, establish},
    error::GatewayError,
    registry::ConnectionRegistry,
};

/// Server factory spawning a dedicated read task per connection.
///
/// Each accepted socket gets its own task driving the read/dispatch loop, so
/// one connection's dispatch can suspend without affecting any other.
pub struct TcpServerFactory {
    addr: SocketAddr,
    config: FactoryConfig,
    registry: Arc<ConnectionRegistry>,
    local_addr: OnceLock<SocketAddr>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl TcpServerFactory {
    /// Create a factory that will listen on `addr` (port 0 binds an
    /// ephemeral port).
    #[must_use]
    pub fn new(addr: SocketAddr, config: FactoryConfig) -> Self {
        Self {
            addr,
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            local_addr: OnceLock::new(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }
}

#[async_trait]
impl ServerConnectionFactory for TcpServerFactory {
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

        self.tracker.spawn(accept_loop(
            listener,
            sink,
            self.config.connection_settings(),
            Arc::clone(&self.registry),
            self.shutdown.clone(),
            self.tracker.clone(),
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

/// Accept connections until shutdown, retrying transient accept errors with
/// exponential backoff.
async fn accept_loop(
    listener: TcpListener,
    sink: Arc<dyn FrameSink>,
    settings: ConnectionSettings,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
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
                    let reads = drive_reads(
                        reader,
                        Arc::clone(&handle),
                        Arc::clone(&sink),
                        Arc::clone(&registry),
                    );
                    tracker.spawn(guarded(reads, handle));
                    delay = Duration::from_millis(10);
                }
                Err(error) => {
                    warn!("accept error: {error}");
                    sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(1));
                }
            },
        }
    }
}
