//! Client-role factory dialing a single outbound connection.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::task::TaskTracker;

use super::{
    ClientConnectionFactory, FactoryConfig, FrameSink, drain_and_close, drive_reads, guarded,
};
use crate::{
    connection::{ConnectionHandle, ConnectionRole, establish},
    error::GatewayError,
    registry::ConnectionRegistry,
};

/// Factory dialing `addr` when the gateway's supervisor asks for a
/// connection.
///
/// Inbound frames on the dialed connection flow through the same dispatch
/// path as server-accepted ones; the only difference is who opened the
/// socket.
pub struct TcpClientFactory {
    addr: SocketAddr,
    config: FactoryConfig,
    registry: Arc<ConnectionRegistry>,
    tracker: TaskTracker,
}

impl TcpClientFactory {
    /// Create a factory dialing `addr`.
    #[must_use]
    pub fn new(addr: SocketAddr, config: FactoryConfig) -> Self {
        Self {
            addr,
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            tracker: TaskTracker::new(),
        }
    }

    /// The endpoint this factory dials.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr { self.addr }
}

#[async_trait]
impl ClientConnectionFactory for TcpClientFactory {
    async fn connect(
        &self,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Arc<ConnectionHandle>, GatewayError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|source| GatewayError::Connect {
                addr: self.addr,
                source,
            })?;
        let (handle, reader) = establish(
            stream,
            ConnectionRole::ClientDialed,
            &self.config.connection_settings(),
            &self.tracker,
        );
        self.registry.insert(&handle);
        let reads = drive_reads(
            reader,
            Arc::clone(&handle),
            sink,
            Arc::clone(&self.registry),
        );
        self.tracker.spawn(guarded(reads, Arc::clone(&handle)));
        Ok(handle)
    }

    async fn stop(&self, grace: Duration) {
        self.registry.close_all();
        drain_and_close(&self.tracker, &self.registry, grace).await;
    }

    fn registry(&self) -> Arc<ConnectionRegistry> { Arc::clone(&self.registry) }
}
