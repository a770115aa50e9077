//! Lifecycle errors raised by the gateway and its factories.

use std::{io, net::SocketAddr};

use thiserror::Error;

/// Errors that prevent the gateway from starting or running.
///
/// Per-connection failures (frame decoding, dispatch rejection, reply
/// writes) never surface here; they are logged and close only the affected
/// connection.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Binding the listening socket failed; fatal at start.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address the factory attempted to bind.
        addr: SocketAddr,
        /// Underlying socket error.
        source: io::Error,
    },
    /// Dialing the remote endpoint failed; retried in client mode.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Address the factory attempted to reach.
        addr: SocketAddr,
        /// Underlying socket error.
        source: io::Error,
    },
    /// The gateway was stopped and cannot be started again.
    #[error("gateway has been stopped and cannot be restarted")]
    Stopped,
}
