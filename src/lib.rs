#![doc(html_root_url = "https://docs.rs/framegate/latest")]
//! Public API for the `framegate` library.
//!
//! This crate provides a framed TCP request/reply inbound gateway: connection
//! factories (server and client role, dedicated-task and shared-reactor),
//! terminator-delimited framing, correlation of in-flight requests to their
//! reply destinations, and an error path that routes processing failures back
//! to the originating connection.

pub mod channel;
pub mod codec;
pub mod connection;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod factory;
pub mod gateway;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod registry;

pub use channel::{
    BoxError,
    ErrorChannel,
    ErrorChannelFn,
    GatewayFailure,
    HandlerChannel,
    QueueChannel,
    RequestChannel,
    SubmitError,
};
pub use codec::{CodecError, DelimitedCodec};
pub use connection::{ConnectionHandle, ConnectionId, ConnectionRole};
pub use correlation::{CorrelationId, CorrelationRegistry};
pub use envelope::{Envelope, ReplyError, ReplyTo};
pub use error::GatewayError;
pub use factory::{
    ClientConnectionFactory,
    FactoryConfig,
    FrameSink,
    ReactorServerFactory,
    ServerConnectionFactory,
    TcpClientFactory,
    TcpServerFactory,
};
pub use gateway::InboundGateway;
pub use registry::ConnectionRegistry;
