//! Request and error channel seams consumed by the gateway.
//!
//! The gateway publishes every inbound request to a [`RequestChannel`] and
//! never assumes how the downstream consumes it. Two implementations cover
//! the common shapes: [`QueueChannel`] hands envelopes to a puller over a
//! bounded queue, and [`HandlerChannel`] invokes a subscribed handler inline
//! so a processing error surfaces back into the dispatch that submitted the
//! request. Processing failures are forwarded to an [`ErrorChannel`] when one
//! is configured.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use log::warn;
use tokio::sync::mpsc;

use crate::envelope::{Envelope, ReplyTo};

/// Boxed error type carried by processing failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by [`RequestChannel::submit`].
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The channel applied backpressure and refused the message.
    #[error("request channel rejected the message")]
    Rejected,
    /// The channel has no consumer left.
    #[error("request channel is closed")]
    Closed,
    /// The downstream consumer processed the message and failed.
    #[error("downstream processing failed: {0}")]
    Processing(#[source] BoxError),
}

/// Asynchronous submission point for inbound request envelopes.
#[async_trait]
pub trait RequestChannel: Send + Sync {
    /// Publish `envelope` for downstream processing.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::Rejected`] or [`SubmitError::Closed`] when the
    /// message could not be handed over, and [`SubmitError::Processing`] when
    /// an inline consumer accepted the message but failed while handling it.
    async fn submit(&self, envelope: Envelope) -> Result<(), SubmitError>;
}

/// Bounded queue channel; the consumer pulls envelopes at its own pace.
///
/// A full queue rejects immediately rather than parking the submitting
/// connection, so a saturated downstream shows up as a dispatch failure on
/// the one connection instead of starving every other one.
pub struct QueueChannel {
    tx: mpsc::Sender<Envelope>,
}

impl QueueChannel {
    /// Create a queue holding at most `capacity` undelivered envelopes,
    /// returning the channel and the consumer's receiving end.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RequestChannel for QueueChannel {
    async fn submit(&self, envelope: Envelope) -> Result<(), SubmitError> {
        use mpsc::error::TrySendError;
        self.tx.try_send(envelope).map_err(|error| match error {
            TrySendError::Full(_) => SubmitError::Rejected,
            TrySendError::Closed(_) => SubmitError::Closed,
        })
    }
}

type Handler = dyn Fn(Envelope) -> BoxFuture<'static, Result<Bytes, BoxError>> + Send + Sync;

/// Inline subscriber channel; the handler runs within the submitting
/// dispatch, and its reply is routed back before `submit` returns.
pub struct HandlerChannel {
    handler: Arc<Handler>,
}

impl HandlerChannel {
    /// Wrap an async handler producing the reply payload for each request.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, BoxError>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |envelope| Box::pin(handler(envelope))),
        }
    }
}

#[async_trait]
impl RequestChannel for HandlerChannel {
    async fn submit(&self, envelope: Envelope) -> Result<(), SubmitError> {
        let reply_to = envelope.reply_to();
        let reply = (self.handler)(envelope)
            .await
            .map_err(SubmitError::Processing)?;
        if let Err(error) = reply_to.reply(reply) {
            warn!("reply could not be delivered: {error}");
        }
        Ok(())
    }
}

/// A processing failure translated into a routable error message.
///
/// Carries the original payload and, unchanged, the reply destination of the
/// failed request so an error reply reaches exactly the peer that sent it.
#[derive(Debug)]
pub struct GatewayFailure {
    description: String,
    payload: Bytes,
    reply_to: ReplyTo,
}

impl GatewayFailure {
    pub(crate) fn new(description: String, payload: Bytes, reply_to: ReplyTo) -> Self {
        Self {
            description,
            payload,
            reply_to,
        }
    }

    /// Human-readable description of the failure.
    #[must_use]
    pub fn description(&self) -> &str { &self.description }

    /// Payload of the request that failed.
    #[must_use]
    pub fn payload(&self) -> &Bytes { &self.payload }

    /// Reply destination of the failed request.
    #[must_use]
    pub fn reply_to(&self) -> ReplyTo { self.reply_to.clone() }
}

/// Receives translated processing failures.
///
/// A handler typically resolves [`GatewayFailure::reply_to`] to send failure
/// information to the peer exactly as a normal reply would be sent.
#[async_trait]
pub trait ErrorChannel: Send + Sync {
    /// Handle one translated failure.
    async fn handle(&self, failure: GatewayFailure);
}

type ErrorHandler = dyn Fn(GatewayFailure) -> BoxFuture<'static, ()> + Send + Sync;

/// [`ErrorChannel`] backed by an async closure.
pub struct ErrorChannelFn {
    handler: Arc<ErrorHandler>,
}

impl ErrorChannelFn {
    /// Wrap an async closure as an error channel.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(GatewayFailure) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |failure| Box::pin(handler(failure))),
        }
    }
}

#[async_trait]
impl ErrorChannel for ErrorChannelFn {
    async fn handle(&self, failure: GatewayFailure) { (self.handler)(failure).await; }
}
