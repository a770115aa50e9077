//! Per-frame dispatch: envelope construction, correlation, and submission.

use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use bytes::Bytes;
use futures::{FutureExt, future, future::BoxFuture};
use log::{debug, error, warn};
use tokio::sync::oneshot;

use super::{RUNNING, translate::translate_failure};
use crate::{
    channel::{ErrorChannel, RequestChannel, SubmitError},
    connection::ConnectionHandle,
    correlation::{CorrelationId, CorrelationRegistry},
    envelope::{Envelope, ReplyTo},
    factory::FrameSink,
};

/// The gateway's [`FrameSink`]: shared by every factory implementation.
///
/// `on_frame` stages the reply slot synchronously: sequence assignment,
/// correlation registration, and pipeline insertion all happen before the
/// returned future is polled. Whichever execution model drives the returned
/// submission, replies keep the order frames were read in.
pub(crate) struct Dispatcher {
    request_channel: Arc<dyn RequestChannel>,
    error_channel: Option<Arc<dyn ErrorChannel>>,
    correlations: Arc<CorrelationRegistry>,
    state: Arc<AtomicU8>,
}

impl Dispatcher {
    pub(crate) fn new(
        request_channel: Arc<dyn RequestChannel>,
        error_channel: Option<Arc<dyn ErrorChannel>>,
        correlations: Arc<CorrelationRegistry>,
        state: Arc<AtomicU8>,
    ) -> Self {
        Self {
            request_channel,
            error_channel,
            correlations,
            state,
        }
    }

    /// Handle a failure reported by downstream processing.
    ///
    /// With an error channel configured the translated failure is handed
    /// over for the handler to produce an error reply; otherwise the failure
    /// is reported and the reply slot abandoned so the peer sees a closed or
    /// idle connection rather than a distorted response.
    async fn processing_failed(
        error_channel: Option<Arc<dyn ErrorChannel>>,
        envelope: Envelope,
        failure: &crate::channel::BoxError,
    ) {
        #[cfg(feature = "metrics")]
        crate::metrics::inc_errors();
        if let Some(channel) = error_channel {
            channel.handle(translate_failure(&envelope, failure)).await;
        } else {
            error!(
                "no error channel configured; dropping failure for {}: {failure}",
                envelope.reply_to().correlation()
            );
            envelope.reply_to().abandon();
        }
    }
}

impl FrameSink for Dispatcher {
    fn on_frame(
        &self,
        connection: &Arc<ConnectionHandle>,
        payload: Bytes,
    ) -> BoxFuture<'static, ()> {
        if self.state.load(Ordering::SeqCst) != RUNNING {
            debug!(
                "gateway not running; dropping frame from {}",
                connection.id()
            );
            return future::ready(()).boxed();
        }

        let correlation = CorrelationId::new(connection.id(), connection.next_sequence());
        let (slot_tx, slot_rx) = oneshot::channel();
        self.correlations.register(correlation, slot_tx);
        if let Err(stage_error) = connection.stage_reply(slot_rx) {
            warn!(
                "connection {}: cannot stage reply for {correlation}, closing: {stage_error}",
                connection.id()
            );
            self.correlations.take(&correlation);
            connection.close();
            return future::ready(()).boxed();
        }

        let envelope = Envelope::new(
            payload,
            connection.peer_addr(),
            ReplyTo::new(correlation, Arc::clone(&self.correlations)),
        );
        let request_channel = Arc::clone(&self.request_channel);
        let error_channel = self.error_channel.clone();
        let connection = Arc::clone(connection);

        async move {
            match request_channel.submit(envelope.clone()).await {
                Ok(()) => {}
                Err(SubmitError::Processing(failure)) => {
                    warn!("processing failed for {correlation}: {failure}");
                    Self::processing_failed(error_channel, envelope, &failure).await;
                }
                Err(dispatch_error) => {
                    warn!(
                        "connection {}: dispatch failed, closing: {dispatch_error}",
                        connection.id()
                    );
                    #[cfg(feature = "metrics")]
                    crate::metrics::inc_errors();
                    connection.close();
                }
            }
        }
        .boxed()
    }

    fn on_closed(&self, connection: &Arc<ConnectionHandle>) {
        self.correlations.evict_connection(connection.id());
    }
}
