//! Translation of processing failures into routable error messages.

use crate::{
    channel::{BoxError, GatewayFailure},
    envelope::Envelope,
};

/// Convert a downstream failure into a [`GatewayFailure`] addressed to the
/// original reply destination.
///
/// The reply destination is carried over unchanged so an error reply is
/// routed exactly as a success reply would be. This function cannot fail:
/// whatever the error renders as becomes the description.
pub(crate) fn translate_failure(envelope: &Envelope, error: &BoxError) -> GatewayFailure {
    GatewayFailure::new(
        error.to_string(),
        envelope.payload().clone(),
        envelope.reply_to(),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::{
        connection::ConnectionId,
        correlation::{CorrelationId, CorrelationRegistry},
        envelope::ReplyTo,
    };

    #[test]
    fn failure_preserves_destination_and_payload() {
        let registry = Arc::new(CorrelationRegistry::new());
        let correlation = CorrelationId::new(ConnectionId::new(4), 2);
        let envelope = Envelope::new(
            Bytes::from("Test1"),
            None,
            ReplyTo::new(correlation, registry),
        );
        let error: BoxError = "planned failure".into();

        let failure = translate_failure(&envelope, &error);

        assert_eq!(failure.description(), "planned failure");
        assert_eq!(failure.payload(), &Bytes::from("Test1"));
        assert_eq!(failure.reply_to().correlation(), correlation);
    }
}
