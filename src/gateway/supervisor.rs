//! Client-mode connection supervision.
//!
//! When the gateway owns a client-role factory, this task establishes the
//! outbound connection, hands it to the normal dispatch path, and watches
//! it. A failed attempt or a lost connection puts the loop back to idle and
//! the next attempt runs after the retry interval, indefinitely, until the
//! gateway stops.

use std::{sync::Arc, time::Duration};

use log::{info, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::factory::{ClientConnectionFactory, FrameSink};

pub(crate) async fn run(
    factory: Arc<dyn ClientConnectionFactory>,
    sink: Arc<dyn FrameSink>,
    retry_interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        match factory.connect(Arc::clone(&sink)).await {
            Ok(connection) => {
                info!(
                    "client-mode connection {} established (peer {:?})",
                    connection.id(),
                    connection.peer_addr()
                );
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => {
                        connection.close();
                        break;
                    }
                    () = connection.closed() => {
                        warn!(
                            "client-mode connection {} lost; reconnecting in {retry_interval:?}",
                            connection.id()
                        );
                    }
                }
            }
            Err(error) => {
                warn!("client-mode connect failed: {error}; retrying in {retry_interval:?}");
            }
        }
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            () = sleep(retry_interval) => {}
        }
    }
}
