//! The request/reply gateway tying factories, channels, and correlation
//! together.
//!
//! [`InboundGateway`] owns the lifecycle: starting the connection factory
//! (or the client-mode supervisor), dispatching decoded frames to the
//! request channel, and routing replies, success or error alike, back to
//! the connection each request arrived on.

mod dispatch;
mod supervisor;
mod translate;

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use dispatch::Dispatcher;
use log::info;
use tokio::time::timeout;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    channel::{ErrorChannel, RequestChannel},
    correlation::CorrelationRegistry,
    error::GatewayError,
    factory::{ClientConnectionFactory, FrameSink, ServerConnectionFactory},
};

const STOPPED: u8 = 0;
pub(crate) const RUNNING: u8 = 1;
const TERMINATED: u8 = 2;

/// Default client-mode retry interval.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Default bounded grace period applied while stopping.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_millis(250);

enum Transport {
    Server(Arc<dyn ServerConnectionFactory>),
    Client(Arc<dyn ClientConnectionFactory>),
}

/// TCP inbound request/reply gateway.
///
/// Frames decoded by the connection factory become [`Envelope`]s published
/// to the request channel; the downstream consumer resolves each envelope's
/// reply destination and the originating connection receives the reply in
/// request order. Processing failures are translated and routed through the
/// error channel when one is configured.
///
/// In client mode the gateway owns the outbound connection: `start` spawns a
/// supervisor that dials immediately and keeps retrying at the configured
/// interval for the gateway's whole lifetime.
///
/// [`Envelope`]: crate::envelope::Envelope
///
/// # Examples
///
/// ```no_run
/// use framegate::{
///     channel::QueueChannel,
///     factory::{FactoryConfig, TcpServerFactory},
///     gateway::InboundGateway,
/// };
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), framegate::error::GatewayError> {
/// let factory = TcpServerFactory::new(
///     "127.0.0.1:0".parse().expect("valid address"),
///     FactoryConfig::new().single_use(true),
/// );
/// let (requests, mut inbound) = QueueChannel::bounded(32);
/// let gateway = InboundGateway::server(factory, requests);
/// gateway.start().await?;
///
/// // Downstream consumer: echo every request back to its sender.
/// if let Some(envelope) = inbound.recv().await {
///     let payload = envelope.payload().clone();
///     let _ = envelope.reply_to().reply(payload);
/// }
///
/// gateway.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct InboundGateway {
    transport: Transport,
    request_channel: Arc<dyn RequestChannel>,
    error_channel: Option<Arc<dyn ErrorChannel>>,
    correlations: Arc<CorrelationRegistry>,
    state: Arc<AtomicU8>,
    retry_interval: Duration,
    stop_grace: Duration,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl InboundGateway {
    /// Create a gateway around a server-role factory.
    pub fn server<F, C>(factory: F, request_channel: C) -> Self
    where
        F: ServerConnectionFactory,
        C: RequestChannel + 'static,
    {
        Self::new(Transport::Server(Arc::new(factory)), request_channel)
    }

    /// Create a gateway owning a client-role factory.
    ///
    /// The gateway runs in client mode: `start` triggers the supervisor's
    /// first connect attempt.
    pub fn client<F, C>(factory: F, request_channel: C) -> Self
    where
        F: ClientConnectionFactory,
        C: RequestChannel + 'static,
    {
        Self::new(Transport::Client(Arc::new(factory)), request_channel)
    }

    fn new<C>(transport: Transport, request_channel: C) -> Self
    where
        C: RequestChannel + 'static,
    {
        Self {
            transport,
            request_channel: Arc::new(request_channel),
            error_channel: None,
            correlations: Arc::new(CorrelationRegistry::new()),
            state: Arc::new(AtomicU8::new(STOPPED)),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            stop_grace: DEFAULT_STOP_GRACE,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Route translated processing failures to `channel`.
    #[must_use]
    pub fn error_channel<E>(mut self, channel: E) -> Self
    where
        E: ErrorChannel + 'static,
    {
        self.error_channel = Some(Arc::new(channel));
        self
    }

    /// Replace the client-mode retry interval.
    #[must_use]
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Replace the bounded grace period used while stopping.
    #[must_use]
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Start the gateway.
    ///
    /// Safe to call again while running (a no-op). In server mode this binds
    /// the listener; returning `Ok` means the factory is accepting and
    /// [`local_addr`](Self::local_addr) reports the bound port. In client
    /// mode the supervisor's first connect attempt is triggered.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Bind`] when the server factory cannot bind,
    /// and [`GatewayError::Stopped`] when the gateway was already stopped.
    pub async fn start(&self) -> Result<(), GatewayError> {
        match self
            .state
            .compare_exchange(STOPPED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {}
            Err(RUNNING) => return Ok(()),
            Err(_) => return Err(GatewayError::Stopped),
        }

        let sink: Arc<dyn FrameSink> = Arc::new(Dispatcher::new(
            Arc::clone(&self.request_channel),
            self.error_channel.clone(),
            Arc::clone(&self.correlations),
            Arc::clone(&self.state),
        ));

        match &self.transport {
            Transport::Server(factory) => {
                if let Err(error) = factory.start(sink).await {
                    self.state.store(TERMINATED, Ordering::SeqCst);
                    return Err(error);
                }
                info!("gateway listening on {:?}", factory.local_addr());
            }
            Transport::Client(factory) => {
                self.tasks.spawn(supervisor::run(
                    Arc::clone(factory),
                    sink,
                    self.retry_interval,
                    self.shutdown.clone(),
                ));
                info!("gateway started in client mode");
            }
        }
        Ok(())
    }

    /// Stop the gateway: stop accepting, cancel any pending client-mode
    /// retry, allow in-flight requests a bounded grace period, then close
    /// every owned connection.
    pub async fn stop(&self) {
        if self
            .state
            .compare_exchange(RUNNING, TERMINATED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.shutdown.cancel();
        match &self.transport {
            Transport::Server(factory) => factory.stop(self.stop_grace).await,
            Transport::Client(factory) => factory.stop(self.stop_grace).await,
        }
        self.tasks.close();
        let _ = timeout(self.stop_grace, self.tasks.wait()).await;
        self.correlations.clear();
        info!("gateway stopped");
    }

    /// Whether the gateway is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool { self.state.load(Ordering::SeqCst) == RUNNING }

    /// Bound address of the server factory, once started.
    ///
    /// Always `None` in client mode.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.transport {
            Transport::Server(factory) => factory.local_addr(),
            Transport::Client(_) => None,
        }
    }

    /// Number of requests currently awaiting a reply.
    #[must_use]
    pub fn pending_replies(&self) -> usize { self.correlations.pending() }
}
