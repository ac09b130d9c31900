//! Daemon: main runtime orchestrator.
//!
//! The Daemon ties together:
//! - Engine (ledger, reconciler, risk state machine, position manager)
//! - Event Bus (signals, broker events, engine events)
//! - API Server (HTTP endpoints)
//!
//! # Lifecycle
//!
//! 1. Connect the broker gateway
//! 2. Sync with the broker: adopt an open position and its orders
//! 3. Start API server
//! 4. Main loop: status poll, broker push events, signals
//! 5. Graceful shutdown on SIGINT, a shutdown event or cancellation

use std::net::SocketAddr;
use std::sync::Arc;

use rust_decimal_macros::dec;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bracket_connectors::ProjectXGateway;
use bracket_exec::{BrokerEvent, BrokerGateway, StubBroker};

use crate::api::{create_router, ApiState};
use crate::config::Config;
use crate::engine::Engine;
use crate::error::{DaemonError, DaemonResult};
use crate::event_bus::{DaemonEvent, EventBus};

// =============================================================================
// Daemon
// =============================================================================

/// The bracket daemon.
pub struct Daemon<G: BrokerGateway + 'static> {
    config: Config,
    engine: Arc<Engine<G>>,
    event_bus: Arc<EventBus>,
    gateway: Arc<G>,
    /// Push events, for gateways that have them
    broker_events: Option<mpsc::UnboundedReceiver<BrokerEvent>>,
    shutdown: CancellationToken,
}

impl Daemon<StubBroker> {
    /// Create a daemon on the in-memory broker (test environment).
    pub fn new_stub(config: Config) -> DaemonResult<Self> {
        let price = config.trading.instrument.round_price(dec!(2650))?;
        let broker = Arc::new(StubBroker::new(config.trading.instrument.clone(), price));
        let events = broker.subscribe();
        Ok(Self::new(config, broker, Some(events)))
    }
}

impl Daemon<ProjectXGateway> {
    /// Create a daemon on ProjectX, logging in first.
    pub async fn new_projectx(config: Config) -> DaemonResult<Self> {
        let gateway = ProjectXGateway::new(config.broker.clone())?;
        let account_id = gateway.connect().await?;
        info!(account_id, "Connected to ProjectX");
        Ok(Self::new(config, Arc::new(gateway), None))
    }
}

impl<G: BrokerGateway + 'static> Daemon<G> {
    /// Create a daemon with provided components.
    pub fn new(
        config: Config,
        gateway: Arc<G>,
        broker_events: Option<mpsc::UnboundedReceiver<BrokerEvent>>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::default());
        let engine = Arc::new(Engine::new(gateway.clone(), &config, event_bus.clone()));
        Self {
            config,
            engine,
            event_bus,
            gateway,
            broker_events,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn engine(&self) -> &Arc<Engine<G>> {
        &self.engine
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    /// Token that stops [`Daemon::run`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the daemon.
    ///
    /// This method blocks until shutdown is requested.
    pub async fn run(mut self) -> DaemonResult<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            environment = %self.config.environment,
            instrument = %self.config.trading.instrument,
            "Starting bracket daemon"
        );

        // 1. Adopt whatever the broker already holds
        self.sync_with_broker().await;

        // 2. Start API server
        let api_addr = self.start_api_server().await?;
        info!(%api_addr, "API server started");

        // 3. Subscribe to event bus
        let mut event_receiver = self.event_bus.subscribe();
        let mut broker_events = self.broker_events.take();
        let mut poll = tokio::time::interval(self.config.trading.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // 4. Main event loop
        info!(poll_interval_secs = self.config.trading.poll_interval.as_secs(), "Entering main event loop");
        loop {
            tokio::select! {
                _ = poll.tick() => {
                    match self.engine.poll_cycle().await {
                        Ok(report) => debug!(sync = ?report.sync, "Status poll complete"),
                        Err(e) => warn!(error = %e, "Status poll failed"),
                    }
                }

                Some(event) = recv_broker_event(&mut broker_events) => {
                    if let Err(e) = self.engine.handle_broker_event(&event).await {
                        error!(error = %e, "Error handling broker event");
                    }
                }

                Some(event_result) = event_receiver.recv() => {
                    match event_result {
                        Ok(event) => {
                            if let Err(e) = self.handle_event(event).await {
                                if matches!(e, DaemonError::Shutdown) {
                                    break;
                                }
                                error!(error = %e, "Error handling event");
                            }
                        }
                        Err(lag_msg) => {
                            warn!(%lag_msg, "Event receiver lagged");
                        }
                    }
                }

                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }

                // Handle shutdown signals
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        // 5. Graceful shutdown
        self.graceful_shutdown().await;
        Ok(())
    }

    /// Initial status poll and a forced watchdog cycle.
    async fn sync_with_broker(&self) {
        match self.engine.manager().poll_position().await {
            Ok(sync) => info!(?sync, "Initial broker sync"),
            Err(e) => warn!(error = %e, "Initial broker sync failed; the status poll will retry"),
        }
        if self.engine.ledger().has_position().await {
            let report = self.engine.reconcile_now().await;
            info!(converged = report.is_converged(), "Initial reconcile");
        }
    }

    /// Start the API server.
    async fn start_api_server(&self) -> DaemonResult<SocketAddr> {
        let state = Arc::new(ApiState {
            engine: self.engine.clone(),
        });

        let router = create_router(state);
        let addr = format!("{}:{}", self.config.api.host, self.config.api.port);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| DaemonError::Config(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| DaemonError::Config(format!("Failed to get local address: {}", e)))?;

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                error!(error = %e, "API server error");
            }
        });

        Ok(local_addr)
    }

    /// Handle an event from the event bus.
    async fn handle_event(&self, event: DaemonEvent) -> DaemonResult<()> {
        match event {
            DaemonEvent::Signal(signal) => {
                info!(side = %signal.side, price = %signal.entry_price, "Received signal");
                match self.engine.open_position(signal).await {
                    Ok(position_id) => info!(%position_id, "Signal executed"),
                    // Rejections were already published as events
                    Err(DaemonError::Rejected(_)) => {}
                    Err(e) => return Err(e),
                }
            }

            DaemonEvent::Broker(event) => {
                self.engine.handle_broker_event(&event).await?;
            }

            // Published by the engine itself
            DaemonEvent::Engine(_) => {}

            DaemonEvent::Shutdown => {
                info!("Shutdown event received");
                return Err(DaemonError::Shutdown);
            }
        }

        Ok(())
    }

    /// Graceful shutdown. Open positions stay protected by their broker
    /// orders; nothing is flattened.
    async fn graceful_shutdown(&self) {
        info!("Initiating graceful shutdown");
        self.shutdown.cancel();

        let status = self.engine.status().await;
        info!(
            open_position = ?status.ledger.position.map(|p| p.id),
            "Shutdown complete"
        );
    }
}

/// Next push event, or pending forever when the gateway has none.
async fn recv_broker_event(receiver: &mut Option<mpsc::UnboundedReceiver<BrokerEvent>>) -> Option<BrokerEvent> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Tests
// =============================================================================
