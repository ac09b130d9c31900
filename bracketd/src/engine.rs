//! Engine: one position's worth of components sharing a ledger, a gate and
//! a broker.
//!
//! ```text
//!                ┌──────────────── PositionLedger ───────────────┐
//!                │                                               │
//! signal ──► PositionManager     Reconciler      RiskStateMachine ◄── quotes
//!                │                   │                  │
//!                └─────────── MutationGate ─────────────┘
//!                                    │
//!                              BrokerGateway
//! ```

use std::sync::Arc;

use bracket_domain::{PositionId, TradeSignal};
use bracket_engine::RiskEngine;
use bracket_exec::{BrokerEvent, BrokerGateway, GateSnapshot, MutationGate, OrderVerifier};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::circuit_breaker::{BreakerStatus, CircuitBreaker};
use crate::config::Config;
use crate::error::DaemonResult;
use crate::event_bus::EventBus;
use crate::ledger::{LedgerSnapshot, PositionLedger};
use crate::position_manager::{PositionManager, PositionSync};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::risk_state::{RiskOutcome, RiskStateMachine};

/// Result of one status poll.
#[derive(Debug, Clone, Serialize)]
pub struct PollReport {
    pub sync: PositionSync,
    pub reconcile: ReconcileReport,
}

/// Everything `/status` shows.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub ledger: LedgerSnapshot,
    pub breaker: BreakerStatus,
    pub gate: GateSnapshot,
}

pub struct Engine<G: BrokerGateway> {
    gateway: Arc<G>,
    ledger: Arc<PositionLedger>,
    gate: Arc<MutationGate>,
    breaker: Arc<CircuitBreaker>,
    manager: PositionManager<G>,
    reconciler: Reconciler<G>,
    risk: RiskStateMachine<G>,
    contract_id: String,
}

impl<G: BrokerGateway> Engine<G> {
    pub fn new(gateway: Arc<G>, config: &Config, event_bus: Arc<EventBus>) -> Self {
        let ledger = Arc::new(PositionLedger::new());
        let gate = MutationGate::new(config.gate.clone());
        let verifier = Arc::new(OrderVerifier::new(gateway.clone(), config.verifier.clone()));
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));

        let manager = PositionManager::new(
            gateway.clone(),
            ledger.clone(),
            gate.clone(),
            verifier.clone(),
            breaker.clone(),
            event_bus.clone(),
            config.trading.clone(),
        );
        let reconciler = Reconciler::new(
            gateway.clone(),
            ledger.clone(),
            gate.clone(),
            verifier.clone(),
            event_bus.clone(),
        );
        let risk = RiskStateMachine::new(
            gateway.clone(),
            ledger.clone(),
            gate.clone(),
            verifier,
            event_bus,
            RiskEngine::new(config.risk.clone()),
        );

        Self {
            gateway,
            ledger,
            gate,
            breaker,
            manager,
            reconciler,
            risk,
            contract_id: config.trading.instrument.contract_id.clone(),
        }
    }

    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.ledger
    }

    pub fn gate(&self) -> &Arc<MutationGate> {
        &self.gate
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn reconciler(&self) -> &Reconciler<G> {
        &self.reconciler
    }

    pub fn risk(&self) -> &RiskStateMachine<G> {
        &self.risk
    }

    pub fn manager(&self) -> &PositionManager<G> {
        &self.manager
    }

    pub async fn open_position(&self, signal: TradeSignal) -> DaemonResult<PositionId> {
        self.manager.open_position(signal).await
    }

    /// Route a broker push event. Quotes are checked against the daily loss
    /// limit, then drive the risk state machine.
    pub async fn handle_broker_event(&self, event: &BrokerEvent) -> DaemonResult<()> {
        match event {
            BrokerEvent::Quote(quote) if quote.instrument == self.contract_id => {
                if self.manager.enforce_daily_loss(quote.price).await?.is_none() {
                    self.risk.on_quote(quote.price).await;
                }
            }
            BrokerEvent::Quote(_) => {}
            other => {
                self.manager.handle_broker_event(other).await?;
            }
        }
        Ok(())
    }

    /// Status poll: sync the ledger with the broker position, run the
    /// watchdog, then check the daily loss limit and evaluate risk at the
    /// polled quote.
    pub async fn poll_cycle(&self) -> DaemonResult<PollReport> {
        let sync = self.manager.poll_position().await?;
        let reconcile = self.reconciler.run_cycle().await;

        if self.ledger.has_position().await {
            match self.gateway.get_quote(&self.contract_id).await {
                Ok(quote) => {
                    if let Some(position_id) = self.manager.enforce_daily_loss(quote.price).await? {
                        warn!(%position_id, "Position flattened on the daily loss limit");
                        return Ok(PollReport { sync, reconcile });
                    }
                    let outcomes = self.risk.on_quote(quote.price).await;
                    let applied = outcomes
                        .iter()
                        .filter(|o| matches!(o, RiskOutcome::Applied { .. }))
                        .count();
                    debug!(price = %quote.price, applied, "Polled quote evaluated");
                }
                Err(e) => warn!(error = %e, "Quote poll failed"),
            }
        }

        Ok(PollReport { sync, reconcile })
    }

    pub async fn reconcile_now(&self) -> ReconcileReport {
        self.reconciler.reconcile_now().await
    }

    pub async fn panic_close(&self) -> DaemonResult<Option<PositionId>> {
        self.manager.panic_close().await
    }

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            ledger: self.ledger.snapshot().await,
            breaker: self.breaker.status(Utc::now()),
            gate: self.gate.snapshot(),
        }
    }
}
