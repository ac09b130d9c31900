//! Reconciler (watchdog): drives the broker toward exactly one stop and one
//! target order per open position, sized to the position.
//!
//! # Cycle
//!
//! ```text
//! entry / stop-update held? ──yes──► defer
//!          │ no
//! acquire protective-placement ──fail──► defer
//!          │
//! watchdog cooldown elapsed? ──no──► defer   (skipped by reconcile_now)
//!          │
//!          ▼
//! for stop, target:
//!   tracked id listed?   ──yes──► cancel extra matches, resize if needed
//!          │ no
//!   clear tracked id
//!   matching orders:  1 ──► adopt (resize if needed)
//!                    >1 ──► keep newest, cancel the rest, adopt
//!                     0 ──► place at ledger price, verify, track if present
//! ```
//!
//! A kind that fails restores its tracked entry and leaves the other kind
//! alone. On a converged state a cycle lists orders and mutates nothing.

use std::sync::Arc;

use bracket_domain::{
    EngineEvent, Position, PositionId, Price, ProtectiveKind, ProtectiveOrder, RepairAction,
};
use bracket_exec::{
    BrokerGateway, BrokerOrder, ExecError, ExecResult, MutationCategory, MutationGate, OrderChange,
    OrderRequest, OrderVerifier, Throttle, Verification,
};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::event_bus::EventBus;
use crate::ledger::PositionLedger;

// =============================================================================
// Report
// =============================================================================

/// Why a cycle did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    NoPosition,
    EntryInFlight,
    StopUpdateInFlight,
    PlacementBusy,
    Cooldown,
}

/// What happened to one protective kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RepairOutcome {
    /// Tracked order present at the right size
    Satisfied { order_id: String },
    Resized { order_id: String, from: u32, to: u32 },
    Adopted { order_id: String },
    DuplicatesCleaned { kept_id: String, cancelled: Vec<String> },
    Placed { order_id: String },
    /// Placement sent but not confirmed; the next cycle enumerates again
    Unconfirmed { order_id: Option<String> },
    Failed { error: String },
}

impl RepairOutcome {
    /// Whether the broker was mutated.
    pub fn mutated(&self) -> bool {
        !matches!(
            self,
            RepairOutcome::Satisfied { .. } | RepairOutcome::Adopted { .. } | RepairOutcome::Failed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairStep {
    pub kind: ProtectiveKind,
    #[serde(flatten)]
    pub outcome: RepairOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconcileReport {
    Deferred { reason: DeferReason },
    Completed { position_id: PositionId, steps: Vec<RepairStep> },
}

impl ReconcileReport {
    pub fn is_deferred(&self) -> bool {
        matches!(self, ReconcileReport::Deferred { .. })
    }

    pub fn steps(&self) -> &[RepairStep] {
        match self {
            ReconcileReport::Completed { steps, .. } => steps,
            ReconcileReport::Deferred { .. } => &[],
        }
    }

    /// Both kinds satisfied without touching the broker.
    pub fn is_converged(&self) -> bool {
        matches!(self, ReconcileReport::Completed { .. })
            && self
                .steps()
                .iter()
                .all(|s| matches!(s.outcome, RepairOutcome::Satisfied { .. }))
    }
}

// =============================================================================
// Reconciler
// =============================================================================

pub struct Reconciler<G: BrokerGateway> {
    gateway: Arc<G>,
    ledger: Arc<PositionLedger>,
    gate: Arc<MutationGate>,
    verifier: Arc<OrderVerifier<G>>,
    event_bus: Arc<EventBus>,
}

impl<G: BrokerGateway> Reconciler<G> {
    pub fn new(
        gateway: Arc<G>,
        ledger: Arc<PositionLedger>,
        gate: Arc<MutationGate>,
        verifier: Arc<OrderVerifier<G>>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            gateway,
            ledger,
            gate,
            verifier,
            event_bus,
        }
    }

    /// Periodic cycle, subject to the watchdog cooldown.
    pub async fn run_cycle(&self) -> ReconcileReport {
        self.cycle(false).await
    }

    /// Cycle that ignores the watchdog cooldown. Locks still apply.
    pub async fn reconcile_now(&self) -> ReconcileReport {
        self.cycle(true).await
    }

    async fn cycle(&self, forced: bool) -> ReconcileReport {
        if !self.ledger.has_position().await {
            debug!("Reconcile skipped: no open position");
            return ReconcileReport::Deferred {
                reason: DeferReason::NoPosition,
            };
        }
        if self.gate.is_held(MutationCategory::Entry) {
            debug!("Reconcile deferred: entry in flight");
            return ReconcileReport::Deferred {
                reason: DeferReason::EntryInFlight,
            };
        }
        if self.gate.is_held(MutationCategory::StopUpdate) {
            debug!("Reconcile deferred: stop update in flight");
            return ReconcileReport::Deferred {
                reason: DeferReason::StopUpdateInFlight,
            };
        }
        let Some(_guard) = self.gate.try_enter(MutationCategory::ProtectivePlacement, "watchdog") else {
            warn!("Reconcile deferred: protective placement busy");
            return ReconcileReport::Deferred {
                reason: DeferReason::PlacementBusy,
            };
        };
        if !forced && !self.gate.try_throttle(Throttle::Watchdog) {
            debug!("Reconcile deferred: watchdog cooldown");
            return ReconcileReport::Deferred {
                reason: DeferReason::Cooldown,
            };
        }

        // Read under the lock: this is the state the cycle acts on
        let Some(position) = self.ledger.position().await else {
            return ReconcileReport::Deferred {
                reason: DeferReason::NoPosition,
            };
        };
        let market = match self.gateway.get_quote(&position.instrument.contract_id).await {
            Ok(quote) => Some(quote.price),
            Err(e) => {
                warn!(error = %e, "Quote unavailable, stops placed unclamped");
                None
            }
        };

        let mut steps = Vec::new();
        for kind in ProtectiveKind::ALL {
            let snapshot = self.ledger.tracked(kind).await;
            match self.reconcile_kind(&position, kind, market).await {
                Ok(outcomes) => steps.extend(outcomes.into_iter().map(|outcome| RepairStep { kind, outcome })),
                Err(e) => {
                    error!(position_id = %position.id, %kind, error = %e, "Reconcile failed for kind, restoring tracked order");
                    self.ledger.restore_tracked(position.id, kind, snapshot).await;
                    if e.is_irrecoverable() {
                        self.event_bus.emit(EngineEvent::ManualInterventionRequired {
                            position_id: Some(position.id),
                            reason: format!("{} repair rejected: {}", kind, e),
                            timestamp: Utc::now(),
                        });
                    }
                    steps.push(RepairStep {
                        kind,
                        outcome: RepairOutcome::Failed { error: e.to_string() },
                    });
                }
            }
        }

        let mutations = steps.iter().filter(|s| s.outcome.mutated()).count();
        if mutations == 0 {
            debug!(position_id = %position.id, "Reconcile: converged");
        } else {
            info!(position_id = %position.id, mutations, "Reconcile cycle repaired orders");
        }

        ReconcileReport::Completed {
            position_id: position.id,
            steps,
        }
    }

    async fn reconcile_kind(
        &self,
        position: &Position,
        kind: ProtectiveKind,
        market: Option<Price>,
    ) -> ExecResult<Vec<RepairOutcome>> {
        let instrument = &position.instrument.contract_id;
        let orders = self.gateway.list_open_orders(instrument).await?;

        let mut matching: Vec<BrokerOrder> = orders
            .iter()
            .filter(|o| o.matches(kind, instrument, position.exit_side()))
            .cloned()
            .collect();
        let mut outcomes = Vec::new();
        let mut stale_id = None;

        if let Some(tracked) = self.ledger.tracked(kind).await {
            if let Some(current) = orders.iter().find(|o| o.order_id == tracked.order_id).cloned() {
                matching.retain(|o| o.order_id != current.order_id);
                if !matching.is_empty() {
                    outcomes.push(self.cancel_duplicates(position, kind, &current.order_id, matching).await);
                }
                outcomes.push(self.ensure_size(position, kind, current).await?);
                return Ok(outcomes);
            }
            info!(position_id = %position.id, %kind, order_id = %tracked.order_id, "Tracked order no longer listed, clearing");
            self.ledger.untrack(position.id, kind).await;
            stale_id = Some(tracked.order_id);
        }

        if matching.is_empty() {
            outcomes.push(self.place(position, kind, market, stale_id).await?);
            return Ok(outcomes);
        }

        // Newest survives
        matching.sort_by_key(|o| o.created_at);
        let Some(kept) = matching.pop() else {
            return Ok(outcomes);
        };
        if !matching.is_empty() {
            outcomes.push(self.cancel_duplicates(position, kind, &kept.order_id, matching).await);
        }

        info!(position_id = %position.id, %kind, order_id = %kept.order_id, "Adopting untracked order");
        self.ledger.adopt(position.id, protective_from(kind, &kept, position)).await;
        self.event_bus.emit(EngineEvent::ProtectiveOrderRepaired {
            position_id: position.id,
            kind,
            old_id: stale_id,
            new_id: kept.order_id.clone(),
            action: RepairAction::Adopted,
            timestamp: Utc::now(),
        });
        outcomes.push(RepairOutcome::Adopted {
            order_id: kept.order_id.clone(),
        });
        outcomes.push(self.ensure_size(position, kind, kept).await?);
        Ok(outcomes)
    }

    /// Resize `order` in place when it does not cover the position.
    async fn ensure_size(&self, position: &Position, kind: ProtectiveKind, order: BrokerOrder) -> ExecResult<RepairOutcome> {
        let quantity = position.quantity.get();
        if order.size == quantity {
            self.ledger.adopt(position.id, protective_from(kind, &order, position)).await;
            return Ok(RepairOutcome::Satisfied {
                order_id: order.order_id,
            });
        }

        info!(position_id = %position.id, %kind, order_id = %order.order_id, from = order.size, to = quantity, "Resizing protective order");
        match self.gateway.modify_order(&order.order_id, &OrderChange::size(quantity)).await {
            Ok(()) => {}
            Err(ExecError::OrderNotFound(_)) => {
                warn!(order_id = %order.order_id, "Order vanished before resize");
                self.ledger.untrack(position.id, kind).await;
                return Ok(RepairOutcome::Unconfirmed { order_id: None });
            }
            Err(e) => return Err(e),
        }

        let instrument = &position.instrument.contract_id;
        match self
            .verifier
            .verify(instrument, &order.order_id, quantity, kind, self.verifier.default_attempts())
            .await?
        {
            Verification::Confirmed(listed) => {
                if listed.size != quantity {
                    warn!(order_id = %order.order_id, expected = quantity, listed = listed.size, "Resize not reflected yet; next cycle retries");
                }
                self.ledger.adopt(position.id, protective_from(kind, &listed, position)).await;
                self.event_bus.emit(EngineEvent::ProtectiveOrderResized {
                    position_id: position.id,
                    kind,
                    order_id: order.order_id.clone(),
                    from_size: order.size,
                    to_size: listed.size,
                    timestamp: Utc::now(),
                });
                Ok(RepairOutcome::Resized {
                    order_id: order.order_id,
                    from: order.size,
                    to: listed.size,
                })
            }
            Verification::NotFound => {
                warn!(order_id = %order.order_id, "Resized order not listed; next cycle re-enumerates");
                Ok(RepairOutcome::Unconfirmed {
                    order_id: Some(order.order_id),
                })
            }
        }
    }

    /// Cancel every order in `extras`. Failures stay for the next cycle.
    async fn cancel_duplicates(
        &self,
        position: &Position,
        kind: ProtectiveKind,
        kept_id: &str,
        extras: Vec<BrokerOrder>,
    ) -> RepairOutcome {
        let mut cancelled = Vec::new();
        for extra in extras {
            match self.gateway.cancel_order(&extra.order_id).await {
                Ok(()) | Err(ExecError::OrderNotFound(_)) => cancelled.push(extra.order_id),
                Err(e) => warn!(order_id = %extra.order_id, error = %e, "Duplicate cancel failed, retrying next cycle"),
            }
        }

        if !cancelled.is_empty() {
            warn!(position_id = %position.id, %kind, kept_id, ?cancelled, "Duplicate protective orders cancelled");
            self.event_bus.emit(EngineEvent::DuplicateOrdersCleaned {
                position_id: position.id,
                kind,
                kept_id: kept_id.to_string(),
                cancelled_ids: cancelled.clone(),
                timestamp: Utc::now(),
            });
        }
        RepairOutcome::DuplicatesCleaned {
            kept_id: kept_id.to_string(),
            cancelled,
        }
    }

    /// Place a missing order and track it only if the listing shows it.
    async fn place(
        &self,
        position: &Position,
        kind: ProtectiveKind,
        market: Option<Price>,
        stale_id: Option<String>,
    ) -> ExecResult<RepairOutcome> {
        let price = protective_price(position, kind, market)?;
        let quantity = position.quantity.get();
        let instrument = &position.instrument.contract_id;
        let request = OrderRequest::protective(kind, instrument.clone(), position.exit_side(), quantity, price);

        info!(position_id = %position.id, %kind, %price, size = quantity, "Placing missing protective order");
        let order_id = match self.gateway.place_order(&request).await {
            Ok(id) => id,
            Err(e) if e.is_transient() => {
                warn!(position_id = %position.id, %kind, error = %e, "Placement outcome unknown; next cycle enumerates");
                return Ok(RepairOutcome::Unconfirmed { order_id: None });
            }
            Err(e) => return Err(e),
        };

        let verification = match self
            .verifier
            .verify(instrument, &order_id, quantity, kind, self.verifier.default_attempts())
            .await
        {
            Ok(v) => v,
            Err(e) if e.is_transient() => {
                warn!(%order_id, error = %e, "Placement unverified; next cycle enumerates");
                return Ok(RepairOutcome::Unconfirmed {
                    order_id: Some(order_id),
                });
            }
            Err(e) => return Err(e),
        };

        let Some(listed) = verification.order() else {
            warn!(position_id = %position.id, %kind, %order_id, "Placed order not listed; not tracking");
            return Ok(RepairOutcome::Unconfirmed {
                order_id: Some(order_id),
            });
        };

        self.ledger.adopt(position.id, protective_from(kind, listed, position)).await;
        self.event_bus.emit(EngineEvent::ProtectiveOrderRepaired {
            position_id: position.id,
            kind,
            old_id: stale_id,
            new_id: order_id.clone(),
            action: RepairAction::Placed,
            timestamp: Utc::now(),
        });
        Ok(RepairOutcome::Placed { order_id })
    }
}

/// Ledger price for `kind`; stops are kept one tick clear of the market.
pub(crate) fn protective_price(position: &Position, kind: ProtectiveKind, market: Option<Price>) -> ExecResult<Price> {
    let price = position.protective_price(kind);
    match (kind, market) {
        (ProtectiveKind::Stop, Some(market)) => Ok(position.instrument.clamp_stop(position.side, price, market)?),
        _ => Ok(price),
    }
}

/// Ledger record for a listed broker order. Orders without a price keep
/// the ledger's intended price.
pub(crate) fn protective_from(kind: ProtectiveKind, order: &BrokerOrder, position: &Position) -> ProtectiveOrder {
    ProtectiveOrder {
        kind,
        order_id: order.order_id.clone(),
        side: order.side,
        size: order.size,
        price: order.price.unwrap_or(position.protective_price(kind)),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bracket_domain::{Contracts, Instrument, OrderSide, Side};
    use bracket_exec::{GateConfig, StubBroker, StubFailure, StubOp, VerifierConfig};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    const MGC: &str = "CON.F.US.MGC.Z25";

    struct Harness {
        broker: Arc<StubBroker>,
        ledger: Arc<PositionLedger>,
        gate: Arc<MutationGate>,
        reconciler: Reconciler<StubBroker>,
        position_id: PositionId,
    }

    fn p(value: rust_decimal::Decimal) -> Price {
        Price::new(value).unwrap()
    }

    async fn harness(quantity: u32, gate_config: GateConfig) -> Harness {
        let instrument = Instrument::new(MGC, dec!(0.1), dec!(1)).unwrap();
        let broker = Arc::new(StubBroker::new(instrument.clone(), p(dec!(2650))));
        broker.set_position(Side::Long, quantity, p(dec!(2650)));

        let ledger = Arc::new(PositionLedger::new());
        let position = Position::open(
            instrument,
            Side::Long,
            Contracts::new(quantity).unwrap(),
            p(dec!(2650)),
            p(dec!(2645)),
            p(dec!(2660)),
        );
        let position_id = position.id;
        ledger.open(position).await.unwrap();

        let gate = MutationGate::new(gate_config);
        let verifier = Arc::new(OrderVerifier::new(
            broker.clone(),
            VerifierConfig {
                delay: Duration::from_millis(1),
                max_attempts: 3,
            },
        ));
        let reconciler = Reconciler::new(
            broker.clone(),
            ledger.clone(),
            gate.clone(),
            verifier,
            Arc::new(EventBus::new(100)),
        );
        Harness {
            broker,
            ledger,
            gate,
            reconciler,
            position_id,
        }
    }

    #[tokio::test]
    async fn test_places_missing_orders_then_converges() {
        let h = harness(4, GateConfig::without_cooldowns()).await;

        let report = h.reconciler.run_cycle().await;
        assert_eq!(report.steps().len(), 2);
        assert!(report
            .steps()
            .iter()
            .all(|s| matches!(s.outcome, RepairOutcome::Placed { .. })));
        assert_eq!(h.broker.orders_of(ProtectiveKind::Stop).len(), 1);
        assert_eq!(h.broker.orders_of(ProtectiveKind::Target).len(), 1);

        let placed_before = h.broker.calls(StubOp::Place);
        let report = h.reconciler.run_cycle().await;
        assert!(report.is_converged());
        assert_eq!(h.broker.calls(StubOp::Place), placed_before);
        assert_eq!(h.broker.calls(StubOp::Modify), 0);
        assert_eq!(h.broker.calls(StubOp::Cancel), 0);
    }

    #[tokio::test]
    async fn test_defers_while_stop_update_held() {
        let h = harness(4, GateConfig::without_cooldowns()).await;
        let _guard = h.gate.try_enter(MutationCategory::StopUpdate, "trailing").unwrap();

        let report = h.reconciler.run_cycle().await;
        assert_eq!(
            report,
            ReconcileReport::Deferred {
                reason: DeferReason::StopUpdateInFlight
            }
        );
        assert_eq!(h.broker.calls(StubOp::ListOrders), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_cooldown_and_forced_cycle() {
        let h = harness(4, GateConfig::default()).await;

        assert!(!h.reconciler.run_cycle().await.is_deferred());
        assert_eq!(
            h.reconciler.run_cycle().await,
            ReconcileReport::Deferred {
                reason: DeferReason::Cooldown
            }
        );
        assert!(h.reconciler.reconcile_now().await.is_converged());
    }

    #[tokio::test]
    async fn test_stale_tracked_id_is_replaced() {
        let h = harness(4, GateConfig::without_cooldowns()).await;
        h.reconciler.run_cycle().await;
        let old = h.ledger.tracked(ProtectiveKind::Target).await.unwrap();

        h.broker.remove_order(&old.order_id);
        let report = h.reconciler.run_cycle().await;

        let new = h.ledger.tracked(ProtectiveKind::Target).await.unwrap();
        assert_ne!(new.order_id, old.order_id);
        assert!(report
            .steps()
            .iter()
            .any(|s| s.kind == ProtectiveKind::Target && matches!(s.outcome, RepairOutcome::Placed { .. })));
    }

    #[tokio::test]
    async fn test_failed_kind_restores_snapshot_and_spares_other_kind() {
        let h = harness(4, GateConfig::without_cooldowns()).await;
        let stop_id = h
            .broker
            .inject_order(ProtectiveKind::Stop, OrderSide::Sell, 4, p(dec!(2645)));
        h.ledger
            .adopt(
                h.position_id,
                ProtectiveOrder {
                    kind: ProtectiveKind::Stop,
                    order_id: stop_id.clone(),
                    side: OrderSide::Sell,
                    size: 4,
                    price: p(dec!(2645)),
                },
            )
            .await;

        // Stop listing fails; target listing and placement succeed
        h.broker.fail_next(StubOp::ListOrders, StubFailure::Transient);
        let report = h.reconciler.run_cycle().await;

        assert!(matches!(
            report.steps()[0],
            RepairStep {
                kind: ProtectiveKind::Stop,
                outcome: RepairOutcome::Failed { .. }
            }
        ));
        assert_eq!(h.ledger.tracked(ProtectiveKind::Stop).await.unwrap().order_id, stop_id);
        assert!(h.ledger.tracked(ProtectiveKind::Target).await.is_some());
    }

    #[tokio::test]
    async fn test_unverified_placement_is_not_tracked_and_adopted_later() {
        let h = harness(2, GateConfig::without_cooldowns()).await;
        h.broker.set_listing_lag(10);

        let report = h.reconciler.run_cycle().await;
        assert!(report
            .steps()
            .iter()
            .all(|s| matches!(s.outcome, RepairOutcome::Unconfirmed { .. })));
        assert!(h.ledger.tracked(ProtectiveKind::Stop).await.is_none());

        // Late orders surface as duplicates of the replacements and get cleaned
        h.broker.set_listing_lag(0);
        for _ in 0..8 {
            h.reconciler.run_cycle().await;
        }
        assert!(h.reconciler.run_cycle().await.is_converged());
        assert_eq!(h.broker.orders_of(ProtectiveKind::Stop).len(), 1);
        assert_eq!(h.broker.orders_of(ProtectiveKind::Target).len(), 1);
    }
}
