//! Risk state machine: applies break-even, partial exit and trailing moves
//! decided by [`RiskEngine`] to the broker's protective orders.
//!
//! Every broker mutation runs under the mutation gate and re-reads the
//! position while the category is held. Failures are logged and left for
//! the reconciler; irrecoverable rejections close the phase and ask for a
//! human.
//!
//! ```text
//! quote ─► observe extreme ─► RiskEngine::evaluate
//!                                  │
//!        ┌─────────────────────────┼──────────────────────────┐
//!        ▼                         ▼                          ▼
//!   partial exit               break-even                 trailing
//!   [stop-update]              [stop-update]          can_enter(stop-update)
//!   market reduce              modify stop → entry    trailing throttle
//!   resize (+ lock) stop       verify price           [stop-update]
//!   release                                           modify stop, verify
//!   [protective-placement]
//!   cancel target, verify gone
//!   place target, verify
//! ```

use std::sync::Arc;

use bracket_domain::{
    EngineEvent, Position, PositionId, Price, ProtectiveKind, RepairAction, RiskPhase,
};
use bracket_engine::{RiskAction, RiskEngine};
use bracket_exec::{
    Absence, BrokerGateway, ExecError, ExecResult, MutationCategory, MutationGate, OrderChange,
    OrderRequest, OrderVerifier, Throttle, Verification,
};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::event_bus::EventBus;
use crate::ledger::PositionLedger;
use crate::reconciler::protective_from;

/// Bounded cancel attempts for the target during a partial exit.
const TARGET_CANCEL_ATTEMPTS: u32 = 3;

/// Result of one risk action.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskOutcome {
    /// The broker was changed and the change verified
    Applied { action: &'static str },
    /// Phase closed without touching the broker
    Completed { phase: RiskPhase, reason: &'static str },
    /// Lock or cooldown unavailable; tried again on a later quote
    Deferred { action: &'static str, reason: &'static str },
    /// Condition no longer held once re-read under the lock
    Skipped { action: &'static str },
    Failed { action: &'static str, error: String },
}

impl RiskOutcome {
    fn failed(action: &'static str, error: impl ToString) -> Self {
        RiskOutcome::Failed {
            action,
            error: error.to_string(),
        }
    }
}

pub struct RiskStateMachine<G: BrokerGateway> {
    gateway: Arc<G>,
    ledger: Arc<PositionLedger>,
    gate: Arc<MutationGate>,
    verifier: Arc<OrderVerifier<G>>,
    event_bus: Arc<EventBus>,
    engine: RiskEngine,
}

impl<G: BrokerGateway> RiskStateMachine<G> {
    pub fn new(
        gateway: Arc<G>,
        ledger: Arc<PositionLedger>,
        gate: Arc<MutationGate>,
        verifier: Arc<OrderVerifier<G>>,
        event_bus: Arc<EventBus>,
        engine: RiskEngine,
    ) -> Self {
        Self {
            gateway,
            ledger,
            gate,
            verifier,
            event_bus,
            engine,
        }
    }

    pub fn engine(&self) -> &RiskEngine {
        &self.engine
    }

    /// Feed a price and run every transition that is due.
    pub async fn on_quote(&self, price: Price) -> Vec<RiskOutcome> {
        let Some(position) = self.ledger.position().await else {
            return Vec::new();
        };
        self.ledger.observe_price(position.id, price).await;
        let Some(position) = self.ledger.position_if(position.id).await else {
            return Vec::new();
        };

        let evaluation = self.engine.evaluate(&position, price);
        let mut outcomes = Vec::with_capacity(evaluation.actions.len());
        for action in evaluation.actions {
            let outcome = match action {
                RiskAction::CompletePhase { phase, reason } => {
                    if self.ledger.complete_phase(position.id, phase).await {
                        info!(position_id = %position.id, %phase, reason, "Risk phase completed without broker change");
                    }
                    RiskOutcome::Completed { phase, reason }
                }
                RiskAction::TakePartial { .. } => self.partial_exit(position.id, price).await,
                RiskAction::MoveStopToBreakEven { .. } => self.break_even(position.id, price).await,
                RiskAction::TrailStop { .. } => self.trail(position.id, price).await,
            };
            match &outcome {
                RiskOutcome::Deferred { action, reason } => {
                    debug!(position_id = %position.id, action, reason, "Risk action deferred")
                }
                RiskOutcome::Failed { action, error } => {
                    warn!(position_id = %position.id, action, error, "Risk action failed; reconciler will repair")
                }
                _ => {}
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    // =========================================================================
    // Break-even
    // =========================================================================

    async fn break_even(&self, id: PositionId, price: Price) -> RiskOutcome {
        const ACTION: &str = "break_even";
        let Some(_guard) = self.gate.try_enter(MutationCategory::StopUpdate, ACTION) else {
            return RiskOutcome::Deferred {
                action: ACTION,
                reason: "stop-update unavailable",
            };
        };
        let Some(position) = self.ledger.position_if(id).await else {
            return RiskOutcome::Skipped { action: ACTION };
        };

        let stop_price = match self.engine.break_even(&position, price) {
            Some(RiskAction::MoveStopToBreakEven { stop_price }) => stop_price,
            Some(RiskAction::CompletePhase { phase, reason }) => {
                self.ledger.complete_phase(id, phase).await;
                return RiskOutcome::Completed { phase, reason };
            }
            _ => return RiskOutcome::Skipped { action: ACTION },
        };

        match self.move_stop(&position, stop_price, price).await {
            Ok(Some(applied)) => {
                self.ledger.complete_phase(id, RiskPhase::BreakEven).await;
                self.resize_target(id).await;
                info!(position_id = %id, stop_price = %applied, "Break-even applied");
                self.event_bus.emit(EngineEvent::BreakEvenApplied {
                    position_id: id,
                    stop_price: applied,
                    timestamp: Utc::now(),
                });
                RiskOutcome::Applied { action: ACTION }
            }
            Ok(None) => RiskOutcome::Deferred {
                action: ACTION,
                reason: "stop not confirmed",
            },
            Err(e) => {
                if e.is_irrecoverable() {
                    self.manual_intervention(id, Some(RiskPhase::BreakEven), ACTION, &e).await;
                }
                RiskOutcome::failed(ACTION, e)
            }
        }
    }

    // =========================================================================
    // Partial exit
    // =========================================================================

    async fn partial_exit(&self, id: PositionId, price: Price) -> RiskOutcome {
        const ACTION: &str = "partial_exit";
        let Some(guard) = self.gate.try_enter(MutationCategory::StopUpdate, ACTION) else {
            return RiskOutcome::Deferred {
                action: ACTION,
                reason: "stop-update unavailable",
            };
        };
        let Some(position) = self.ledger.position_if(id).await else {
            return RiskOutcome::Skipped { action: ACTION };
        };

        let (exit_size, remaining, locked_stop) = match self.engine.partial_exit(&position, price) {
            Some(RiskAction::TakePartial {
                exit_size,
                remaining,
                locked_stop,
            }) => (exit_size, remaining, locked_stop),
            Some(RiskAction::CompletePhase { phase, reason }) => {
                self.ledger.complete_phase(id, phase).await;
                return RiskOutcome::Completed { phase, reason };
            }
            _ => return RiskOutcome::Skipped { action: ACTION },
        };

        // Closed before the market order so a lost response never exits twice
        self.ledger.complete_phase(id, RiskPhase::PartialExit).await;

        let instrument = position.instrument.contract_id.clone();
        info!(position_id = %id, exit_size, remaining = %remaining, "Partial exit: reducing at market");
        let request = OrderRequest::market(instrument.clone(), position.exit_side(), exit_size);
        if let Err(e) = self.gateway.place_order(&request).await {
            if e.is_irrecoverable() {
                self.manual_intervention(id, None, ACTION, &e).await;
            }
            return RiskOutcome::failed(ACTION, e);
        }

        self.ledger.set_quantity(id, remaining).await;
        self.event_bus.emit(EngineEvent::PartialExitApplied {
            position_id: id,
            filled_size: exit_size,
            remaining_size: remaining.get(),
            timestamp: Utc::now(),
        });

        // Stop: resize in place, tightened to the lock when that is better
        let Some(position) = self.ledger.position_if(id).await else {
            return RiskOutcome::Applied { action: ACTION };
        };
        let stop_price = locked_stop.unwrap_or(position.stop_price);
        if let Err(e) = self.move_stop(&position, stop_price, price).await {
            warn!(position_id = %id, error = %e, "Stop resize after partial failed");
            if e.is_irrecoverable() {
                self.manual_intervention(id, None, ACTION, &e).await;
            }
        }
        drop(guard);

        // Target: cancel, confirm gone, then place at the remaining size
        let Some(_placement) = self.gate.try_enter(MutationCategory::ProtectivePlacement, ACTION) else {
            warn!(position_id = %id, "Target replacement deferred to reconciler");
            return RiskOutcome::Applied { action: ACTION };
        };
        if let Err(e) = self.replace_target(id).await {
            warn!(position_id = %id, error = %e, "Target replacement failed; reconciler will repair");
            if e.is_irrecoverable() {
                self.manual_intervention(id, None, ACTION, &e).await;
            }
        }
        RiskOutcome::Applied { action: ACTION }
    }

    async fn replace_target(&self, id: PositionId) -> ExecResult<()> {
        let Some(position) = self.ledger.position_if(id).await else {
            return Ok(());
        };
        let instrument = position.instrument.contract_id.clone();
        let old = self.ledger.tracked(ProtectiveKind::Target).await;

        if let Some(old) = &old {
            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.gateway.cancel_order(&old.order_id).await {
                    Ok(()) | Err(ExecError::OrderNotFound(_)) => break,
                    Err(e) if e.is_transient() && attempt < TARGET_CANCEL_ATTEMPTS => {
                        warn!(order_id = %old.order_id, attempt, error = %e, "Target cancel failed, retrying");
                    }
                    Err(e) => return Err(e),
                }
            }

            match self
                .verifier
                .verify_absent(&instrument, &old.order_id, self.verifier.default_attempts())
                .await?
            {
                Absence::Gone => {
                    self.ledger.untrack(id, ProtectiveKind::Target).await;
                }
                Absence::StillPresent => {
                    warn!(order_id = %old.order_id, "Old target still listed; not placing a second one");
                    return Ok(());
                }
            }
        }

        let quantity = position.quantity.get();
        let request = OrderRequest::protective(
            ProtectiveKind::Target,
            instrument.clone(),
            position.exit_side(),
            quantity,
            position.target_price,
        );
        let new_id = self.gateway.place_order(&request).await?;
        let verification = self
            .verifier
            .verify(&instrument, &new_id, quantity, ProtectiveKind::Target, self.verifier.default_attempts())
            .await?;
        let Some(listed) = verification.order() else {
            warn!(order_id = %new_id, "Replacement target not listed; reconciler will adopt or place");
            return Ok(());
        };

        self.ledger
            .adopt(id, protective_from(ProtectiveKind::Target, listed, &position))
            .await;
        self.event_bus.emit(EngineEvent::ProtectiveOrderRepaired {
            position_id: id,
            kind: ProtectiveKind::Target,
            old_id: old.map(|o| o.order_id),
            new_id,
            action: RepairAction::Placed,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    // =========================================================================
    // Trailing
    // =========================================================================

    async fn trail(&self, id: PositionId, price: Price) -> RiskOutcome {
        const ACTION: &str = "trailing";
        if !self.gate.can_enter(MutationCategory::StopUpdate) {
            debug!(
                position_id = %id,
                held = self.gate.is_held(MutationCategory::StopUpdate),
                cooldown_ms = self.gate.cooldown_remaining(MutationCategory::StopUpdate).as_millis() as u64,
                "Trailing waits for stop-update"
            );
            return RiskOutcome::Deferred {
                action: ACTION,
                reason: "stop-update held or cooling down",
            };
        }
        if !self.gate.try_throttle(Throttle::Trailing) {
            return RiskOutcome::Deferred {
                action: ACTION,
                reason: "trailing cooldown",
            };
        }
        let Some(_guard) = self.gate.try_enter(MutationCategory::StopUpdate, ACTION) else {
            return RiskOutcome::Deferred {
                action: ACTION,
                reason: "stop-update unavailable",
            };
        };
        let Some(position) = self.ledger.position_if(id).await else {
            return RiskOutcome::Skipped { action: ACTION };
        };
        let Some(RiskAction::TrailStop { new_stop }) = self.engine.trailing(&position, price) else {
            return RiskOutcome::Skipped { action: ACTION };
        };

        let previous_stop = position.stop_price;
        match self.move_stop(&position, new_stop, price).await {
            Ok(Some(applied)) => {
                self.ledger.record_trail(id, applied).await;
                info!(position_id = %id, from = %previous_stop, to = %applied, "Trailing stop updated");
                self.event_bus.emit(EngineEvent::TrailingStopUpdated {
                    position_id: id,
                    previous_stop,
                    new_stop: applied,
                    timestamp: Utc::now(),
                });
                RiskOutcome::Applied { action: ACTION }
            }
            Ok(None) => RiskOutcome::Skipped { action: ACTION },
            Err(e) => {
                if e.is_irrecoverable() {
                    self.manual_intervention(id, None, ACTION, &e).await;
                }
                RiskOutcome::failed(ACTION, e)
            }
        }
    }

    // =========================================================================
    // Shared
    // =========================================================================

    /// Modify the tracked stop to `target_price` and the current quantity in
    /// one call. Never loosens the stop. Returns the verified price, or
    /// `None` when nothing was confirmed.
    async fn move_stop(&self, position: &Position, target_price: Price, market: Price) -> ExecResult<Option<Price>> {
        let Some(tracked) = self.ledger.tracked(ProtectiveKind::Stop).await else {
            warn!(position_id = %position.id, "No tracked stop to move");
            return Ok(None);
        };

        let clamped = position.instrument.clamp_stop(position.side, target_price, market)?;
        let tighter = position.side.is_more_favorable_stop(clamped, position.stop_price);
        let quantity = position.quantity.get();

        let mut change = if tighter { OrderChange::price(clamped) } else { OrderChange::default() };
        if tracked.size != quantity {
            change = change.with_size(quantity);
        }
        if change.is_empty() {
            return Ok(None);
        }

        match self.gateway.modify_order(&tracked.order_id, &change).await {
            Ok(()) => {}
            Err(ExecError::OrderNotFound(_)) => {
                warn!(order_id = %tracked.order_id, "Stop vanished before modify");
                self.ledger.untrack(position.id, ProtectiveKind::Stop).await;
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let verification = self
            .verifier
            .verify(
                &position.instrument.contract_id,
                &tracked.order_id,
                quantity,
                ProtectiveKind::Stop,
                self.verifier.default_attempts(),
            )
            .await?;
        let listed = match &verification {
            Verification::Confirmed(order) => order,
            Verification::NotFound => {
                warn!(order_id = %tracked.order_id, "Modified stop not listed");
                return Ok(None);
            }
        };

        self.ledger
            .adopt(position.id, protective_from(ProtectiveKind::Stop, listed, position))
            .await;
        match listed.price {
            Some(listed_price) if tighter && listed_price != clamped => {
                warn!(order_id = %tracked.order_id, expected = %clamped, listed = %listed_price, "Stop price not applied");
                Ok(None)
            }
            Some(listed_price) if tighter => Ok(Some(listed_price)),
            _ => Ok(None),
        }
    }

    /// Bring the tracked target to the current quantity when it changed
    /// underneath a stop move. Failures are left to the reconciler.
    async fn resize_target(&self, id: PositionId) {
        let Some(position) = self.ledger.position_if(id).await else {
            return;
        };
        let Some(target) = self.ledger.tracked(ProtectiveKind::Target).await else {
            return;
        };
        let quantity = position.quantity.get();
        if target.size == quantity {
            return;
        }

        if let Err(e) = self.gateway.modify_order(&target.order_id, &OrderChange::size(quantity)).await {
            warn!(position_id = %id, order_id = %target.order_id, error = %e, "Target resize failed; reconciler will repair");
            return;
        }
        let verification = match self
            .verifier
            .verify(
                &position.instrument.contract_id,
                &target.order_id,
                quantity,
                ProtectiveKind::Target,
                self.verifier.default_attempts(),
            )
            .await
        {
            Ok(verification) => verification,
            Err(e) => {
                warn!(position_id = %id, order_id = %target.order_id, error = %e, "Target resize unverified");
                return;
            }
        };
        let Some(listed) = verification.order() else {
            return;
        };

        self.ledger
            .adopt(id, protective_from(ProtectiveKind::Target, listed, &position))
            .await;
        info!(position_id = %id, order_id = %target.order_id, from = target.size, to = listed.size, "Target resized");
        self.event_bus.emit(EngineEvent::ProtectiveOrderResized {
            position_id: id,
            kind: ProtectiveKind::Target,
            order_id: target.order_id,
            from_size: target.size,
            to_size: listed.size,
            timestamp: Utc::now(),
        });
    }

    async fn manual_intervention(&self, id: PositionId, phase: Option<RiskPhase>, action: &str, e: &ExecError) {
        if let Some(phase) = phase {
            self.ledger.complete_phase(id, phase).await;
        }
        error!(position_id = %id, action, error = %e, "Broker rejected risk action");
        self.event_bus.emit(EngineEvent::ManualInterventionRequired {
            position_id: Some(id),
            reason: format!("{} rejected: {}", action, e),
            timestamp: Utc::now(),
        });
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bracket_domain::{Contracts, Instrument, OrderSide, ProtectiveOrder, Side};
    use bracket_engine::RiskSettings;
    use bracket_exec::{GateConfig, StubBroker, StubFailure, StubOp, VerifierConfig};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    const MGC: &str = "CON.F.US.MGC.Z25";

    fn p(value: rust_decimal::Decimal) -> Price {
        Price::new(value).unwrap()
    }

    struct Harness {
        broker: Arc<StubBroker>,
        ledger: Arc<PositionLedger>,
        bus: Arc<EventBus>,
        risk: RiskStateMachine<StubBroker>,
        id: PositionId,
    }

    /// Long 8 @ 2650, stop 2645 (1R = 5.0), target 2660, both tracked.
    async fn harness(settings: RiskSettings) -> Harness {
        let instrument = Instrument::new(MGC, dec!(0.1), dec!(1)).unwrap();
        let broker = Arc::new(StubBroker::new(instrument.clone(), p(dec!(2650))));
        broker.set_position(Side::Long, 8, p(dec!(2650)));

        let ledger = Arc::new(PositionLedger::new());
        let position = Position::open(
            instrument,
            Side::Long,
            Contracts::new(8).unwrap(),
            p(dec!(2650)),
            p(dec!(2645)),
            p(dec!(2660)),
        );
        let id = position.id;
        ledger.open(position).await.unwrap();

        for (kind, price) in [(ProtectiveKind::Stop, dec!(2645)), (ProtectiveKind::Target, dec!(2660))] {
            let order_id = broker.inject_order(kind, OrderSide::Sell, 8, p(price));
            ledger
                .adopt(
                    id,
                    ProtectiveOrder {
                        kind,
                        order_id,
                        side: OrderSide::Sell,
                        size: 8,
                        price: p(price),
                    },
                )
                .await;
        }

        let gate = MutationGate::new(GateConfig::without_cooldowns());
        let verifier = Arc::new(OrderVerifier::new(
            broker.clone(),
            VerifierConfig {
                delay: Duration::from_millis(1),
                max_attempts: 3,
            },
        ));
        let bus = Arc::new(EventBus::new(100));
        let risk = RiskStateMachine::new(
            broker.clone(),
            ledger.clone(),
            gate,
            verifier,
            bus.clone(),
            RiskEngine::new(settings),
        );
        Harness {
            broker,
            ledger,
            bus,
            risk,
            id,
        }
    }

    fn only_break_even() -> RiskSettings {
        RiskSettings {
            partial_exit_enabled: false,
            trailing_enabled: false,
            early_break_even_ticks: None,
            ..RiskSettings::default()
        }
    }

    #[tokio::test]
    async fn test_break_even_moves_stop_to_entry_once() {
        let h = harness(only_break_even()).await;
        let mut events = h.bus.subscribe();

        let outcomes = h.risk.on_quote(p(dec!(2655))).await;
        assert_eq!(outcomes, vec![RiskOutcome::Applied { action: "break_even" }]);

        let stop = h.broker.orders_of(ProtectiveKind::Stop);
        assert_eq!(stop.len(), 1);
        assert_eq!(stop[0].price, Some(p(dec!(2650))));
        let position = h.ledger.position().await.unwrap();
        assert_eq!(position.stop_price, p(dec!(2650)));
        assert!(position.phases.is_complete(RiskPhase::BreakEven));
        assert!(events
            .drain_engine_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::BreakEvenApplied { .. })));

        assert!(h.risk.on_quote(p(dec!(2656))).await.is_empty());
        assert_eq!(h.broker.calls(StubOp::Modify), 1);
    }

    #[tokio::test]
    async fn test_break_even_resizes_both_orders_after_quantity_change() {
        let h = harness(only_break_even()).await;
        h.ledger.set_quantity(h.id, Contracts::new(4).unwrap()).await;

        let outcomes = h.risk.on_quote(p(dec!(2655))).await;
        assert_eq!(outcomes, vec![RiskOutcome::Applied { action: "break_even" }]);

        let stops = h.broker.orders_of(ProtectiveKind::Stop);
        assert_eq!(stops[0].size, 4);
        assert_eq!(stops[0].price, Some(p(dec!(2650))));
        assert_eq!(h.broker.orders_of(ProtectiveKind::Target)[0].size, 4);
        assert_eq!(h.ledger.tracked(ProtectiveKind::Target).await.unwrap().size, 4);
        // One combined stop modify, one target resize
        assert_eq!(h.broker.calls(StubOp::Modify), 2);
    }

    #[tokio::test]
    async fn test_break_even_below_trigger_does_nothing() {
        let h = harness(only_break_even()).await;
        assert!(h.risk.on_quote(p(dec!(2652))).await.is_empty());
        assert_eq!(h.broker.calls(StubOp::Modify), 0);
    }

    #[tokio::test]
    async fn test_rejected_break_even_requests_manual_intervention() {
        let h = harness(only_break_even()).await;
        let mut events = h.bus.subscribe();
        h.broker.fail_next(StubOp::Modify, StubFailure::Rejected);

        let outcomes = h.risk.on_quote(p(dec!(2655))).await;
        assert!(matches!(outcomes[0], RiskOutcome::Failed { action: "break_even", .. }));
        let position = h.ledger.position().await.unwrap();
        assert!(position.phases.is_complete(RiskPhase::BreakEven));
        assert_eq!(position.stop_price, p(dec!(2645)));
        assert!(events
            .drain_engine_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::ManualInterventionRequired { .. })));
    }

    #[tokio::test]
    async fn test_transient_break_even_failure_retries_on_next_quote() {
        let h = harness(only_break_even()).await;
        h.broker.fail_next(StubOp::Modify, StubFailure::Transient);

        let outcomes = h.risk.on_quote(p(dec!(2655))).await;
        assert!(matches!(outcomes[0], RiskOutcome::Failed { .. }));
        assert!(!h.ledger.position().await.unwrap().phases.is_complete(RiskPhase::BreakEven));

        let outcomes = h.risk.on_quote(p(dec!(2655))).await;
        assert_eq!(outcomes, vec![RiskOutcome::Applied { action: "break_even" }]);
    }

    #[tokio::test]
    async fn test_partial_exit_resizes_stop_and_replaces_target() {
        let h = harness(RiskSettings {
            break_even_enabled: false,
            trailing_enabled: false,
            early_break_even_ticks: None,
            ..RiskSettings::default()
        })
        .await;
        let old_target = h.ledger.tracked(ProtectiveKind::Target).await.unwrap();
        h.broker.set_price(p(dec!(2655)));

        let outcomes = h.risk.on_quote(p(dec!(2655))).await;
        assert_eq!(outcomes, vec![RiskOutcome::Applied { action: "partial_exit" }]);

        assert_eq!(h.broker.position().unwrap().size, 4);
        let position = h.ledger.position().await.unwrap();
        assert_eq!(position.quantity.get(), 4);
        assert!(position.phases.is_complete(RiskPhase::PartialExit));

        // Locked at entry + 0.5R
        let stops = h.broker.orders_of(ProtectiveKind::Stop);
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].size, 4);
        assert_eq!(stops[0].price, Some(p(dec!(2652.5))));

        let targets = h.broker.orders_of(ProtectiveKind::Target);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].size, 4);
        assert_ne!(targets[0].order_id, old_target.order_id);
        assert_eq!(
            h.ledger.tracked(ProtectiveKind::Target).await.unwrap().order_id,
            targets[0].order_id
        );
    }

    #[tokio::test]
    async fn test_partial_exit_on_single_contract_only_completes_phase() {
        let h = harness(RiskSettings {
            break_even_enabled: false,
            trailing_enabled: false,
            ..RiskSettings::default()
        })
        .await;
        h.ledger.set_quantity(h.id, Contracts::ONE).await;

        let outcomes = h.risk.on_quote(p(dec!(2655))).await;
        assert!(matches!(
            outcomes[0],
            RiskOutcome::Completed {
                phase: RiskPhase::PartialExit,
                ..
            }
        ));
        assert_eq!(h.broker.calls(StubOp::Place), 0);
    }

    #[tokio::test]
    async fn test_trailing_ratchets_only_forward() {
        let h = harness(RiskSettings {
            break_even_enabled: false,
            partial_exit_enabled: false,
            early_break_even_ticks: None,
            ..RiskSettings::default()
        })
        .await;

        // 1R reached, trail 2.0 behind the high
        assert_eq!(
            h.risk.on_quote(p(dec!(2655))).await,
            vec![RiskOutcome::Applied { action: "trailing" }]
        );
        assert_eq!(h.ledger.position().await.unwrap().stop_price, p(dec!(2653)));

        // Pullback: no new extreme
        h.risk.on_quote(p(dec!(2654))).await;
        assert_eq!(h.ledger.position().await.unwrap().stop_price, p(dec!(2653)));

        h.risk.on_quote(p(dec!(2658))).await;
        let position = h.ledger.position().await.unwrap();
        assert_eq!(position.stop_price, p(dec!(2656)));
        assert_eq!(h.broker.orders_of(ProtectiveKind::Stop)[0].price, Some(p(dec!(2656))));
    }
}
