//! Position manager: entries, close detection, orphan adoption and panic
//! close.
//!
//! # Entry Flow
//!
//! ```text
//! open_position(signal)
//!   ├─ validate signal
//!   ├─ circuit breaker / daily guards
//!   ├─ [entry] ledger and broker both flat
//!   ├─ market order, wait for the broker position
//!   ├─ ledger.open, PositionOpened
//!   └─ place + verify stop and target (still under [entry])
//! ```
//!
//! # Close Detection
//!
//! A close can be seen by a trade callback, a position-changed push event
//! or the status poll. Whichever path sees it first takes the position off
//! the ledger; the others find the ledger empty. The circuit breaker is
//! keyed by position id, so it counts the close once either way.
//!
//! Contracts closed without a trade report are valued at the price of the
//! tracked stop or target that stopped working, since that order is the
//! one that filled. The quote is only a fallback.

use std::sync::Arc;
use std::time::Duration;

use bracket_domain::{
    CloseSource, Contracts, EngineEvent, Position, PositionId, Price, ProtectiveKind, Side, TradeSignal,
};
use bracket_exec::{
    BrokerEvent, BrokerGateway, BrokerOrder, BrokerPosition, ExecError, ExecResult, MutationCategory, MutationGate,
    OrderRequest, OrderVerifier,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{CircuitBreaker, EntryBlock, OutcomeRecord};
use crate::config::TradingConfig;
use crate::error::{DaemonError, DaemonResult, RejectReason};
use crate::event_bus::EventBus;
use crate::ledger::{ClosedPosition, PositionLedger};
use crate::reconciler::{protective_from, protective_price};

/// Attempts to take the placement lock before a panic close goes ahead anyway.
const PANIC_LOCK_ATTEMPTS: u32 = 20;
const PANIC_LOCK_DELAY: Duration = Duration::from_millis(100);

/// What a status poll found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "sync", rename_all = "snake_case")]
pub enum PositionSync {
    /// Broker and ledger both flat; stray protective orders cancelled
    Flat { cancelled: usize },
    InSync,
    QuantitySynced { from: u32, to: u32 },
    Closed { position_id: PositionId },
    Adopted { position_id: PositionId },
    /// Broker position unknown to the ledger, entry lock busy
    AdoptionDeferred,
}

pub struct PositionManager<G: BrokerGateway> {
    gateway: Arc<G>,
    ledger: Arc<PositionLedger>,
    gate: Arc<MutationGate>,
    verifier: Arc<OrderVerifier<G>>,
    breaker: Arc<CircuitBreaker>,
    event_bus: Arc<EventBus>,
    trading: TradingConfig,
}

impl<G: BrokerGateway> PositionManager<G> {
    pub fn new(
        gateway: Arc<G>,
        ledger: Arc<PositionLedger>,
        gate: Arc<MutationGate>,
        verifier: Arc<OrderVerifier<G>>,
        breaker: Arc<CircuitBreaker>,
        event_bus: Arc<EventBus>,
        trading: TradingConfig,
    ) -> Self {
        Self {
            gateway,
            ledger,
            gate,
            verifier,
            breaker,
            event_bus,
            trading,
        }
    }

    fn contract_id(&self) -> &str {
        &self.trading.instrument.contract_id
    }

    // =========================================================================
    // Entry
    // =========================================================================

    /// Open a position for `signal` and protect it.
    ///
    /// Returns the position id, or [`DaemonError::Rejected`] with the reason
    /// the entry was refused. When the initial brackets cannot be confirmed
    /// the position stays open and the reconciler keeps repairing it.
    pub async fn open_position(&self, signal: TradeSignal) -> DaemonResult<PositionId> {
        if let Err(e) = signal.validate() {
            return Err(self.reject(RejectReason::InvalidSignal(e.to_string())));
        }
        match self.breaker.entry_permission(Utc::now()) {
            Ok(()) => {}
            Err(EntryBlock::CooldownActive { until }) => {
                return Err(self.reject(RejectReason::CircuitBreakerTripped { until }));
            }
            Err(block) => return Err(self.reject(RejectReason::DailyLimit(block))),
        }

        let Some(_entry) = self.gate.try_enter(MutationCategory::Entry, "entry") else {
            return Err(self.reject(RejectReason::EntryInFlight));
        };
        if self.ledger.has_position().await || self.gateway.get_position(self.contract_id()).await?.is_some() {
            return Err(self.reject(RejectReason::PositionAlreadyOpen));
        }

        let size = self.trading.position_size.get();
        let request = OrderRequest::market(self.contract_id(), signal.side.entry_action(), size);
        info!(side = %signal.side, size, signal_price = %signal.entry_price, "Entry: sending market order");
        let order_id = match self.gateway.place_order(&request).await {
            Ok(order_id) => order_id,
            Err(e) if e.is_irrecoverable() => {
                return Err(self.reject(RejectReason::BrokerRejected(e.to_string())));
            }
            Err(e) => {
                warn!(error = %e, "Entry order outcome unknown, checking broker position");
                "unconfirmed".to_string()
            }
        };

        let Some(fill) = self.await_fill(signal.side).await? else {
            error!(%order_id, "Entry fill not seen; status poll will adopt it if it appears");
            return Err(DaemonError::EntryUnconfirmed(order_id));
        };

        let instrument = self.trading.instrument.clone();
        let (stop, target) = signal.bracket_prices(&instrument, fill.average_price)?;
        let position = Position::open(
            instrument,
            signal.side,
            Contracts::new(fill.size)?,
            fill.average_price,
            stop,
            target,
        );
        let position_id = position.id;
        self.ledger.open(position.clone()).await?;
        self.breaker.record_entry(Utc::now());
        self.event_bus.emit(EngineEvent::PositionOpened {
            position_id,
            instrument: position.instrument.contract_id.clone(),
            side: position.side,
            quantity: position.quantity.get(),
            entry_price: position.entry_price,
            stop_price: stop,
            target_price: target,
            timestamp: Utc::now(),
        });

        let missing = self.place_initial_brackets(&position).await;
        if !missing.is_empty() {
            return Err(self.reject(RejectReason::VerificationFailedOnInitialBrackets { missing }));
        }

        info!(%position_id, "Position opened and protected");
        Ok(position_id)
    }

    /// Poll the broker position until the entry shows up.
    async fn await_fill(&self, side: Side) -> DaemonResult<Option<BrokerPosition>> {
        for attempt in 1..=self.trading.entry_fill_attempts.max(1) {
            match self.gateway.get_position(self.contract_id()).await {
                Ok(Some(position)) if position.side == side && position.size > 0 => {
                    debug!(attempt, size = position.size, price = %position.average_price, "Entry filled");
                    return Ok(Some(position));
                }
                Ok(_) => debug!(attempt, "Entry fill not visible yet"),
                Err(e) if e.is_transient() => warn!(attempt, error = %e, "Position poll failed during entry"),
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(self.trading.entry_fill_delay).await;
        }
        Ok(None)
    }

    /// Place and verify both brackets. Returns the kinds left unconfirmed.
    async fn place_initial_brackets(&self, position: &Position) -> Vec<ProtectiveKind> {
        let market = self
            .gateway
            .get_quote(self.contract_id())
            .await
            .ok()
            .map(|q| q.price);

        let mut missing = Vec::new();
        for kind in ProtectiveKind::ALL {
            match self.place_bracket(position, kind, market).await {
                Ok(true) => {}
                Ok(false) => missing.push(kind),
                Err(e) => {
                    warn!(position_id = %position.id, %kind, error = %e, "Initial bracket failed");
                    if e.is_irrecoverable() {
                        self.event_bus.emit(EngineEvent::ManualInterventionRequired {
                            position_id: Some(position.id),
                            reason: format!("initial {} rejected: {}", kind, e),
                            timestamp: Utc::now(),
                        });
                    }
                    missing.push(kind);
                }
            }
        }
        missing
    }

    async fn place_bracket(&self, position: &Position, kind: ProtectiveKind, market: Option<Price>) -> ExecResult<bool> {
        let price = protective_price(position, kind, market)?;
        let quantity = position.quantity.get();
        let request = OrderRequest::protective(kind, self.contract_id(), position.exit_side(), quantity, price);
        let order_id = self.gateway.place_order(&request).await?;

        let verification = self
            .verifier
            .verify(self.contract_id(), &order_id, quantity, kind, self.verifier.default_attempts())
            .await?;
        match verification.order() {
            Some(listed) => {
                self.ledger.adopt(position.id, protective_from(kind, listed, position)).await;
                info!(position_id = %position.id, %kind, %order_id, %price, "Initial bracket confirmed");
                Ok(true)
            }
            None => {
                warn!(position_id = %position.id, %kind, %order_id, "Initial bracket not listed");
                Ok(false)
            }
        }
    }

    fn reject(&self, reason: RejectReason) -> DaemonError {
        warn!(%reason, "Entry rejected");
        self.event_bus.emit(EngineEvent::EntryRejected {
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        DaemonError::Rejected(reason)
    }

    // =========================================================================
    // Broker push events
    // =========================================================================

    /// Handle a trade or position push event. Quotes are not handled here.
    pub async fn handle_broker_event(&self, event: &BrokerEvent) -> DaemonResult<Option<PositionId>> {
        match event {
            BrokerEvent::Trade {
                trade_id,
                instrument,
                size,
                pnl: Some(pnl),
                ..
            } if instrument == self.contract_id() => {
                if !self.ledger.record_fill(trade_id, *size, *pnl).await {
                    return Ok(None);
                }
                debug!(trade_id, size, %pnl, "Reducing fill recorded");
                match self.gateway.get_position(self.contract_id()).await {
                    Ok(None) => Ok(self.finalize_close(CloseSource::TradeCallback).await),
                    Ok(Some(_)) => Ok(None),
                    Err(e) => {
                        warn!(error = %e, "Position check after fill failed; status poll will catch a close");
                        Ok(None)
                    }
                }
            }
            BrokerEvent::PositionChanged { instrument, size } if instrument == self.contract_id() => {
                if *size == 0 {
                    return Ok(self.finalize_close(CloseSource::PositionEvent).await);
                }
                if let Some(position) = self.ledger.position().await {
                    self.ledger.set_quantity(position.id, Contracts::new(*size)?).await;
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    // =========================================================================
    // Status poll
    // =========================================================================

    /// Compare the ledger with the broker position and fix the ledger.
    pub async fn poll_position(&self) -> DaemonResult<PositionSync> {
        let broker = self.gateway.get_position(self.contract_id()).await?;
        let ledger = self.ledger.position().await;

        match (ledger, broker) {
            (Some(position), None) => {
                self.finalize_close(CloseSource::StatusPoll).await;
                Ok(PositionSync::Closed { position_id: position.id })
            }
            (Some(position), Some(broker)) if broker.side != position.side => {
                warn!(position_id = %position.id, broker_side = %broker.side, "Broker position reversed; closing ledger position");
                self.finalize_close(CloseSource::StatusPoll).await;
                Ok(PositionSync::Closed { position_id: position.id })
            }
            (Some(position), Some(broker)) => {
                let quantity = Contracts::new(broker.size)?;
                match self.ledger.set_quantity(position.id, quantity).await {
                    Some(previous) => {
                        warn!(position_id = %position.id, from = %previous, to = %quantity, "Ledger quantity synced from broker");
                        Ok(PositionSync::QuantitySynced {
                            from: previous.get(),
                            to: quantity.get(),
                        })
                    }
                    None => Ok(PositionSync::InSync),
                }
            }
            (None, Some(broker)) => self.adopt_orphan(broker).await,
            (None, None) => Ok(PositionSync::Flat {
                cancelled: self.sweep_when_flat().await,
            }),
        }
    }

    /// Take over a broker position the ledger does not know, e.g. after a
    /// restart, along with any protective orders already working for it.
    async fn adopt_orphan(&self, broker: BrokerPosition) -> DaemonResult<PositionSync> {
        let Some(_entry) = self.gate.try_enter(MutationCategory::Entry, "orphan_adoption") else {
            return Ok(PositionSync::AdoptionDeferred);
        };
        if self.ledger.has_position().await {
            return Ok(PositionSync::InSync);
        }

        let instrument = self.trading.instrument.clone();
        let exit_side = broker.side.exit_action();
        let orders = self.gateway.list_open_orders(self.contract_id()).await?;
        let newest = |kind: ProtectiveKind| -> Option<BrokerOrder> {
            orders
                .iter()
                .filter(|o| o.matches(kind, self.contract_id(), exit_side))
                .max_by_key(|o| o.created_at)
                .cloned()
        };
        let stop_order = newest(ProtectiveKind::Stop);
        let target_order = newest(ProtectiveKind::Target);

        let entry = broker.average_price.as_decimal();
        let direction = broker.side.direction();
        let stop = match stop_order.as_ref().and_then(|o| o.price) {
            Some(price) => price,
            None => instrument.round_price(entry - direction * instrument.ticks(self.trading.fallback_stop_ticks))?,
        };
        let target = match target_order.as_ref().and_then(|o| o.price) {
            Some(price) => price,
            None => instrument.round_price(entry + direction * instrument.ticks(self.trading.fallback_target_ticks))?,
        };

        let position = Position::open(
            instrument,
            broker.side,
            Contracts::new(broker.size)?,
            broker.average_price,
            stop,
            target,
        );
        let position_id = position.id;
        self.ledger.open(position.clone()).await?;
        for (kind, order) in [(ProtectiveKind::Stop, stop_order), (ProtectiveKind::Target, target_order)] {
            if let Some(order) = order {
                self.ledger.adopt(position_id, protective_from(kind, &order, &position)).await;
            }
        }

        warn!(%position_id, side = %broker.side, size = broker.size, price = %broker.average_price, "Adopted orphan broker position");
        self.event_bus.emit(EngineEvent::PositionOpened {
            position_id,
            instrument: position.instrument.contract_id.clone(),
            side: position.side,
            quantity: position.quantity.get(),
            entry_price: position.entry_price,
            stop_price: stop,
            target_price: target,
            timestamp: Utc::now(),
        });
        Ok(PositionSync::Adopted { position_id })
    }

    /// Cancel protective orders left working while flat.
    async fn sweep_when_flat(&self) -> usize {
        let Some(_entry) = self.gate.try_enter(MutationCategory::Entry, "flat_sweep") else {
            return 0;
        };
        if self.ledger.has_position().await {
            return 0;
        }
        self.cancel_protective_orders().await
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Tear down the ledger position after the broker went flat.
    ///
    /// Returns the id of the position closed by this call, `None` when
    /// another path already did it.
    pub async fn finalize_close(&self, source: CloseSource) -> Option<PositionId> {
        let closed = self.ledger.close().await?;
        let position_id = closed.position.id;

        let listed = self.list_orders().await;
        let cancelled = match &listed {
            Some(orders) => self.cancel_listed(orders).await,
            None => 0,
        };
        if cancelled > 0 {
            info!(%position_id, cancelled, "Cancelled leftover protective orders");
        }

        let filled_at = listed.as_deref().and_then(|orders| closed.filled_protective_price(orders));
        let exit_price = match filled_at {
            Some(price) => {
                debug!(%position_id, %price, "Valuing unreported exit at the filled protective order");
                Some(price)
            }
            None => self.gateway.get_quote(self.contract_id()).await.ok().map(|q| q.price),
        };
        let realized_pnl = closed_pnl(&closed, exit_price);
        self.record_outcome(position_id, realized_pnl);

        info!(%position_id, %realized_pnl, detected_by = ?source, "Position closed");
        self.event_bus.emit(EngineEvent::PositionClosed {
            position_id,
            realized_pnl,
            detected_by: source,
            timestamp: Utc::now(),
        });
        Some(position_id)
    }

    fn record_outcome(&self, position_id: PositionId, pnl: Decimal) {
        let now = Utc::now();
        if let OutcomeRecord::Counted {
            consecutive_losses,
            tripped_until: Some(until),
        } = self.breaker.record_outcome(&position_id.to_string(), pnl, now)
        {
            self.event_bus.emit(EngineEvent::CircuitBreakerTripped {
                until,
                consecutive_losses,
                timestamp: now,
            });
        }
    }

    async fn list_orders(&self) -> Option<Vec<BrokerOrder>> {
        match self.gateway.list_open_orders(self.contract_id()).await {
            Ok(orders) => Some(orders),
            Err(e) => {
                warn!(error = %e, "Could not list orders for cleanup");
                None
            }
        }
    }

    /// Cancel every stop and limit order on the instrument.
    async fn cancel_protective_orders(&self) -> usize {
        match self.list_orders().await {
            Some(orders) => self.cancel_listed(&orders).await,
            None => 0,
        }
    }

    /// Cancel the stop and limit orders among `orders`.
    async fn cancel_listed(&self, orders: &[BrokerOrder]) -> usize {
        let mut cancelled = 0;
        for order in orders.iter().filter(|o| o.kind.as_protective().is_some()) {
            match self.gateway.cancel_order(&order.order_id).await {
                Ok(()) => cancelled += 1,
                Err(ExecError::OrderNotFound(_)) => {}
                Err(e) => warn!(order_id = %order.order_id, error = %e, "Cleanup cancel failed"),
            }
        }
        cancelled
    }

    // =========================================================================
    // Daily loss
    // =========================================================================

    /// Flatten the open position when today's realized P&L plus its open P&L
    /// at `price` reaches the daily loss limit. Entries stay blocked for the
    /// rest of the trading day.
    ///
    /// Returns the id of the position flattened by this call.
    pub async fn enforce_daily_loss(&self, price: Price) -> DaemonResult<Option<PositionId>> {
        let Some(position) = self.ledger.position().await else {
            return Ok(None);
        };
        let open_pnl = position.realized_pnl
            + position
                .instrument
                .pnl(position.side, position.entry_price, price, position.quantity.get());
        let Some(total_pnl) = self.breaker.check_daily_loss(open_pnl, Utc::now()) else {
            return Ok(None);
        };

        error!(position_id = %position.id, %total_pnl, %price, "DAILY LOSS LIMIT HIT: emergency exit");
        self.event_bus.emit(EngineEvent::DailyLossLimitHit {
            position_id: position.id,
            total_pnl,
            price,
            timestamp: Utc::now(),
        });
        self.panic_close().await
    }

    /// Cancel protective orders and flatten at market.
    pub async fn panic_close(&self) -> DaemonResult<Option<PositionId>> {
        let mut placement = None;
        for _ in 0..PANIC_LOCK_ATTEMPTS {
            placement = self.gate.try_enter(MutationCategory::ProtectivePlacement, "panic_close");
            if placement.is_some() {
                break;
            }
            tokio::time::sleep(PANIC_LOCK_DELAY).await;
        }
        if placement.is_none() {
            warn!("Panic close proceeding without the placement lock");
        }

        let closed = self.ledger.close().await;
        let cancelled = self.cancel_protective_orders().await;
        error!(cancelled, "PANIC CLOSE: protective orders cancelled, flattening");

        if let Some(broker) = self.gateway.get_position(self.contract_id()).await? {
            let request = OrderRequest::market(self.contract_id(), broker.side.exit_action(), broker.size);
            self.gateway.place_order(&request).await?;
            info!(size = broker.size, "Flatten order sent");
        }

        let Some(closed) = closed else {
            return Ok(None);
        };
        let position_id = closed.position.id;
        let exit_price = self.gateway.get_quote(self.contract_id()).await.ok().map(|q| q.price);
        let realized_pnl = closed_pnl(&closed, exit_price);
        self.record_outcome(position_id, realized_pnl);
        self.event_bus.emit(EngineEvent::PositionClosed {
            position_id,
            realized_pnl,
            detected_by: CloseSource::Panic,
            timestamp: Utc::now(),
        });
        Ok(Some(position_id))
    }
}

/// Realized P&L of a closed position. Contracts closed without a trade
/// report are valued at `exit_price`, or at the stop when no price is known.
fn closed_pnl(closed: &ClosedPosition, exit_price: Option<Price>) -> Decimal {
    let position = &closed.position;
    let unaccounted = closed.unaccounted_contracts();
    if unaccounted == 0 {
        return position.realized_pnl;
    }
    let exit = exit_price.unwrap_or(position.stop_price);
    position.realized_pnl + position.instrument.pnl(position.side, position.entry_price, exit, unaccounted)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerConfig;
    use crate::config::Config;
    use bracket_domain::OrderSide;
    use bracket_exec::{StubBroker, StubFailure, StubOp};
    use rust_decimal_macros::dec;

    fn p(value: Decimal) -> Price {
        Price::new(value).unwrap()
    }

    struct Harness {
        broker: Arc<StubBroker>,
        ledger: Arc<PositionLedger>,
        breaker: Arc<CircuitBreaker>,
        bus: Arc<EventBus>,
        manager: PositionManager<StubBroker>,
    }

    fn harness() -> Harness {
        let config = Config::test();
        let broker = Arc::new(StubBroker::new(config.trading.instrument.clone(), p(dec!(2650))));
        let ledger = Arc::new(PositionLedger::new());
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
        let bus = Arc::new(EventBus::new(100));
        let manager = PositionManager::new(
            broker.clone(),
            ledger.clone(),
            MutationGate::new(config.gate.clone()),
            Arc::new(OrderVerifier::new(broker.clone(), config.verifier.clone())),
            breaker.clone(),
            bus.clone(),
            config.trading,
        );
        Harness {
            broker,
            ledger,
            breaker,
            bus,
            manager,
        }
    }

    fn long_signal() -> TradeSignal {
        TradeSignal {
            side: Side::Long,
            entry_price: p(dec!(2650)),
            stop_distance_ticks: 50,
            target_distance_ticks: 100,
            risk_reward_ratio: dec!(2),
        }
    }

    async fn feed_events(h: &Harness, rx: &mut tokio::sync::mpsc::UnboundedReceiver<BrokerEvent>) {
        while let Ok(event) = rx.try_recv() {
            h.manager.handle_broker_event(&event).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_open_position_places_and_tracks_brackets() {
        let h = harness();
        let mut events = h.bus.subscribe();

        let id = h.manager.open_position(long_signal()).await.unwrap();

        let position = h.ledger.position().await.unwrap();
        assert_eq!(position.id, id);
        assert_eq!(position.stop_price, p(dec!(2645)));
        assert_eq!(position.target_price, p(dec!(2660)));
        assert!(h.ledger.tracked(ProtectiveKind::Stop).await.is_some());
        assert!(h.ledger.tracked(ProtectiveKind::Target).await.is_some());
        assert_eq!(h.broker.open_orders().len(), 2);
        assert!(h.broker.open_orders().iter().all(|o| o.side == OrderSide::Sell && o.size == 1));
        assert!(events
            .drain_engine_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::PositionOpened { .. })));
    }

    #[tokio::test]
    async fn test_rejects_invalid_signal_and_second_entry() {
        let h = harness();
        let signal = TradeSignal {
            stop_distance_ticks: 0,
            ..long_signal()
        };
        assert!(matches!(
            h.manager.open_position(signal).await,
            Err(DaemonError::Rejected(RejectReason::InvalidSignal(_)))
        ));

        h.manager.open_position(long_signal()).await.unwrap();
        assert!(matches!(
            h.manager.open_position(long_signal()).await,
            Err(DaemonError::Rejected(RejectReason::PositionAlreadyOpen))
        ));
        assert_eq!(h.broker.position().unwrap().size, 1);
    }

    #[tokio::test]
    async fn test_rejects_while_breaker_tripped() {
        let h = harness();
        let now = Utc::now();
        h.breaker.record_outcome("a", dec!(-50), now);
        h.breaker.record_outcome("b", dec!(-30), now);

        let result = h.manager.open_position(long_signal()).await;
        assert!(matches!(
            result,
            Err(DaemonError::Rejected(RejectReason::CircuitBreakerTripped { .. }))
        ));
        assert_eq!(h.broker.calls(StubOp::Place), 0);
    }

    #[tokio::test]
    async fn test_broker_rejection_aborts_entry() {
        let h = harness();
        h.broker.fail_next(StubOp::Place, StubFailure::Rejected);

        let result = h.manager.open_position(long_signal()).await;
        assert!(matches!(
            result,
            Err(DaemonError::Rejected(RejectReason::BrokerRejected(_)))
        ));
        assert!(!h.ledger.has_position().await);
    }

    #[tokio::test]
    async fn test_unconfirmed_brackets_keep_position_open() {
        let h = harness();
        h.broker.set_listing_lag(50);

        let result = h.manager.open_position(long_signal()).await;
        match result {
            Err(DaemonError::Rejected(RejectReason::VerificationFailedOnInitialBrackets { missing })) => {
                assert_eq!(missing, vec![ProtectiveKind::Stop, ProtectiveKind::Target]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(h.ledger.has_position().await);
        assert!(h.ledger.tracked(ProtectiveKind::Stop).await.is_none());
    }

    #[tokio::test]
    async fn test_stop_fill_closes_once_across_detection_paths() {
        let h = harness();
        let mut rx = h.broker.subscribe();
        let mut events = h.bus.subscribe();
        let id = h.manager.open_position(long_signal()).await.unwrap();

        h.broker.set_price(p(dec!(2644)));
        feed_events(&h, &mut rx).await;
        assert_eq!(h.manager.poll_position().await.unwrap(), PositionSync::Flat { cancelled: 0 });

        assert!(!h.ledger.has_position().await);
        assert_eq!(h.ledger.last_closed().await, Some(id));
        assert!(h.broker.open_orders().is_empty());
        assert_eq!(h.breaker.consecutive_losses(Utc::now()), 1);

        let closes: Vec<_> = events
            .drain_engine_events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::PositionClosed {
                    realized_pnl,
                    detected_by,
                    ..
                } => Some((realized_pnl, detected_by)),
                _ => None,
            })
            .collect();
        assert_eq!(closes, vec![(dec!(-50), CloseSource::TradeCallback)]);
    }

    #[tokio::test]
    async fn test_status_poll_detects_silent_close() {
        let h = harness();
        let id = h.manager.open_position(long_signal()).await.unwrap();
        h.broker.clear_position();

        assert_eq!(
            h.manager.poll_position().await.unwrap(),
            PositionSync::Closed { position_id: id }
        );
        assert!(h.broker.open_orders().is_empty());
        // Valued at the last quote, 2650
        assert_eq!(h.breaker.consecutive_losses(Utc::now()), 0);
    }

    #[tokio::test]
    async fn test_poll_close_after_bounce_values_exit_at_filled_stop() {
        let h = harness();
        let mut rx = h.broker.subscribe();
        let mut events = h.bus.subscribe();
        let id = h.manager.open_position(long_signal()).await.unwrap();
        while rx.try_recv().is_ok() {}

        // Stop fills at 2645, then the market bounces before anyone looks
        h.broker.set_price(p(dec!(2645)));
        h.broker.set_price(p(dec!(2652)));
        assert_eq!(
            h.manager.poll_position().await.unwrap(),
            PositionSync::Closed { position_id: id }
        );
        feed_events(&h, &mut rx).await;

        assert_eq!(h.breaker.consecutive_losses(Utc::now()), 1);
        assert!(h.broker.open_orders().is_empty());
        let closes: Vec<_> = events
            .drain_engine_events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::PositionClosed { realized_pnl, .. } => Some(realized_pnl),
                _ => None,
            })
            .collect();
        assert_eq!(closes, vec![dec!(-50)]);
    }

    #[tokio::test]
    async fn test_position_event_close_values_exit_at_filled_target() {
        let h = harness();
        let mut events = h.bus.subscribe();
        h.manager.open_position(long_signal()).await.unwrap();

        h.broker.set_price(p(dec!(2660)));
        h.broker.set_price(p(dec!(2655)));
        let event = BrokerEvent::PositionChanged {
            instrument: h.broker.instrument().contract_id.clone(),
            size: 0,
        };
        assert!(h.manager.handle_broker_event(&event).await.unwrap().is_some());

        let closed = events
            .drain_engine_events()
            .into_iter()
            .find_map(|e| match e {
                EngineEvent::PositionClosed { realized_pnl, .. } => Some(realized_pnl),
                _ => None,
            });
        assert_eq!(closed, Some(dec!(100)));
    }

    #[tokio::test]
    async fn test_daily_loss_flattens_and_blocks_entries() {
        let config = Config::test();
        let broker = Arc::new(StubBroker::new(config.trading.instrument.clone(), p(dec!(2650))));
        let ledger = Arc::new(PositionLedger::new());
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            daily_loss_limit: Some(dec!(30)),
            ..BreakerConfig::default()
        }));
        let bus = Arc::new(EventBus::new(100));
        let manager = PositionManager::new(
            broker.clone(),
            ledger.clone(),
            MutationGate::new(config.gate.clone()),
            Arc::new(OrderVerifier::new(broker.clone(), config.verifier.clone())),
            breaker.clone(),
            bus.clone(),
            config.trading,
        );
        let mut events = bus.subscribe();
        let id = manager.open_position(long_signal()).await.unwrap();

        // Open P&L of -20 is inside the limit
        assert_eq!(manager.enforce_daily_loss(p(dec!(2648))).await.unwrap(), None);
        assert!(ledger.has_position().await);

        broker.set_price(p(dec!(2646.5)));
        assert_eq!(manager.enforce_daily_loss(p(dec!(2646.5))).await.unwrap(), Some(id));
        assert!(broker.position().is_none());
        assert!(broker.open_orders().is_empty());
        assert!(!ledger.has_position().await);
        assert!(events
            .drain_engine_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::DailyLossLimitHit { total_pnl, .. } if *total_pnl == dec!(-35))));

        assert!(matches!(
            manager.open_position(long_signal()).await,
            Err(DaemonError::Rejected(RejectReason::DailyLimit(EntryBlock::DailyLossLimit { .. })))
        ));
    }

    #[tokio::test]
    async fn test_orphan_position_adopted_with_existing_stop() {
        let h = harness();
        h.broker.set_position(Side::Short, 2, p(dec!(2650)));
        let stop_id = h
            .broker
            .inject_order(ProtectiveKind::Stop, OrderSide::Buy, 2, p(dec!(2655)));

        let sync = h.manager.poll_position().await.unwrap();
        assert!(matches!(sync, PositionSync::Adopted { .. }));

        let position = h.ledger.position().await.unwrap();
        assert_eq!(position.side, Side::Short);
        assert_eq!(position.quantity.get(), 2);
        assert_eq!(position.stop_price, p(dec!(2655)));
        // Fallback target: 100 ticks below entry
        assert_eq!(position.target_price, p(dec!(2640)));
        assert_eq!(h.ledger.tracked(ProtectiveKind::Stop).await.unwrap().order_id, stop_id);
        assert!(h.ledger.tracked(ProtectiveKind::Target).await.is_none());
    }

    #[tokio::test]
    async fn test_flat_sweep_cancels_stray_orders() {
        let h = harness();
        h.broker
            .inject_order(ProtectiveKind::Target, OrderSide::Sell, 1, p(dec!(2660)));

        assert_eq!(h.manager.poll_position().await.unwrap(), PositionSync::Flat { cancelled: 1 });
        assert!(h.broker.open_orders().is_empty());
    }

    #[tokio::test]
    async fn test_panic_close_flattens() {
        let h = harness();
        let id = h.manager.open_position(long_signal()).await.unwrap();

        assert_eq!(h.manager.panic_close().await.unwrap(), Some(id));
        assert!(h.broker.position().is_none());
        assert!(h.broker.open_orders().is_empty());
        assert!(!h.ledger.has_position().await);
    }
}
