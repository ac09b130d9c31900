//! Position ledger: the engine's belief about the open position.
//!
//! Holds at most one position, the tracked order id per protective kind,
//! and fill accounting. The broker remains the source of truth; the ledger
//! is what the reconciler compares against it.
//!
//! Every mutation names the position it targets. A mutation decided for a
//! position that has since closed is dropped instead of leaking into the
//! next one.

use std::collections::HashSet;

use bracket_domain::{
    Contracts, Position, PositionId, Price, ProtectiveKind, ProtectiveOrder, RiskPhase,
};
use bracket_exec::BrokerOrder;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{DaemonError, DaemonResult};

/// Tracked order per protective kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackedOrders {
    pub stop: Option<ProtectiveOrder>,
    pub target: Option<ProtectiveOrder>,
}

impl TrackedOrders {
    pub fn get(&self, kind: ProtectiveKind) -> Option<&ProtectiveOrder> {
        match kind {
            ProtectiveKind::Stop => self.stop.as_ref(),
            ProtectiveKind::Target => self.target.as_ref(),
        }
    }

    fn slot(&mut self, kind: ProtectiveKind) -> &mut Option<ProtectiveOrder> {
        match kind {
            ProtectiveKind::Stop => &mut self.stop,
            ProtectiveKind::Target => &mut self.target,
        }
    }
}

/// A position taken off the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPosition {
    pub position: Position,
    /// Contracts whose exit P&L arrived through trade reports
    pub exited_contracts: u32,
    /// Contracts ever held, including later increases
    pub entered_contracts: u32,
    /// Protective orders tracked at the moment of close
    pub tracked: TrackedOrders,
}

impl ClosedPosition {
    /// Contracts closed without a trade report carrying their P&L.
    pub fn unaccounted_contracts(&self) -> u32 {
        self.entered_contracts.saturating_sub(self.exited_contracts)
    }

    /// Price of the tracked protective order that is no longer working,
    /// i.e. the one that filled. When both are gone the stop is assumed.
    pub fn filled_protective_price(&self, listed: &[BrokerOrder]) -> Option<Price> {
        let vanished = |kind: ProtectiveKind| {
            self.tracked
                .get(kind)
                .filter(|tracked| !listed.iter().any(|o| o.order_id == tracked.order_id))
                .map(|tracked| tracked.price)
        };
        vanished(ProtectiveKind::Stop).or_else(|| vanished(ProtectiveKind::Target))
    }
}

/// Read-only view for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSnapshot {
    pub position: Option<Position>,
    pub tracked: TrackedOrders,
    pub last_closed: Option<PositionId>,
}

#[derive(Default)]
struct LedgerState {
    position: Option<Position>,
    tracked: TrackedOrders,
    entered_contracts: u32,
    exited_contracts: u32,
    last_closed: Option<PositionId>,
    seen_trades: HashSet<String>,
}

impl LedgerState {
    fn position_mut(&mut self, id: PositionId) -> Option<&mut Position> {
        self.position.as_mut().filter(|p| p.id == id)
    }
}

pub struct PositionLedger {
    state: RwLock<LedgerState>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LedgerState::default()),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Put a new position on the ledger. Fails if one is already open.
    pub async fn open(&self, position: Position) -> DaemonResult<()> {
        let mut state = self.state.write().await;
        if let Some(existing) = &state.position {
            return Err(DaemonError::PositionAlreadyExists(existing.id));
        }
        info!(position_id = %position.id, side = %position.side, quantity = %position.quantity, "Ledger: position opened");
        state.entered_contracts = position.quantity.get();
        state.exited_contracts = 0;
        state.tracked = TrackedOrders::default();
        state.seen_trades.clear();
        state.position = Some(position);
        Ok(())
    }

    /// Take the position off the ledger and forget its tracked orders.
    ///
    /// Only the first caller gets the position; later calls for the same
    /// close see `None`.
    pub async fn close(&self) -> Option<ClosedPosition> {
        let mut state = self.state.write().await;
        let position = state.position.take()?;
        let tracked = std::mem::take(&mut state.tracked);
        state.last_closed = Some(position.id);
        info!(position_id = %position.id, realized_pnl = %position.realized_pnl, "Ledger: position closed");
        Some(ClosedPosition {
            position,
            exited_contracts: state.exited_contracts,
            entered_contracts: state.entered_contracts,
            tracked,
        })
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub async fn position(&self) -> Option<Position> {
        self.state.read().await.position.clone()
    }

    /// The open position, if it is still `id`.
    pub async fn position_if(&self, id: PositionId) -> Option<Position> {
        self.state.read().await.position.clone().filter(|p| p.id == id)
    }

    pub async fn has_position(&self) -> bool {
        self.state.read().await.position.is_some()
    }

    pub async fn tracked(&self, kind: ProtectiveKind) -> Option<ProtectiveOrder> {
        self.state.read().await.tracked.get(kind).cloned()
    }

    pub async fn tracked_orders(&self) -> TrackedOrders {
        self.state.read().await.tracked.clone()
    }

    pub async fn last_closed(&self) -> Option<PositionId> {
        self.state.read().await.last_closed
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.read().await;
        LedgerSnapshot {
            position: state.position.clone(),
            tracked: state.tracked.clone(),
            last_closed: state.last_closed,
        }
    }

    // -------------------------------------------------------------------------
    // Tracked orders
    // -------------------------------------------------------------------------

    /// Track `order` and take its price as the intended price of its kind.
    pub async fn adopt(&self, id: PositionId, order: ProtectiveOrder) -> bool {
        let mut state = self.state.write().await;
        let Some(position) = state.position_mut(id) else {
            return false;
        };
        match order.kind {
            ProtectiveKind::Stop => position.stop_price = order.price,
            ProtectiveKind::Target => position.target_price = order.price,
        }
        let kind = order.kind;
        debug!(position_id = %id, %kind, order_id = %order.order_id, size = order.size, "Ledger: tracking order");
        *state.tracked.slot(kind) = Some(order);
        true
    }

    /// Forget the tracked order of `kind`, returning it.
    pub async fn untrack(&self, id: PositionId, kind: ProtectiveKind) -> Option<ProtectiveOrder> {
        let mut state = self.state.write().await;
        state.position_mut(id)?;
        let previous = state.tracked.slot(kind).take();
        if let Some(order) = &previous {
            debug!(position_id = %id, %kind, order_id = %order.order_id, "Ledger: untracked order");
        }
        previous
    }

    /// Put back a tracked entry captured before a failed operation.
    pub async fn restore_tracked(&self, id: PositionId, kind: ProtectiveKind, snapshot: Option<ProtectiveOrder>) {
        let mut state = self.state.write().await;
        if state.position_mut(id).is_some() {
            *state.tracked.slot(kind) = snapshot;
        }
    }

    // -------------------------------------------------------------------------
    // Position mutations
    // -------------------------------------------------------------------------

    /// Set the open quantity. Returns the previous quantity when it changed.
    pub async fn set_quantity(&self, id: PositionId, quantity: Contracts) -> Option<Contracts> {
        let mut state = self.state.write().await;
        let position = state.position_mut(id)?;
        if position.quantity == quantity {
            return None;
        }
        let previous = position.quantity;
        position.quantity = quantity;
        if quantity > previous {
            state.entered_contracts += quantity.get() - previous.get();
        }
        info!(position_id = %id, from = %previous, to = %quantity, "Ledger: quantity changed");
        Some(previous)
    }

    pub async fn complete_phase(&self, id: PositionId, phase: RiskPhase) -> bool {
        let mut state = self.state.write().await;
        state
            .position_mut(id)
            .map(|p| p.phases.complete(phase))
            .unwrap_or(false)
    }

    /// Record a verified trailing move.
    pub async fn record_trail(&self, id: PositionId, new_stop: Price) -> bool {
        let mut state = self.state.write().await;
        let Some(position) = state.position_mut(id) else {
            return false;
        };
        position.stop_price = new_stop;
        position.phases.record_trail();
        true
    }

    /// Fold a price into the favorable extreme.
    pub async fn observe_price(&self, id: PositionId, price: Price) -> bool {
        let mut state = self.state.write().await;
        state
            .position_mut(id)
            .map(|p| p.observe_price(price))
            .unwrap_or(false)
    }

    /// Apply a reducing fill's P&L to the open position. Each trade id is
    /// applied once.
    pub async fn record_fill(&self, trade_id: &str, size: u32, pnl: Decimal) -> bool {
        let mut state = self.state.write().await;
        if state.position.is_none() || !state.seen_trades.insert(trade_id.to_string()) {
            return false;
        }
        state.exited_contracts += size;
        if let Some(position) = state.position.as_mut() {
            position.realized_pnl += pnl;
        }
        true
    }
}

impl Default for PositionLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bracket_domain::{Instrument, OrderSide, Side};
    use rust_decimal_macros::dec;

    fn position() -> Position {
        Position::open(
            Instrument::new("CON.F.US.MGC.Z25", dec!(0.1), dec!(1)).unwrap(),
            Side::Long,
            Contracts::new(4).unwrap(),
            Price::new(dec!(2650)).unwrap(),
            Price::new(dec!(2645)).unwrap(),
            Price::new(dec!(2660)).unwrap(),
        )
    }

    fn stop(order_id: &str, price: Price) -> ProtectiveOrder {
        ProtectiveOrder {
            kind: ProtectiveKind::Stop,
            order_id: order_id.to_string(),
            side: OrderSide::Sell,
            size: 4,
            price,
        }
    }

    #[tokio::test]
    async fn test_single_open_position() {
        let ledger = PositionLedger::new();
        ledger.open(position()).await.unwrap();

        let err = ledger.open(position()).await.unwrap_err();
        assert!(matches!(err, DaemonError::PositionAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_adopt_updates_intended_price() {
        let ledger = PositionLedger::new();
        let p = position();
        let id = p.id;
        ledger.open(p).await.unwrap();

        let moved = Price::new(dec!(2647)).unwrap();
        assert!(ledger.adopt(id, stop("S1", moved)).await);

        assert_eq!(ledger.position().await.unwrap().stop_price, moved);
        assert_eq!(ledger.tracked(ProtectiveKind::Stop).await.unwrap().order_id, "S1");
        assert!(ledger.tracked(ProtectiveKind::Target).await.is_none());
    }

    #[tokio::test]
    async fn test_mutations_for_other_position_are_dropped() {
        let ledger = PositionLedger::new();
        let first = position();
        let first_id = first.id;
        ledger.open(first).await.unwrap();
        ledger.close().await.unwrap();
        ledger.open(position()).await.unwrap();

        assert!(!ledger.adopt(first_id, stop("S1", Price::new(dec!(2647)).unwrap())).await);
        assert!(ledger.set_quantity(first_id, Contracts::new(2).unwrap()).await.is_none());
        assert!(!ledger.complete_phase(first_id, RiskPhase::BreakEven).await);
        assert!(ledger.tracked(ProtectiveKind::Stop).await.is_none());
        assert_eq!(ledger.last_closed().await, Some(first_id));
    }

    #[tokio::test]
    async fn test_close_happens_once_and_clears_tracking() {
        let ledger = PositionLedger::new();
        let p = position();
        let id = p.id;
        ledger.open(p).await.unwrap();
        ledger.adopt(id, stop("S1", Price::new(dec!(2645)).unwrap())).await;

        assert!(ledger.close().await.is_some());
        assert!(ledger.close().await.is_none());
        assert!(ledger.tracked_orders().await.stop.is_none());
    }

    #[tokio::test]
    async fn test_close_reports_the_protective_order_that_filled() {
        let ledger = PositionLedger::new();
        let p = position();
        let id = p.id;
        ledger.open(p).await.unwrap();
        ledger.adopt(id, stop("S1", Price::new(dec!(2645)).unwrap())).await;
        ledger
            .adopt(
                id,
                ProtectiveOrder {
                    kind: ProtectiveKind::Target,
                    order_id: "T1".to_string(),
                    side: OrderSide::Sell,
                    size: 4,
                    price: Price::new(dec!(2660)).unwrap(),
                },
            )
            .await;

        let closed = ledger.close().await.unwrap();
        let listed = |ids: &[&str]| -> Vec<BrokerOrder> {
            ids.iter()
                .map(|order_id| BrokerOrder {
                    order_id: order_id.to_string(),
                    instrument: "CON.F.US.MGC.Z25".to_string(),
                    kind: bracket_exec::OrderKind::Limit,
                    side: OrderSide::Sell,
                    size: 4,
                    price: None,
                    created_at: chrono::Utc::now(),
                })
                .collect()
        };

        assert_eq!(closed.filled_protective_price(&listed(&["T1"])), Some(Price::new(dec!(2645)).unwrap()));
        assert_eq!(closed.filled_protective_price(&listed(&["S1"])), Some(Price::new(dec!(2660)).unwrap()));
        assert_eq!(closed.filled_protective_price(&listed(&[])), Some(Price::new(dec!(2645)).unwrap()));
        assert_eq!(closed.filled_protective_price(&listed(&["S1", "T1"])), None);
    }

    #[tokio::test]
    async fn test_trade_ids_forgotten_when_next_position_opens() {
        let ledger = PositionLedger::new();
        ledger.open(position()).await.unwrap();
        assert!(ledger.record_fill("T-1", 1, dec!(10)).await);
        ledger.close().await.unwrap();

        ledger.open(position()).await.unwrap();
        assert!(ledger.state.read().await.seen_trades.is_empty());
    }

    #[tokio::test]
    async fn test_fill_accounting() {
        let ledger = PositionLedger::new();
        ledger.open(position()).await.unwrap();

        assert!(ledger.record_fill("T-2", 2, dec!(200)).await);
        assert!(!ledger.record_fill("T-2", 2, dec!(200)).await);

        let closed = ledger.close().await.unwrap();
        assert_eq!(closed.position.realized_pnl, dec!(200));
        assert_eq!(closed.unaccounted_contracts(), 2);
    }
}
