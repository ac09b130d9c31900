//! In-memory broker for tests and the `test` environment.
//!
//! Simulates the parts of a futures broker the engine depends on:
//! working stop/limit orders, market fills against a single position,
//! stop/target triggering on price updates, and push events. It also
//! reproduces the broker behaviors that caused order duplication in the
//! past: listing lag after placement, transient failures, and requests
//! that are applied even though the call reports an error.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use bracket_domain::{BrokerOrderId, Instrument, OrderSide, Price, ProtectiveKind, Side};

use crate::error::{ExecError, ExecResult};
use crate::ports::{
    BrokerEvent, BrokerGateway, BrokerOrder, BrokerPosition, OrderChange, OrderKind, OrderRequest, Quote,
};

// =============================================================================
// Failure Injection
// =============================================================================

/// Gateway operations that can be failed on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubOp {
    Place,
    Modify,
    Cancel,
    ListOrders,
    Position,
    Quote,
}

/// How an injected failure behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubFailure {
    /// Request not applied, transient error returned
    Transient,
    /// Request not applied, irrecoverable rejection returned
    Rejected,
    /// Request applied, but the caller sees a transient error
    AppliedThenTimeout,
    /// Mutation acknowledged but never applied; read calls see a transient error
    Ignored,
}

// =============================================================================
// State
// =============================================================================

struct StubOrder {
    order: BrokerOrder,
    /// Listing calls that will still miss this order
    hidden_for: u32,
}

struct StubState {
    orders: Vec<StubOrder>,
    position: Option<BrokerPosition>,
    price: Price,
    order_counter: u64,
    trade_counter: u64,
    last_created: DateTime<Utc>,
    listing_lag: u32,
    failures: HashMap<StubOp, VecDeque<StubFailure>>,
    calls: HashMap<StubOp, u32>,
    subscribers: Vec<mpsc::UnboundedSender<BrokerEvent>>,
}

// =============================================================================
// Stub Broker
// =============================================================================

/// In-memory single-instrument broker.
pub struct StubBroker {
    instrument: Instrument,
    latency: Duration,
    state: Mutex<StubState>,
}

impl StubBroker {
    /// Create a flat broker quoting `price`.
    pub fn new(instrument: Instrument, price: Price) -> Self {
        Self {
            instrument,
            latency: Duration::ZERO,
            state: Mutex::new(StubState {
                orders: Vec::new(),
                position: None,
                price,
                order_counter: 0,
                trade_counter: 0,
                last_created: Utc::now(),
                listing_lag: 0,
                failures: HashMap::new(),
                calls: HashMap::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Delay every gateway call, so concurrent callers interleave.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    // -------------------------------------------------------------------------
    // Test controls
    // -------------------------------------------------------------------------

    /// New orders stay invisible to the next `lag` listing calls.
    pub fn set_listing_lag(&self, lag: u32) {
        self.state().listing_lag = lag;
    }

    /// Queue a failure for the next call of `op`.
    pub fn fail_next(&self, op: StubOp, failure: StubFailure) {
        self.state().failures.entry(op).or_default().push_back(failure);
    }

    /// Number of calls made to `op`, including failed ones.
    pub fn calls(&self, op: StubOp) -> u32 {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// Add a working order as if someone else had placed it. Visible immediately.
    pub fn inject_order(&self, kind: ProtectiveKind, side: OrderSide, size: u32, price: Price) -> BrokerOrderId {
        let mut state = self.state();
        let order_id = Self::next_order_id(&mut state);
        let created_at = Self::next_created_at(&mut state);
        state.orders.push(StubOrder {
            order: BrokerOrder {
                order_id: order_id.clone(),
                instrument: self.instrument.contract_id.clone(),
                kind: OrderKind::for_protective(kind),
                side,
                size,
                price: Some(price),
                created_at,
            },
            hidden_for: 0,
        });
        order_id
    }

    /// Drop an order without telling anyone (silent expiry).
    pub fn remove_order(&self, order_id: &str) {
        self.state().orders.retain(|o| o.order.order_id != order_id);
    }

    /// Change an order's size behind the engine's back.
    pub fn set_order_size(&self, order_id: &str, size: u32) {
        if let Some(o) = self.state().orders.iter_mut().find(|o| o.order.order_id == order_id) {
            o.order.size = size;
        }
    }

    /// Every working order, ignoring listing lag.
    pub fn open_orders(&self) -> Vec<BrokerOrder> {
        self.state().orders.iter().map(|o| o.order.clone()).collect()
    }

    /// Working orders of one protective kind, ignoring listing lag.
    pub fn orders_of(&self, kind: ProtectiveKind) -> Vec<BrokerOrder> {
        self.open_orders()
            .into_iter()
            .filter(|o| o.kind.as_protective() == Some(kind))
            .collect()
    }

    pub fn set_position(&self, side: Side, size: u32, average_price: Price) {
        self.state().position = Some(BrokerPosition {
            instrument: self.instrument.contract_id.clone(),
            side,
            size,
            average_price,
        });
    }

    pub fn clear_position(&self) {
        self.state().position = None;
    }

    pub fn position(&self) -> Option<BrokerPosition> {
        self.state().position.clone()
    }

    /// Subscribe to push events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BrokerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().subscribers.push(tx);
        rx
    }

    /// Push an arbitrary event to subscribers.
    pub fn emit(&self, event: BrokerEvent) {
        let mut state = self.state();
        Self::broadcast(&mut state, vec![event]);
    }

    /// Move the market. Working stops and targets the price crosses fill
    /// against the open position; a quote event is pushed either way.
    pub fn set_price(&self, price: Price) {
        let mut state = self.state();
        state.price = price;

        let mut events = Vec::new();
        let mut i = 0;
        while i < state.orders.len() {
            let Some(position) = state.position.clone() else {
                break;
            };
            let order = &state.orders[i].order;
            let exits_position = order.side == position.side.exit_action();
            let triggered = match (order.kind, order.side, order.price) {
                (OrderKind::Stop, OrderSide::Sell, Some(p)) => price <= p,
                (OrderKind::Stop, OrderSide::Buy, Some(p)) => price >= p,
                (OrderKind::Limit, OrderSide::Sell, Some(p)) => price >= p,
                (OrderKind::Limit, OrderSide::Buy, Some(p)) => price <= p,
                _ => false,
            };
            if !(exits_position && triggered) {
                i += 1;
                continue;
            }

            let filled = state.orders.remove(i).order;
            let fill_price = filled.price.unwrap_or(price);
            let size = filled.size.min(position.size);
            debug!(order_id = %filled.order_id, kind = ?filled.kind, %fill_price, size, "Stub: order triggered");
            events.extend(self.apply_fill(&mut state, filled.side, size, fill_price));
        }

        events.push(BrokerEvent::Quote(Quote {
            instrument: self.instrument.contract_id.clone(),
            price,
            timestamp: Utc::now(),
        }));
        Self::broadcast(&mut state, events);
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn next_order_id(state: &mut StubState) -> BrokerOrderId {
        state.order_counter += 1;
        format!("STUB-{}", state.order_counter)
    }

    /// Strictly increasing creation timestamps.
    fn next_created_at(state: &mut StubState) -> DateTime<Utc> {
        let now = Utc::now();
        let created = if now > state.last_created {
            now
        } else {
            state.last_created + ChronoDuration::microseconds(1)
        };
        state.last_created = created;
        created
    }

    /// Record the call and pop the next injected failure, if any.
    fn begin(&self, state: &mut StubState, op: StubOp) -> Option<StubFailure> {
        *state.calls.entry(op).or_insert(0) += 1;
        state.failures.get_mut(&op).and_then(VecDeque::pop_front)
    }

    fn fail(failure: StubFailure, op: StubOp) -> ExecError {
        match failure {
            StubFailure::Rejected => ExecError::Rejected(format!("stub rejected {:?}", op)),
            StubFailure::Transient | StubFailure::AppliedThenTimeout | StubFailure::Ignored => {
                ExecError::Transient(format!("stub timeout on {:?}", op))
            }
        }
    }

    fn broadcast(state: &mut StubState, events: Vec<BrokerEvent>) {
        state.subscribers.retain(|tx| events.iter().all(|e| tx.send(e.clone()).is_ok()));
    }

    /// Fill `size` contracts on `side` at `price` against the position.
    fn apply_fill(&self, state: &mut StubState, side: OrderSide, size: u32, price: Price) -> Vec<BrokerEvent> {
        state.trade_counter += 1;
        let trade_id = format!("T-{}", state.trade_counter);
        let instrument = self.instrument.contract_id.clone();
        let opening_side = if side == OrderSide::Buy { Side::Long } else { Side::Short };

        let (pnl, position) = match state.position.take() {
            None => (
                None,
                Some(BrokerPosition {
                    instrument: instrument.clone(),
                    side: opening_side,
                    size,
                    average_price: price,
                }),
            ),
            Some(pos) if pos.side == opening_side => {
                let total = pos.size + size;
                let weighted = pos.average_price.as_decimal() * Decimal::from(pos.size)
                    + price.as_decimal() * Decimal::from(size);
                let average = Price::new(weighted / Decimal::from(total)).unwrap_or(price);
                (
                    None,
                    Some(BrokerPosition {
                        size: total,
                        average_price: average,
                        ..pos
                    }),
                )
            }
            Some(pos) => {
                let closed = size.min(pos.size);
                let pnl = self.instrument.pnl(pos.side, pos.average_price, price, closed);
                let position = if size < pos.size {
                    Some(BrokerPosition {
                        size: pos.size - size,
                        ..pos
                    })
                } else if size > pos.size {
                    Some(BrokerPosition {
                        instrument: instrument.clone(),
                        side: opening_side,
                        size: size - pos.size,
                        average_price: price,
                    })
                } else {
                    None
                };
                (Some(pnl), position)
            }
        };

        let new_size = position.as_ref().map(|p| p.size).unwrap_or(0);
        state.position = position;

        vec![
            BrokerEvent::Trade {
                trade_id,
                instrument: instrument.clone(),
                size,
                pnl,
                timestamp: Utc::now(),
            },
            BrokerEvent::PositionChanged {
                instrument,
                size: new_size,
            },
        ]
    }
}

#[async_trait]
impl BrokerGateway for StubBroker {
    async fn place_order(&self, request: &OrderRequest) -> ExecResult<BrokerOrderId> {
        self.pause().await;
        let mut state = self.state();
        let failure = self.begin(&mut state, StubOp::Place);
        if let Some(f @ (StubFailure::Transient | StubFailure::Rejected)) = failure {
            return Err(Self::fail(f, StubOp::Place));
        }
        if failure == Some(StubFailure::Ignored) {
            let order_id = Self::next_order_id(&mut state);
            debug!(%order_id, "Stub: placement acknowledged, not applied");
            return Ok(order_id);
        }

        if request.instrument != self.instrument.contract_id {
            return Err(ExecError::Rejected(format!("unknown instrument {}", request.instrument)));
        }
        if request.size == 0 {
            return Err(ExecError::Rejected("size must be positive".to_string()));
        }

        let order_id = Self::next_order_id(&mut state);
        match request.kind {
            OrderKind::Market => {
                let price = state.price;
                let events = self.apply_fill(&mut state, request.side, request.size, price);
                Self::broadcast(&mut state, events);
            }
            OrderKind::Stop | OrderKind::Limit => {
                let Some(price) = request.price else {
                    return Err(ExecError::Rejected(format!("{:?} order requires a price", request.kind)));
                };
                let created_at = Self::next_created_at(&mut state);
                let hidden_for = state.listing_lag;
                state.orders.push(StubOrder {
                    order: BrokerOrder {
                        order_id: order_id.clone(),
                        instrument: request.instrument.clone(),
                        kind: request.kind,
                        side: request.side,
                        size: request.size,
                        price: Some(price),
                        created_at,
                    },
                    hidden_for,
                });
            }
        }
        debug!(%order_id, kind = ?request.kind, side = %request.side, size = request.size, "Stub: order placed");

        match failure {
            Some(f) => Err(Self::fail(f, StubOp::Place)),
            None => Ok(order_id),
        }
    }

    async fn modify_order(&self, order_id: &str, change: &OrderChange) -> ExecResult<()> {
        self.pause().await;
        let mut state = self.state();
        let failure = self.begin(&mut state, StubOp::Modify);
        if let Some(f @ (StubFailure::Transient | StubFailure::Rejected)) = failure {
            return Err(Self::fail(f, StubOp::Modify));
        }
        if failure == Some(StubFailure::Ignored) {
            debug!(order_id, "Stub: modify acknowledged, not applied");
            return Ok(());
        }
        if change.size == Some(0) {
            return Err(ExecError::Rejected("size must be positive".to_string()));
        }

        let Some(entry) = state.orders.iter_mut().find(|o| o.order.order_id == order_id) else {
            return Err(ExecError::OrderNotFound(order_id.to_string()));
        };
        if let Some(size) = change.size {
            entry.order.size = size;
        }
        if let Some(price) = change.price {
            entry.order.price = Some(price);
        }
        debug!(order_id, ?change, "Stub: order modified");

        match failure {
            Some(f) => Err(Self::fail(f, StubOp::Modify)),
            None => Ok(()),
        }
    }

    async fn cancel_order(&self, order_id: &str) -> ExecResult<()> {
        self.pause().await;
        let mut state = self.state();
        let failure = self.begin(&mut state, StubOp::Cancel);
        if let Some(f @ (StubFailure::Transient | StubFailure::Rejected)) = failure {
            return Err(Self::fail(f, StubOp::Cancel));
        }
        if failure == Some(StubFailure::Ignored) {
            debug!(order_id, "Stub: cancel acknowledged, not applied");
            return Ok(());
        }

        let before = state.orders.len();
        state.orders.retain(|o| o.order.order_id != order_id);
        if state.orders.len() == before {
            return Err(ExecError::OrderNotFound(order_id.to_string()));
        }
        debug!(order_id, "Stub: order cancelled");

        match failure {
            Some(f) => Err(Self::fail(f, StubOp::Cancel)),
            None => Ok(()),
        }
    }

    async fn list_open_orders(&self, instrument: &str) -> ExecResult<Vec<BrokerOrder>> {
        self.pause().await;
        let mut state = self.state();
        if let Some(f) = self.begin(&mut state, StubOp::ListOrders) {
            return Err(Self::fail(f, StubOp::ListOrders));
        }

        let mut visible = Vec::new();
        for entry in state.orders.iter_mut() {
            if entry.hidden_for > 0 {
                entry.hidden_for -= 1;
                continue;
            }
            if entry.order.instrument == instrument {
                visible.push(entry.order.clone());
            }
        }
        Ok(visible)
    }

    async fn get_position(&self, instrument: &str) -> ExecResult<Option<BrokerPosition>> {
        self.pause().await;
        let mut state = self.state();
        if let Some(f) = self.begin(&mut state, StubOp::Position) {
            return Err(Self::fail(f, StubOp::Position));
        }
        Ok(state.position.clone().filter(|p| p.instrument == instrument))
    }

    async fn get_quote(&self, instrument: &str) -> ExecResult<Quote> {
        self.pause().await;
        let mut state = self.state();
        if let Some(f) = self.begin(&mut state, StubOp::Quote) {
            return Err(Self::fail(f, StubOp::Quote));
        }
        Ok(Quote {
            instrument: instrument.to_string(),
            price: state.price,
            timestamp: Utc::now(),
        })
    }

    async fn health_check(&self) -> ExecResult<()> {
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
