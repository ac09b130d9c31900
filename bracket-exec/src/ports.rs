//! Execution layer port definitions.
//!
//! [`BrokerGateway`] is the only way the engine touches the broker.
//! Adapters implement it for a concrete broker (ProjectX REST) or for tests
//! (`StubBroker`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use bracket_domain::{BrokerOrderId, OrderSide, Price, ProtectiveKind, Side};

use crate::error::ExecResult;

// =============================================================================
// Broker Gateway
// =============================================================================

/// Port for broker operations.
///
/// The broker is the source of truth. An order that exists will eventually
/// appear in `list_open_orders`, but not necessarily right after
/// `place_order` returns.
///
/// Implementations:
/// - `StubBroker` - in-memory broker with lag and failure injection
/// - `ProjectXGateway` - ProjectX / TopstepX REST API
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Submit an order. Returns the broker order id.
    async fn place_order(&self, request: &OrderRequest) -> ExecResult<BrokerOrderId>;

    /// Change size and/or price of a working order in a single call.
    async fn modify_order(&self, order_id: &str, change: &OrderChange) -> ExecResult<()>;

    /// Cancel a working order.
    async fn cancel_order(&self, order_id: &str) -> ExecResult<()>;

    /// Working orders for an instrument.
    async fn list_open_orders(&self, instrument: &str) -> ExecResult<Vec<BrokerOrder>>;

    /// Open position for an instrument, `None` when flat.
    async fn get_position(&self, instrument: &str) -> ExecResult<Option<BrokerPosition>>;

    /// Last traded price.
    async fn get_quote(&self, instrument: &str) -> ExecResult<Quote>;

    /// Check if the broker is reachable and authenticated.
    async fn health_check(&self) -> ExecResult<()>;
}

// =============================================================================
// Orders
// =============================================================================

/// Broker-level order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
}

impl OrderKind {
    /// Order type carrying a protective kind: stops are stop orders,
    /// targets are limit orders.
    pub fn for_protective(kind: ProtectiveKind) -> Self {
        match kind {
            ProtectiveKind::Stop => OrderKind::Stop,
            ProtectiveKind::Target => OrderKind::Limit,
        }
    }

    pub fn as_protective(&self) -> Option<ProtectiveKind> {
        match self {
            OrderKind::Stop => Some(ProtectiveKind::Stop),
            OrderKind::Limit => Some(ProtectiveKind::Target),
            OrderKind::Market => None,
        }
    }
}

/// Order submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub instrument: String,
    pub kind: OrderKind,
    pub side: OrderSide,
    pub size: u32,
    /// Stop or limit price; `None` for market orders
    pub price: Option<Price>,
}

impl OrderRequest {
    pub fn market(instrument: impl Into<String>, side: OrderSide, size: u32) -> Self {
        Self {
            instrument: instrument.into(),
            kind: OrderKind::Market,
            side,
            size,
            price: None,
        }
    }

    pub fn protective(
        kind: ProtectiveKind,
        instrument: impl Into<String>,
        side: OrderSide,
        size: u32,
        price: Price,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            kind: OrderKind::for_protective(kind),
            side,
            size,
            price: Some(price),
        }
    }
}

/// Modification of a working order. Both fields go out in one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderChange {
    pub size: Option<u32>,
    pub price: Option<Price>,
}

impl OrderChange {
    pub fn size(size: u32) -> Self {
        Self {
            size: Some(size),
            price: None,
        }
    }

    pub fn price(price: Price) -> Self {
        Self {
            size: None,
            price: Some(price),
        }
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.size.is_none() && self.price.is_none()
    }
}

/// A working order as reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub order_id: BrokerOrderId,
    pub instrument: String,
    pub kind: OrderKind,
    pub side: OrderSide,
    pub size: u32,
    pub price: Option<Price>,
    pub created_at: DateTime<Utc>,
}

impl BrokerOrder {
    /// Whether this order could be the `kind` protective order of a position
    /// on `instrument` whose exit side is `side`.
    pub fn matches(&self, kind: ProtectiveKind, instrument: &str, side: OrderSide) -> bool {
        self.kind.as_protective() == Some(kind) && self.instrument == instrument && self.side == side
    }
}

// =============================================================================
// Positions, Quotes, Push Events
// =============================================================================

/// Position as reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub instrument: String,
    pub side: Side,
    pub size: u32,
    pub average_price: Price,
}

/// Last traded price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub instrument: String,
    pub price: Price,
    pub timestamp: DateTime<Utc>,
}

/// Push events from the broker connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerEvent {
    /// A fill. `pnl` is set when the fill reduced a position.
    Trade {
        trade_id: String,
        instrument: String,
        size: u32,
        pnl: Option<Decimal>,
        timestamp: DateTime<Utc>,
    },
    /// Position size changed; zero means flat.
    PositionChanged { instrument: String, size: u32 },
    /// Price update.
    Quote(Quote),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(kind: OrderKind, side: OrderSide) -> BrokerOrder {
        BrokerOrder {
            order_id: "1".to_string(),
            instrument: "CON.F.US.MGC.Z25".to_string(),
            kind,
            side,
            size: 2,
            price: Some(Price::new(dec!(2645)).unwrap()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_matches_requires_kind_side_and_instrument() {
        let stop = order(OrderKind::Stop, OrderSide::Sell);
        assert!(stop.matches(ProtectiveKind::Stop, "CON.F.US.MGC.Z25", OrderSide::Sell));
        assert!(!stop.matches(ProtectiveKind::Target, "CON.F.US.MGC.Z25", OrderSide::Sell));
        assert!(!stop.matches(ProtectiveKind::Stop, "CON.F.US.MGC.Z25", OrderSide::Buy));
        assert!(!stop.matches(ProtectiveKind::Stop, "CON.F.US.GC.Z25", OrderSide::Sell));

        // A buy limit is an entry order for a long, not its target
        let entry_limit = order(OrderKind::Limit, OrderSide::Buy);
        assert!(!entry_limit.matches(ProtectiveKind::Target, "CON.F.US.MGC.Z25", OrderSide::Sell));
    }

    #[test]
    fn test_order_change_builders() {
        let change = OrderChange::price(Price::new(dec!(2650)).unwrap()).with_size(4);
        assert_eq!(change.size, Some(4));
        assert!(!change.is_empty());
        assert!(OrderChange::default().is_empty());
    }

    #[test]
    fn test_broker_event_serialization() {
        let event = BrokerEvent::PositionChanged {
            instrument: "CON.F.US.MGC.Z25".to_string(),
            size: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "position_changed");
        assert_eq!(json["size"], 0);
    }
}
