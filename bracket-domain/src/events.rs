//! Engine events for Bracket
//!
//! Every repair, cleanup, rejection and risk transition is published as an
//! [`EngineEvent`]. An operator must be able to tell from the event stream
//! alone why the number of live orders changed.

use crate::entities::{BrokerOrderId, PositionId};
use crate::value_objects::{Price, ProtectiveKind, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How a protective order was restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    /// An existing untracked broker order was adopted
    Adopted,
    /// A new order was placed and verified
    Placed,
}

/// Which path detected that a position closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseSource {
    /// Trade callback from the broker connection
    TradeCallback,
    /// Position-changed push event reporting size zero
    PositionEvent,
    /// Periodic status poll found no broker position
    StatusPoll,
    /// Operator-requested flatten
    Panic,
}

/// Structured events emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Entry filled and initial brackets submitted
    PositionOpened {
        /// Position identifier
        position_id: PositionId,
        /// Contract id
        instrument: String,
        /// Direction
        side: Side,
        /// Filled contracts
        quantity: u32,
        /// Average fill price
        entry_price: Price,
        /// Initial stop
        stop_price: Price,
        /// Initial target
        target_price: Price,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// Position reached size zero and was torn down
    PositionClosed {
        /// Position identifier
        position_id: PositionId,
        /// Total realized P&L
        realized_pnl: Decimal,
        /// Detection path that saw the close first
        detected_by: CloseSource,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// An entry request was refused
    EntryRejected {
        /// Human-readable reason
        reason: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// A missing or stale protective order was restored
    ProtectiveOrderRepaired {
        /// Position identifier
        position_id: PositionId,
        /// Stop or target
        kind: ProtectiveKind,
        /// Stale tracked id, if there was one
        old_id: Option<BrokerOrderId>,
        /// Id now tracked
        new_id: BrokerOrderId,
        /// Adopted or placed
        action: RepairAction,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// A protective order was resized in place
    ProtectiveOrderResized {
        /// Position identifier
        position_id: PositionId,
        /// Stop or target
        kind: ProtectiveKind,
        /// Order modified
        order_id: BrokerOrderId,
        /// Size before
        from_size: u32,
        /// Size after
        to_size: u32,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// Duplicate protective orders were cancelled
    DuplicateOrdersCleaned {
        /// Position identifier
        position_id: PositionId,
        /// Stop or target
        kind: ProtectiveKind,
        /// Order kept and tracked
        kept_id: BrokerOrderId,
        /// Orders cancelled
        cancelled_ids: Vec<BrokerOrderId>,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// Stop moved to entry
    BreakEvenApplied {
        /// Position identifier
        position_id: PositionId,
        /// New stop price
        stop_price: Price,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// Part of the position closed at market
    PartialExitApplied {
        /// Position identifier
        position_id: PositionId,
        /// Contracts closed
        filled_size: u32,
        /// Contracts still open
        remaining_size: u32,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// Trailing stop tightened
    TrailingStopUpdated {
        /// Position identifier
        position_id: PositionId,
        /// Stop before
        previous_stop: Price,
        /// Stop after
        new_stop: Price,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// Consecutive losses halted new entries
    CircuitBreakerTripped {
        /// Entries resume after this instant
        until: DateTime<Utc>,
        /// Losses that tripped it
        consecutive_losses: u32,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// Realized plus open P&L crossed the daily loss limit; the position is
    /// flattened and entries stay blocked until the next trading day
    DailyLossLimitHit {
        /// Position flattened
        position_id: PositionId,
        /// Realized today plus the open position's P&L
        total_pnl: Decimal,
        /// Price the open P&L was valued at
        price: Price,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// The engine cannot proceed safely on its own
    ManualInterventionRequired {
        /// Position concerned, if any
        position_id: Option<PositionId>,
        /// What went wrong
        reason: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Snake-case event name, as serialized in `type`.
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::PositionOpened { .. } => "position_opened",
            EngineEvent::PositionClosed { .. } => "position_closed",
            EngineEvent::EntryRejected { .. } => "entry_rejected",
            EngineEvent::ProtectiveOrderRepaired { .. } => "protective_order_repaired",
            EngineEvent::ProtectiveOrderResized { .. } => "protective_order_resized",
            EngineEvent::DuplicateOrdersCleaned { .. } => "duplicate_orders_cleaned",
            EngineEvent::BreakEvenApplied { .. } => "break_even_applied",
            EngineEvent::PartialExitApplied { .. } => "partial_exit_applied",
            EngineEvent::TrailingStopUpdated { .. } => "trailing_stop_updated",
            EngineEvent::CircuitBreakerTripped { .. } => "circuit_breaker_tripped",
            EngineEvent::DailyLossLimitHit { .. } => "daily_loss_limit_hit",
            EngineEvent::ManualInterventionRequired { .. } => "manual_intervention_required",
        }
    }

    /// Position the event concerns, if any.
    pub fn position_id(&self) -> Option<PositionId> {
        match self {
            EngineEvent::PositionOpened { position_id, .. }
            | EngineEvent::PositionClosed { position_id, .. }
            | EngineEvent::ProtectiveOrderRepaired { position_id, .. }
            | EngineEvent::ProtectiveOrderResized { position_id, .. }
            | EngineEvent::DuplicateOrdersCleaned { position_id, .. }
            | EngineEvent::BreakEvenApplied { position_id, .. }
            | EngineEvent::PartialExitApplied { position_id, .. }
            | EngineEvent::TrailingStopUpdated { position_id, .. }
            | EngineEvent::DailyLossLimitHit { position_id, .. } => Some(*position_id),
            EngineEvent::ManualInterventionRequired { position_id, .. } => *position_id,
            EngineEvent::EntryRejected { .. } | EngineEvent::CircuitBreakerTripped { .. } => None,
        }
    }

    /// When the event happened.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EngineEvent::PositionOpened { timestamp, .. }
            | EngineEvent::PositionClosed { timestamp, .. }
            | EngineEvent::EntryRejected { timestamp, .. }
            | EngineEvent::ProtectiveOrderRepaired { timestamp, .. }
            | EngineEvent::ProtectiveOrderResized { timestamp, .. }
            | EngineEvent::DuplicateOrdersCleaned { timestamp, .. }
            | EngineEvent::BreakEvenApplied { timestamp, .. }
            | EngineEvent::PartialExitApplied { timestamp, .. }
            | EngineEvent::TrailingStopUpdated { timestamp, .. }
            | EngineEvent::CircuitBreakerTripped { timestamp, .. }
            | EngineEvent::DailyLossLimitHit { timestamp, .. }
            | EngineEvent::ManualInterventionRequired { timestamp, .. } => *timestamp,
        }
    }
}
