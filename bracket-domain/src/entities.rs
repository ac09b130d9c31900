//! Domain Entities for Bracket
//!
//! Entities have identity and a lifecycle. The central one is [`Position`]:
//! an open futures position together with the prices its protective orders
//! should sit at and the risk phases it has already gone through.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::value_objects::{Contracts, DomainError, Instrument, OrderSide, Price, ProtectiveKind, Side};

// =============================================================================
// Type Aliases
// =============================================================================

/// Unique identifier for a logical position.
pub type PositionId = Uuid;

/// Broker-assigned order identifier.
pub type BrokerOrderId = String;

// =============================================================================
// Trade Signal
// =============================================================================

/// Entry request produced by the signal layer.
///
/// Opaque to the engine apart from the positivity of its distances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    /// Direction to open
    pub side: Side,
    /// Price the signal was generated at
    pub entry_price: Price,
    /// Stop distance from the fill, in ticks
    pub stop_distance_ticks: u32,
    /// Target distance from the fill, in ticks
    pub target_distance_ticks: u32,
    /// Reward-to-risk ratio the signal layer computed
    pub risk_reward_ratio: Decimal,
}

impl TradeSignal {
    /// Check that both bracket distances are positive.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.stop_distance_ticks == 0 {
            return Err(DomainError::InvalidSignal("stop distance must be positive".to_string()));
        }
        if self.target_distance_ticks == 0 {
            return Err(DomainError::InvalidSignal("target distance must be positive".to_string()));
        }
        Ok(())
    }

    /// Stop and target prices around an actual fill price.
    pub fn bracket_prices(
        &self,
        instrument: &Instrument,
        fill: Price,
    ) -> Result<(Price, Price), DomainError> {
        let direction = self.side.direction();
        let stop = fill.as_decimal() - direction * instrument.ticks(self.stop_distance_ticks);
        let target = fill.as_decimal() + direction * instrument.ticks(self.target_distance_ticks);
        Ok((instrument.round_price(stop)?, instrument.round_price(target)?))
    }
}

// =============================================================================
// Risk Phases
// =============================================================================

/// One-shot risk transitions a position can go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskPhase {
    /// Stop moved to entry
    BreakEven,
    /// Fraction of the position closed early
    PartialExit,
}

impl fmt::Display for RiskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskPhase::BreakEven => write!(f, "break_even"),
            RiskPhase::PartialExit => write!(f, "partial_exit"),
        }
    }
}

/// Continuous trailing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrailingState {
    /// No trailing move applied yet
    Idle,
    /// At least one trailing move applied
    Updated {
        /// Number of applied moves
        count: u32,
    },
}

/// Independent completed-phase flags.
///
/// Break-even and partial exit each happen at most once; trailing can
/// happen any number of times. None of them excludes the others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskPhases {
    completed: BTreeSet<RiskPhase>,
    trailing: TrailingState,
}

impl RiskPhases {
    /// No phase completed.
    pub fn new() -> Self {
        Self {
            completed: BTreeSet::new(),
            trailing: TrailingState::Idle,
        }
    }

    /// Mark a phase complete. Returns `false` if it already was.
    pub fn complete(&mut self, phase: RiskPhase) -> bool {
        self.completed.insert(phase)
    }

    /// Whether `phase` has completed.
    pub fn is_complete(&self, phase: RiskPhase) -> bool {
        self.completed.contains(&phase)
    }

    /// Record an applied trailing move.
    pub fn record_trail(&mut self) {
        self.trailing = match self.trailing {
            TrailingState::Idle => TrailingState::Updated { count: 1 },
            TrailingState::Updated { count } => TrailingState::Updated { count: count + 1 },
        };
    }

    /// Current trailing state.
    pub fn trailing(&self) -> TrailingState {
        self.trailing
    }

    /// Completed phases, in order.
    pub fn completed(&self) -> impl Iterator<Item = RiskPhase> + '_ {
        self.completed.iter().copied()
    }
}

impl Default for RiskPhases {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Position
// =============================================================================

/// An open position and the intended placement of its protective orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier
    pub id: PositionId,
    /// Contract traded
    pub instrument: Instrument,
    /// Direction
    pub side: Side,
    /// Open contracts
    pub quantity: Contracts,
    /// Average fill price
    pub entry_price: Price,
    /// When the entry filled
    pub opened_at: DateTime<Utc>,
    /// Stop price at entry; defines 1R
    pub initial_stop: Price,
    /// Price the stop order should currently sit at
    pub stop_price: Price,
    /// Price the target order should currently sit at
    pub target_price: Price,
    /// Best price seen since entry (high for long, low for short)
    pub favorable_extreme: Price,
    /// P&L already realized by partial fills
    pub realized_pnl: Decimal,
    /// Completed risk transitions
    pub phases: RiskPhases,
}

impl Position {
    /// Create a freshly opened position.
    pub fn open(
        instrument: Instrument,
        side: Side,
        quantity: Contracts,
        entry_price: Price,
        stop_price: Price,
        target_price: Price,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            instrument,
            side,
            quantity,
            entry_price,
            opened_at: Utc::now(),
            initial_stop: stop_price,
            stop_price,
            target_price,
            favorable_extreme: entry_price,
            realized_pnl: Decimal::ZERO,
            phases: RiskPhases::new(),
        }
    }

    /// Initial risk per contract in price units (1R).
    pub fn risk_per_contract(&self) -> Decimal {
        (self.entry_price.as_decimal() - self.initial_stop.as_decimal()).abs()
    }

    /// Unrealized move at `price`, in multiples of the initial risk.
    ///
    /// Zero when the initial risk is zero.
    pub fn r_multiple(&self, price: Price) -> Decimal {
        let risk = self.risk_per_contract();
        if risk.is_zero() {
            return Decimal::ZERO;
        }
        self.side.excursion(self.entry_price, price) / risk
    }

    /// Unrealized P&L of the open contracts at `price`.
    pub fn unrealized_pnl(&self, price: Price) -> Decimal {
        self.instrument
            .pnl(self.side, self.entry_price, price, self.quantity.get())
    }

    /// Side every protective order carries.
    pub fn exit_side(&self) -> OrderSide {
        self.side.exit_action()
    }

    /// Intended price of a protective order.
    pub fn protective_price(&self, kind: ProtectiveKind) -> Price {
        match kind {
            ProtectiveKind::Stop => self.stop_price,
            ProtectiveKind::Target => self.target_price,
        }
    }

    /// Fold a new price into the favorable extreme. Returns `true` on a new extreme.
    pub fn observe_price(&mut self, price: Price) -> bool {
        let extreme = self.side.favorable_extreme(self.favorable_extreme, price);
        let changed = extreme != self.favorable_extreme;
        self.favorable_extreme = extreme;
        changed
    }
}

// =============================================================================
// Protective Order
// =============================================================================

/// A stop or target order believed to guard the position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectiveOrder {
    /// Stop or target
    pub kind: ProtectiveKind,
    /// Broker order id
    pub order_id: BrokerOrderId,
    /// Exit side of the position
    pub side: OrderSide,
    /// Contracts covered
    pub size: u32,
    /// Working price
    pub price: Price,
}

// =============================================================================
// Tests
// =============================================================================
