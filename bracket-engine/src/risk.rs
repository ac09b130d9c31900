//! Risk decisions for an open position.
//!
//! # Decision Order
//!
//! ```text
//! price ──► favorable extreme ──► partial exit? ──► break-even? ──► trail?
//! ```
//!
//! Each decision looks only at the position's completed phases and prices,
//! so evaluating the same inputs twice yields the same actions. Whoever
//! applies an action re-checks it against the ledger under the relevant
//! mutation lock; an action here is a proposal, not a command.

use bracket_domain::{
    update_trailing_stop, Contracts, DomainError, Position, Price, RiskPhase,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

// =============================================================================
// Errors
// =============================================================================

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Domain validation failed
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Settings out of range
    #[error("Invalid risk settings: {0}")]
    InvalidSettings(String),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

// =============================================================================
// Settings
// =============================================================================

/// Thresholds for the risk transitions, in R multiples of the initial risk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSettings {
    pub break_even_enabled: bool,
    /// Unrealized R at which the stop moves to entry
    pub break_even_trigger_r: Decimal,
    /// Favorable ticks that trigger break-even before the R threshold
    pub early_break_even_ticks: Option<u32>,

    pub partial_exit_enabled: bool,
    /// Unrealized R at which part of the position is closed
    pub partial_exit_r: Decimal,
    /// Fraction of the open contracts to close
    pub partial_exit_fraction: Decimal,
    /// After the partial, lock the stop this many R beyond entry
    pub post_partial_lock_r: Decimal,

    pub trailing_enabled: bool,
    /// Unrealized R at which trailing starts
    pub trailing_activation_r: Decimal,
    /// Distance kept behind the favorable extreme, in R
    pub trailing_distance_r: Decimal,
}

impl RiskSettings {
    /// Reject settings that would produce nonsense actions.
    pub fn validate(&self) -> EngineResult<()> {
        if self.partial_exit_fraction <= Decimal::ZERO || self.partial_exit_fraction >= Decimal::ONE {
            return Err(EngineError::InvalidSettings(format!(
                "partial_exit_fraction must be in (0, 1), got {}",
                self.partial_exit_fraction
            )));
        }
        for (name, value) in [
            ("break_even_trigger_r", self.break_even_trigger_r),
            ("partial_exit_r", self.partial_exit_r),
            ("trailing_activation_r", self.trailing_activation_r),
            ("trailing_distance_r", self.trailing_distance_r),
        ] {
            if value <= Decimal::ZERO {
                return Err(EngineError::InvalidSettings(format!("{} must be positive, got {}", name, value)));
            }
        }
        if self.post_partial_lock_r < Decimal::ZERO || self.post_partial_lock_r >= self.partial_exit_r {
            return Err(EngineError::InvalidSettings(format!(
                "post_partial_lock_r must be in [0, partial_exit_r), got {}",
                self.post_partial_lock_r
            )));
        }
        Ok(())
    }
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            break_even_enabled: true,
            break_even_trigger_r: dec!(1.0),
            early_break_even_ticks: Some(40),
            partial_exit_enabled: true,
            partial_exit_r: dec!(1.0),
            partial_exit_fraction: dec!(0.5),
            post_partial_lock_r: dec!(0.5),
            trailing_enabled: true,
            trailing_activation_r: dec!(1.0),
            trailing_distance_r: dec!(0.4),
        }
    }
}

// =============================================================================
// Actions
// =============================================================================

/// A risk transition that is due.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskAction {
    /// The phase's goal already holds; mark it done without touching the broker
    CompletePhase {
        phase: RiskPhase,
        reason: &'static str,
    },
    /// Modify the stop in place to the entry price
    MoveStopToBreakEven { stop_price: Price },
    /// Close `exit_size` contracts at market
    TakePartial {
        exit_size: u32,
        remaining: Contracts,
        /// Tighter stop to apply with the resize, if it improves the current one
        locked_stop: Option<Price>,
    },
    /// Tighten the stop
    TrailStop { new_stop: Price },
}

/// Output of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskEvaluation {
    /// Favorable extreme including the evaluated price
    pub favorable_extreme: Price,
    /// Unrealized R at the evaluated price
    pub r_multiple: Decimal,
    pub actions: Vec<RiskAction>,
}

// =============================================================================
// Engine
// =============================================================================

/// Stateless evaluator of break-even, partial exit and trailing rules.
#[derive(Debug, Clone)]
pub struct RiskEngine {
    settings: RiskSettings,
}

impl RiskEngine {
    pub fn new(settings: RiskSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RiskSettings {
        &self.settings
    }

    /// Evaluate every rule at `price`.
    pub fn evaluate(&self, position: &Position, price: Price) -> RiskEvaluation {
        let favorable_extreme = position.side.favorable_extreme(position.favorable_extreme, price);
        let r_multiple = position.r_multiple(price);

        let actions: Vec<RiskAction> = [
            self.partial_exit(position, price),
            self.break_even(position, price),
            self.trailing(position, price),
        ]
        .into_iter()
        .flatten()
        .collect();

        trace!(
            position_id = %position.id,
            %price,
            %r_multiple,
            actions = actions.len(),
            "Risk evaluation"
        );

        RiskEvaluation {
            favorable_extreme,
            r_multiple,
            actions,
        }
    }

    /// Break-even rule.
    pub fn break_even(&self, position: &Position, price: Price) -> Option<RiskAction> {
        if !self.settings.break_even_enabled || position.phases.is_complete(RiskPhase::BreakEven) {
            return None;
        }
        if position.risk_per_contract().is_zero() {
            return None;
        }

        let by_r = position.r_multiple(price) >= self.settings.break_even_trigger_r;
        let by_ticks = self.settings.early_break_even_ticks.is_some_and(|ticks| {
            position.side.excursion(position.entry_price, price) >= position.instrument.ticks(ticks)
        });
        if !(by_r || by_ticks) {
            return None;
        }

        if !position
            .side
            .is_more_favorable_stop(position.entry_price, position.stop_price)
        {
            return Some(RiskAction::CompletePhase {
                phase: RiskPhase::BreakEven,
                reason: "stop already at or beyond entry",
            });
        }

        Some(RiskAction::MoveStopToBreakEven {
            stop_price: position.entry_price,
        })
    }

    /// Partial-exit rule.
    pub fn partial_exit(&self, position: &Position, price: Price) -> Option<RiskAction> {
        if !self.settings.partial_exit_enabled || position.phases.is_complete(RiskPhase::PartialExit) {
            return None;
        }
        if position.risk_per_contract().is_zero()
            || position.r_multiple(price) < self.settings.partial_exit_r
        {
            return None;
        }

        let exit_size = position.quantity.fraction(self.settings.partial_exit_fraction);
        let Some(remaining) = position.quantity.checked_reduce(exit_size) else {
            return Some(RiskAction::CompletePhase {
                phase: RiskPhase::PartialExit,
                reason: "position too small to split",
            });
        };

        let raw_lock = position.entry_price.as_decimal()
            + position.side.direction() * self.settings.post_partial_lock_r * position.risk_per_contract();
        let locked_stop = position
            .instrument
            .round_price(raw_lock)
            .ok()
            .filter(|lock| position.side.is_more_favorable_stop(*lock, position.stop_price));

        Some(RiskAction::TakePartial {
            exit_size,
            remaining,
            locked_stop,
        })
    }

    /// Trailing rule.
    pub fn trailing(&self, position: &Position, price: Price) -> Option<RiskAction> {
        if !self.settings.trailing_enabled || position.risk_per_contract().is_zero() {
            return None;
        }
        if position.r_multiple(price) < self.settings.trailing_activation_r {
            return None;
        }

        let distance = self.settings.trailing_distance_r * position.risk_per_contract();
        update_trailing_stop(
            position.side,
            price,
            position.favorable_extreme,
            position.stop_price,
            distance,
            position.instrument.tick_size,
        )
        .map(|update| RiskAction::TrailStop {
            new_stop: update.new_stop,
        })
    }
}

impl Default for RiskEngine {
    fn default() -> Self {
        Self::new(RiskSettings::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
