//! Value Objects for the Bracket domain
//!
//! Immutable types with validation. Prices are `Decimal` (never floats);
//! quantities are whole futures contracts.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// Domain validation errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DomainError {
    /// Price must be strictly positive
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    /// Quantity must be a positive whole number of contracts
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Instrument definition is unusable (empty id, non-positive tick)
    #[error("Invalid instrument: {0}")]
    InvalidInstrument(String),

    /// Trade signal failed validation
    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    /// Risk settings out of range
    #[error("Invalid risk settings: {0}")]
    InvalidRiskSettings(String),
}

// =============================================================================
// Price
// =============================================================================

/// A strictly positive price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(Decimal);

impl Price {
    /// Create a new price.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidPrice` if `value <= 0`.
    pub fn new(value: Decimal) -> Result<Self, DomainError> {
        if value <= Decimal::ZERO {
            return Err(DomainError::InvalidPrice(format!("price must be positive, got {}", value)));
        }
        Ok(Self(value))
    }

    /// Underlying decimal value.
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Round to the nearest multiple of `tick_size` (midpoint away from zero).
    pub fn round_to_tick(&self, tick_size: Decimal) -> Result<Price, DomainError> {
        Price::new(round_to_tick(self.0, tick_size))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Round a raw decimal to the nearest tick.
pub fn round_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size <= Decimal::ZERO {
        return value;
    }
    (value / tick_size).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero) * tick_size
}

// =============================================================================
// Contracts
// =============================================================================

/// A positive whole number of futures contracts.
///
/// A position whose size would reach zero is closed, so there is no zero
/// value: reductions go through [`Contracts::checked_reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Contracts(u32);

impl Contracts {
    /// A single contract.
    pub const ONE: Contracts = Contracts(1);

    /// Create a contract count.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidQuantity` if `value == 0`.
    pub fn new(value: u32) -> Result<Self, DomainError> {
        if value == 0 {
            return Err(DomainError::InvalidQuantity("contract count must be positive".to_string()));
        }
        Ok(Self(value))
    }

    /// Number of contracts.
    pub fn get(&self) -> u32 {
        self.0
    }

    /// Remaining contracts after reducing by `by`; `None` when nothing remains.
    pub fn checked_reduce(&self, by: u32) -> Option<Contracts> {
        self.0.checked_sub(by).filter(|rest| *rest > 0).map(Contracts)
    }

    /// `max(1, floor(self * fraction))`, the size of a fractional exit.
    pub fn fraction(&self, fraction: Decimal) -> u32 {
        let raw = (Decimal::from(self.0) * fraction).floor().to_u32().unwrap_or(0);
        raw.max(1)
    }
}

impl fmt::Display for Contracts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Side
// =============================================================================

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Profits when price rises
    Long,
    /// Profits when price falls
    Short,
}

impl Side {
    /// Order side that opens a position in this direction.
    pub fn entry_action(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces or closes a position in this direction.
    ///
    /// Protective orders always carry this side.
    pub fn exit_action(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }

    /// `+1` for long, `-1` for short.
    pub fn direction(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Signed price move from `entry` to `price`, positive when in profit.
    pub fn excursion(&self, entry: Price, price: Price) -> Decimal {
        (price.as_decimal() - entry.as_decimal()) * self.direction()
    }

    /// True when `candidate` protects more profit than `current`
    /// (long: higher, short: lower). Equal prices are not more favorable.
    pub fn is_more_favorable_stop(&self, candidate: Price, current: Price) -> bool {
        match self {
            Side::Long => candidate > current,
            Side::Short => candidate < current,
        }
    }

    /// The better of two prices for this direction (long: max, short: min).
    pub fn favorable_extreme(&self, a: Price, b: Price) -> Price {
        match self {
            Side::Long => a.max(b),
            Side::Short => a.min(b),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// Order side as sent to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    /// Bid
    Buy,
    /// Ask
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

// =============================================================================
// Protective Kind
// =============================================================================

/// The two protective orders guarding a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectiveKind {
    /// Stop-loss (a stop order)
    Stop,
    /// Take-profit (a limit order)
    Target,
}

impl ProtectiveKind {
    /// Both kinds, in reconciliation order.
    pub const ALL: [ProtectiveKind; 2] = [ProtectiveKind::Stop, ProtectiveKind::Target];
}

impl fmt::Display for ProtectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtectiveKind::Stop => write!(f, "stop"),
            ProtectiveKind::Target => write!(f, "target"),
        }
    }
}

// =============================================================================
// Instrument
// =============================================================================

/// A tradable futures contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    /// Broker contract identifier (e.g. `CON.F.US.MGC.Z25`)
    pub contract_id: String,
    /// Minimum price increment
    pub tick_size: Decimal,
    /// Currency value of one tick for one contract
    pub tick_value: Decimal,
}

impl Instrument {
    /// Create an instrument definition.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidInstrument` on an empty id or a
    /// non-positive tick size or tick value.
    pub fn new(
        contract_id: impl Into<String>,
        tick_size: Decimal,
        tick_value: Decimal,
    ) -> Result<Self, DomainError> {
        let contract_id = contract_id.into();
        if contract_id.trim().is_empty() {
            return Err(DomainError::InvalidInstrument("empty contract id".to_string()));
        }
        if tick_size <= Decimal::ZERO || tick_value <= Decimal::ZERO {
            return Err(DomainError::InvalidInstrument(format!(
                "tick size and value must be positive ({} / {})",
                tick_size, tick_value
            )));
        }
        Ok(Self {
            contract_id,
            tick_size,
            tick_value,
        })
    }

    /// Price distance covered by `ticks` ticks.
    pub fn ticks(&self, ticks: u32) -> Decimal {
        Decimal::from(ticks) * self.tick_size
    }

    /// Round a raw value to this instrument's tick grid.
    pub fn round_price(&self, value: Decimal) -> Result<Price, DomainError> {
        Price::new(round_to_tick(value, self.tick_size))
    }

    /// Realized or unrealized P&L in account currency.
    pub fn pnl(&self, side: Side, entry: Price, exit: Price, contracts: u32) -> Decimal {
        let ticks = side.excursion(entry, exit) / self.tick_size;
        ticks * self.tick_value * Decimal::from(contracts)
    }

    /// Keep a stop at least one tick on the protective side of `market`.
    ///
    /// Brokers reject a sell stop at or above the market (buy stop at or
    /// below), so a stop that the market has already reached is pulled back
    /// to one tick away.
    pub fn clamp_stop(&self, side: Side, stop: Price, market: Price) -> Result<Price, DomainError> {
        let limit = market.as_decimal() - side.direction() * self.tick_size;
        let clamped = match side {
            Side::Long if stop.as_decimal() > limit => limit,
            Side::Short if stop.as_decimal() < limit => limit,
            _ => stop.as_decimal(),
        };
        Price::new(clamped)
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.contract_id)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn mgc() -> Instrument {
        Instrument::new("CON.F.US.MGC.Z25", dec!(0.1), dec!(1)).unwrap()
    }

    #[test]
    fn test_price_rejects_non_positive() {
        assert!(Price::new(dec!(0)).is_err());
        assert!(Price::new(dec!(-1)).is_err());
        assert_eq!(Price::new(dec!(2650.3)).unwrap().as_decimal(), dec!(2650.3));
    }

    #[test]
    fn test_round_to_tick() {
        let price = Price::new(dec!(2650.34)).unwrap();
        assert_eq!(price.round_to_tick(dec!(0.1)).unwrap().as_decimal(), dec!(2650.3));

        let price = Price::new(dec!(5012.13)).unwrap();
        assert_eq!(price.round_to_tick(dec!(0.25)).unwrap().as_decimal(), dec!(5012.25));
    }

    #[test]
    fn test_contracts_reduce_and_fraction() {
        let eight = Contracts::new(8).unwrap();
        assert_eq!(eight.checked_reduce(4).unwrap().get(), 4);
        assert!(eight.checked_reduce(8).is_none());
        assert!(eight.checked_reduce(9).is_none());

        assert_eq!(eight.fraction(dec!(0.5)), 4);
        assert_eq!(Contracts::new(3).unwrap().fraction(dec!(0.5)), 1);
        assert_eq!(Contracts::new(1).unwrap().fraction(dec!(0.5)), 1);
        assert!(Contracts::new(0).is_err());
    }

    #[test]
    fn test_side_actions_and_ratchet_direction() {
        assert_eq!(Side::Long.exit_action(), OrderSide::Sell);
        assert_eq!(Side::Short.exit_action(), OrderSide::Buy);

        let low = Price::new(dec!(100)).unwrap();
        let high = Price::new(dec!(101)).unwrap();
        assert!(Side::Long.is_more_favorable_stop(high, low));
        assert!(!Side::Long.is_more_favorable_stop(low, low));
        assert!(Side::Short.is_more_favorable_stop(low, high));
    }

    #[test]
    fn test_instrument_pnl() {
        let inst = mgc();
        let entry = Price::new(dec!(2650.0)).unwrap();
        let exit = Price::new(dec!(2645.0)).unwrap();

        // 50 ticks against a long, 2 contracts, $1/tick
        assert_eq!(inst.pnl(Side::Long, entry, exit, 2), dec!(-100));
        assert_eq!(inst.pnl(Side::Short, entry, exit, 2), dec!(100));
    }

    #[test]
    fn test_clamp_stop() {
        let inst = mgc();
        let market = Price::new(dec!(2650.0)).unwrap();

        let through = Price::new(dec!(2651.0)).unwrap();
        assert_eq!(inst.clamp_stop(Side::Long, through, market).unwrap().as_decimal(), dec!(2649.9));

        let fine = Price::new(dec!(2640.0)).unwrap();
        assert_eq!(inst.clamp_stop(Side::Long, fine, market).unwrap(), fine);

        let through_short = Price::new(dec!(2649.0)).unwrap();
        assert_eq!(
            inst.clamp_stop(Side::Short, through_short, market).unwrap().as_decimal(),
            dec!(2650.1)
        );
    }

    #[test]
    fn test_instrument_validation() {
        assert!(Instrument::new("", dec!(0.1), dec!(1)).is_err());
        assert!(Instrument::new("MGC", dec!(0), dec!(1)).is_err());
    }
}
