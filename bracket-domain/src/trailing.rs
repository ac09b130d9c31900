//! Trailing Stop Logic (Pure Functions)
//!
//! Deterministic helpers for the trailing stop and the stop ratchet.
//!
//! # Trailing Stop Algorithm (R-distance)
//!
//! The trail distance is a fixed price distance derived from the initial
//! risk (e.g. 0.4R):
//! - LONG: candidate = peak - trail_distance
//! - SHORT: candidate = trough + trail_distance
//!
//! Key invariants:
//! - The applied stop is monotonic (never moves against the position)
//! - The favorable extreme is monotonic (peak only rises, trough only falls)
//! - Candidates are rounded to the tick grid before comparison

use crate::value_objects::{round_to_tick, Price, Side};
use rust_decimal::Decimal;

/// Result of a trailing stop update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingStopUpdate {
    /// New stop price
    pub new_stop: Price,
    /// Favorable extreme the stop was computed from
    pub new_favorable_extreme: Price,
}

/// Compute the next trailing stop, if it tightens the current one.
///
/// # Arguments
///
/// * `side` - Position side
/// * `current_price` - Latest traded price
/// * `favorable_extreme` - Best price seen so far
/// * `current_stop` - Stop price currently applied
/// * `trail_distance` - Price distance kept behind the extreme
/// * `tick_size` - Instrument tick, candidates are rounded to it
///
/// # Returns
///
/// `Some` only when the rounded candidate is strictly more favorable than
/// `current_stop`.
///
/// # Examples
///
/// ```
/// # use bracket_domain::trailing::update_trailing_stop;
/// # use bracket_domain::value_objects::{Price, Side};
/// # use rust_decimal_macros::dec;
/// let stop = Price::new(dec!(2645.0)).unwrap();
/// let extreme = Price::new(dec!(2650.0)).unwrap();
///
/// // Price runs to 2656: candidate = 2656 - 2 = 2654
/// let update = update_trailing_stop(
///     Side::Long,
///     Price::new(dec!(2656.0)).unwrap(),
///     extreme,
///     stop,
///     dec!(2.0),
///     dec!(0.1),
/// )
/// .unwrap();
/// assert_eq!(update.new_stop.as_decimal(), dec!(2654.0));
///
/// // Pullback to 2655: no new extreme, no update
/// let none = update_trailing_stop(
///     Side::Long,
///     Price::new(dec!(2655.0)).unwrap(),
///     update.new_favorable_extreme,
///     update.new_stop,
///     dec!(2.0),
///     dec!(0.1),
/// );
/// assert!(none.is_none());
/// ```
pub fn update_trailing_stop(
    side: Side,
    current_price: Price,
    favorable_extreme: Price,
    current_stop: Price,
    trail_distance: Decimal,
    tick_size: Decimal,
) -> Option<TrailingStopUpdate> {
    let extreme = side.favorable_extreme(favorable_extreme, current_price);
    let raw = extreme.as_decimal() - side.direction() * trail_distance;
    let candidate = Price::new(round_to_tick(raw, tick_size)).ok()?;

    if side.is_more_favorable_stop(candidate, current_stop) {
        Some(TrailingStopUpdate {
            new_stop: candidate,
            new_favorable_extreme: extreme,
        })
    } else {
        None
    }
}

/// Apply a candidate stop only if it does not loosen the current one.
///
/// This is the ratchet every stop move goes through.
pub fn ratchet(side: Side, current_stop: Price, candidate: Price) -> Price {
    if side.is_more_favorable_stop(candidate, current_stop) {
        candidate
    } else {
        current_stop
    }
}
