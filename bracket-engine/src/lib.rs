//! Bracket Engine Layer
//!
//! Pure decision logic, deterministic, no I/O.
//! Takes a position and a price, returns the risk actions that are due.
//! Applying them against the broker is the daemon's job.

#![warn(clippy::all)]

pub mod risk;

pub use risk::{EngineError, EngineResult, RiskAction, RiskEngine, RiskEvaluation, RiskSettings};
