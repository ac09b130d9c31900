//! Bracket Domain Layer
//!
//! Pure domain types with zero I/O: positions, protective orders, trade
//! signals, risk phases and engine events.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entities;
pub mod events;
pub mod trailing;
pub mod value_objects;

pub use entities::{
    BrokerOrderId, Position, PositionId, ProtectiveOrder, RiskPhase, RiskPhases, TradeSignal,
    TrailingState,
};
pub use events::{CloseSource, EngineEvent, RepairAction};
pub use trailing::{ratchet, update_trailing_stop, TrailingStopUpdate};
pub use value_objects::{
    round_to_tick, Contracts, DomainError, Instrument, OrderSide, Price, ProtectiveKind, Side,
};
