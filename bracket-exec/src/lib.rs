//! Bracket Execution Layer
//!
//! Everything that talks to the broker or serializes talking to it.
//!
//! # Architecture
//!
//! ```text
//! Reconciler / RiskStateMachine / Entry
//!              │
//!              ▼
//!        MutationGate ──── locks + cooldowns per category
//!              │
//!              ▼
//!        BrokerGateway ◄── OrderVerifier (bounded polling of listings)
//!              │
//!              ▼
//!     ProjectX REST │ StubBroker
//! ```

#![warn(clippy::all)]

pub mod error;
pub mod gate;
pub mod ports;
pub mod stub;
pub mod verifier;

pub use error::{ExecError, ExecResult};
pub use gate::{GateConfig, GateGuard, GateSnapshot, MutationCategory, MutationGate, Throttle};
pub use ports::{
    BrokerEvent, BrokerGateway, BrokerOrder, BrokerPosition, OrderChange, OrderKind, OrderRequest, Quote,
};
pub use stub::{StubBroker, StubFailure, StubOp};
pub use verifier::{Absence, OrderVerifier, Verification, VerifierConfig};
