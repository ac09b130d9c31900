//! Bracket Daemon Library
//!
//! Keeps a live futures position protected by exactly one stop and one
//! target order while break-even, partial exit and trailing moves change
//! them underneath.
//!
//! # Architecture
//!
//! ```text
//! API Server / Event Bus (signals)
//!          │
//!          ▼
//!       Engine ─── PositionManager (entry, close detection, panic)
//!          │  ├─── Reconciler (watchdog repair)
//!          │  ├─── RiskStateMachine (break-even, partial, trailing)
//!          │  └─── CircuitBreaker (loss streak, daily guards)
//!          ▼
//!   PositionLedger + MutationGate
//!          │
//!          ▼
//!    BrokerGateway (ProjectX │ StubBroker)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use bracketd::{Config, Daemon};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let daemon = Daemon::new_stub(config)?;
//!     daemon.run().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

pub mod api;
pub mod circuit_breaker;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod ledger;
pub mod position_manager;
pub mod reconciler;
pub mod risk_state;

// Re-exports for convenience
pub use circuit_breaker::{BreakerConfig, BreakerState, BreakerStatus, CircuitBreaker, EntryBlock, OutcomeRecord};
pub use config::{ApiConfig, Config, Environment, TradingConfig};
pub use daemon::Daemon;
pub use engine::{Engine, EngineStatus, PollReport};
pub use error::{DaemonError, DaemonResult, RejectReason};
pub use event_bus::{DaemonEvent, EventBus, EventReceiver};
pub use ledger::{ClosedPosition, LedgerSnapshot, PositionLedger, TrackedOrders};
pub use position_manager::{PositionManager, PositionSync};
pub use reconciler::{DeferReason, ReconcileReport, Reconciler, RepairOutcome, RepairStep};
pub use risk_state::{RiskOutcome, RiskStateMachine};
