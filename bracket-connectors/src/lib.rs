//! Bracket Broker Connectors
//!
//! Adapters from broker APIs to the `BrokerGateway` port.
//! Normalizes broker-specific wire types to domain types.

#![warn(clippy::all)]

pub mod projectx;
pub mod rate_limit;

pub use projectx::{ProjectXConfig, ProjectXError, ProjectXGateway};
pub use rate_limit::RequestWindow;
