//! Daemon error types.

use bracket_connectors::ProjectXError;
use chrono::{DateTime, Utc};
use bracket_domain::{DomainError, ProtectiveKind};
use bracket_engine::EngineError;
use bracket_exec::ExecError;
use thiserror::Error;
use uuid::Uuid;

use crate::circuit_breaker::EntryBlock;

/// Why `open_position` refused a signal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectReason {
    #[error("circuit breaker tripped until {until}")]
    CircuitBreakerTripped { until: DateTime<Utc> },

    /// Daily trade count or loss limit reached
    #[error("daily limit reached: {0}")]
    DailyLimit(EntryBlock),

    /// The position is open but some initial brackets could not be confirmed;
    /// the reconciler keeps repairing them.
    #[error("verification failed on initial brackets: {missing:?}")]
    VerificationFailedOnInitialBrackets { missing: Vec<ProtectiveKind> },

    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    #[error("a position is already open")]
    PositionAlreadyOpen,

    #[error("another entry is in flight")]
    EntryInFlight,

    #[error("broker rejected entry: {0}")]
    BrokerRejected(String),
}

/// Daemon-level errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Engine error
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Execution error
    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    /// Broker connector error
    #[error("Connector error: {0}")]
    Connector(#[from] ProjectXError),

    /// Entry refused
    #[error("Entry rejected: {0}")]
    Rejected(RejectReason),

    /// Market order sent but no fill showed up in the broker position
    #[error("Entry fill not confirmed for order {0}")]
    EntryUnconfirmed(String),

    /// Ledger already holds a position
    #[error("Position already exists: {0}")]
    PositionAlreadyExists(Uuid),

    /// Event bus error
    #[error("Event bus error: {0}")]
    EventBus(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl From<RejectReason> for DaemonError {
    fn from(reason: RejectReason) -> Self {
        DaemonError::Rejected(reason)
    }
}

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
