//! Execution layer error types.

use thiserror::Error;

/// Errors from broker operations and order verification.
///
/// The split that matters to callers is [`ExecError::is_transient`]:
/// transient errors may be retried inside the current bounded attempt
/// budget; everything else is surfaced.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// Timeout, dropped connection or 5xx from the broker
    #[error("Transient broker error: {0}")]
    Transient(String),

    /// Broker throttled the request
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Broker refused the request (invalid instrument, insufficient margin, ...)
    #[error("Broker rejected request: {0}")]
    Rejected(String),

    /// Modify or cancel targeted an order the broker does not know
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// Every listing attempt failed, so presence is unknown
    #[error("Verification of order {order_id} timed out after {attempts} attempts")]
    VerificationTimeout { order_id: String, attempts: u32 },

    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] bracket_domain::DomainError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ExecError {
    /// Errors that say nothing about broker state and may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExecError::Transient(_) | ExecError::RateLimited { .. } | ExecError::VerificationTimeout { .. }
        )
    }

    /// Errors that must never be retried silently.
    pub fn is_irrecoverable(&self) -> bool {
        matches!(self, ExecError::Rejected(_))
    }
}

/// Result type for execution operations.
pub type ExecResult<T> = Result<T, ExecError>;
