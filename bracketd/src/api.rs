//! HTTP API for the bracket daemon.
//!
//! Provides REST endpoints for:
//! - Health check
//! - Status (ledger, breaker, held locks)
//! - Signal (open a protected position)
//! - Reconcile (forced watchdog cycle)
//! - Panic (cancel protective orders and flatten)

use axum::{extract::State, http::StatusCode, routing::{get, post}, Json, Router};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use bracket_domain::{Price, Side, TradeSignal};
use bracket_exec::BrokerGateway;

use crate::engine::{Engine, EngineStatus};
use crate::error::{DaemonError, RejectReason};
use crate::reconciler::ReconcileReport;

// =============================================================================
// API State
// =============================================================================

/// Shared state for API handlers.
pub struct ApiState<G: BrokerGateway + 'static> {
    pub engine: Arc<Engine<G>>,
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Request to open a position.
#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    pub side: Side,
    pub entry_price: Decimal,
    pub stop_distance_ticks: u32,
    pub target_distance_ticks: u32,
    #[serde(default)]
    pub risk_reward_ratio: Decimal,
}

/// Response after opening a position.
#[derive(Debug, Serialize, Deserialize)]
pub struct SignalResponse {
    pub position_id: Uuid,
}

/// Panic response.
#[derive(Debug, Serialize, Deserialize)]
pub struct PanicResponse {
    pub closed_position: Option<Uuid>,
}

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

// =============================================================================
// Router
// =============================================================================

/// Create the API router.
pub fn create_router<G>(state: Arc<ApiState<G>>) -> Router
where
    G: BrokerGateway + 'static,
{
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler::<G>))
        .route("/signal", post(signal_handler::<G>))
        .route("/reconcile", post(reconcile_handler::<G>))
        .route("/panic", post(panic_handler::<G>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check endpoint.
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn status_handler<G>(State(state): State<Arc<ApiState<G>>>) -> Json<EngineStatus>
where
    G: BrokerGateway + 'static,
{
    Json(state.engine.status().await)
}

/// Open a position for a signal.
async fn signal_handler<G>(
    State(state): State<Arc<ApiState<G>>>,
    Json(req): Json<SignalRequest>,
) -> Result<(StatusCode, Json<SignalResponse>), ApiError>
where
    G: BrokerGateway + 'static,
{
    let entry_price = Price::new(req.entry_price).map_err(|e| {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorResponse {
                error: format!("Invalid entry price: {}", e),
            }),
        )
    })?;
    let signal = TradeSignal {
        side: req.side,
        entry_price,
        stop_distance_ticks: req.stop_distance_ticks,
        target_distance_ticks: req.target_distance_ticks,
        risk_reward_ratio: req.risk_reward_ratio,
    };

    let position_id = state
        .engine
        .open_position(signal)
        .await
        .map_err(to_error_response)?;

    Ok((StatusCode::CREATED, Json(SignalResponse { position_id })))
}

/// Run a watchdog cycle now, ignoring its cooldown.
async fn reconcile_handler<G>(State(state): State<Arc<ApiState<G>>>) -> Json<ReconcileReport>
where
    G: BrokerGateway + 'static,
{
    Json(state.engine.reconcile_now().await)
}

/// Emergency close.
async fn panic_handler<G>(State(state): State<Arc<ApiState<G>>>) -> Result<Json<PanicResponse>, ApiError>
where
    G: BrokerGateway + 'static,
{
    let closed_position = state.engine.panic_close().await.map_err(to_error_response)?;
    Ok(Json(PanicResponse { closed_position }))
}

// =============================================================================
// Helpers
// =============================================================================

fn to_error_response(error: DaemonError) -> ApiError {
    let status = match &error {
        DaemonError::Rejected(RejectReason::InvalidSignal(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        DaemonError::Rejected(
            RejectReason::BrokerRejected(_) | RejectReason::VerificationFailedOnInitialBrackets { .. },
        ) => StatusCode::BAD_GATEWAY,
        DaemonError::Rejected(_) | DaemonError::PositionAlreadyExists(_) => StatusCode::CONFLICT,
        DaemonError::EntryUnconfirmed(_) => StatusCode::GATEWAY_TIMEOUT,
        DaemonError::Exec(_) | DaemonError::Connector(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

// =============================================================================
// Tests
// =============================================================================
