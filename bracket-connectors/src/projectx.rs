//! ProjectX (TopstepX) REST gateway.
//!
//! Implements `BrokerGateway` over the ProjectX Gateway API:
//! - Orders: place, modify, cancel, search open
//! - Positions: search open
//! - Quotes: last closed one-minute bar
//!
//! # Authentication
//!
//! `POST /api/Auth/loginKey` with user name and API key returns a session
//! token sent as `Authorization: Bearer`. A 401 triggers one refresh via
//! `/api/Auth/validate` (falling back to a fresh login) and a single retry.
//!
//! # Wire codes
//!
//! ```text
//! order type   1 = limit   2 = market   4 = stop
//! order side   0 = bid (buy)            1 = ask (sell)
//! position     1 = long                 2 = short
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use bracket_domain::{BrokerOrderId, OrderSide, Price, Side};
use bracket_exec::{
    BrokerGateway, BrokerOrder, BrokerPosition, ExecError, ExecResult, OrderChange, OrderKind, OrderRequest, Quote,
};

use crate::rate_limit::RequestWindow;

// =============================================================================
// Constants
// =============================================================================

/// ProjectX API base URL (TopstepX)
pub const DEFAULT_BASE_URL: &str = "https://api.topstepx.com";

/// Request timeout in seconds
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Requests allowed per rate window
const RATE_LIMIT_REQUESTS: u32 = 200;

/// Rate window length in seconds
const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Pause once this few requests remain in the window
const RATE_LIMIT_HEADROOM: u32 = 5;

/// Retry-After fallback when a 429 carries none
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

const ORDER_TYPE_LIMIT: i32 = 1;
const ORDER_TYPE_MARKET: i32 = 2;
const ORDER_TYPE_STOP: i32 = 4;

const SIDE_BID: i32 = 0;
const SIDE_ASK: i32 = 1;

const POSITION_LONG: i32 = 1;
const POSITION_SHORT: i32 = 2;

/// Bar unit code for minutes
const BAR_UNIT_MINUTE: i32 = 2;

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in the ProjectX client.
#[derive(Debug, Clone, Error)]
pub enum ProjectXError {
    /// HTTP request failed before a response arrived
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    /// Request timed out
    #[error("Request timed out")]
    Timeout,

    /// Non-success HTTP status
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// HTTP 429
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Login or token refresh failed
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// API answered `success: false`
    #[error("ProjectX API error {code:?}: {message}")]
    Api { code: Option<i64>, message: String },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// Invalid client configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<ProjectXError> for ExecError {
    fn from(err: ProjectXError) -> Self {
        match err {
            ProjectXError::RequestFailed(msg) => ExecError::Transient(msg),
            ProjectXError::Timeout => ExecError::Transient("request timed out".to_string()),
            ProjectXError::Parse(msg) => ExecError::Transient(format!("unparseable response: {}", msg)),
            ProjectXError::Unauthorized(msg) => ExecError::Transient(format!("authentication: {}", msg)),
            ProjectXError::RateLimited { retry_after_secs } => ExecError::RateLimited { retry_after_secs },
            ProjectXError::Http { status, body } if status >= 500 => {
                ExecError::Transient(format!("HTTP {}: {}", status, body))
            }
            ProjectXError::Http { status, body } => ExecError::Rejected(format!("HTTP {}: {}", status, body)),
            ProjectXError::Api { code, message } => ExecError::Rejected(match code {
                Some(code) => format!("{} (code {})", message, code),
                None => message,
            }),
            ProjectXError::Config(msg) => ExecError::Config(msg),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct ProjectXConfig {
    pub base_url: String,
    pub username: String,
    pub api_key: String,
    /// Trading account; resolved from the first tradable account when unset
    pub account_id: Option<i64>,
    pub request_timeout: Duration,
}

impl ProjectXConfig {
    pub fn validate(&self) -> Result<(), ProjectXError> {
        if self.username.trim().is_empty() || self.api_key.trim().is_empty() {
            return Err(ProjectXError::Config("username and api key are required".to_string()));
        }
        if !self.base_url.starts_with("http") {
            return Err(ProjectXError::Config(format!("invalid base url: {}", self.base_url)));
        }
        Ok(())
    }
}

impl Default for ProjectXConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            username: String::new(),
            api_key: String::new(),
            account_id: None,
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }
}

// =============================================================================
// Wire Types
// =============================================================================

/// Common response envelope.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    success: bool,
    error_code: Option<i64>,
    error_message: Option<String>,
    #[serde(flatten)]
    data: T,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateData {
    new_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountsData {
    #[serde(default)]
    accounts: Vec<ProjectXAccount>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectXAccount {
    id: i64,
    name: String,
    #[serde(default)]
    can_trade: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaceData {
    order_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Empty {}

#[derive(Debug, Deserialize)]
struct OrdersData {
    #[serde(default)]
    orders: Vec<ProjectXOrder>,
}

/// Working order as listed by `/api/Order/searchOpen`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectXOrder {
    pub id: i64,
    pub contract_id: String,
    #[serde(rename = "type")]
    pub order_type: i32,
    pub side: i32,
    pub size: u32,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct PositionsData {
    #[serde(default)]
    positions: Vec<ProjectXPosition>,
}

/// Open position as listed by `/api/Position/searchOpen`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectXPosition {
    pub contract_id: String,
    #[serde(rename = "type")]
    pub position_type: i32,
    pub size: u32,
    pub average_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct BarsData {
    #[serde(default)]
    bars: Vec<ProjectXBar>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProjectXBar {
    t: DateTime<Utc>,
    c: Decimal,
}

// =============================================================================
// Conversions
// =============================================================================

fn order_type_code(kind: OrderKind) -> i32 {
    match kind {
        OrderKind::Limit => ORDER_TYPE_LIMIT,
        OrderKind::Market => ORDER_TYPE_MARKET,
        OrderKind::Stop => ORDER_TYPE_STOP,
    }
}

fn side_code(side: OrderSide) -> i32 {
    match side {
        OrderSide::Buy => SIDE_BID,
        OrderSide::Sell => SIDE_ASK,
    }
}

fn parse_order_id(order_id: &str) -> ExecResult<i64> {
    order_id
        .parse()
        .map_err(|_| ExecError::OrderNotFound(order_id.to_string()))
}

/// Map a listed order. Order types the engine never places are skipped.
pub fn to_broker_order(order: &ProjectXOrder) -> Option<BrokerOrder> {
    let kind = match order.order_type {
        ORDER_TYPE_LIMIT => OrderKind::Limit,
        ORDER_TYPE_MARKET => OrderKind::Market,
        ORDER_TYPE_STOP => OrderKind::Stop,
        _ => return None,
    };
    let side = match order.side {
        SIDE_BID => OrderSide::Buy,
        SIDE_ASK => OrderSide::Sell,
        _ => return None,
    };
    let raw_price = match kind {
        OrderKind::Stop => order.stop_price,
        OrderKind::Limit => order.limit_price,
        OrderKind::Market => None,
    };
    Some(BrokerOrder {
        order_id: order.id.to_string(),
        instrument: order.contract_id.clone(),
        kind,
        side,
        size: order.size,
        price: raw_price.and_then(|p| Price::new(p).ok()),
        created_at: order.creation_timestamp,
    })
}

pub fn to_broker_position(position: &ProjectXPosition) -> Option<BrokerPosition> {
    let side = match position.position_type {
        POSITION_LONG => Side::Long,
        POSITION_SHORT => Side::Short,
        _ => return None,
    };
    if position.size == 0 {
        return None;
    }
    Some(BrokerPosition {
        instrument: position.contract_id.clone(),
        side,
        size: position.size,
        average_price: Price::new(position.average_price).ok()?,
    })
}

/// Prices go out as JSON numbers.
fn wire_price(price: Price) -> Value {
    json!(price.as_decimal().to_f64())
}

fn place_body(account_id: i64, request: &OrderRequest) -> Value {
    let mut body = json!({
        "accountId": account_id,
        "contractId": request.instrument,
        "type": order_type_code(request.kind),
        "side": side_code(request.side),
        "size": request.size,
    });
    if let Some(price) = request.price {
        match request.kind {
            OrderKind::Stop => body["stopPrice"] = wire_price(price),
            OrderKind::Limit => body["limitPrice"] = wire_price(price),
            OrderKind::Market => {}
        }
    }
    body
}

/// Size and price in one request. The price goes to whichever field the
/// order's type uses; both are sent because the API ignores the other.
fn modify_body(account_id: i64, order_id: i64, change: &OrderChange) -> Value {
    let mut body = json!({
        "accountId": account_id,
        "orderId": order_id,
    });
    if let Some(size) = change.size {
        body["size"] = json!(size);
    }
    if let Some(price) = change.price {
        body["stopPrice"] = wire_price(price);
        body["limitPrice"] = wire_price(price);
    }
    body
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> u64 {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

fn unwrap_envelope<T>(envelope: Envelope<T>) -> Result<T, ProjectXError> {
    if envelope.success {
        Ok(envelope.data)
    } else {
        Err(ProjectXError::Api {
            code: envelope.error_code,
            message: envelope
                .error_message
                .unwrap_or_else(|| "request unsuccessful".to_string()),
        })
    }
}

/// ProjectX reports unknown orders as API errors; recognize them.
fn is_missing_order(err: &ProjectXError) -> bool {
    matches!(err, ProjectXError::Api { message, .. } if message.to_lowercase().contains("not found"))
}

// =============================================================================
// Gateway
// =============================================================================

/// ProjectX REST adapter for `BrokerGateway`.
pub struct ProjectXGateway {
    client: Client,
    config: ProjectXConfig,
    token: RwLock<Option<String>>,
    account_id: RwLock<Option<i64>>,
    window: RequestWindow,
}

impl ProjectXGateway {
    pub fn new(config: ProjectXConfig) -> Result<Self, ProjectXError> {
        config.validate()?;
        let client = Client::builder()
            .build()
            .map_err(|e| ProjectXError::Config(e.to_string()))?;
        let account_id = config.account_id;
        Ok(Self {
            client,
            config,
            token: RwLock::new(None),
            account_id: RwLock::new(account_id),
            window: RequestWindow::new(
                RATE_LIMIT_REQUESTS,
                Duration::from_secs(RATE_LIMIT_WINDOW_SECS),
                RATE_LIMIT_HEADROOM,
            ),
        })
    }

    /// Log in and resolve the trading account.
    pub async fn connect(&self) -> Result<i64, ProjectXError> {
        self.login().await?;
        self.account_id().await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Send one POST and decode the envelope. No auth handling.
    async fn send<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
        token: Option<&str>,
    ) -> Result<T, ProjectXError> {
        self.window.acquire().await;

        let mut request = self.client.post(self.url(path)).json(body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = timeout(self.config.request_timeout, request.send())
            .await
            .map_err(|_| ProjectXError::Timeout)?
            .map_err(|e| {
                if e.is_timeout() {
                    ProjectXError::Timeout
                } else {
                    ProjectXError::RequestFailed(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = retry_after(response.headers());
            warn!(path, retry_after_secs, "ProjectX rate limit hit");
            return Err(ProjectXError::RateLimited { retry_after_secs });
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(ProjectXError::Unauthorized(format!("{} returned 401", path)));
        }

        let text = response.text().await.map_err(|e| ProjectXError::Parse(e.to_string()))?;
        if !status.is_success() {
            return Err(ProjectXError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        let envelope: Envelope<T> = serde_json::from_str(&text).map_err(|e| ProjectXError::Parse(e.to_string()))?;
        unwrap_envelope(envelope)
    }

    /// Authenticated POST. Refreshes the token once on 401.
    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, ProjectXError> {
        let token = match self.token.read().await.clone() {
            Some(token) => token,
            None => self.login().await?,
        };

        match self.send(path, body, Some(&token)).await {
            Err(ProjectXError::Unauthorized(_)) => {
                debug!(path, "Token rejected, refreshing");
                let token = self.refresh_token(&token).await?;
                self.send(path, body, Some(&token)).await
            }
            other => other,
        }
    }

    async fn login(&self) -> Result<String, ProjectXError> {
        let body = json!({
            "userName": self.config.username,
            "apiKey": self.config.api_key,
        });
        let data: LoginData = self
            .send("/api/Auth/loginKey", &body, None)
            .await
            .map_err(|e| ProjectXError::Unauthorized(e.to_string()))?;
        let token = data
            .token
            .ok_or_else(|| ProjectXError::Unauthorized("login returned no token".to_string()))?;

        info!(username = %self.config.username, "ProjectX login successful");
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn refresh_token(&self, current: &str) -> Result<String, ProjectXError> {
        match self
            .send::<ValidateData>("/api/Auth/validate", &json!({}), Some(current))
            .await
        {
            Ok(ValidateData { new_token: Some(token) }) => {
                *self.token.write().await = Some(token.clone());
                Ok(token)
            }
            Ok(_) => Ok(current.to_string()),
            Err(e) => {
                warn!(error = %e, "Token refresh failed, logging in again");
                self.login().await
            }
        }
    }

    async fn account_id(&self) -> Result<i64, ProjectXError> {
        if let Some(id) = *self.account_id.read().await {
            return Ok(id);
        }

        let data: AccountsData = self
            .post("/api/Account/search", &json!({ "onlyActiveAccounts": true }))
            .await?;
        let account = data
            .accounts
            .into_iter()
            .find(|a| a.can_trade)
            .ok_or_else(|| ProjectXError::Config("no tradable account found".to_string()))?;

        info!(account_id = account.id, name = %account.name, "ProjectX account selected");
        *self.account_id.write().await = Some(account.id);
        Ok(account.id)
    }
}

#[async_trait]
impl BrokerGateway for ProjectXGateway {
    async fn place_order(&self, request: &OrderRequest) -> ExecResult<BrokerOrderId> {
        let account_id = self.account_id().await?;
        let data: PlaceData = self.post("/api/Order/place", &place_body(account_id, request)).await?;
        let order_id = data
            .order_id
            .ok_or_else(|| ExecError::Transient("placement returned no order id".to_string()))?;

        info!(
            order_id,
            kind = ?request.kind,
            side = %request.side,
            size = request.size,
            price = ?request.price,
            "ProjectX order placed"
        );
        Ok(order_id.to_string())
    }

    async fn modify_order(&self, order_id: &str, change: &OrderChange) -> ExecResult<()> {
        let account_id = self.account_id().await?;
        let id = parse_order_id(order_id)?;
        match self
            .post::<Empty>("/api/Order/modify", &modify_body(account_id, id, change))
            .await
        {
            Ok(_) => {
                info!(order_id, ?change, "ProjectX order modified");
                Ok(())
            }
            Err(e) if is_missing_order(&e) => Err(ExecError::OrderNotFound(order_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn cancel_order(&self, order_id: &str) -> ExecResult<()> {
        let account_id = self.account_id().await?;
        let id = parse_order_id(order_id)?;
        match self
            .post::<Empty>("/api/Order/cancel", &json!({ "accountId": account_id, "orderId": id }))
            .await
        {
            Ok(_) => {
                info!(order_id, "ProjectX order cancelled");
                Ok(())
            }
            Err(e) if is_missing_order(&e) => Err(ExecError::OrderNotFound(order_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_open_orders(&self, instrument: &str) -> ExecResult<Vec<BrokerOrder>> {
        let account_id = self.account_id().await?;
        let data: OrdersData = self
            .post("/api/Order/searchOpen", &json!({ "accountId": account_id }))
            .await?;

        Ok(data
            .orders
            .iter()
            .filter(|o| o.contract_id == instrument)
            .filter_map(to_broker_order)
            .collect())
    }

    async fn get_position(&self, instrument: &str) -> ExecResult<Option<BrokerPosition>> {
        let account_id = self.account_id().await?;
        let data: PositionsData = self
            .post("/api/Position/searchOpen", &json!({ "accountId": account_id }))
            .await?;

        Ok(data
            .positions
            .iter()
            .filter(|p| p.contract_id == instrument)
            .find_map(to_broker_position))
    }

    async fn get_quote(&self, instrument: &str) -> ExecResult<Quote> {
        let now = Utc::now();
        let body = json!({
            "contractId": instrument,
            "live": false,
            "startTime": now - ChronoDuration::minutes(5),
            "endTime": now,
            "unit": BAR_UNIT_MINUTE,
            "unitNumber": 1,
            "limit": 5,
            "includePartialBar": true,
        });
        let data: BarsData = self.post("/api/History/retrieveBars", &body).await?;

        let bar = data
            .bars
            .into_iter()
            .max_by_key(|b| b.t)
            .ok_or_else(|| ExecError::Transient(format!("no recent bars for {}", instrument)))?;
        Ok(Quote {
            instrument: instrument.to_string(),
            price: Price::new(bar.c)?,
            timestamp: bar.t,
        })
    }

    async fn health_check(&self) -> ExecResult<()> {
        self.account_id().await?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bracket_domain::ProtectiveKind;
    use rust_decimal_macros::dec;

    const MGC: &str = "CON.F.US.MGC.Z25";

    #[test]
    fn test_parse_open_orders() {
        let json = r#"{
            "orders": [
                {"id": 36598, "accountId": 704, "contractId": "CON.F.US.MGC.Z25",
                 "creationTimestamp": "2025-07-18T21:00:01.268009+00:00",
                 "status": 1, "type": 4, "side": 1, "size": 2, "stopPrice": 2645.0},
                {"id": 36599, "accountId": 704, "contractId": "CON.F.US.MGC.Z25",
                 "creationTimestamp": "2025-07-18T21:00:02.1+00:00",
                 "status": 1, "type": 1, "side": 1, "size": 2, "limitPrice": 2660.0},
                {"id": 36600, "accountId": 704, "contractId": "CON.F.US.MGC.Z25",
                 "creationTimestamp": "2025-07-18T21:00:03+00:00",
                 "status": 1, "type": 5, "side": 1, "size": 2}
            ],
            "success": true, "errorCode": 0, "errorMessage": null
        }"#;

        let envelope: Envelope<OrdersData> = serde_json::from_str(json).unwrap();
        let data = unwrap_envelope(envelope).unwrap();
        let orders: Vec<BrokerOrder> = data.orders.iter().filter_map(to_broker_order).collect();

        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].order_id, "36598");
        assert!(orders[0].matches(ProtectiveKind::Stop, MGC, OrderSide::Sell));
        assert_eq!(orders[0].price.unwrap().as_decimal(), dec!(2645.0));
        assert!(orders[1].matches(ProtectiveKind::Target, MGC, OrderSide::Sell));
        assert!(orders[1].created_at > orders[0].created_at);
    }

    #[test]
    fn test_parse_positions() {
        let json = r#"{
            "positions": [
                {"id": 1, "accountId": 704, "contractId": "CON.F.US.MGC.Z25",
                 "creationTimestamp": "2025-07-18T21:00:01+00:00",
                 "type": 2, "size": 3, "averagePrice": 2650.4}
            ],
            "success": true, "errorCode": 0, "errorMessage": null
        }"#;
        let envelope: Envelope<PositionsData> = serde_json::from_str(json).unwrap();
        let position = to_broker_position(&unwrap_envelope(envelope).unwrap().positions[0]).unwrap();

        assert_eq!(position.side, Side::Short);
        assert_eq!(position.size, 3);
        assert_eq!(position.average_price.as_decimal(), dec!(2650.4));
    }

    #[test]
    fn test_unsuccessful_envelope_is_api_error() {
        let json = r#"{"orderId": null, "success": false, "errorCode": 2, "errorMessage": "Order not found"}"#;
        let envelope: Envelope<PlaceData> = serde_json::from_str(json).unwrap();
        let err = unwrap_envelope(envelope).unwrap_err();

        assert!(is_missing_order(&err));
        assert!(matches!(ExecError::from(err), ExecError::Rejected(_)));
    }

    #[test]
    fn test_place_body_uses_wire_codes() {
        let request = OrderRequest::protective(
            ProtectiveKind::Stop,
            MGC,
            OrderSide::Sell,
            2,
            Price::new(dec!(2645.0)).unwrap(),
        );
        let body = place_body(704, &request);

        assert_eq!(body["type"], 4);
        assert_eq!(body["side"], 1);
        assert_eq!(body["size"], 2);
        assert!(body.get("stopPrice").is_some());
        assert!(body.get("limitPrice").is_none());

        let market = place_body(704, &OrderRequest::market(MGC, OrderSide::Buy, 1));
        assert_eq!(market["type"], 2);
        assert_eq!(market["side"], 0);
        assert!(market.get("stopPrice").is_none());
    }

    #[test]
    fn test_modify_body_combines_size_and_price() {
        let change = OrderChange::price(Price::new(dec!(2650.0)).unwrap()).with_size(4);
        let body = modify_body(704, 36598, &change);

        assert_eq!(body["orderId"], 36598);
        assert_eq!(body["size"], 4);
        assert!(body.get("stopPrice").is_some());

        let resize_only = modify_body(704, 36598, &OrderChange::size(2));
        assert!(resize_only.get("stopPrice").is_none());
    }

    #[test]
    fn test_error_mapping() {
        assert!(ExecError::from(ProjectXError::Timeout).is_transient());
        assert!(ExecError::from(ProjectXError::Http {
            status: 503,
            body: String::new()
        })
        .is_transient());
        assert!(ExecError::from(ProjectXError::Http {
            status: 400,
            body: String::new()
        })
        .is_irrecoverable());
        assert!(matches!(
            ExecError::from(ProjectXError::RateLimited { retry_after_secs: 7 }),
            ExecError::RateLimited { retry_after_secs: 7 }
        ));
    }

    #[test]
    fn test_config_requires_credentials() {
        assert!(ProjectXGateway::new(ProjectXConfig::default()).is_err());

        let config = ProjectXConfig {
            username: "trader".to_string(),
            api_key: "key".to_string(),
            ..ProjectXConfig::default()
        };
        assert!(ProjectXGateway::new(config).is_ok());
    }
}
