// =============================================================================
// Order Transport — Bybit v5 private REST with HMAC-SHA256 signing
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry X-BAPI-* headers and a recvWindow of 5 000 ms to tolerate clock
// drift.
//
// This layer never retries order submissions on its own: a blind retry after
// an ambiguous failure can double-place. The turbo controller owns the
// single deliberate retry allowed on transient retCodes.
// =============================================================================

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bybit::client::parse_opt_f64;
use crate::bybit::error::BybitError;
use crate::bybit::rate_limit::RateLimiter;
use crate::types::{Category, Side};

type HmacSha256 = Hmac<Sha256>;

/// recvWindow sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "Limit",
            OrderType::Market => "Market",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimeInForce {
    PostOnly,
    Gtc,
    Ioc,
}

impl TimeInForce {
    fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::PostOnly => "PostOnly",
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
        }
    }
}

/// A fully specified order submission.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub category: Category,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: f64,
    /// Required for limit orders; ignored for market orders.
    pub price: Option<f64>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
}

/// Exchange acknowledgement of a submitted order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    pub order_id: String,
    pub order_link_id: String,
}

/// Normalized order lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Unknown,
}

impl OrderState {
    fn from_api(s: &str) -> Self {
        match s {
            "New" | "Created" | "Untriggered" => OrderState::New,
            "PartiallyFilled" => OrderState::PartiallyFilled,
            "Filled" => OrderState::Filled,
            "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => OrderState::Cancelled,
            "Rejected" => OrderState::Rejected,
            _ => OrderState::Unknown,
        }
    }
}

/// Polled status of a resting order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderStatus {
    pub state: OrderState,
    pub avg_price: Option<f64>,
    pub filled_qty: Option<f64>,
}

// ---------------------------------------------------------------------------
// Trait seam
// ---------------------------------------------------------------------------

/// Narrow order-transport interface consumed by the turbo controller.
/// Production code uses [`BybitOrderClient`]; tests inject a mock.
#[async_trait]
pub trait OrderApi: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, BybitError>;

    async fn cancel_order(
        &self,
        category: Category,
        symbol: &str,
        order_id: &str,
    ) -> Result<(), BybitError>;

    async fn order_status(
        &self,
        category: Category,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatus, BybitError>;

    /// Total account equity in USD from the unified wallet.
    async fn wallet_equity(&self) -> Result<f64, BybitError>;
}

// ---------------------------------------------------------------------------
// Production implementation
// ---------------------------------------------------------------------------

/// Bybit v5 private REST client.
#[derive(Clone)]
pub struct BybitOrderClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    secret: String,
    limiter: Arc<RateLimiter>,
}

impl BybitOrderClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            secret: secret.into(),
            limiter,
        }
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// HMAC-SHA256 hex signature over `timestamp + api_key + recv_window +
    /// payload` per the v5 signing scheme.
    fn sign(&self, timestamp: u64, payload: &str) -> String {
        let message = format!("{timestamp}{}{RECV_WINDOW}{payload}", self.api_key);
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn post_signed(&self, path: &str, body: Value) -> Result<Value, BybitError> {
        self.limiter.acquire().await;

        let body_str = body.to_string();
        let ts = Self::timestamp_ms();
        let sig = self.sign(ts, &body_str);
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .http
            .post(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string())
            .header("X-BAPI-SIGN", sig)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body_str)
            .send()
            .await?;

        Self::check_envelope(response).await
    }

    async fn get_signed(&self, path: &str, query: &str) -> Result<Value, BybitError> {
        self.limiter.acquire().await;

        let ts = Self::timestamp_ms();
        let sig = self.sign(ts, query);
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let response = self
            .http
            .get(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string())
            .header("X-BAPI-SIGN", sig)
            .send()
            .await?;

        Self::check_envelope(response).await
    }

    async fn check_envelope(response: reqwest::Response) -> Result<Value, BybitError> {
        let status = response.status();
        if status.as_u16() >= 400 {
            let detail = response.text().await.unwrap_or_default();
            return Err(BybitError::HttpStatus {
                status: status.as_u16(),
                detail: detail.chars().take(200).collect(),
            });
        }

        let body: Value = response.json().await?;
        let ret_code = body["retCode"].as_i64().unwrap_or(0);
        if ret_code != 0 {
            let ret_msg = body["retMsg"].as_str().unwrap_or("").to_string();
            return Err(BybitError::from_ret_code(ret_code, ret_msg));
        }
        Ok(body["result"].clone())
    }
}

#[async_trait]
impl OrderApi for BybitOrderClient {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, BybitError> {
        let order_link_id = Uuid::new_v4().to_string();
        let mut body = json!({
            "category": request.category.as_str(),
            "symbol": request.symbol,
            "side": request.side.as_str(),
            "orderType": request.order_type.as_str(),
            "qty": request.qty.to_string(),
            "timeInForce": request.time_in_force.as_str(),
            "reduceOnly": request.reduce_only,
            "orderLinkId": order_link_id,
        });
        if let (OrderType::Limit, Some(price)) = (request.order_type, request.price) {
            body["price"] = json!(price.to_string());
        }

        debug!(
            symbol = %request.symbol,
            side = %request.side,
            qty = request.qty,
            price = ?request.price,
            reduce_only = request.reduce_only,
            "placing order"
        );

        let result = self.post_signed("/v5/order/create", body).await?;
        let order_id = result["orderId"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BybitError::Malformed("order ack missing orderId".into()))?
            .to_string();

        Ok(OrderAck {
            order_id,
            order_link_id,
        })
    }

    async fn cancel_order(
        &self,
        category: Category,
        symbol: &str,
        order_id: &str,
    ) -> Result<(), BybitError> {
        let body = json!({
            "category": category.as_str(),
            "symbol": symbol,
            "orderId": order_id,
        });
        debug!(symbol, order_id, "cancelling order");
        self.post_signed("/v5/order/cancel", body).await?;
        Ok(())
    }

    async fn order_status(
        &self,
        category: Category,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatus, BybitError> {
        let query = format!(
            "category={}&symbol={}&orderId={}",
            category.as_str(),
            symbol,
            order_id
        );
        let result = self.get_signed("/v5/order/realtime", &query).await?;

        let order = result["list"].as_array().and_then(|l| l.first());
        let Some(order) = order else {
            // An order that left the realtime list was terminally closed;
            // the caller re-polls via history if it needs the fill price.
            return Ok(OrderStatus {
                state: OrderState::Unknown,
                avg_price: None,
                filled_qty: None,
            });
        };

        Ok(OrderStatus {
            state: OrderState::from_api(order["orderStatus"].as_str().unwrap_or("")),
            avg_price: parse_opt_f64(&order["avgPrice"]),
            filled_qty: parse_opt_f64(&order["cumExecQty"]),
        })
    }

    async fn wallet_equity(&self) -> Result<f64, BybitError> {
        let result = self
            .get_signed("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;
        let equity = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .and_then(|acct| parse_opt_f64(&acct["totalEquity"]));

        match equity {
            Some(e) => Ok(e),
            None => {
                warn!("wallet-balance response missing totalEquity");
                Err(BybitError::Malformed(
                    "wallet balance missing totalEquity".into(),
                ))
            }
        }
    }
}

impl std::fmt::Debug for BybitOrderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitOrderClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
