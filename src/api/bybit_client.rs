//! Bybit v5 REST connector for linear (USDT perpetual) accounts.
//!
//! Every private endpoint is signed with HMAC-SHA256 over
//! `timestamp + api_key + recv_window + (query | body)` and the result is
//! sent in the `X-BAPI-*` headers.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::error::{ConnectorError, ConnectorResult};
use crate::models::{ApiCredentials, OrderType, Position, Side};

use super::types::*;
use super::{ConnectorFactory, ExchangeConnector};

type HmacSha256 = Hmac<Sha256>;

pub const BYBIT_REST_URL: &str = "https://api.bybit.com";
pub const BYBIT_WS_URL: &str = "wss://stream.bybit.com";

/// Closed-pnl pages are capped at 100 rows by the exchange.
const CLOSED_PNL_PAGE: &str = "100";
const MAX_PNL_PAGES: usize = 50;

/// Endpoint settings shared by every Bybit connector.
#[derive(Debug, Clone)]
pub struct BybitConfig {
    pub rest_url: String,
    /// Product category; the engine trades `linear`
    pub category: String,
    /// Account type used for balances and transfers
    pub account_type: String,
    pub recv_window: u64,
    pub request_timeout: Duration,
}

impl Default for BybitConfig {
    fn default() -> Self {
        Self {
            rest_url: BYBIT_REST_URL.to_string(),
            category: "linear".to_string(),
            account_type: "UNIFIED".to_string(),
            recv_window: 5_000,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Signed REST client bound to one account's credentials.
pub struct BybitClient {
    http: Client,
    config: Arc<BybitConfig>,
    credentials: ApiCredentials,
}

impl BybitClient {
    pub fn new(http: Client, config: Arc<BybitConfig>, credentials: ApiCredentials) -> Self {
        Self {
            http,
            config,
            credentials,
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.rest_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> ConnectorResult<T> {
        self.signed_request(Method::GET, path, Value::Null, query).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> ConnectorResult<T> {
        self.signed_request(Method::POST, path, body, &[]).await
    }

    async fn signed_request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Value,
        query: &[(&str, String)],
    ) -> ConnectorResult<T> {
        let timestamp = Utc::now().timestamp_millis();
        let query_string =
            serde_urlencoded::to_string(query).map_err(|e| ConnectorError::Decode(e.to_string()))?;
        let signed_part = if method == Method::GET {
            query_string.clone()
        } else {
            body.to_string()
        };
        let payload = format!(
            "{}{}{}{}",
            timestamp, self.credentials.api_key, self.config.recv_window, signed_part
        );
        let signature = sign(&self.credentials.api_secret, &payload)?;

        let url = if query_string.is_empty() {
            self.url(path)
        } else {
            format!("{}?{}", self.url(path), query_string)
        };
        debug!(method = %method, path, "Bybit request");

        let mut request = self
            .http
            .request(method.clone(), url)
            .header("X-BAPI-API-KEY", &self.credentials.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-RECV-WINDOW", self.config.recv_window.to_string())
            .header("Content-Type", "application/json");
        if method != Method::GET {
            request = request.body(signed_part);
        }

        let response = request.send().await?.error_for_status()?;
        let envelope: ApiResponse<T> = response.json().await?;
        if envelope.ret_code != 0 {
            return Err(ConnectorError::from_bybit(envelope.ret_code, &envelope.ret_msg));
        }
        envelope
            .result
            .ok_or_else(|| ConnectorError::Decode(format!("{} returned no result", path)))
    }

    /// Look up an order by one of its ids.
    async fn find_order(
        &self,
        symbol: &str,
        key: &str,
        id: &str,
    ) -> ConnectorResult<Option<OrderItem>> {
        let query = [
            ("category", self.config.category.clone()),
            ("symbol", symbol.to_string()),
            (key, id.to_string()),
        ];
        let result: ListResult<OrderItem> = self.get("/v5/order/realtime", &query).await?;
        Ok(result.list.into_iter().next())
    }

    /// Look up the fill price of a just-placed order.
    ///
    /// The order already exists at this point, so a failed lookup is logged
    /// and reported as "no price" rather than failing the placement.
    async fn fill_price(&self, symbol: &str, order_id: &str) -> (Option<Decimal>, String) {
        match self.find_order(symbol, "orderId", order_id).await {
            Ok(Some(item)) => (item.avg_price(), item.order_status),
            Ok(None) => (None, "Submitted".to_string()),
            Err(e) => {
                warn!(order_id, error = %e, "Failed to fetch order fill price");
                (None, "Submitted".to_string())
            }
        }
    }

    async fn submit(
        &self,
        body: Value,
        symbol: &str,
        link_id: Option<&str>,
    ) -> ConnectorResult<OrderResult> {
        let created: CreateOrderResult = match self.post("/v5/order/create", body).await {
            Ok(created) => created,
            Err(ConnectorError::DuplicateOrder(message)) => {
                let Some(link_id) = link_id else {
                    return Err(ConnectorError::DuplicateOrder(message));
                };
                // An earlier attempt reached the exchange; report that order
                let item = self
                    .find_order(symbol, "orderLinkId", link_id)
                    .await?
                    .ok_or_else(|| ConnectorError::DuplicateOrder(message))?;
                debug!(order_link_id = link_id, order_id = %item.order_id, "Order already placed");
                return Ok(OrderResult {
                    avg_price: item.avg_price(),
                    order_id: item.order_id,
                    status: item.order_status,
                });
            }
            Err(e) => return Err(e),
        };
        let (avg_price, status) = self.fill_price(symbol, &created.order_id).await;
        Ok(OrderResult {
            order_id: created.order_id,
            avg_price,
            status,
        })
    }
}

#[async_trait]
impl ExchangeConnector for BybitClient {
    async fn get_wallet_balance(&self) -> ConnectorResult<Decimal> {
        let query = [("accountType", self.config.account_type.clone())];
        let result: ListResult<WalletAccount> =
            self.get("/v5/account/wallet-balance", &query).await?;
        let account = result.list.into_iter().next().ok_or_else(|| {
            ConnectorError::Decode("wallet-balance returned no account".to_string())
        })?;
        parse_decimal(&account.total_equity)
    }

    async fn get_positions(&self, symbol: Option<&str>) -> ConnectorResult<Vec<Position>> {
        let mut query = vec![("category", self.config.category.clone())];
        match symbol {
            Some(s) => query.push(("symbol", s.to_string())),
            None => query.push(("settleCoin", "USDT".to_string())),
        }
        let result: ListResult<PositionItem> = self.get("/v5/position/list", &query).await?;

        let mut positions = Vec::new();
        for item in result.list {
            // Flat positions come back with an empty side
            let Ok(side) = Side::from_str(&item.side) else {
                continue;
            };
            let position = Position {
                symbol: item.symbol,
                side,
                size: parse_decimal(&item.size)?,
                entry_price: parse_decimal(&item.avg_price)?,
                mark_price: parse_decimal(&item.mark_price)?,
            };
            if !position.is_closed() {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    async fn place_order(&self, request: &OrderRequest) -> ConnectorResult<OrderResult> {
        let mut body = json!({
            "category": self.config.category,
            "symbol": request.symbol,
            "side": request.side.as_str(),
            "orderType": request.order_type.as_str(),
            "qty": request.qty.normalize().to_string(),
        });
        if request.order_type == OrderType::Limit {
            if let Some(price) = request.price {
                body["price"] = json!(price.normalize().to_string());
            }
        }
        if let Some(link_id) = &request.client_order_id {
            body["orderLinkId"] = json!(link_id);
        }
        self.submit(body, &request.symbol, request.client_order_id.as_deref())
            .await
    }

    async fn close_position(&self, request: &OrderRequest) -> ConnectorResult<OrderResult> {
        let mut body = json!({
            "category": self.config.category,
            "symbol": request.symbol,
            "side": request.side.as_str(),
            "orderType": OrderType::Market.as_str(),
            "qty": request.qty.normalize().to_string(),
            "reduceOnly": true,
        });
        if let Some(link_id) = &request.client_order_id {
            body["orderLinkId"] = json!(link_id);
        }
        self.submit(body, &request.symbol, request.client_order_id.as_deref())
            .await
    }

    async fn internal_transfer(
        &self,
        request: &TransferRequest,
    ) -> ConnectorResult<TransferResult> {
        let transfer_id = uuid::Uuid::new_v4().to_string();
        let body = json!({
            "transferId": transfer_id,
            "coin": request.coin,
            "amount": request.amount.normalize().to_string(),
            "fromMemberId": member_id(&request.from_account)?,
            "toMemberId": member_id(&request.to_account)?,
            "fromAccountType": self.config.account_type,
            "toAccountType": self.config.account_type,
        });
        let result: TransferResponse =
            self.post("/v5/asset/transfer/universal-transfer", body).await?;
        Ok(TransferResult {
            success: result.status.eq_ignore_ascii_case("SUCCESS"),
            transaction_id: result.transfer_id,
        })
    }

    async fn get_closed_pnl(&self, window: PnlWindow) -> ConnectorResult<Decimal> {
        let mut total = Decimal::ZERO;
        let mut cursor = String::new();

        for _ in 0..MAX_PNL_PAGES {
            let mut query = vec![
                ("category", self.config.category.clone()),
                ("startTime", window.start.timestamp_millis().to_string()),
                ("endTime", window.end.timestamp_millis().to_string()),
                ("limit", CLOSED_PNL_PAGE.to_string()),
            ];
            if !cursor.is_empty() {
                query.push(("cursor", cursor.clone()));
            }
            let page: ClosedPnlPage = self.get("/v5/position/closed-pnl", &query).await?;
            for item in &page.list {
                total += parse_decimal(&item.closed_pnl)?;
            }
            if page.next_page_cursor.is_empty() || page.list.is_empty() {
                return Ok(total);
            }
            cursor = page.next_page_cursor;
        }

        warn!(pages = MAX_PNL_PAGES, "Closed pnl paging stopped early");
        Ok(total)
    }

    async fn validate_credentials(&self) -> ConnectorResult<String> {
        let info: ApiKeyInfo = self.get("/v5/user/query-api", &[]).await?;
        Ok(info.user_id.to_string())
    }
}

/// Builds [`BybitClient`]s over one shared HTTP connection pool.
pub struct BybitConnectorFactory {
    http: Client,
    config: Arc<BybitConfig>,
}

impl BybitConnectorFactory {
    pub fn new(config: BybitConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(config.request_timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }
}

impl ConnectorFactory for BybitConnectorFactory {
    fn connector(
        &self,
        credentials: &ApiCredentials,
    ) -> ConnectorResult<Arc<dyn ExchangeConnector>> {
        if credentials.api_key.is_empty() || credentials.api_secret.is_empty() {
            return Err(ConnectorError::Credential("missing API key or secret".to_string()));
        }
        Ok(Arc::new(BybitClient::new(
            self.http.clone(),
            Arc::clone(&self.config),
            credentials.clone(),
        )))
    }
}

/// Hex-encoded HMAC-SHA256 of `payload`.
pub(crate) fn sign(secret: &str, payload: &str) -> ConnectorResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ConnectorError::Credential(format!("invalid signing key: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Bybit sends numbers as strings, and empty strings for "nothing".
pub(crate) fn parse_decimal(value: &str) -> ConnectorResult<Decimal> {
    if value.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(value)
        .map_err(|e| ConnectorError::Decode(format!("bad number '{}': {}", value, e)))
}

fn member_id(account: &str) -> ConnectorResult<u64> {
    account
        .parse::<u64>()
        .map_err(|_| ConnectorError::Exchange {
            code: 0,
            message: format!("'{}' is not a Bybit member id", account),
        })
}

// ==================== Wire types ====================

#[derive(Deserialize)]
struct ApiResponse<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    result: Option<T>,
}

#[derive(Deserialize)]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Deserialize)]
struct WalletAccount {
    #[serde(rename = "totalEquity", default)]
    total_equity: String,
}

#[derive(Deserialize)]
struct PositionItem {
    symbol: String,
    #[serde(default)]
    side: String,
    #[serde(default)]
    size: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
    #[serde(rename = "markPrice", default)]
    mark_price: String,
}

#[derive(Deserialize)]
struct CreateOrderResult {
    #[serde(rename = "orderId")]
    order_id: String,
}

#[derive(Deserialize)]
struct OrderItem {
    #[serde(rename = "orderId")]
    order_id: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
    #[serde(rename = "orderStatus", default)]
    order_status: String,
}

impl OrderItem {
    /// Average fill price; unfilled orders report zero or nothing.
    fn avg_price(&self) -> Option<Decimal> {
        parse_decimal(&self.avg_price).ok().filter(|p| *p > Decimal::ZERO)
    }
}

#[derive(Deserialize)]
struct TransferResponse {
    #[serde(rename = "transferId")]
    transfer_id: String,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
struct ClosedPnlPage {
    #[serde(default)]
    list: Vec<ClosedPnlItem>,
    #[serde(rename = "nextPageCursor", default)]
    next_page_cursor: String,
}

#[derive(Deserialize)]
struct ClosedPnlItem {
    #[serde(rename = "closedPnl", default)]
    closed_pnl: String,
}

#[derive(Deserialize)]
struct ApiKeyInfo {
    #[serde(rename = "userID")]
    user_id: u64,
}
