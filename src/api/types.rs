//! Request and response types shared by exchange connectors.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{MasterExecution, OrderType, Position, Side};

/// Order to place on an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    /// Caller-chosen id; the exchange accepts each one once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
}

/// Outcome of a placed or closing order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    /// Average fill price, when the exchange reports one
    pub avg_price: Option<Decimal>,
    pub status: String,
}

/// Internal transfer between two exchange accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub amount: Decimal,
    pub coin: String,
    pub from_account: String,
    pub to_account: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub success: bool,
    pub transaction_id: String,
}

/// Order status change on the master account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdate {
    pub symbol: String,
    pub order_id: String,
    pub status: String,
    pub side: Side,
    pub quantity: Decimal,
}

/// A parsed event from the master's private stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Execution(MasterExecution),
    Position(Position),
    Order(OrderUpdate),
}

/// Time window for realized profit queries.
#[derive(Debug, Clone, Copy)]
pub struct PnlWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}
