//! Replication tasks: one queued open/close instruction for one copier.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::trade::{OrderType, Side};

/// Fixed priority of tasks derived from master trades and reconciliation.
pub const PRIORITY_NORMAL: i64 = 1;

/// Priority of close-outs for a disconnecting copier.
pub const PRIORITY_DISCONNECT: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    OpenPosition,
    ClosePosition,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::OpenPosition => "open_position",
            TaskType::ClosePosition => "close_position",
        }
    }
}

impl FromStr for TaskType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open_position" => Ok(TaskType::OpenPosition),
            "close_position" => Ok(TaskType::ClosePosition),
            other => anyhow::bail!("unknown task type '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => anyhow::bail!("unknown task status '{}'", other),
        }
    }
}

/// Where a task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOrigin {
    MasterTrade,
    Reconciliation,
    Disconnect,
}

/// Opaque, forward-compatible payload stored with the task.
///
/// The executor never reads business fields from here; symbol, side,
/// quantity and price live on the task itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub origin: TaskOrigin,

    /// Master capital the ratio was computed against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_capital: Option<Decimal>,

    /// Capital ratio times multiplier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<Decimal>,

    /// Last error seen by the executor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Anything else a producer wants to keep
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

impl TaskMetadata {
    pub fn new(origin: TaskOrigin) -> Self {
        Self {
            origin,
            master_capital: None,
            ratio: None,
            last_error: None,
            extra: serde_json::Value::Null,
        }
    }
}

/// One queued instruction to open or close a position on a copier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub id: String,

    pub master_account_id: String,

    pub copier_account_id: String,

    /// Master execution this task mirrors (None for reconciliation deltas)
    pub master_trade_id: Option<String>,

    pub task_type: TaskType,

    pub symbol: String,

    /// Side of the order to submit
    pub side: Side,

    pub order_type: OrderType,

    pub quantity: Decimal,

    /// Expected execution price, used for risk checks and slippage
    pub price: Option<Decimal>,

    pub status: TaskStatus,

    pub priority: i64,

    pub retry_count: i64,

    pub max_retries: i64,

    pub created_at: DateTime<Utc>,

    pub metadata: TaskMetadata,
}

impl ReplicationTask {
    /// Create a new pending market-order task.
    pub fn new(
        copier_account_id: &str,
        task_type: TaskType,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
        max_retries: i64,
        metadata: TaskMetadata,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            master_account_id: MASTER_ACCOUNT_ID.to_string(),
            copier_account_id: copier_account_id.to_string(),
            master_trade_id: None,
            task_type,
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price,
            status: TaskStatus::Pending,
            priority: PRIORITY_NORMAL,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            metadata,
        }
    }

    pub fn with_master_trade(mut self, trade_id: &str) -> Self {
        self.master_trade_id = Some(trade_id.to_string());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Expected notional of the order, when a price is known.
    pub fn notional(&self) -> Option<Decimal> {
        self.price.map(|p| p * self.quantity)
    }

    /// Will another failure exhaust the retry budget?
    pub fn retries_exhausted_after_failure(&self) -> bool {
        self.retry_count + 1 >= self.max_retries
    }
}

/// There is exactly one master account; tasks reference it by this ID.
pub const MASTER_ACCOUNT_ID: &str = "master";

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_new_task_defaults() {
        let task = ReplicationTask::new(
            "c1",
            TaskType::OpenPosition,
            "BTCUSDT",
            Side::Buy,
            dec!(0.1),
            Some(dec!(60000)),
            3,
            TaskMetadata::new(TaskOrigin::MasterTrade),
        )
        .with_master_trade("exec-1");

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, PRIORITY_NORMAL);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.notional(), Some(dec!(6000)));
        assert_eq!(task.master_trade_id.as_deref(), Some("exec-1"));
    }

    #[test]
    fn test_retry_budget() {
        let mut task = ReplicationTask::new(
            "c1",
            TaskType::ClosePosition,
            "ETHUSDT",
            Side::Sell,
            dec!(1),
            None,
            3,
            TaskMetadata::new(TaskOrigin::Reconciliation),
        );
        assert!(!task.retries_exhausted_after_failure());
        task.retry_count = 2;
        assert!(task.retries_exhausted_after_failure());
    }

    #[test]
    fn test_metadata_is_compact() {
        let meta = TaskMetadata::new(TaskOrigin::Disconnect);
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(json, r#"{"origin":"disconnect"}"#);
    }
}
