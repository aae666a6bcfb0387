//! Audit records written by the engine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::trade::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorStatus {
    Executed,
    Failed,
    Skipped,
}

impl MirrorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorStatus::Executed => "executed",
            MirrorStatus::Failed => "failed",
            MirrorStatus::Skipped => "skipped",
        }
    }
}

/// Immutable row written once per task terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeMirrorRecord {
    pub task_id: String,
    pub copier_account_id: String,
    pub master_trade_id: Option<String>,
    pub copier_trade_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub master_price: Option<Decimal>,
    pub copier_price: Option<Decimal>,
    pub slippage_percent: Option<Decimal>,
    pub status: MirrorStatus,
    pub execution_time_ms: i64,
    pub error_message: Option<String>,
}

/// How a copier was last brought in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMethod {
    Websocket,
    Reconciliation,
}

impl SyncMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMethod::Websocket => "websocket",
            SyncMethod::Reconciliation => "reconciliation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Synced,
    Connected,
    Reconnecting,
    Disconnected,
    Error,
    /// Credentials rejected; the copier is excluded until re-validated
    CredentialError,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::Connected => "connected",
            SyncState::Reconnecting => "reconnecting",
            SyncState::Disconnected => "disconnected",
            SyncState::Error => "error",
            SyncState::CredentialError => "credential_error",
        }
    }
}

impl FromStr for SyncState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(SyncState::Synced),
            "connected" => Ok(SyncState::Connected),
            "reconnecting" => Ok(SyncState::Reconnecting),
            "disconnected" => Ok(SyncState::Disconnected),
            "error" => Ok(SyncState::Error),
            "credential_error" => Ok(SyncState::CredentialError),
            other => anyhow::bail!("unknown sync state '{}'", other),
        }
    }
}

/// One row per account (copiers, plus the master's connectivity row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatusRecord {
    pub account_id: String,
    pub websocket_connected: bool,
    pub sync_method: SyncMethod,
    pub sync_status: SyncState,
    pub last_error: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
}

impl SyncStatusRecord {
    pub fn new(account_id: &str, method: SyncMethod, status: SyncState) -> Self {
        Self {
            account_id: account_id.to_string(),
            websocket_connected: method == SyncMethod::Websocket,
            sync_method: method,
            sync_status: status,
            last_error: None,
            last_heartbeat: Utc::now(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Completed,
    Skipped,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Completed => "completed",
            TransferStatus::Skipped => "skipped",
            TransferStatus::Failed => "failed",
        }
    }
}

impl FromStr for TransferStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransferStatus::Pending),
            "completed" => Ok(TransferStatus::Completed),
            "skipped" => Ok(TransferStatus::Skipped),
            "failed" => Ok(TransferStatus::Failed),
            other => anyhow::bail!("unknown transfer status '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    /// Scheduled weekly settlement
    Weekly,
    /// Out-of-cycle settlement when a copier disconnects
    Withdrawal,
}

impl TransferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferType::Weekly => "weekly",
            TransferType::Withdrawal => "withdrawal",
        }
    }
}

impl FromStr for TransferType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weekly" => Ok(TransferType::Weekly),
            "withdrawal" => Ok(TransferType::Withdrawal),
            other => anyhow::bail!("unknown transfer type '{}'", other),
        }
    }
}

/// One per copier per settlement period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitTransferRecord {
    pub id: String,
    pub copier_account_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_profit: Decimal,
    pub user_share: Decimal,
    pub platform_share: Decimal,
    pub transfer_amount: Decimal,
    pub status: TransferStatus,
    pub transfer_type: TransferType,
    pub transaction_id: Option<String>,
    pub error_message: Option<String>,
}
