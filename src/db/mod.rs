//! Database persistence for the replication engine.
//!
//! Stores everything the engine needs to resume after a restart:
//! - Master configuration and the copier registry
//! - The durable replication task queue
//! - Trade mirror audit rows and action logs
//! - Sync status heartbeats and profit transfers
//! - Copier disconnect progress

use std::collections::HashSet;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{
    ApiCredentials, CopierAccount, CopierSettings, CopyStatus, MasterConfig, MirrorStatus,
    OrderType, ProfitTransferRecord, ReplicationTask, Side, SyncMethod, SyncState,
    SyncStatusRecord, TaskMetadata, TaskStatus, TaskType, TradeMirrorRecord, TransferStatus,
    TransferType,
};

/// Database connection pool with full state management.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Progress of the close-everything path for a deactivated copier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectPhase {
    /// Close-out tasks have been queued
    Closing,
    /// Positions are flat and the withdrawal settlement ran
    Disconnected,
}

impl DisconnectPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectPhase::Closing => "closing",
            DisconnectPhase::Disconnected => "disconnected",
        }
    }
}

/// Stored action log entry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActionLog {
    pub id: i64,
    pub account_id: String,
    pub action: String,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

/// Task counts by status.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

#[derive(sqlx::FromRow)]
struct MasterRow {
    api_key: String,
    api_secret: String,
    settlement_account_id: String,
}

#[derive(sqlx::FromRow)]
struct CopierRow {
    id: String,
    user_id: String,
    api_key: String,
    api_secret: String,
    exchange_account_id: Option<String>,
    capital: String,
    max_risk_percent: String,
    copy_status: String,
    copy_multiplier: String,
    max_position_size: String,
    allowed_symbols: Option<String>,
    blocked_symbols: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    master_account_id: String,
    copier_account_id: String,
    master_trade_id: Option<String>,
    task_type: String,
    symbol: String,
    side: String,
    order_type: String,
    quantity: String,
    price: Option<String>,
    status: String,
    priority: i64,
    retry_count: i64,
    max_retries: i64,
    metadata: String,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct MirrorRow {
    task_id: String,
    copier_account_id: String,
    master_trade_id: Option<String>,
    copier_trade_id: Option<String>,
    symbol: String,
    side: String,
    quantity: String,
    master_price: Option<String>,
    copier_price: Option<String>,
    slippage_percent: Option<String>,
    status: String,
    execution_time_ms: i64,
    error_message: Option<String>,
}

#[derive(sqlx::FromRow)]
struct SyncRow {
    account_id: String,
    websocket_connected: bool,
    sync_method: String,
    sync_status: String,
    last_error: Option<String>,
    last_heartbeat: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct TransferRow {
    id: String,
    copier_account_id: String,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    total_profit: String,
    user_share: String,
    platform_share: String,
    transfer_amount: String,
    status: String,
    transfer_type: String,
    transaction_id: Option<String>,
    error_message: Option<String>,
}

const TASK_COLUMNS: &str = "id, master_account_id, copier_account_id, master_trade_id, task_type, \
     symbol, side, order_type, quantity, price, status, priority, retry_count, max_retries, \
     metadata, created_at";

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database. A single connection that never expires,
    /// since each SQLite memory connection is its own database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Singleton master account
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS master_config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                api_key TEXT NOT NULL,
                api_secret TEXT NOT NULL,
                settlement_account_id TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Copier registry
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS copier_accounts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                api_key TEXT NOT NULL,
                api_secret TEXT NOT NULL,
                exchange_account_id TEXT,
                capital TEXT NOT NULL,
                max_risk_percent TEXT NOT NULL DEFAULT '0',
                copy_status TEXT NOT NULL DEFAULT 'paused',
                copy_multiplier TEXT NOT NULL DEFAULT '1',
                max_position_size TEXT NOT NULL DEFAULT '0',
                allowed_symbols TEXT,
                blocked_symbols TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Durable task queue; seq gives creation order
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_tasks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                master_account_id TEXT NOT NULL,
                copier_account_id TEXT NOT NULL,
                master_trade_id TEXT,
                task_type TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 1,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                metadata TEXT NOT NULL DEFAULT '{}',
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // At most one live task per copier per master trade
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_master_trade
            ON replication_tasks (copier_account_id, master_trade_id)
            WHERE status != 'failed' AND master_trade_id IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tasks_queue
            ON replication_tasks (status, priority DESC, seq)
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Trade mirror audit
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_mirrors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                copier_account_id TEXT NOT NULL,
                master_trade_id TEXT,
                copier_trade_id TEXT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                master_price TEXT,
                copier_price TEXT,
                slippage_percent TEXT,
                status TEXT NOT NULL,
                execution_time_ms INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Sync heartbeats
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_status (
                account_id TEXT PRIMARY KEY,
                websocket_connected INTEGER NOT NULL DEFAULT 0,
                sync_method TEXT NOT NULL,
                sync_status TEXT NOT NULL,
                last_error TEXT,
                last_heartbeat TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Profit settlements
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS profit_transfers (
                id TEXT PRIMARY KEY,
                copier_account_id TEXT NOT NULL,
                period_start TEXT NOT NULL,
                period_end TEXT NOT NULL,
                total_profit TEXT NOT NULL,
                user_share TEXT NOT NULL,
                platform_share TEXT NOT NULL,
                transfer_amount TEXT NOT NULL,
                status TEXT NOT NULL,
                transfer_type TEXT NOT NULL,
                transaction_id TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Audit action log
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS action_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                action TEXT NOT NULL,
                details TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Disconnect progress for deactivated copiers
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS copier_disconnects (
                copier_account_id TEXT PRIMARY KEY,
                phase TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Master ====================

    /// Create or replace the master configuration.
    pub async fn save_master_config(&self, config: &MasterConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO master_config (id, api_key, api_secret, settlement_account_id)
            VALUES (1, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                api_key = excluded.api_key,
                api_secret = excluded.api_secret,
                settlement_account_id = excluded.settlement_account_id,
                updated_at = datetime('now')
            "#,
        )
        .bind(&config.credentials.api_key)
        .bind(&config.credentials.api_secret)
        .bind(&config.settlement_account_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_master_config(&self) -> Result<Option<MasterConfig>> {
        let row: Option<MasterRow> = sqlx::query_as(
            "SELECT api_key, api_secret, settlement_account_id FROM master_config WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load master config")?;

        Ok(row.map(|r| MasterConfig {
            credentials: ApiCredentials::new(r.api_key, r.api_secret),
            settlement_account_id: r.settlement_account_id,
        }))
    }

    // ==================== Copiers ====================

    /// Insert or update a copier.
    ///
    /// A copier created inactive has nothing to disconnect from, so it starts
    /// out marked disconnected. On an existing copier a status change goes
    /// through [`Database::set_copier_status`] so the disconnect marker
    /// follows the transition.
    pub async fn save_copier(&self, copier: &CopierAccount) -> Result<()> {
        let existing = self.get_copier(&copier.id).await?;

        sqlx::query(
            r#"
            INSERT INTO copier_accounts (
                id, user_id, api_key, api_secret, exchange_account_id, capital, max_risk_percent,
                copy_status, copy_multiplier, max_position_size, allowed_symbols, blocked_symbols,
                created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                api_key = excluded.api_key,
                api_secret = excluded.api_secret,
                exchange_account_id = excluded.exchange_account_id,
                capital = excluded.capital,
                max_risk_percent = excluded.max_risk_percent,
                copy_multiplier = excluded.copy_multiplier,
                max_position_size = excluded.max_position_size,
                allowed_symbols = excluded.allowed_symbols,
                blocked_symbols = excluded.blocked_symbols,
                updated_at = datetime('now')
            "#,
        )
        .bind(&copier.id)
        .bind(&copier.user_id)
        .bind(&copier.credentials.api_key)
        .bind(&copier.credentials.api_secret)
        .bind(&copier.exchange_account_id)
        .bind(copier.capital.to_string())
        .bind(copier.max_risk_percent.to_string())
        .bind(copier.copy_status.as_str())
        .bind(copier.settings.copy_multiplier.to_string())
        .bind(copier.settings.max_position_size.to_string())
        .bind(symbols_to_json(&copier.settings.allowed_symbols)?)
        .bind(symbols_to_json(&copier.settings.blocked_symbols)?)
        .bind(copier.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to save copier")?;

        match existing {
            Some(current) if current.copy_status != copier.copy_status => {
                self.set_copier_status(&copier.id, copier.copy_status).await?;
            }
            Some(_) => {}
            None if copier.copy_status == CopyStatus::Inactive => {
                self.set_disconnect_phase(&copier.id, DisconnectPhase::Disconnected)
                    .await?;
            }
            None => {}
        }

        Ok(())
    }

    pub async fn get_copier(&self, id: &str) -> Result<Option<CopierAccount>> {
        let row: Option<CopierRow> = sqlx::query_as("SELECT * FROM copier_accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load copier")?;

        row.map(CopierAccount::try_from).transpose()
    }

    /// All copiers regardless of status.
    pub async fn list_copiers(&self) -> Result<Vec<CopierAccount>> {
        let rows: Vec<CopierRow> =
            sqlx::query_as("SELECT * FROM copier_accounts ORDER BY created_at, id")
                .fetch_all(&self.pool)
                .await
                .context("Failed to list copiers")?;

        rows.into_iter().map(CopierAccount::try_from).collect()
    }

    /// Copiers flagged active whose credentials are not suspended.
    pub async fn list_active_copiers(&self) -> Result<Vec<CopierAccount>> {
        let rows: Vec<CopierRow> = sqlx::query_as(
            r#"
            SELECT c.* FROM copier_accounts c
            LEFT JOIN sync_status s ON s.account_id = c.id
            WHERE c.copy_status = 'active'
              AND (s.sync_status IS NULL OR s.sync_status != 'credential_error')
            ORDER BY c.created_at, c.id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list active copiers")?;

        rows.into_iter().map(CopierAccount::try_from).collect()
    }

    /// Whether the copier's credentials were rejected and not yet re-validated.
    pub async fn is_suspended(&self, id: &str) -> Result<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT sync_status FROM sync_status WHERE account_id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(matches!(row, Some((status,)) if status == SyncState::CredentialError.as_str()))
    }

    pub async fn get_copier_settings(&self, id: &str) -> Result<Option<CopierSettings>> {
        Ok(self.get_copier(id).await?.map(|c| c.settings))
    }

    pub async fn update_copier_settings(
        &self,
        id: &str,
        settings: &CopierSettings,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE copier_accounts SET
                copy_multiplier = ?,
                max_position_size = ?,
                allowed_symbols = ?,
                blocked_symbols = ?,
                updated_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(settings.copy_multiplier.to_string())
        .bind(settings.max_position_size.to_string())
        .bind(symbols_to_json(&settings.allowed_symbols)?)
        .bind(symbols_to_json(&settings.blocked_symbols)?)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Change a copier's status. Any real transition clears the disconnect
    /// marker, so moving to inactive starts a fresh close-out.
    pub async fn set_copier_status(&self, id: &str, status: CopyStatus) -> Result<bool> {
        let Some(current) = self.get_copier(id).await? else {
            return Ok(false);
        };
        if current.copy_status == status {
            return Ok(true);
        }

        sqlx::query(
            "UPDATE copier_accounts SET copy_status = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
            .await?;

        sqlx::query("DELETE FROM copier_disconnects WHERE copier_account_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(true)
    }

    pub async fn set_exchange_account_id(&self, id: &str, exchange_account_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE copier_accounts SET exchange_account_id = ?, updated_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(exchange_account_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Disconnects ====================

    /// Inactive copiers whose close-out has not finished.
    pub async fn pending_disconnects(
        &self,
    ) -> Result<Vec<(CopierAccount, Option<DisconnectPhase>)>> {
        let rows: Vec<CopierRow> = sqlx::query_as(
            r#"
            SELECT c.* FROM copier_accounts c
            LEFT JOIN copier_disconnects d ON d.copier_account_id = c.id
            WHERE c.copy_status = 'inactive'
              AND (d.phase IS NULL OR d.phase != 'disconnected')
            ORDER BY c.id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list pending disconnects")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let copier = CopierAccount::try_from(row)?;
            let phase = self.get_disconnect_phase(&copier.id).await?;
            out.push((copier, phase));
        }
        Ok(out)
    }

    pub async fn get_disconnect_phase(&self, id: &str) -> Result<Option<DisconnectPhase>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT phase FROM copier_disconnects WHERE copier_account_id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.and_then(|(phase,)| match phase.as_str() {
            "closing" => Some(DisconnectPhase::Closing),
            "disconnected" => Some(DisconnectPhase::Disconnected),
            _ => None,
        }))
    }

    pub async fn set_disconnect_phase(&self, id: &str, phase: DisconnectPhase) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO copier_disconnects (copier_account_id, phase, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(copier_account_id) DO UPDATE SET
                phase = excluded.phase,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(phase.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Tasks ====================

    /// Enqueue a task. Returns false when a live task for the same copier
    /// and master trade already exists.
    pub async fn insert_task(&self, task: &ReplicationTask) -> Result<bool> {
        let metadata =
            serde_json::to_string(&task.metadata).context("Failed to encode task metadata")?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO replication_tasks (
                id, master_account_id, copier_account_id, master_trade_id, task_type, symbol,
                side, order_type, quantity, price, status, priority, retry_count, max_retries,
                metadata, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.master_account_id)
        .bind(&task.copier_account_id)
        .bind(&task.master_trade_id)
        .bind(task.task_type.as_str())
        .bind(&task.symbol)
        .bind(task.side.as_str())
        .bind(task.order_type.as_str())
        .bind(task.quantity.to_string())
        .bind(task.price.map(|p| p.to_string()))
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(task.retry_count)
        .bind(task.max_retries)
        .bind(metadata)
        .bind(task.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert task")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<ReplicationTask>> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {} FROM replication_tasks WHERE id = ?", TASK_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(ReplicationTask::try_from).transpose()
    }

    /// Copiers with pending work, most urgent first. Suspended copiers are
    /// left out until their credentials are re-validated.
    pub async fn pending_copiers(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT t.copier_account_id FROM replication_tasks t
            LEFT JOIN sync_status s ON s.account_id = t.copier_account_id
            WHERE t.status = 'pending'
              AND (s.sync_status IS NULL OR s.sync_status != 'credential_error')
            GROUP BY t.copier_account_id
            ORDER BY MAX(t.priority) DESC, MIN(t.seq) ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list copiers with pending tasks")?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// One copier's pending tasks in dequeue order: priority first, then
    /// creation order.
    pub async fn fetch_pending_tasks(
        &self,
        copier_id: &str,
        limit: i64,
    ) -> Result<Vec<ReplicationTask>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM replication_tasks
            WHERE copier_account_id = ? AND status = 'pending'
            ORDER BY priority DESC, seq ASC
            LIMIT ?
            "#,
            TASK_COLUMNS
        ))
        .bind(copier_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch pending tasks")?;

        rows.into_iter().map(ReplicationTask::try_from).collect()
    }

    /// Atomically move a task from pending to processing.
    pub async fn claim_task(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE replication_tasks SET status = 'processing', updated_at = datetime('now')
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn complete_task(&self, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE replication_tasks SET status = 'completed', updated_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persist a failed attempt: back to pending, or terminally failed.
    pub async fn record_task_failure(
        &self,
        task: &ReplicationTask,
        status: TaskStatus,
        error: &str,
    ) -> Result<()> {
        let metadata = serde_json::to_string(&task.metadata)?;

        sqlx::query(
            r#"
            UPDATE replication_tasks SET
                status = ?,
                retry_count = ?,
                error_message = ?,
                metadata = ?,
                updated_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(task.retry_count)
        .bind(error)
        .bind(metadata)
        .bind(&task.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record the outcome of a claimed task that could not be executed.
    /// Only a task still in processing is touched.
    pub async fn release_task(
        &self,
        task: &ReplicationTask,
        status: TaskStatus,
        error: &str,
    ) -> Result<bool> {
        let metadata = serde_json::to_string(&task.metadata)?;

        let result = sqlx::query(
            r#"
            UPDATE replication_tasks SET
                status = ?,
                retry_count = ?,
                error_message = ?,
                metadata = ?,
                updated_at = datetime('now')
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(status.as_str())
        .bind(task.retry_count)
        .bind(error)
        .bind(metadata)
        .bind(&task.id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Return tasks stranded in processing by a crash to the queue.
    pub async fn reset_processing_tasks(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE replication_tasks SET status = 'pending', updated_at = datetime('now')
            WHERE status = 'processing'
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Symbols with a pending or processing task for this copier.
    pub async fn in_flight_symbols(&self, copier_id: &str) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT symbol FROM replication_tasks
            WHERE copier_account_id = ? AND status IN ('pending', 'processing')
            "#,
        )
        .bind(copier_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    pub async fn recent_tasks(&self, limit: i64) -> Result<Vec<ReplicationTask>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM replication_tasks ORDER BY seq DESC LIMIT ?",
            TASK_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch recent tasks")?;

        rows.into_iter().map(ReplicationTask::try_from).collect()
    }

    pub async fn tasks_for_copier(&self, copier_id: &str) -> Result<Vec<ReplicationTask>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM replication_tasks WHERE copier_account_id = ? ORDER BY seq ASC",
            TASK_COLUMNS
        ))
        .bind(copier_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ReplicationTask::try_from).collect()
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM replication_tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => stats.pending = count,
                "processing" => stats.processing = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    // ==================== Trade Mirrors ====================

    pub async fn insert_mirror(&self, record: &TradeMirrorRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_mirrors (
                task_id, copier_account_id, master_trade_id, copier_trade_id, symbol, side,
                quantity, master_price, copier_price, slippage_percent, status,
                execution_time_ms, error_message
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.task_id)
        .bind(&record.copier_account_id)
        .bind(&record.master_trade_id)
        .bind(&record.copier_trade_id)
        .bind(&record.symbol)
        .bind(record.side.as_str())
        .bind(record.quantity.to_string())
        .bind(record.master_price.map(|p| p.to_string()))
        .bind(record.copier_price.map(|p| p.to_string()))
        .bind(record.slippage_percent.map(|p| p.to_string()))
        .bind(record.status.as_str())
        .bind(record.execution_time_ms)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await
        .context("Failed to write trade mirror")?;

        Ok(())
    }

    pub async fn mirrors_for_task(&self, task_id: &str) -> Result<Vec<TradeMirrorRecord>> {
        let rows: Vec<MirrorRow> = sqlx::query_as(
            r#"
            SELECT task_id, copier_account_id, master_trade_id, copier_trade_id, symbol, side,
                   quantity, master_price, copier_price, slippage_percent, status,
                   execution_time_ms, error_message
            FROM trade_mirrors WHERE task_id = ? ORDER BY id
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TradeMirrorRecord::try_from).collect()
    }

    // ==================== Sync Status ====================

    pub async fn upsert_sync_status(&self, record: &SyncStatusRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_status (
                account_id, websocket_connected, sync_method, sync_status, last_error,
                last_heartbeat
            )
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                websocket_connected = excluded.websocket_connected,
                sync_method = excluded.sync_method,
                sync_status = excluded.sync_status,
                last_error = excluded.last_error,
                last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(&record.account_id)
        .bind(record.websocket_connected)
        .bind(record.sync_method.as_str())
        .bind(record.sync_status.as_str())
        .bind(&record.last_error)
        .bind(record.last_heartbeat)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_sync_status(&self, account_id: &str) -> Result<Option<SyncStatusRecord>> {
        let row: Option<SyncRow> = sqlx::query_as("SELECT * FROM sync_status WHERE account_id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(SyncStatusRecord::try_from).transpose()
    }

    pub async fn list_sync_status(&self) -> Result<Vec<SyncStatusRecord>> {
        let rows: Vec<SyncRow> = sqlx::query_as("SELECT * FROM sync_status ORDER BY account_id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(SyncStatusRecord::try_from).collect()
    }

    // ==================== Profit Transfers ====================

    pub async fn insert_transfer(&self, record: &ProfitTransferRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO profit_transfers (
                id, copier_account_id, period_start, period_end, total_profit, user_share,
                platform_share, transfer_amount, status, transfer_type, transaction_id,
                error_message
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.copier_account_id)
        .bind(record.period_start)
        .bind(record.period_end)
        .bind(record.total_profit.to_string())
        .bind(record.user_share.to_string())
        .bind(record.platform_share.to_string())
        .bind(record.transfer_amount.to_string())
        .bind(record.status.as_str())
        .bind(record.transfer_type.as_str())
        .bind(&record.transaction_id)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await
        .context("Failed to write profit transfer")?;

        Ok(())
    }

    /// End of the copier's last settled period. Failed runs are not settled.
    pub async fn last_settlement_end(&self, copier_id: &str) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            SELECT period_end FROM profit_transfers
            WHERE copier_account_id = ? AND status IN ('completed', 'skipped')
            ORDER BY period_end DESC LIMIT 1
            "#,
        )
        .bind(copier_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(end,)| end))
    }

    pub async fn transfers_for_copier(&self, copier_id: &str) -> Result<Vec<ProfitTransferRecord>> {
        let rows: Vec<TransferRow> = sqlx::query_as(
            r#"
            SELECT id, copier_account_id, period_start, period_end, total_profit, user_share,
                   platform_share, transfer_amount, status, transfer_type, transaction_id,
                   error_message
            FROM profit_transfers WHERE copier_account_id = ? ORDER BY created_at, period_end
            "#,
        )
        .bind(copier_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ProfitTransferRecord::try_from).collect()
    }

    // ==================== Action Logs ====================

    pub async fn log_action(
        &self,
        account_id: &str,
        action: &str,
        details: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO action_logs (account_id, action, details, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(account_id)
        .bind(action)
        .bind(details.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Newest audit entries first, optionally for one account.
    pub async fn recent_actions(
        &self,
        account_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ActionLog>> {
        sqlx::query_as::<_, ActionLog>(
            r#"
            SELECT * FROM action_logs
            WHERE ? IS NULL OR account_id = ?
            ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(account_id)
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch action logs")
    }
}

// ==================== Row conversions ====================

fn dec(value: &str) -> Result<Decimal> {
    Decimal::from_str(value).with_context(|| format!("Invalid decimal '{}'", value))
}

fn opt_dec(value: Option<String>) -> Result<Option<Decimal>> {
    value.as_deref().map(dec).transpose()
}

fn symbols_to_json(symbols: &Option<Vec<String>>) -> Result<Option<String>> {
    symbols
        .as_ref()
        .map(|s| serde_json::to_string(s).context("Failed to encode symbol list"))
        .transpose()
}

fn symbols_from_json(value: Option<String>) -> Result<Option<Vec<String>>> {
    value
        .map(|s| serde_json::from_str(&s).context("Invalid symbol list"))
        .transpose()
}

impl TryFrom<CopierRow> for CopierAccount {
    type Error = anyhow::Error;

    fn try_from(row: CopierRow) -> Result<Self> {
        Ok(CopierAccount {
            capital: dec(&row.capital)?,
            max_risk_percent: dec(&row.max_risk_percent)?,
            copy_status: CopyStatus::from_str(&row.copy_status)?,
            settings: CopierSettings {
                max_position_size: dec(&row.max_position_size)?,
                allowed_symbols: symbols_from_json(row.allowed_symbols)?,
                blocked_symbols: symbols_from_json(row.blocked_symbols)?,
                copy_multiplier: dec(&row.copy_multiplier)?,
            },
            credentials: ApiCredentials::new(row.api_key, row.api_secret),
            id: row.id,
            user_id: row.user_id,
            exchange_account_id: row.exchange_account_id,
            created_at: row.created_at,
        })
    }
}

impl TryFrom<TaskRow> for ReplicationTask {
    type Error = anyhow::Error;

    fn try_from(row: TaskRow) -> Result<Self> {
        let metadata: TaskMetadata = serde_json::from_str(&row.metadata)
            .with_context(|| format!("Invalid metadata on task {}", row.id))?;

        Ok(ReplicationTask {
            task_type: TaskType::from_str(&row.task_type)?,
            side: Side::from_str(&row.side)?,
            order_type: OrderType::from_str(&row.order_type)?,
            quantity: dec(&row.quantity)?,
            price: opt_dec(row.price)?,
            status: TaskStatus::from_str(&row.status)?,
            id: row.id,
            master_account_id: row.master_account_id,
            copier_account_id: row.copier_account_id,
            master_trade_id: row.master_trade_id,
            symbol: row.symbol,
            priority: row.priority,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            created_at: row.created_at,
            metadata,
        })
    }
}

impl TryFrom<MirrorRow> for TradeMirrorRecord {
    type Error = anyhow::Error;

    fn try_from(row: MirrorRow) -> Result<Self> {
        let status = match row.status.as_str() {
            "executed" => MirrorStatus::Executed,
            "failed" => MirrorStatus::Failed,
            "skipped" => MirrorStatus::Skipped,
            other => anyhow::bail!("unknown mirror status '{}'", other),
        };

        Ok(TradeMirrorRecord {
            side: Side::from_str(&row.side)?,
            quantity: dec(&row.quantity)?,
            master_price: opt_dec(row.master_price)?,
            copier_price: opt_dec(row.copier_price)?,
            slippage_percent: opt_dec(row.slippage_percent)?,
            status,
            task_id: row.task_id,
            copier_account_id: row.copier_account_id,
            master_trade_id: row.master_trade_id,
            copier_trade_id: row.copier_trade_id,
            symbol: row.symbol,
            execution_time_ms: row.execution_time_ms,
            error_message: row.error_message,
        })
    }
}

impl TryFrom<SyncRow> for SyncStatusRecord {
    type Error = anyhow::Error;

    fn try_from(row: SyncRow) -> Result<Self> {
        let sync_method = match row.sync_method.as_str() {
            "websocket" => SyncMethod::Websocket,
            "reconciliation" => SyncMethod::Reconciliation,
            other => anyhow::bail!("unknown sync method '{}'", other),
        };

        Ok(SyncStatusRecord {
            account_id: row.account_id,
            websocket_connected: row.websocket_connected,
            sync_method,
            sync_status: SyncState::from_str(&row.sync_status)?,
            last_error: row.last_error,
            last_heartbeat: row.last_heartbeat,
        })
    }
}

impl TryFrom<TransferRow> for ProfitTransferRecord {
    type Error = anyhow::Error;

    fn try_from(row: TransferRow) -> Result<Self> {
        Ok(ProfitTransferRecord {
            total_profit: dec(&row.total_profit)?,
            user_share: dec(&row.user_share)?,
            platform_share: dec(&row.platform_share)?,
            transfer_amount: dec(&row.transfer_amount)?,
            status: TransferStatus::from_str(&row.status)?,
            transfer_type: TransferType::from_str(&row.transfer_type)?,
            id: row.id,
            copier_account_id: row.copier_account_id,
            period_start: row.period_start,
            period_end: row.period_end,
            transaction_id: row.transaction_id,
            error_message: row.error_message,
        })
    }
}
