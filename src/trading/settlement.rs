//! Weekly profit settlement: split each copier's realized profit and move
//! the platform's share to the settlement account.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::json;
use tracing::{error, info, warn};

use crate::api::{with_timeout, ConnectorFactory, PnlWindow, TransferRequest};
use crate::db::Database;
use crate::models::{
    CopierAccount, MasterConfig, ProfitTransferRecord, TransferStatus, TransferType,
};
use crate::status::StatusSink;

use super::EngineConfig;

/// Decimal places kept on transfer amounts.
const TRANSFER_PRECISION: u32 = 4;

/// Outcome counts for one settlement run.
#[derive(Debug, Clone, Default)]
pub struct SettlementSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub transferred: Decimal,
}

/// Owns profit transfer records.
pub struct SettlementJob {
    db: Database,
    sink: StatusSink,
    factory: Arc<dyn ConnectorFactory>,
    config: Arc<EngineConfig>,
}

impl SettlementJob {
    pub fn new(
        sink: StatusSink,
        factory: Arc<dyn ConnectorFactory>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            db: sink.db().clone(),
            sink,
            factory,
            config,
        }
    }

    /// Settle every active copier. One copier's failure does not stop the rest.
    pub async fn process_settlements(&self) -> Result<SettlementSummary> {
        let master = self
            .db
            .get_master_config()
            .await?
            .context("Master account is not configured")?;
        let copiers = self.db.list_active_copiers().await?;
        info!(copiers = copiers.len(), "Starting weekly settlement");

        let mut summary = SettlementSummary::default();
        for copier in &copiers {
            match self.settle_copier(&master, copier, TransferType::Weekly).await {
                Ok(record) => match record.status {
                    TransferStatus::Completed => {
                        summary.completed += 1;
                        summary.transferred += record.transfer_amount;
                    }
                    TransferStatus::Skipped => summary.skipped += 1,
                    TransferStatus::Failed | TransferStatus::Pending => summary.failed += 1,
                },
                Err(e) => {
                    error!(copier = %copier.id, error = %e, "Settlement could not be recorded");
                    summary.failed += 1;
                }
            }
        }

        info!(
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            transferred = %summary.transferred,
            "Weekly settlement finished"
        );
        Ok(summary)
    }

    /// Settle one copier for the period since its last settlement.
    pub async fn settle_copier(
        &self,
        master: &MasterConfig,
        copier: &CopierAccount,
        transfer_type: TransferType,
    ) -> Result<ProfitTransferRecord> {
        let period_end = Utc::now();
        let period_start = self
            .db
            .last_settlement_end(&copier.id)
            .await?
            .unwrap_or(period_end - Duration::days(7));

        let mut record = ProfitTransferRecord {
            id: uuid::Uuid::new_v4().to_string(),
            copier_account_id: copier.id.clone(),
            period_start,
            period_end,
            total_profit: Decimal::ZERO,
            user_share: Decimal::ZERO,
            platform_share: Decimal::ZERO,
            transfer_amount: Decimal::ZERO,
            status: TransferStatus::Pending,
            transfer_type,
            transaction_id: None,
            error_message: None,
        };

        match self.realized_profit(copier, period_start, period_end).await {
            Ok(profit) => {
                record.total_profit = profit;
                self.split_and_transfer(master, copier, &mut record).await;
            }
            Err(e) => {
                record.status = TransferStatus::Failed;
                record.error_message = Some(format!("failed to fetch realized profit: {}", e));
            }
        }

        self.db.insert_transfer(&record).await?;
        self.sink
            .log_action(
                &copier.id,
                "profit_settlement",
                json!({
                    "transferId": record.id,
                    "transferType": record.transfer_type,
                    "status": record.status,
                    "totalProfit": record.total_profit,
                    "platformShare": record.platform_share,
                    "transferAmount": record.transfer_amount,
                    "transactionId": record.transaction_id,
                    "error": record.error_message,
                }),
            )
            .await;

        match record.status {
            TransferStatus::Failed => warn!(
                copier = %copier.id,
                transfer_type = transfer_type.as_str(),
                error = ?record.error_message,
                "Settlement failed, needs manual review"
            ),
            status => info!(
                copier = %copier.id,
                transfer_type = transfer_type.as_str(),
                status = status.as_str(),
                profit = %record.total_profit,
                amount = %record.transfer_amount,
                "Settlement recorded"
            ),
        }
        Ok(record)
    }

    async fn realized_profit(
        &self,
        copier: &CopierAccount,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Decimal> {
        let connector = self.factory.connector(&copier.credentials)?;
        let profit = with_timeout(
            self.config.request_timeout(),
            connector.get_closed_pnl(PnlWindow { start, end }),
        )
        .await?;
        Ok(profit)
    }

    async fn split_and_transfer(
        &self,
        master: &MasterConfig,
        copier: &CopierAccount,
        record: &mut ProfitTransferRecord,
    ) {
        if record.total_profit <= Decimal::ZERO {
            record.status = TransferStatus::Skipped;
            return;
        }

        record.platform_share = record.total_profit * self.config.platform_share;
        record.user_share = record.total_profit - record.platform_share;
        record.transfer_amount = record
            .platform_share
            .round_dp_with_strategy(TRANSFER_PRECISION, RoundingStrategy::ToZero);
        if record.transfer_amount <= Decimal::ZERO {
            record.status = TransferStatus::Skipped;
            return;
        }

        let Some(from_account) = copier.exchange_account_id.clone() else {
            record.status = TransferStatus::Failed;
            record.error_message =
                Some("copier has no exchange account id, validate its credentials".to_string());
            return;
        };

        let request = TransferRequest {
            amount: record.transfer_amount,
            coin: self.config.settlement_coin.clone(),
            from_account,
            to_account: master.settlement_account_id.clone(),
        };

        let result = match self.factory.connector(&master.credentials) {
            Ok(connector) => {
                let timeout = self.config.request_timeout();
                with_timeout(timeout, connector.internal_transfer(&request)).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(transfer) if transfer.success => {
                record.status = TransferStatus::Completed;
                record.transaction_id = Some(transfer.transaction_id);
            }
            Ok(transfer) => {
                record.status = TransferStatus::Failed;
                record.transaction_id = Some(transfer.transaction_id);
                record.error_message = Some("transfer was not accepted".to_string());
            }
            Err(e) => {
                record.status = TransferStatus::Failed;
                record.error_message = Some(e.to_string());
            }
        }
    }
}

/// Next weekly run strictly after `now`.
pub fn next_weekly_run(now: DateTime<Utc>, weekday: chrono::Weekday, hour: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or_default();
    let target = weekday.num_days_from_monday() as i64;
    let today = now.weekday().num_days_from_monday() as i64;
    let days_ahead = (target - today).rem_euclid(7);
    let candidate = (now.date_naive() + Duration::days(days_ahead)).and_time(time).and_utc();
    if candidate > now {
        candidate
    } else {
        candidate + Duration::days(7)
    }
}
