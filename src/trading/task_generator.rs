//! Turns master executions into per-copier replication tasks.

use std::sync::Arc;

use anyhow::Result;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::models::{
    CopierAccount, MasterExecution, ReplicationTask, TaskMetadata, TaskOrigin, TaskType,
};

use super::EngineConfig;

/// Copier capital over master capital, times the copier's multiplier.
///
/// `None` when the master has no capital to scale against.
pub fn copy_ratio(copier: &CopierAccount, master_capital: Decimal) -> Option<Decimal> {
    if master_capital <= Decimal::ZERO {
        return None;
    }
    Some(copier.capital / master_capital * copier.settings.copy_multiplier)
}

/// Scale a master quantity by `ratio`, truncated to `precision` places.
///
/// Returns `None` for anything that is not a positive order size.
pub fn scaled_quantity(master_qty: Decimal, ratio: Decimal, precision: u32) -> Option<Decimal> {
    let qty = (master_qty * ratio)
        .round_dp_with_strategy(precision, RoundingStrategy::ToZero)
        .normalize();
    if qty > Decimal::ZERO {
        Some(qty)
    } else {
        None
    }
}

/// Creates replication tasks for every eligible copier.
#[derive(Clone)]
pub struct TaskGenerator {
    db: Database,
    config: Arc<EngineConfig>,
}

impl TaskGenerator {
    pub fn new(db: Database, config: Arc<EngineConfig>) -> Self {
        Self { db, config }
    }

    /// Build (but do not store) the tasks for one master execution.
    pub fn plan(
        &self,
        execution: &MasterExecution,
        reduces_exposure: bool,
        master_capital: Decimal,
        copiers: &[CopierAccount],
    ) -> Vec<ReplicationTask> {
        let task_type = if reduces_exposure {
            TaskType::ClosePosition
        } else {
            TaskType::OpenPosition
        };

        let mut tasks = Vec::new();
        for copier in copiers.iter().filter(|c| c.is_active()) {
            if !copier.settings.allows_symbol(&execution.symbol) {
                debug!(
                    copier = %copier.id,
                    symbol = %execution.symbol,
                    "Symbol filtered for copier"
                );
                continue;
            }

            let Some(ratio) = copy_ratio(copier, master_capital) else {
                warn!(
                    copier = %copier.id,
                    master_capital = %master_capital,
                    "Cannot size trade without master capital"
                );
                continue;
            };
            let precision = self.config.quantity_precision;
            let Some(quantity) = scaled_quantity(execution.exec_qty, ratio, precision) else {
                warn!(
                    copier = %copier.id,
                    symbol = %execution.symbol,
                    exec_qty = %execution.exec_qty,
                    ratio = %ratio,
                    "Scaled quantity is not a valid order size, skipping"
                );
                continue;
            };

            let mut metadata = TaskMetadata::new(TaskOrigin::MasterTrade);
            metadata.master_capital = Some(master_capital);
            metadata.ratio = Some(ratio);

            tasks.push(
                ReplicationTask::new(
                    &copier.id,
                    task_type,
                    &execution.symbol,
                    execution.side,
                    quantity,
                    Some(execution.exec_price),
                    self.config.max_retries,
                    metadata,
                )
                .with_master_trade(&execution.exec_id),
            );
        }
        tasks
    }

    /// Plan and enqueue tasks for one master execution against the current
    /// active copiers. Replays of an execution already queued are dropped.
    pub async fn on_master_execution(
        &self,
        execution: &MasterExecution,
        reduces_exposure: bool,
        master_capital: Decimal,
    ) -> Result<Vec<ReplicationTask>> {
        let copiers = self.db.list_active_copiers().await?;
        let planned = self.plan(execution, reduces_exposure, master_capital, &copiers);

        let mut queued = Vec::with_capacity(planned.len());
        for task in planned {
            if self.db.insert_task(&task).await? {
                queued.push(task);
            } else {
                debug!(
                    copier = %task.copier_account_id,
                    exec_id = %execution.exec_id,
                    "Task for this execution already queued"
                );
            }
        }

        if !queued.is_empty() {
            info!(
                exec_id = %execution.exec_id,
                symbol = %execution.symbol,
                side = %execution.side,
                tasks = queued.len(),
                "Queued replication tasks"
            );
        }
        Ok(queued)
    }
}
