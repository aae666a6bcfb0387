//! Task executor: drains the durable queue on a fixed tick.
//!
//! Each tick starts one worker per copier with pending work, unless that
//! copier's previous worker is still running, and returns without waiting.
//! A slow or hung exchange call therefore only holds up its own copier.
//! Tasks for one copier run in creation order under that copier's lock, and
//! a requeued task holds back the copier's later tasks until the next tick.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{with_timeout, ConnectorFactory, OrderRequest, OrderResult};
use crate::db::Database;
use crate::error::{ConnectorError, FailureKind};
use crate::models::{
    CopierAccount, CopyStatus, MirrorStatus, OrderType, ReplicationTask, SyncMethod, SyncState,
    SyncStatusRecord, TaskOrigin, TaskStatus, TaskType, TradeMirrorRecord,
};
use crate::status::StatusSink;

use super::{CopierLocks, EngineConfig};

/// What happened to one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Nothing tradable on the copier side; completed with a skipped record
    Skipped,
    Requeued,
    Failed,
    /// Failed on rejected credentials; the copier is suspended
    Suspended,
    /// The copier is suspended; the task stays pending
    Held,
    /// Another worker owns it or it is already terminal
    NotClaimed,
}

/// Counts for one worker run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub completed: usize,
    pub skipped: usize,
    pub requeued: usize,
    pub failed: usize,
}

impl TickSummary {
    fn add(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Completed => self.completed += 1,
            TaskOutcome::Skipped => self.skipped += 1,
            TaskOutcome::Requeued => self.requeued += 1,
            TaskOutcome::Failed | TaskOutcome::Suspended => self.failed += 1,
            TaskOutcome::Held | TaskOutcome::NotClaimed => {}
        }
    }

    #[cfg(test)]
    fn merge(&mut self, other: TickSummary) {
        self.completed += other.completed;
        self.skipped += other.skipped;
        self.requeued += other.requeued;
        self.failed += other.failed;
    }

    pub fn is_empty(&self) -> bool {
        *self == TickSummary::default()
    }
}

/// Failure of a single attempt, before retry accounting.
struct AttemptError {
    kind: FailureKind,
    message: String,
}

impl From<ConnectorError> for AttemptError {
    fn from(err: ConnectorError) -> Self {
        Self {
            kind: err.failure_kind(),
            message: err.to_string(),
        }
    }
}

/// Marks a copier as having a worker in flight until dropped.
struct WorkerSlot {
    executor: Arc<TaskExecutor>,
    copier_id: String,
}

impl WorkerSlot {
    fn claim(executor: &Arc<TaskExecutor>, copier_id: String) -> Option<Self> {
        let mut busy = executor.busy.lock().unwrap_or_else(|e| e.into_inner());
        if !busy.insert(copier_id.clone()) {
            return None;
        }
        Some(Self {
            executor: Arc::clone(executor),
            copier_id,
        })
    }

    async fn run(self) -> TickSummary {
        self.executor.run_copier(&self.copier_id).await
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        let mut busy = self.executor.busy.lock().unwrap_or_else(|e| e.into_inner());
        busy.remove(&self.copier_id);
    }
}

/// Sole writer of replication task status.
pub struct TaskExecutor {
    db: Database,
    sink: StatusSink,
    factory: Arc<dyn ConnectorFactory>,
    locks: CopierLocks,
    config: Arc<EngineConfig>,
    busy: Mutex<HashSet<String>>,
}

impl TaskExecutor {
    pub fn new(
        sink: StatusSink,
        factory: Arc<dyn ConnectorFactory>,
        locks: CopierLocks,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            db: sink.db().clone(),
            sink,
            factory,
            locks,
            config,
            busy: Mutex::new(HashSet::new()),
        }
    }

    /// Return tasks a crashed run left in processing to the queue.
    pub async fn recover(&self) -> Result<u64> {
        let reset = self.db.reset_processing_tasks().await?;
        if reset > 0 {
            warn!(tasks = reset, "Requeued tasks left in processing by a previous run");
        }
        Ok(reset)
    }

    /// Start a worker for every copier with pending work and no worker
    /// already running. Returns the new workers without waiting on them.
    pub async fn tick(self: &Arc<Self>) -> Result<Vec<JoinHandle<TickSummary>>> {
        let copiers = self.db.pending_copiers().await?;

        let mut workers = Vec::new();
        for copier_id in copiers {
            let Some(slot) = WorkerSlot::claim(self, copier_id) else {
                continue;
            };
            workers.push(tokio::spawn(slot.run()));
        }
        if !workers.is_empty() {
            debug!(workers = workers.len(), "Task workers started");
        }
        Ok(workers)
    }

    /// Run one tick and wait for the workers it started.
    #[cfg(test)]
    pub(crate) async fn run_tick(self: &Arc<Self>) -> Result<TickSummary> {
        let mut summary = TickSummary::default();
        for worker in self.tick().await? {
            summary.merge(worker.await?);
        }
        Ok(summary)
    }

    async fn run_copier(&self, copier_id: &str) -> TickSummary {
        let _guard = self.locks.acquire(copier_id).await;
        let mut summary = TickSummary::default();

        let tasks = match self
            .db
            .fetch_pending_tasks(copier_id, self.config.task_batch_size)
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(copier = %copier_id, error = %e, "Failed to fetch pending tasks");
                return summary;
            }
        };

        for task in tasks {
            match self.execute(task.clone()).await {
                Ok(outcome @ (TaskOutcome::Requeued | TaskOutcome::Held)) => {
                    summary.add(outcome);
                    break;
                }
                Ok(TaskOutcome::Suspended) => {
                    summary.add(TaskOutcome::Suspended);
                    warn!(copier = %copier_id, "Holding remaining tasks of suspended copier");
                    break;
                }
                Ok(outcome) => summary.add(outcome),
                Err(e) => {
                    error!(
                        copier = %copier_id,
                        task = %task.id,
                        error = %e,
                        "Task execution aborted"
                    );
                    if let Some(outcome) = self.abandon(task, &e).await {
                        summary.add(outcome);
                    }
                    break;
                }
            }
        }

        if !summary.is_empty() {
            debug!(copier = %copier_id, ?summary, "Task worker finished");
        }
        summary
    }

    /// Settle a claimed task whose execution errored outside the exchange
    /// call, so it does not sit in processing until the next restart.
    async fn abandon(
        &self,
        mut task: ReplicationTask,
        error: &anyhow::Error,
    ) -> Option<TaskOutcome> {
        let message = format!("{:#}", error);
        let exhausted = task.retries_exhausted_after_failure();
        task.retry_count += 1;
        task.metadata.last_error = Some(message.clone());
        let (status, outcome) = if exhausted {
            (TaskStatus::Failed, TaskOutcome::Failed)
        } else {
            (TaskStatus::Pending, TaskOutcome::Requeued)
        };

        match self.db.release_task(&task, status, &message).await {
            Ok(true) => {
                warn!(
                    task = %task.id,
                    copier = %task.copier_account_id,
                    status = status.as_str(),
                    retry = task.retry_count,
                    "Released task after execution error"
                );
                Some(outcome)
            }
            Ok(false) => None,
            Err(e) => {
                error!(
                    task = %task.id,
                    error = %e,
                    "Failed to release task, it stays processing until restart"
                );
                None
            }
        }
    }

    /// Execute one task through to its next state. Caller holds the copier lock.
    pub async fn execute(&self, mut task: ReplicationTask) -> Result<TaskOutcome> {
        if self.db.is_suspended(&task.copier_account_id).await? {
            debug!(
                task = %task.id,
                copier = %task.copier_account_id,
                "Copier suspended, task held"
            );
            return Ok(TaskOutcome::Held);
        }
        if !self.db.claim_task(&task.id).await? {
            debug!(task = %task.id, "Task not pending, skipping");
            return Ok(TaskOutcome::NotClaimed);
        }
        task.status = TaskStatus::Processing;

        let Some(copier) = self.db.get_copier(&task.copier_account_id).await? else {
            let error = AttemptError {
                kind: FailureKind::PolicyViolation,
                message: "copier account no longer exists".to_string(),
            };
            return self.fail(task, error, 0).await;
        };

        if let Some(violation) = self.policy_violation(&task, &copier) {
            let error = AttemptError {
                kind: FailureKind::PolicyViolation,
                message: violation,
            };
            return self.fail(task, error, 0).await;
        }

        let started = Instant::now();
        let attempt = self.dispatch(&task, &copier).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        match attempt {
            Ok(result) => self.succeed(task, result, elapsed_ms).await,
            Err(error) => self.fail(task, error, elapsed_ms).await,
        }
    }

    fn policy_violation(&self, task: &ReplicationTask, copier: &CopierAccount) -> Option<String> {
        if task.task_type != TaskType::OpenPosition {
            return None;
        }
        if copier.copy_status == CopyStatus::Inactive {
            return Some("copier is inactive".to_string());
        }
        match task.notional() {
            Some(notional) if copier.settings.exceeds_position_limit(notional) => Some(format!(
                "notional {} exceeds max position size {}",
                notional.round_dp(2),
                copier.settings.max_position_size
            )),
            _ => None,
        }
    }

    async fn dispatch(
        &self,
        task: &ReplicationTask,
        copier: &CopierAccount,
    ) -> Result<OrderResult, AttemptError> {
        let connector = self.factory.connector(&copier.credentials)?;
        let timeout = self.config.request_timeout();
        // The task id doubles as the exchange order id, so a retry after a
        // lost response finds the first order instead of placing another.
        let request = OrderRequest {
            symbol: task.symbol.clone(),
            side: task.side,
            order_type: match task.task_type {
                TaskType::OpenPosition => task.order_type,
                TaskType::ClosePosition => OrderType::Market,
            },
            qty: task.quantity,
            price: task.price,
            client_order_id: Some(task.id.clone()),
        };

        let result = match task.task_type {
            TaskType::OpenPosition => with_timeout(timeout, connector.place_order(&request)).await?,
            TaskType::ClosePosition => {
                with_timeout(timeout, connector.close_position(&request)).await?
            }
        };
        Ok(result)
    }

    async fn succeed(
        &self,
        task: ReplicationTask,
        result: OrderResult,
        elapsed_ms: i64,
    ) -> Result<TaskOutcome> {
        let slippage = match (task.price, result.avg_price) {
            (Some(expected), Some(actual)) => slippage_percent(expected, actual),
            _ => None,
        };

        self.db.complete_task(&task.id).await?;
        let mirror = TradeMirrorRecord {
            task_id: task.id.clone(),
            copier_account_id: task.copier_account_id.clone(),
            master_trade_id: task.master_trade_id.clone(),
            copier_trade_id: Some(result.order_id.clone()),
            symbol: task.symbol.clone(),
            side: task.side,
            quantity: task.quantity,
            master_price: task.price,
            copier_price: result.avg_price,
            slippage_percent: slippage,
            status: MirrorStatus::Executed,
            execution_time_ms: elapsed_ms,
            error_message: None,
        };
        if let Err(e) = self.sink.record_mirror(&mirror).await {
            error!(task = %task.id, error = %e, "Failed to write trade mirror");
        }

        info!(
            task = %task.id,
            copier = %task.copier_account_id,
            symbol = %task.symbol,
            side = %task.side,
            qty = %task.quantity,
            order_id = %result.order_id,
            slippage = ?slippage,
            "Task executed"
        );
        Ok(TaskOutcome::Completed)
    }

    async fn fail(
        &self,
        mut task: ReplicationTask,
        error: AttemptError,
        elapsed_ms: i64,
    ) -> Result<TaskOutcome> {
        task.metadata.last_error = Some(error.message.clone());

        match error.kind {
            FailureKind::Transient => {
                let exhausted = task.retries_exhausted_after_failure();
                task.retry_count += 1;
                if !exhausted {
                    self.db
                        .record_task_failure(&task, TaskStatus::Pending, &error.message)
                        .await?;
                    warn!(
                        task = %task.id,
                        copier = %task.copier_account_id,
                        retry = task.retry_count,
                        max_retries = task.max_retries,
                        error = %error.message,
                        "Task attempt failed, requeued"
                    );
                    return Ok(TaskOutcome::Requeued);
                }
                self.terminal_failure(&task, &error, elapsed_ms, "retries_exhausted").await?;
                Ok(TaskOutcome::Failed)
            }
            FailureKind::PolicyViolation => {
                self.terminal_failure(&task, &error, elapsed_ms, "policy_violation").await?;
                Ok(TaskOutcome::Failed)
            }
            FailureKind::Credential => {
                self.terminal_failure(&task, &error, elapsed_ms, "credential_error").await?;
                self.sink
                    .heartbeat(
                        &SyncStatusRecord::new(
                            &task.copier_account_id,
                            SyncMethod::Reconciliation,
                            SyncState::CredentialError,
                        )
                        .with_error(error.message.clone()),
                    )
                    .await;
                error!(
                    copier = %task.copier_account_id,
                    error = %error.message,
                    "Copier credentials rejected, copier suspended"
                );
                Ok(TaskOutcome::Suspended)
            }
            FailureKind::DataInconsistency => {
                let mirror =
                    mirror_failure(&task, MirrorStatus::Skipped, &error.message, elapsed_ms);
                self.sink.record_mirror(&mirror).await?;
                self.db.complete_task(&task.id).await?;
                warn!(
                    task = %task.id,
                    copier = %task.copier_account_id,
                    symbol = %task.symbol,
                    error = %error.message,
                    "Nothing to trade on copier, task skipped"
                );
                Ok(TaskOutcome::Skipped)
            }
        }
    }

    async fn terminal_failure(
        &self,
        task: &ReplicationTask,
        error: &AttemptError,
        elapsed_ms: i64,
        reason: &str,
    ) -> Result<()> {
        self.db
            .record_task_failure(task, TaskStatus::Failed, &error.message)
            .await?;
        let mirror = mirror_failure(task, MirrorStatus::Failed, &error.message, elapsed_ms);
        self.sink.record_mirror(&mirror).await?;
        self.sink
            .log_action(
                &task.copier_account_id,
                "task_failed",
                json!({
                    "taskId": task.id,
                    "reason": reason,
                    "symbol": task.symbol,
                    "side": task.side,
                    "quantity": task.quantity,
                    "retryCount": task.retry_count,
                    "disconnect": task.metadata.origin == TaskOrigin::Disconnect,
                    "error": error.message,
                }),
            )
            .await;

        warn!(
            task = %task.id,
            copier = %task.copier_account_id,
            reason,
            error = %error.message,
            "Task failed"
        );
        Ok(())
    }
}

fn mirror_failure(
    task: &ReplicationTask,
    status: MirrorStatus,
    error: &str,
    elapsed_ms: i64,
) -> TradeMirrorRecord {
    TradeMirrorRecord {
        task_id: task.id.clone(),
        copier_account_id: task.copier_account_id.clone(),
        master_trade_id: task.master_trade_id.clone(),
        copier_trade_id: None,
        symbol: task.symbol.clone(),
        side: task.side,
        quantity: task.quantity,
        master_price: task.price,
        copier_price: None,
        slippage_percent: None,
        status,
        execution_time_ms: elapsed_ms,
        error_message: Some(error.to_string()),
    }
}

/// Signed slippage of `actual` against `expected`, in percent.
pub fn slippage_percent(expected: Decimal, actual: Decimal) -> Option<Decimal> {
    if expected <= Decimal::ZERO {
        return None;
    }
    Some(((actual - expected) / expected * Decimal::ONE_HUNDRED).round_dp(4))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::{MockExchange, MockFactory};
    use crate::db::tests::{action_count, copier, corrupt_copier};
    use crate::models::{Side, TaskMetadata, PRIORITY_DISCONNECT};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct Harness {
        db: Database,
        exchange: Arc<MockExchange>,
        factory: Arc<MockFactory>,
        executor: Arc<TaskExecutor>,
    }

    async fn harness() -> Harness {
        harness_with(EngineConfig::default()).await
    }

    async fn harness_with(config: EngineConfig) -> Harness {
        let db = Database::in_memory().await.unwrap();
        db.save_copier(&copier("c1", dec!(10000), CopyStatus::Active)).await.unwrap();

        let exchange = MockExchange::new(dec!(10000));
        let factory = MockFactory::new();
        factory.register("key-c1", exchange.clone());

        let executor = Arc::new(TaskExecutor::new(
            StatusSink::new(db.clone()),
            factory.clone(),
            CopierLocks::new(),
            Arc::new(config),
        ));
        Harness {
            db,
            exchange,
            factory,
            executor,
        }
    }

    fn open_task(symbol: &str, qty: Decimal, price: Decimal) -> ReplicationTask {
        task_for("c1", symbol, qty, price)
    }

    fn task_for(copier: &str, symbol: &str, qty: Decimal, price: Decimal) -> ReplicationTask {
        ReplicationTask::new(
            copier,
            TaskType::OpenPosition,
            symbol,
            Side::Buy,
            qty,
            Some(price),
            3,
            TaskMetadata::new(TaskOrigin::MasterTrade),
        )
    }

    #[test]
    fn test_slippage_percent() {
        assert_eq!(slippage_percent(dec!(100), dec!(101)), Some(dec!(1)));
        assert_eq!(slippage_percent(dec!(60000), dec!(59970)), Some(dec!(-0.05)));
        assert_eq!(slippage_percent(Decimal::ZERO, dec!(1)), None);
    }

    #[tokio::test]
    async fn test_success_writes_executed_mirror() {
        let h = harness().await;
        h.exchange.set_fill_price(dec!(60060));
        let task = open_task("BTCUSDT", dec!(0.1), dec!(60000));
        h.db.insert_task(&task).await.unwrap();

        let summary = h.executor.run_tick().await.unwrap();
        assert_eq!(summary.completed, 1);

        let stored = h.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);

        let mirrors = h.db.mirrors_for_task(&task.id).await.unwrap();
        assert_eq!(mirrors.len(), 1);
        assert_eq!(mirrors[0].status, MirrorStatus::Executed);
        assert_eq!(mirrors[0].copier_price, Some(dec!(60060)));
        assert_eq!(mirrors[0].slippage_percent, Some(dec!(0.1)));
        assert_eq!(h.exchange.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_two_timeouts_then_success() {
        let h = harness().await;
        h.exchange.fail_next_order(ConnectorError::Timeout(Duration::from_secs(10)));
        h.exchange.fail_next_order(ConnectorError::Timeout(Duration::from_secs(10)));
        let task = open_task("BTCUSDT", dec!(0.1), dec!(60000));
        h.db.insert_task(&task).await.unwrap();

        assert_eq!(h.executor.run_tick().await.unwrap().requeued, 1);
        assert_eq!(h.executor.run_tick().await.unwrap().requeued, 1);
        assert_eq!(h.executor.run_tick().await.unwrap().completed, 1);

        let stored = h.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.retry_count, 2);

        let mirrors = h.db.mirrors_for_task(&task.id).await.unwrap();
        assert_eq!(mirrors.len(), 1);
        assert_eq!(mirrors[0].status, MirrorStatus::Executed);
    }

    #[tokio::test]
    async fn test_exhausted_retries_end_failed() {
        let h = harness().await;
        for _ in 0..3 {
            h.exchange.fail_next_order(ConnectorError::Transport("connection reset".to_string()));
        }
        let task = open_task("BTCUSDT", dec!(0.1), dec!(60000));
        h.db.insert_task(&task).await.unwrap();

        for _ in 0..5 {
            h.executor.run_tick().await.unwrap();
        }

        let stored = h.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.retry_count, stored.max_retries);
        assert!(h.db.fetch_pending_tasks("c1", 10).await.unwrap().is_empty());
        assert!(h.exchange.orders().is_empty());

        let mirrors = h.db.mirrors_for_task(&task.id).await.unwrap();
        assert_eq!(mirrors.len(), 1);
        assert_eq!(mirrors[0].status, MirrorStatus::Failed);
        assert_eq!(action_count(&h.db, "c1", "task_failed").await, 1);
    }

    #[tokio::test]
    async fn test_position_limit_fails_without_retry() {
        let h = harness().await;
        let mut c = h.db.get_copier("c1").await.unwrap().unwrap();
        c.settings.max_position_size = dec!(1000);
        h.db.save_copier(&c).await.unwrap();

        let task = open_task("BTCUSDT", dec!(0.1), dec!(60000));
        h.db.insert_task(&task).await.unwrap();
        assert_eq!(h.executor.run_tick().await.unwrap().failed, 1);

        let stored = h.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.retry_count, 0);
        assert!(h.exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn test_credential_error_suspends_copier() {
        let h = harness().await;
        h.exchange.fail_next_order(ConnectorError::Credential("API key is invalid.".to_string()));
        let task = open_task("BTCUSDT", dec!(0.1), dec!(60000));
        h.db.insert_task(&task).await.unwrap();

        assert_eq!(h.executor.run_tick().await.unwrap().failed, 1);
        let status = h.db.get_sync_status("c1").await.unwrap().unwrap();
        assert_eq!(status.sync_status, SyncState::CredentialError);
        assert!(h.db.list_active_copiers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_on_flat_copier_is_skipped() {
        let h = harness().await;
        let task = ReplicationTask::new(
            "c1",
            TaskType::ClosePosition,
            "ETHUSDT",
            Side::Sell,
            dec!(1),
            Some(dec!(3000)),
            3,
            TaskMetadata::new(TaskOrigin::MasterTrade),
        );
        h.db.insert_task(&task).await.unwrap();

        assert_eq!(h.executor.run_tick().await.unwrap().skipped, 1);
        let stored = h.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        let mirrors = h.db.mirrors_for_task(&task.id).await.unwrap();
        assert_eq!(mirrors[0].status, MirrorStatus::Skipped);
    }

    #[tokio::test]
    async fn test_completed_task_is_not_reexecuted() {
        let h = harness().await;
        let task = open_task("BTCUSDT", dec!(0.1), dec!(60000));
        h.db.insert_task(&task).await.unwrap();
        h.executor.run_tick().await.unwrap();

        let outcome = h.executor.execute(task.clone()).await.unwrap();
        assert_eq!(outcome, TaskOutcome::NotClaimed);
        assert_eq!(h.exchange.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_requeue_holds_back_later_tasks_of_same_copier() {
        let h = harness().await;
        h.exchange.fail_next_order(ConnectorError::Timeout(Duration::from_secs(10)));
        let first = open_task("BTCUSDT", dec!(0.1), dec!(60000));
        let second = open_task("ETHUSDT", dec!(1), dec!(3000));
        h.db.insert_task(&first).await.unwrap();
        h.db.insert_task(&second).await.unwrap();

        let summary = h.executor.run_tick().await.unwrap();
        assert_eq!(summary.requeued, 1);
        assert_eq!(summary.completed, 0);
        assert!(h.exchange.orders().is_empty());

        h.executor.run_tick().await.unwrap();
        let symbols: Vec<String> = h.exchange.orders().into_iter().map(|o| o.symbol).collect();
        assert_eq!(symbols, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
    }

    #[tokio::test]
    async fn test_disconnect_priority_runs_first() {
        let h = harness().await;
        h.exchange.set_position("ETHUSDT", Side::Buy, dec!(2), dec!(3000));
        let open = open_task("BTCUSDT", dec!(0.1), dec!(60000));
        let close = ReplicationTask::new(
            "c1",
            TaskType::ClosePosition,
            "ETHUSDT",
            Side::Sell,
            dec!(2),
            None,
            3,
            TaskMetadata::new(TaskOrigin::Disconnect),
        )
        .with_priority(PRIORITY_DISCONNECT);
        h.db.insert_task(&open).await.unwrap();
        h.db.insert_task(&close).await.unwrap();

        h.executor.run_tick().await.unwrap();
        assert_eq!(h.exchange.closes().len(), 1);
        assert!(h.exchange.position("ETHUSDT").is_none());
    }

    #[tokio::test]
    async fn test_recover_requeues_processing() {
        let h = harness().await;
        let task = open_task("BTCUSDT", dec!(0.1), dec!(60000));
        h.db.insert_task(&task).await.unwrap();
        h.db.claim_task(&task.id).await.unwrap();

        assert_eq!(h.executor.recover().await.unwrap(), 1);
        assert_eq!(h.executor.run_tick().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_hung_copier_does_not_stall_others() {
        let mut config = EngineConfig::default();
        config.request_timeout_secs = 3;
        let h = harness_with(config).await;

        h.db.save_copier(&copier("slow", dec!(10000), CopyStatus::Active)).await.unwrap();
        let slow = MockExchange::new(dec!(10000));
        slow.set_order_delay(Duration::from_secs(60));
        h.factory.register("key-slow", slow.clone());

        let fast_task = open_task("BTCUSDT", dec!(0.1), dec!(60000));
        h.db.insert_task(&fast_task).await.unwrap();
        h.db.insert_task(&task_for("slow", "BTCUSDT", dec!(0.1), dec!(60000))).await.unwrap();

        let mut workers = h.executor.tick().await.unwrap();
        assert_eq!(workers.len(), 2);
        let fast = workers.remove(0);
        let summary = tokio::time::timeout(Duration::from_secs(1), fast)
            .await
            .expect("fast copier waited on the slow one")
            .unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(h.exchange.orders().len(), 1);

        // The slow copier keeps its worker; a new task for the fast one still runs.
        let next = open_task("ETHUSDT", dec!(1), dec!(3000));
        h.db.insert_task(&next).await.unwrap();
        let summary = tokio::time::timeout(Duration::from_secs(1), h.executor.run_tick())
            .await
            .expect("tick waited on the slow copier")
            .unwrap();
        assert_eq!(summary.completed, 1);
        assert!(slow.orders().is_empty());
        let stored = h.db.get_task(&next.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_per_copier_batches_do_not_starve_others() {
        let mut config = EngineConfig::default();
        config.task_batch_size = 2;
        let h = harness_with(config).await;

        h.db.save_copier(&copier("c2", dec!(10000), CopyStatus::Active)).await.unwrap();
        let other = MockExchange::new(dec!(10000));
        h.factory.register("key-c2", other.clone());

        for _ in 0..5 {
            h.db.insert_task(&open_task("BTCUSDT", dec!(0.1), dec!(60000))).await.unwrap();
        }
        h.db.insert_task(&task_for("c2", "ETHUSDT", dec!(1), dec!(3000))).await.unwrap();

        let summary = h.executor.run_tick().await.unwrap();
        assert_eq!(summary.completed, 3);
        assert_eq!(h.exchange.orders().len(), 2);
        assert_eq!(other.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_credential_failure_holds_later_tasks() {
        let h = harness().await;
        h.exchange.fail_next_order(ConnectorError::Credential("API key is invalid.".to_string()));
        let first = open_task("BTCUSDT", dec!(0.1), dec!(60000));
        let second = open_task("ETHUSDT", dec!(1), dec!(3000));
        h.db.insert_task(&first).await.unwrap();
        h.db.insert_task(&second).await.unwrap();

        let summary = h.executor.run_tick().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.completed, 0);
        assert!(h.exchange.orders().is_empty());

        // Suspended copiers get no worker at all.
        assert!(h.executor.tick().await.unwrap().is_empty());
        let held = h.db.get_task(&second.id).await.unwrap().unwrap();
        assert_eq!(held.status, TaskStatus::Pending);
        assert_eq!(h.executor.execute(held).await.unwrap(), TaskOutcome::Held);
        assert!(h.exchange.orders().is_empty());

        // Fresh credentials resume the queue.
        h.db.upsert_sync_status(&SyncStatusRecord::new(
            "c1",
            SyncMethod::Reconciliation,
            SyncState::Synced,
        ))
        .await
        .unwrap();
        assert_eq!(h.executor.run_tick().await.unwrap().completed, 1);
        assert_eq!(h.exchange.orders()[0].symbol, "ETHUSDT");
    }

    #[tokio::test]
    async fn test_lost_response_is_not_placed_twice() {
        let h = harness().await;
        h.exchange.lose_next_response(ConnectorError::Timeout(Duration::from_secs(10)));
        let task = open_task("BTCUSDT", dec!(0.1), dec!(60000));
        h.db.insert_task(&task).await.unwrap();

        assert_eq!(h.executor.run_tick().await.unwrap().requeued, 1);
        assert_eq!(h.executor.run_tick().await.unwrap().completed, 1);

        let orders = h.exchange.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].client_order_id.as_deref(), Some(task.id.as_str()));
        assert_eq!(h.exchange.position("BTCUSDT").unwrap().size, dec!(0.1));
    }

    #[tokio::test]
    async fn test_lookup_error_after_claim_releases_task() {
        let h = harness().await;
        let task = open_task("BTCUSDT", dec!(0.1), dec!(60000));
        h.db.insert_task(&task).await.unwrap();
        corrupt_copier(&h.db, "c1").await;

        assert_eq!(h.executor.run_tick().await.unwrap().requeued, 1);
        let stored = h.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.metadata.last_error.is_some());

        for _ in 0..3 {
            h.executor.run_tick().await.unwrap();
        }
        let stored = h.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.retry_count, stored.max_retries);
        assert!(h.exchange.orders().is_empty());
    }
}
