//! Reconciliation: the periodic fallback that rebuilds each copier's target
//! positions from the master's standing positions and queues corrections.
//!
//! The same pass drives the close-everything path for copiers that were
//! switched to inactive, finishing with an out-of-cycle settlement.
//! Master positions are read under each copier's lock, so an execution the
//! executor finishes while the pass waits cannot be planned against a stale
//! master book.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::api::{with_timeout, ConnectorFactory, ExchangeConnector};
use crate::db::{Database, DisconnectPhase};
use crate::error::{ConnectorError, FailureKind};
use crate::models::{
    CopierAccount, CopyStatus, MasterConfig, Position, ReplicationTask, SyncMethod, SyncState,
    SyncStatusRecord, TaskMetadata, TaskOrigin, TaskType, TransferType, PRIORITY_DISCONNECT,
};
use crate::status::StatusSink;

use super::task_generator::{copy_ratio, scaled_quantity};
use super::{CopierLocks, EngineConfig, MasterCapital, SettlementJob};

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileSummary {
    /// Another pass was already running
    pub skipped: bool,
    pub copiers_checked: usize,
    pub tasks_created: usize,
    pub copiers_failed: usize,
    pub disconnects_completed: usize,
}

/// Clears the run flag when the pass ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Compute the orders that bring `actual` to the copier's share of `master`.
///
/// Symbols the copier does not copy and symbols with work already queued
/// are left alone. A side flip closes the old position before opening the
/// new one.
pub fn plan_adjustments(
    copier: &CopierAccount,
    master: &[Position],
    master_capital: Decimal,
    actual: &[Position],
    in_flight: &HashSet<String>,
    config: &EngineConfig,
) -> Vec<ReplicationTask> {
    let Some(ratio) = copy_ratio(copier, master_capital) else {
        return Vec::new();
    };

    let mut targets: HashMap<&str, (&Position, Decimal)> = HashMap::new();
    for position in master.iter().filter(|p| !p.is_closed()) {
        if let Some(qty) = scaled_quantity(position.size, ratio, config.quantity_precision) {
            targets.insert(position.symbol.as_str(), (position, qty));
        }
    }
    let held: HashMap<&str, &Position> = actual
        .iter()
        .filter(|p| !p.is_closed())
        .map(|p| (p.symbol.as_str(), p))
        .collect();

    let symbols: BTreeSet<&str> = targets.keys().chain(held.keys()).copied().collect();
    let mut metadata = TaskMetadata::new(TaskOrigin::Reconciliation);
    metadata.master_capital = Some(master_capital);
    metadata.ratio = Some(ratio);

    let task = |task_type: TaskType, symbol: &str, side, qty: Decimal, price: Decimal| {
        let price = if price > Decimal::ZERO { Some(price) } else { None };
        ReplicationTask::new(
            &copier.id,
            task_type,
            symbol,
            side,
            qty,
            price,
            config.max_retries,
            metadata.clone(),
        )
    };

    let mut tasks = Vec::new();
    for symbol in symbols {
        if !copier.settings.allows_symbol(symbol) || in_flight.contains(symbol) {
            continue;
        }

        match (targets.get(symbol), held.get(symbol)) {
            (None, None) => {}
            (None, Some(pos)) => {
                let close_side = pos.side.opposite();
                let price = pos.reference_price();
                tasks.push(task(TaskType::ClosePosition, symbol, close_side, pos.size, price));
            }
            (Some((master_pos, qty)), None) => {
                let price = master_pos.reference_price();
                tasks.push(task(TaskType::OpenPosition, symbol, master_pos.side, *qty, price));
            }
            (Some((master_pos, qty)), Some(pos)) if master_pos.side != pos.side => {
                let (close_side, close_px) = (pos.side.opposite(), pos.reference_price());
                let (open_side, open_px) = (master_pos.side, master_pos.reference_price());
                tasks.push(task(TaskType::ClosePosition, symbol, close_side, pos.size, close_px));
                tasks.push(task(TaskType::OpenPosition, symbol, open_side, *qty, open_px));
            }
            (Some((master_pos, qty)), Some(pos)) => {
                let drift = *qty - pos.size;
                if drift.abs() <= config.drift_tolerance(*qty) {
                    continue;
                }
                let precision = config.quantity_precision;
                let Some(delta) = scaled_quantity(drift.abs(), Decimal::ONE, precision) else {
                    continue;
                };
                if drift > Decimal::ZERO {
                    let price = master_pos.reference_price();
                    tasks.push(task(TaskType::OpenPosition, symbol, master_pos.side, delta, price));
                } else {
                    let close_side = pos.side.opposite();
                    let price = pos.reference_price();
                    tasks.push(task(TaskType::ClosePosition, symbol, close_side, delta, price));
                }
            }
        }
    }
    tasks
}

/// Periodic position sync, mutually exclusive with itself.
pub struct Reconciler {
    db: Database,
    sink: StatusSink,
    factory: Arc<dyn ConnectorFactory>,
    locks: CopierLocks,
    capital: Arc<MasterCapital>,
    settlement: Arc<SettlementJob>,
    config: Arc<EngineConfig>,
    running: AtomicBool,
}

impl Reconciler {
    pub fn new(
        sink: StatusSink,
        factory: Arc<dyn ConnectorFactory>,
        locks: CopierLocks,
        capital: Arc<MasterCapital>,
        settlement: Arc<SettlementJob>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            db: sink.db().clone(),
            sink,
            factory,
            locks,
            capital,
            settlement,
            config,
            running: AtomicBool::new(false),
        }
    }

    /// Run one pass. Returns immediately with `skipped` if a pass is in progress.
    pub async fn sync_positions(&self) -> Result<ReconcileSummary> {
        let Some(_guard) = RunGuard::try_acquire(&self.running) else {
            debug!("Reconciliation already running, skipping");
            return Ok(ReconcileSummary {
                skipped: true,
                ..Default::default()
            });
        };

        let master_config = self
            .db
            .get_master_config()
            .await?
            .context("Master account is not configured")?;

        let mut summary = ReconcileSummary {
            disconnects_completed: self.process_disconnects(&master_config).await?,
            ..Default::default()
        };

        let master = self.factory.connector(&master_config.credentials)?;
        let master_capital = self
            .capital
            .refresh(master.as_ref())
            .await
            .context("Failed to read master capital")?;

        for copier in self.db.list_active_copiers().await? {
            summary.copiers_checked += 1;
            match self.reconcile_copier(&copier, master.as_ref(), master_capital).await? {
                Ok(created) => {
                    summary.tasks_created += created;
                    let synced = SyncStatusRecord::new(
                        &copier.id,
                        SyncMethod::Reconciliation,
                        SyncState::Synced,
                    );
                    self.sink.heartbeat(&synced).await;
                }
                Err(e) => {
                    summary.copiers_failed += 1;
                    self.record_copier_error(&copier, &e).await;
                }
            }
        }

        if summary.tasks_created > 0 || summary.copiers_failed > 0 {
            info!(
                copiers = summary.copiers_checked,
                tasks = summary.tasks_created,
                failed = summary.copiers_failed,
                "Reconciliation pass finished"
            );
        } else {
            debug!(copiers = summary.copiers_checked, "Reconciliation pass found no drift");
        }
        Ok(summary)
    }

    /// Plan and queue one copier's corrections. The outer error is a
    /// master-side failure and ends the pass.
    async fn reconcile_copier(
        &self,
        copier: &CopierAccount,
        master: &dyn ExchangeConnector,
        master_capital: Decimal,
    ) -> Result<Result<usize, ConnectorError>> {
        let _guard = self.locks.acquire(&copier.id).await;
        let timeout = self.config.request_timeout();

        let master_positions = with_timeout(timeout, master.get_positions(None))
            .await
            .context("Failed to read master positions")?;

        let connector = match self.factory.connector(&copier.credentials) {
            Ok(connector) => connector,
            Err(e) => return Ok(Err(e)),
        };
        let actual = match with_timeout(timeout, connector.get_positions(None)).await {
            Ok(positions) => positions,
            Err(e) => return Ok(Err(e)),
        };
        let in_flight = match self.db.in_flight_symbols(&copier.id).await {
            Ok(symbols) => symbols,
            Err(e) => {
                let message = format!("queue lookup failed: {}", e);
                return Ok(Err(ConnectorError::Transport(message)));
            }
        };

        let tasks = plan_adjustments(
            copier,
            &master_positions,
            master_capital,
            &actual,
            &in_flight,
            &self.config,
        );
        let mut created = 0;
        for task in &tasks {
            match self.db.insert_task(task).await {
                Ok(true) => {
                    created += 1;
                    info!(
                        copier = %copier.id,
                        symbol = %task.symbol,
                        task_type = task.task_type.as_str(),
                        side = %task.side,
                        qty = %task.quantity,
                        "Queued reconciliation task"
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    error!(copier = %copier.id, error = %e, "Failed to queue reconciliation task")
                }
            }
        }
        Ok(Ok(created))
    }

    async fn record_copier_error(&self, copier: &CopierAccount, error: &ConnectorError) {
        let state = if error.failure_kind() == FailureKind::Credential {
            error!(
                copier = %copier.id,
                error = %error,
                "Copier credentials rejected, copier suspended"
            );
            self.sink
                .log_action(&copier.id, "credential_error", json!({ "error": error.to_string() }))
                .await;
            SyncState::CredentialError
        } else {
            warn!(copier = %copier.id, error = %error, "Copier reconciliation failed");
            SyncState::Error
        };
        let record = SyncStatusRecord::new(&copier.id, SyncMethod::Reconciliation, state)
            .with_error(error.to_string());
        self.sink.heartbeat(&record).await;
    }

    // ==================== Disconnects ====================

    /// Change a copier's status. Deactivation queues the close-out right
    /// away instead of waiting for the next pass. Returns false for an
    /// unknown copier.
    pub async fn set_copier_status(&self, copier_id: &str, status: CopyStatus) -> Result<bool> {
        let Some(current) = self.db.get_copier(copier_id).await? else {
            return Ok(false);
        };
        self.db.set_copier_status(copier_id, status).await?;
        if current.copy_status == status || status != CopyStatus::Inactive {
            return Ok(true);
        }

        let Some(master) = self.db.get_master_config().await? else {
            warn!(copier = %copier_id, "Master account is not configured, close-out deferred");
            return Ok(true);
        };
        let copier = CopierAccount {
            copy_status: status,
            ..current
        };
        if let Err(e) = self.advance_disconnect(&master, &copier, None).await {
            warn!(copier = %copier_id, error = %e, "Close-out deferred to the next pass");
        }
        Ok(true)
    }

    /// Advance every inactive copier's close-out. Returns how many finished.
    pub async fn process_disconnects(&self, master: &MasterConfig) -> Result<usize> {
        let mut finished = 0;
        for (copier, phase) in self.db.pending_disconnects().await? {
            match self.advance_disconnect(master, &copier, phase).await {
                Ok(true) => finished += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(copier = %copier.id, error = %e, "Disconnect step failed, will retry")
                }
            }
        }
        Ok(finished)
    }

    async fn advance_disconnect(
        &self,
        master: &MasterConfig,
        copier: &CopierAccount,
        phase: Option<DisconnectPhase>,
    ) -> Result<bool> {
        let guard = self.locks.acquire(&copier.id).await;

        let in_flight = self.db.in_flight_symbols(&copier.id).await?;
        if !in_flight.is_empty() {
            debug!(copier = %copier.id, pending = in_flight.len(), "Waiting for close-out tasks");
            return Ok(false);
        }

        let connector: Arc<dyn ExchangeConnector> = self.factory.connector(&copier.credentials)?;
        let timeout = self.config.request_timeout();
        let positions = with_timeout(timeout, connector.get_positions(None)).await?;

        if positions.is_empty() {
            drop(guard);
            let record = self
                .settlement
                .settle_copier(master, copier, TransferType::Withdrawal)
                .await?;
            self.db
                .set_disconnect_phase(&copier.id, DisconnectPhase::Disconnected)
                .await?;
            self.sink
                .log_action(
                    &copier.id,
                    "copier_disconnected",
                    json!({ "settlementId": record.id, "settlementStatus": record.status }),
                )
                .await;
            info!(
                copier = %copier.id,
                settlement = record.status.as_str(),
                "Copier fully disconnected"
            );
            return Ok(true);
        }

        let mut queued = 0;
        for position in &positions {
            let mut metadata = TaskMetadata::new(TaskOrigin::Disconnect);
            metadata.extra = json!({ "phase": "closing" });
            let price = position.reference_price();
            let task = ReplicationTask::new(
                &copier.id,
                TaskType::ClosePosition,
                &position.symbol,
                position.side.opposite(),
                position.size,
                if price > Decimal::ZERO { Some(price) } else { None },
                self.config.max_retries,
                metadata,
            )
            .with_priority(PRIORITY_DISCONNECT);
            if self.db.insert_task(&task).await? {
                queued += 1;
            }
        }

        if phase.is_none() {
            self.db.set_disconnect_phase(&copier.id, DisconnectPhase::Closing).await?;
            let details = json!({ "positions": positions.len() });
            self.sink.log_action(&copier.id, "disconnect_started", details).await;
        }
        info!(copier = %copier.id, tasks = queued, "Queued close-out for inactive copier");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::{MockExchange, MockFactory};
    use crate::db::tests::copier;
    use crate::models::{ApiCredentials, CopyStatus, Side, TaskStatus, TransferStatus};
    use crate::trading::TaskExecutor;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn position(symbol: &str, side: Side, size: Decimal, price: Decimal) -> Position {
        Position {
            symbol: symbol.to_string(),
            side,
            size,
            entry_price: price,
            mark_price: price,
        }
    }

    struct Harness {
        db: Database,
        master: Arc<MockExchange>,
        copier: Arc<MockExchange>,
        reconciler: Reconciler,
        executor: Arc<TaskExecutor>,
    }

    async fn harness() -> Harness {
        let db = Database::in_memory().await.unwrap();
        db.save_master_config(&MasterConfig {
            credentials: ApiCredentials::new("master-key", "secret"),
            settlement_account_id: "900009".to_string(),
        })
        .await
        .unwrap();
        db.save_copier(&copier("c1", dec!(10000), CopyStatus::Active)).await.unwrap();

        let master = MockExchange::new(dec!(100000));
        let copier_exchange = MockExchange::new(dec!(10000));
        let factory = MockFactory::new();
        factory.register("master-key", master.clone());
        factory.register("key-c1", copier_exchange.clone());

        let config = Arc::new(EngineConfig::default());
        let sink = StatusSink::new(db.clone());
        let locks = CopierLocks::new();
        let capital = Arc::new(MasterCapital::new(
            Duration::from_secs(5),
            Duration::from_secs(1),
        ));
        let settlement = Arc::new(SettlementJob::new(
            sink.clone(),
            factory.clone(),
            config.clone(),
        ));
        let reconciler = Reconciler::new(
            sink.clone(),
            factory.clone(),
            locks.clone(),
            capital,
            settlement,
            config.clone(),
        );
        let executor = Arc::new(TaskExecutor::new(sink, factory, locks, config));

        Harness {
            db,
            master,
            copier: copier_exchange,
            reconciler,
            executor,
        }
    }

    #[test]
    fn test_matching_positions_produce_no_tasks() {
        let c = copier("c1", dec!(10000), CopyStatus::Active);
        let master = vec![
            position("BTCUSDT", Side::Buy, dec!(1), dec!(60000)),
            position("ETHUSDT", Side::Sell, dec!(10), dec!(3000)),
        ];
        let actual = vec![
            position("BTCUSDT", Side::Buy, dec!(0.1), dec!(60010)),
            // Within the 1% tolerance
            position("ETHUSDT", Side::Sell, dec!(0.995), dec!(3000)),
        ];

        let config = EngineConfig::default();
        let tasks = plan_adjustments(&c, &master, dec!(100000), &actual, &HashSet::new(), &config);
        assert!(tasks.is_empty());
    }

    #[test]
    fn test_drift_open_close_and_flip() {
        let c = copier("c1", dec!(10000), CopyStatus::Active);
        let master = vec![
            position("BTCUSDT", Side::Buy, dec!(1), dec!(60000)),
            position("ETHUSDT", Side::Buy, dec!(10), dec!(3000)),
            position("SOLUSDT", Side::Buy, dec!(100), dec!(150)),
        ];
        let actual = vec![
            position("BTCUSDT", Side::Buy, dec!(0.05), dec!(60000)),
            position("ETHUSDT", Side::Sell, dec!(0.5), dec!(3000)),
            position("XRPUSDT", Side::Buy, dec!(40), dec!(0.6)),
        ];

        let config = EngineConfig::default();
        let tasks = plan_adjustments(&c, &master, dec!(100000), &actual, &HashSet::new(), &config);
        let summary: Vec<(String, TaskType, Side, Decimal)> = tasks
            .iter()
            .map(|t| (t.symbol.clone(), t.task_type, t.side, t.quantity))
            .collect();

        assert_eq!(
            summary,
            vec![
                ("BTCUSDT".to_string(), TaskType::OpenPosition, Side::Buy, dec!(0.05)),
                ("ETHUSDT".to_string(), TaskType::ClosePosition, Side::Buy, dec!(0.5)),
                ("ETHUSDT".to_string(), TaskType::OpenPosition, Side::Buy, dec!(1)),
                ("SOLUSDT".to_string(), TaskType::OpenPosition, Side::Buy, dec!(10)),
                ("XRPUSDT".to_string(), TaskType::ClosePosition, Side::Sell, dec!(40)),
            ]
        );
        assert!(tasks.iter().all(|t| t.metadata.origin == TaskOrigin::Reconciliation));
    }

    #[test]
    fn test_in_flight_and_filtered_symbols_are_left_alone() {
        let mut c = copier("c1", dec!(10000), CopyStatus::Active);
        c.settings.blocked_symbols = Some(vec!["ETHUSDT".to_string()]);
        let master = vec![
            position("BTCUSDT", Side::Buy, dec!(1), dec!(60000)),
            position("ETHUSDT", Side::Buy, dec!(10), dec!(3000)),
        ];
        let actual = vec![position("ETHUSDT", Side::Sell, dec!(3), dec!(3000))];
        let in_flight: HashSet<String> = ["BTCUSDT".to_string()].into_iter().collect();

        let config = EngineConfig::default();
        let tasks = plan_adjustments(&c, &master, dec!(100000), &actual, &in_flight, &config);
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_sync_converges_copier_to_master() {
        let h = harness().await;
        h.master.set_position("BTCUSDT", Side::Buy, dec!(1), dec!(60000));

        let summary = h.reconciler.sync_positions().await.unwrap();
        assert_eq!(summary.tasks_created, 1);

        h.executor.run_tick().await.unwrap();
        assert_eq!(h.copier.position("BTCUSDT").unwrap().size, dec!(0.1));

        let summary = h.reconciler.sync_positions().await.unwrap();
        assert_eq!(summary.tasks_created, 0);

        let status = h.db.get_sync_status("c1").await.unwrap().unwrap();
        assert_eq!(status.sync_status, SyncState::Synced);
        assert_eq!(status.sync_method, SyncMethod::Reconciliation);
    }

    #[tokio::test]
    async fn test_overlapping_pass_is_skipped() {
        let h = harness().await;
        let _held = RunGuard::try_acquire(&h.reconciler.running).unwrap();

        let summary = h.reconciler.sync_positions().await.unwrap();
        assert!(summary.skipped);
    }

    #[tokio::test]
    async fn test_inactive_copier_closes_everything_then_settles() {
        let h = harness().await;
        h.master.set_position("BTCUSDT", Side::Buy, dec!(1), dec!(60000));
        h.copier.set_position("ETHUSDT", Side::Buy, dec!(2), dec!(3000));
        h.copier.set_closed_pnl(dec!(80));

        h.db.set_copier_status("c1", CopyStatus::Inactive).await.unwrap();
        h.reconciler.sync_positions().await.unwrap();

        let tasks = h.db.tasks_for_copier("c1").await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].symbol, "ETHUSDT");
        assert_eq!(tasks[0].task_type, TaskType::ClosePosition);
        assert_eq!(tasks[0].priority, PRIORITY_DISCONNECT);
        assert!(h.db.transfers_for_copier("c1").await.unwrap().is_empty());

        h.executor.run_tick().await.unwrap();
        assert!(h.copier.position("ETHUSDT").is_none());
        let closed = h.db.get_task(&tasks[0].id).await.unwrap().unwrap();
        assert_eq!(closed.status, TaskStatus::Completed);

        let summary = h.reconciler.sync_positions().await.unwrap();
        assert_eq!(summary.disconnects_completed, 1);

        let transfers = h.db.transfers_for_copier("c1").await.unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].transfer_type, TransferType::Withdrawal);
        assert_eq!(transfers[0].status, TransferStatus::Completed);
        assert_eq!(h.master.transfers()[0].amount, dec!(40));

        // Nothing more happens on later passes
        h.reconciler.sync_positions().await.unwrap();
        assert_eq!(h.db.transfers_for_copier("c1").await.unwrap().len(), 1);
        assert!(h.copier.orders().is_empty());
    }

    #[tokio::test]
    async fn test_master_book_is_read_after_copier_lock() {
        let h = harness().await;
        let guard = h.reconciler.locks.acquire("c1").await;

        let master = h.master.clone();
        let copier_exchange = h.copier.clone();
        let (summary, _) = tokio::join!(h.reconciler.sync_positions(), async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            // The executor finishes a copy while the pass waits on the lock
            master.set_position("BTCUSDT", Side::Buy, dec!(1), dec!(60000));
            copier_exchange.set_position("BTCUSDT", Side::Buy, dec!(0.1), dec!(60000));
            drop(guard);
        });

        let summary = summary.unwrap();
        assert_eq!(summary.copiers_checked, 1);
        assert_eq!(summary.tasks_created, 0);
        assert!(h.db.tasks_for_copier("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_master_read_failure_ends_pass() {
        let h = harness().await;
        h.db.save_copier(&copier("c2", dec!(10000), CopyStatus::Active)).await.unwrap();
        h.master.fail_next_positions(ConnectorError::Transport("connection reset".to_string()));

        assert!(h.reconciler.sync_positions().await.is_err());
        // Not blamed on the copier
        assert!(h.db.get_sync_status("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deactivation_queues_close_out_immediately() {
        let h = harness().await;
        h.copier.set_position("ETHUSDT", Side::Buy, dec!(2), dec!(3000));

        assert!(h.reconciler.set_copier_status("c1", CopyStatus::Inactive).await.unwrap());

        let tasks = h.db.tasks_for_copier("c1").await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, TaskType::ClosePosition);
        assert_eq!(tasks[0].side, Side::Sell);
        assert_eq!(tasks[0].priority, PRIORITY_DISCONNECT);
        assert_eq!(
            h.db.get_disconnect_phase("c1").await.unwrap(),
            Some(DisconnectPhase::Closing)
        );

        // Repeating the change queues nothing new
        assert!(h.reconciler.set_copier_status("c1", CopyStatus::Inactive).await.unwrap());
        assert_eq!(h.db.tasks_for_copier("c1").await.unwrap().len(), 1);
        assert!(!h.reconciler.set_copier_status("nope", CopyStatus::Inactive).await.unwrap());
    }
}
