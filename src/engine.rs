//! Engine runner: wires the listener, dispatcher, task executor,
//! reconciliation and settlement drivers together and runs them until
//! shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::api::{ConnectorFactory, StreamSource};
use crate::db::Database;
use crate::listener::{Dispatcher, ListenerStatus, StreamListener};
use crate::status::{StatusEvent, StatusSink};
use crate::trading::{
    next_weekly_run, CopierLocks, EngineConfig, MasterCapital, Reconciler, SettlementJob,
    TaskExecutor, TickSummary,
};

const DISPATCH_CAPACITY: usize = 1024;

/// The replication engine and its periodic drivers.
pub struct Engine {
    sink: StatusSink,
    factory: Arc<dyn ConnectorFactory>,
    source: Arc<dyn StreamSource>,
    config: Arc<EngineConfig>,
    capital: Arc<MasterCapital>,
    executor: Arc<TaskExecutor>,
    reconciler: Arc<Reconciler>,
    settlement: Arc<SettlementJob>,
    status: Arc<watch::Sender<ListenerStatus>>,
    reconnect: Arc<Notify>,
}

impl Engine {
    pub fn new(
        db: Database,
        factory: Arc<dyn ConnectorFactory>,
        source: Arc<dyn StreamSource>,
        config: EngineConfig,
    ) -> Self {
        let config = Arc::new(config);
        let sink = StatusSink::new(db);
        let locks = CopierLocks::new();
        let capital = Arc::new(MasterCapital::new(
            config.capital_staleness(),
            config.request_timeout(),
        ));
        let settlement = Arc::new(SettlementJob::new(
            sink.clone(),
            factory.clone(),
            config.clone(),
        ));
        let executor = Arc::new(TaskExecutor::new(
            sink.clone(),
            factory.clone(),
            locks.clone(),
            config.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            sink.clone(),
            factory.clone(),
            locks,
            capital.clone(),
            settlement.clone(),
            config.clone(),
        ));
        let (status, _) = watch::channel(ListenerStatus::default());

        Self {
            sink,
            factory,
            source,
            config,
            capital,
            executor,
            reconciler,
            settlement,
            status: Arc::new(status),
            reconnect: Arc::new(Notify::new()),
        }
    }

    /// Current master stream status.
    pub fn status(&self) -> ListenerStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ListenerStatus> {
        self.status.subscribe()
    }

    /// Live status events.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sink.subscribe()
    }

    /// Wake a listener that gave up reconnecting.
    pub fn request_reconnect(&self) {
        self.reconnect.notify_one();
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn settlement(&self) -> &SettlementJob {
        &self.settlement
    }

    /// Run every driver until `cancel` fires, then wait for in-flight work.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let master = self
            .sink
            .db()
            .get_master_config()
            .await?
            .context("Master account is not configured, run `master set` first")?;

        self.executor.recover().await?;

        info!(
            task_tick_ms = self.config.task_tick_ms,
            reconcile_secs = self.config.reconcile_interval_secs,
            "Starting replication engine"
        );

        let (tx, rx) = mpsc::channel(DISPATCH_CAPACITY);
        let listener = StreamListener::new(
            self.source.clone(),
            self.sink.clone(),
            self.config.clone(),
            self.status.clone(),
            self.reconnect.clone(),
        );
        let dispatcher = Dispatcher::new(
            self.sink.clone(),
            self.factory.clone(),
            master.clone(),
            self.capital.clone(),
            self.config.clone(),
            self.status.clone(),
        );

        let listener_handle = tokio::spawn(listener.run(master, tx, cancel.clone()));
        let dispatcher_handle = tokio::spawn(dispatcher.run(rx));
        let executor_handle = tokio::spawn(run_executor(
            self.executor.clone(),
            self.config.clone(),
            cancel.clone(),
        ));
        let reconcile_handle = tokio::spawn(run_reconciler(
            self.reconciler.clone(),
            self.config.clone(),
            cancel.clone(),
        ));
        let settlement_handle = tokio::spawn(run_settlement(
            self.settlement.clone(),
            self.config.clone(),
            cancel.clone(),
        ));

        cancel.cancelled().await;
        info!("Shutting down, waiting for in-flight work");

        let (listener, dispatcher, executor, reconcile, settlement) = tokio::join!(
            listener_handle,
            dispatcher_handle,
            executor_handle,
            reconcile_handle,
            settlement_handle
        );
        for (name, result) in [
            ("listener", listener),
            ("dispatcher", dispatcher),
            ("executor", executor),
            ("reconciler", reconcile),
            ("settlement", settlement),
        ] {
            if let Err(e) = result {
                error!(driver = name, error = %e, "Driver task panicked");
            }
        }

        info!("Replication engine stopped");
        Ok(())
    }
}

async fn run_executor(
    executor: Arc<TaskExecutor>,
    config: Arc<EngineConfig>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(config.task_tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut workers: Vec<JoinHandle<TickSummary>> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        workers.retain(|w| !w.is_finished());
        match executor.tick().await {
            Ok(started) => workers.extend(started),
            Err(e) => error!(error = %e, "Error in task tick"),
        }
    }

    debug!(workers = workers.len(), "Waiting for in-flight task workers");
    for result in join_all(workers).await {
        if let Err(e) = result {
            error!(error = %e, "Task worker panicked");
        }
    }
    debug!("Task executor stopped");
}

async fn run_reconciler(
    reconciler: Arc<Reconciler>,
    config: Arc<EngineConfig>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(config.reconcile_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = reconciler.sync_positions().await {
            error!(error = %e, "Reconciliation pass failed");
        }
    }
    debug!("Reconciliation scheduler stopped");
}

async fn run_settlement(
    settlement: Arc<SettlementJob>,
    config: Arc<EngineConfig>,
    cancel: CancellationToken,
) {
    loop {
        let now = Utc::now();
        let next = next_weekly_run(now, config.settlement_weekday, config.settlement_hour);
        let wait = (next - now).to_std().unwrap_or_default();
        info!(next_run = %next, "Next profit settlement scheduled");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        if let Err(e) = settlement.process_settlements().await {
            error!(error = %e, "Profit settlement run failed");
        }
    }
    debug!("Settlement scheduler stopped");
}
