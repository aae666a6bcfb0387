//! Master stream listener and dispatcher.
//!
//! The listener owns the private stream connection and its reconnect state
//! machine. Events are forwarded to a single dispatcher task that owns the
//! master position book and turns executions into replication tasks.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{with_timeout, ConnectorFactory, EventReceiver, StreamEvent, StreamSource};
use crate::db::Database;
use crate::error::FailureKind;
use crate::models::{
    MasterConfig, MasterExecution, MasterPositionBook, SyncMethod, SyncState, SyncStatusRecord,
    TaskType,
};
use crate::status::{ConnectionStatus, StatusEvent, StatusSink};
use crate::trading::{EngineConfig, MasterCapital, TaskGenerator};

/// Snapshot of the master stream exposed to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerStatus {
    pub state: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub active_positions: usize,
}

impl Default for ListenerStatus {
    fn default() -> Self {
        Self {
            state: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            active_positions: 0,
        }
    }
}

/// What the listener hands to the dispatcher.
#[derive(Debug)]
pub enum ListenerMessage {
    /// A (re)connection completed; the position book needs a fresh snapshot
    Connected,
    Event(StreamEvent),
}

enum StreamEnd {
    Closed(String),
    Cancelled,
    DispatcherGone,
}

/// Connects to the master's private stream and keeps it connected.
pub struct StreamListener {
    source: Arc<dyn StreamSource>,
    sink: StatusSink,
    config: Arc<EngineConfig>,
    status: Arc<watch::Sender<ListenerStatus>>,
    reconnect: Arc<Notify>,
}

impl StreamListener {
    pub fn new(
        source: Arc<dyn StreamSource>,
        sink: StatusSink,
        config: Arc<EngineConfig>,
        status: Arc<watch::Sender<ListenerStatus>>,
        reconnect: Arc<Notify>,
    ) -> Self {
        Self {
            source,
            sink,
            config,
            status,
            reconnect,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.reconnect_initial())
            .with_max_interval(self.config.reconnect_max())
            .with_max_elapsed_time(None)
            .build()
    }

    async fn transition(
        &self,
        state: ConnectionStatus,
        attempt: Option<u32>,
        error: Option<String>,
    ) {
        self.sink.master_connectivity(state, attempt, error).await;
        self.status.send_modify(|s| {
            s.state = state;
            s.reconnect_attempts = attempt.unwrap_or(0);
        });
    }

    /// Run until cancelled or until the dispatcher goes away.
    ///
    /// After `max_reconnect_attempts` failed reconnects the listener parks in
    /// `Disconnected` until [`Notify::notify_one`] is called on its reconnect
    /// handle. Rejected credentials park it in `Error` straight away.
    pub async fn run(
        self,
        master: MasterConfig,
        tx: mpsc::Sender<ListenerMessage>,
        cancel: CancellationToken,
    ) {
        let max_attempts = self.config.max_reconnect_attempts;
        let timeout = self.config.request_timeout();
        let mut backoff = self.backoff();
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let connect = self.source.connect(&master.credentials);
            let last_error = match with_timeout(timeout, connect).await {
                Ok(events) => {
                    attempts = 0;
                    backoff.reset();
                    info!("Master stream connected");
                    self.transition(ConnectionStatus::Connected, None, None).await;
                    if tx.send(ListenerMessage::Connected).await.is_err() {
                        break;
                    }

                    match pump(events, &tx, &cancel).await {
                        StreamEnd::Cancelled | StreamEnd::DispatcherGone => break,
                        StreamEnd::Closed(reason) => {
                            warn!(reason = %reason, "Master stream closed unexpectedly");
                            reason
                        }
                    }
                }
                Err(e) if e.failure_kind() == FailureKind::Credential => {
                    error!(error = %e, "Master credentials rejected, stream stopped");
                    self.transition(ConnectionStatus::Error, None, Some(e.to_string())).await;
                    if !self.park(&cancel).await {
                        break;
                    }
                    attempts = 0;
                    backoff.reset();
                    continue;
                }
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "Master stream connect failed");
                    e.to_string()
                }
            };

            attempts += 1;
            if attempts > max_attempts {
                error!(
                    attempts = max_attempts,
                    "Master stream reconnect limit reached, falling back to reconciliation only"
                );
                self.transition(
                    ConnectionStatus::Disconnected,
                    Some(max_attempts),
                    Some(last_error),
                )
                .await;

                if !self.park(&cancel).await {
                    break;
                }
                attempts = 0;
                backoff.reset();
                continue;
            }

            self.transition(ConnectionStatus::Reconnecting, Some(attempts), Some(last_error))
                .await;
            let delay = backoff.next_backoff().unwrap_or_else(|| self.config.reconnect_max());
            debug!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "Waiting before reconnect"
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Master stream listener stopped");
        self.transition(ConnectionStatus::Disconnected, None, None).await;
    }

    /// Wait for a manual reconnect request. False when cancelled first.
    async fn park(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = self.reconnect.notified() => {
                info!("Manual reconnect requested");
                true
            }
        }
    }
}

async fn pump(
    mut events: EventReceiver,
    tx: &mpsc::Sender<ListenerMessage>,
    cancel: &CancellationToken,
) -> StreamEnd {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            next = events.recv() => match next {
                Some(Ok(event)) => {
                    if tx.send(ListenerMessage::Event(event)).await.is_err() {
                        return StreamEnd::DispatcherGone;
                    }
                }
                Some(Err(e)) => warn!(error = %e, "Dropped malformed stream event"),
                None => return StreamEnd::Closed("stream ended".to_string()),
            }
        }
    }
}

/// Consumes listener messages in bursts. Sole owner of the master position book.
pub struct Dispatcher {
    db: Database,
    sink: StatusSink,
    factory: Arc<dyn ConnectorFactory>,
    master: MasterConfig,
    capital: Arc<MasterCapital>,
    generator: TaskGenerator,
    status: Arc<watch::Sender<ListenerStatus>>,
    timeout: Duration,
    book: MasterPositionBook,
}

impl Dispatcher {
    pub fn new(
        sink: StatusSink,
        factory: Arc<dyn ConnectorFactory>,
        master: MasterConfig,
        capital: Arc<MasterCapital>,
        config: Arc<EngineConfig>,
        status: Arc<watch::Sender<ListenerStatus>>,
    ) -> Self {
        Self {
            db: sink.db().clone(),
            generator: TaskGenerator::new(sink.db().clone(), config.clone()),
            sink,
            factory,
            master,
            capital,
            status,
            timeout: config.request_timeout(),
            book: MasterPositionBook::new(),
        }
    }

    /// Run until the listener side of the channel is dropped.
    pub async fn run(mut self, mut rx: mpsc::Receiver<ListenerMessage>) {
        while let Some(first) = rx.recv().await {
            let mut burst = vec![first];
            while let Ok(next) = rx.try_recv() {
                burst.push(next);
            }
            self.handle_burst(burst).await;
        }
        debug!("Dispatcher stopped");
    }

    async fn handle_burst(&mut self, burst: Vec<ListenerMessage>) {
        let mut executions = Vec::new();
        let mut others = Vec::new();
        for message in burst {
            match message {
                ListenerMessage::Connected => self.load_snapshot().await,
                ListenerMessage::Event(StreamEvent::Execution(exec)) => executions.push(exec),
                ListenerMessage::Event(event) => others.push(event),
            }
        }
        let had_events = !executions.is_empty() || !others.is_empty();

        // Executions are judged against the book before this burst's position updates land
        if !executions.is_empty() {
            self.replicate(executions).await;
        }

        for event in others {
            match event {
                StreamEvent::Position(update) => {
                    if let Some(change) = self.book.apply(update) {
                        info!(
                            symbol = %change.symbol,
                            side = %change.side,
                            size = %change.size,
                            previous = %change.previous_size,
                            "Master position changed"
                        );
                        self.sink.publish(StatusEvent::PositionUpdate {
                            symbol: change.symbol,
                            side: change.side,
                            size: change.size,
                            previous_size: change.previous_size,
                            action: change.action,
                        });
                    }
                }
                StreamEvent::Order(update) => {
                    debug!(
                        order_id = %update.order_id,
                        status = %update.status,
                        "Master order update"
                    );
                    self.sink.publish(StatusEvent::OrderUpdate(update));
                }
                StreamEvent::Execution(_) => {}
            }
        }

        let active = self.book.len();
        self.status.send_modify(|s| s.active_positions = active);

        if had_events {
            self.copier_heartbeats().await;
        }
    }

    async fn load_snapshot(&mut self) {
        let positions = match self.factory.connector(&self.master.credentials) {
            Ok(master) => with_timeout(self.timeout, master.get_positions(None)).await,
            Err(e) => Err(e),
        };
        match positions {
            Ok(positions) => {
                self.book.load(positions);
                info!(positions = self.book.len(), "Loaded master position snapshot");
            }
            Err(e) => warn!(error = %e, "Failed to load master position snapshot"),
        }
    }

    async fn replicate(&mut self, executions: Vec<MasterExecution>) {
        let capital = match self.factory.connector(&self.master.credentials) {
            Ok(master) => self.capital.get(master.as_ref()).await,
            Err(e) => Err(e),
        };
        let capital: Option<Decimal> = match capital {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    error = %e,
                    executions = executions.len(),
                    "Master capital unavailable, leaving burst to reconciliation"
                );
                None
            }
        };

        for exec in executions {
            info!(
                exec_id = %exec.exec_id,
                symbol = %exec.symbol,
                side = %exec.side,
                qty = %exec.exec_qty,
                price = %exec.exec_price,
                "Master execution"
            );
            self.sink.publish(StatusEvent::TradeExecuted {
                symbol: exec.symbol.clone(),
                side: exec.side,
                quantity: exec.exec_qty,
                price: exec.exec_price,
                order_id: exec.order_id.clone(),
            });

            let Some(capital) = capital else { continue };
            let reduces = self.book.reduces_exposure(&exec);
            match self.generator.on_master_execution(&exec, reduces, capital).await {
                Ok(tasks) if !tasks.is_empty() => {
                    self.sink.publish(StatusEvent::ReplicationComplete {
                        symbol: exec.symbol.clone(),
                        copiers_count: tasks.len(),
                        action: if reduces {
                            TaskType::ClosePosition
                        } else {
                            TaskType::OpenPosition
                        },
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    error!(exec_id = %exec.exec_id, error = %e, "Failed to queue replication tasks")
                }
            }
        }
    }

    async fn copier_heartbeats(&self) {
        match self.db.list_active_copiers().await {
            Ok(copiers) => {
                for copier in copiers {
                    let record =
                        SyncStatusRecord::new(&copier.id, SyncMethod::Websocket, SyncState::Synced);
                    self.sink.heartbeat(&record).await;
                }
            }
            Err(e) => warn!(error = %e, "Failed to list copiers for heartbeat"),
        }
    }
}
