//! Status and audit sink: persists heartbeats, trade mirrors and action
//! logs, and broadcasts live status events to observers.

use anyhow::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::api::OrderUpdate;
use crate::db::Database;
use crate::models::{
    PositionAction, Side, SyncMethod, SyncState, SyncStatusRecord, TaskType, TradeMirrorRecord,
    MASTER_ACCOUNT_ID,
};

const EVENT_CAPACITY: usize = 256;

/// Connectivity of the master stream as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    Error,
    Disconnected,
}

impl ConnectionStatus {
    fn sync_state(&self) -> SyncState {
        match self {
            ConnectionStatus::Connected => SyncState::Connected,
            ConnectionStatus::Reconnecting => SyncState::Reconnecting,
            ConnectionStatus::Error => SyncState::Error,
            ConnectionStatus::Disconnected => SyncState::Disconnected,
        }
    }
}

/// Live event pushed on every meaningful transition.
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum StatusEvent {
    CopyTradingStatus {
        status: ConnectionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        attempt: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TradeExecuted {
        symbol: String,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        order_id: String,
    },
    PositionUpdate {
        symbol: String,
        side: Side,
        size: Decimal,
        previous_size: Decimal,
        action: PositionAction,
    },
    ReplicationComplete {
        symbol: String,
        copiers_count: usize,
        action: TaskType,
    },
    OrderUpdate(OrderUpdate),
}

/// Shared handle to the audit store and the live event channel.
#[derive(Clone)]
pub struct StatusSink {
    db: Database,
    events: broadcast::Sender<StatusEvent>,
}

impl StatusSink {
    pub fn new(db: Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { db, events }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Push an event to observers. Having none is fine.
    pub fn publish(&self, event: StatusEvent) {
        debug!(?event, "Status event");
        let _ = self.events.send(event);
    }

    /// Record a master connectivity transition.
    pub async fn master_connectivity(
        &self,
        status: ConnectionStatus,
        attempt: Option<u32>,
        error: Option<String>,
    ) {
        let mut record =
            SyncStatusRecord::new(MASTER_ACCOUNT_ID, SyncMethod::Websocket, status.sync_state());
        record.websocket_connected = status == ConnectionStatus::Connected;
        record.last_error = error.clone();
        self.heartbeat(&record).await;

        self.publish(StatusEvent::CopyTradingStatus { status, attempt, error });
    }

    /// Upsert a sync status row; storage trouble is logged, not raised.
    pub async fn heartbeat(&self, record: &SyncStatusRecord) {
        if let Err(e) = self.db.upsert_sync_status(record).await {
            warn!(account = %record.account_id, error = %e, "Failed to write sync status");
        }
    }

    /// Write an audit action-log entry; storage trouble is logged, not raised.
    pub async fn log_action(&self, account_id: &str, action: &str, details: serde_json::Value) {
        if let Err(e) = self.db.log_action(account_id, action, &details).await {
            warn!(account = %account_id, action, error = %e, "Failed to write action log");
        }
    }

    pub async fn record_mirror(&self, record: &TradeMirrorRecord) -> Result<()> {
        self.db.insert_mirror(record).await
    }
}
