//! Data models for accounts, positions, replication tasks and audit records.

mod copier;
mod position;
mod records;
mod task;
mod trade;

pub use copier::{ApiCredentials, CopierAccount, CopierSettings, CopyStatus, MasterConfig};
pub use position::{MasterPositionBook, Position, PositionAction};
pub use records::{
    MirrorStatus, ProfitTransferRecord, SyncMethod, SyncState, SyncStatusRecord, TradeMirrorRecord,
    TransferStatus, TransferType,
};
pub use task::{
    ReplicationTask, TaskMetadata, TaskOrigin, TaskStatus, TaskType, MASTER_ACCOUNT_ID,
    PRIORITY_DISCONNECT,
};
pub use trade::{MasterExecution, OrderType, Side};
