//! Replication engine: task generation, execution, reconciliation and
//! profit settlement.

mod capital;
mod config;
mod executor;
mod locks;
mod reconciler;
mod settlement;
mod task_generator;

pub use capital::MasterCapital;
pub use config::EngineConfig;
pub use executor::{TaskExecutor, TickSummary};
pub use locks::CopierLocks;
pub use reconciler::Reconciler;
pub use settlement::{next_weekly_run, SettlementJob};
pub use task_generator::TaskGenerator;
