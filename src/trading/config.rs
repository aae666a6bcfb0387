//! Engine configuration.

use std::time::Duration;

use chrono::Weekday;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Tunables for the replication engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Period of the task executor tick in milliseconds
    pub task_tick_ms: u64,

    /// Maximum tasks dequeued per tick
    pub task_batch_size: i64,

    /// Period of the reconciliation pass in seconds
    pub reconcile_interval_secs: u64,

    /// Retry budget given to new tasks
    pub max_retries: i64,

    /// Stream reconnect attempts before degrading to reconciliation only
    pub max_reconnect_attempts: u32,

    /// First reconnect delay in milliseconds
    pub reconnect_initial_ms: u64,

    /// Reconnect delay cap in milliseconds
    pub reconnect_max_ms: u64,

    /// Hard timeout for every exchange call in seconds
    pub request_timeout_secs: u64,

    /// How long a sampled master capital stays usable, in seconds
    pub capital_staleness_secs: u64,

    /// Relative drift tolerated by reconciliation (0.01 = 1%)
    pub drift_tolerance_relative: Decimal,

    /// Absolute drift tolerated by reconciliation, in contracts
    pub drift_tolerance_absolute: Decimal,

    /// Decimal places kept on copier order quantities
    pub quantity_precision: u32,

    /// Day of the weekly settlement run (UTC)
    pub settlement_weekday: Weekday,

    /// Hour of the weekly settlement run (UTC)
    pub settlement_hour: u32,

    /// Share of realized profit that goes to the platform (0.0 to 1.0)
    pub platform_share: Decimal,

    /// Coin used for profit transfers
    pub settlement_coin: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_tick_ms: 1_000,
            task_batch_size: 10,
            reconcile_interval_secs: 30,
            max_retries: 3,
            max_reconnect_attempts: 10,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            request_timeout_secs: 10,
            capital_staleness_secs: 5,
            drift_tolerance_relative: dec!(0.01),  // 1%
            drift_tolerance_absolute: dec!(0.0001),
            quantity_precision: 6,
            settlement_weekday: Weekday::Mon,
            settlement_hour: 0,
            platform_share: dec!(0.5),             // 50/50 split
            settlement_coin: "USDT".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn task_tick(&self) -> Duration {
        Duration::from_millis(self.task_tick_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn capital_staleness(&self) -> Duration {
        Duration::from_secs(self.capital_staleness_secs)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    /// Drift below this is ignored for a target of `target` contracts.
    pub fn drift_tolerance(&self, target: Decimal) -> Decimal {
        (target.abs() * self.drift_tolerance_relative).max(self.drift_tolerance_absolute)
    }
}
