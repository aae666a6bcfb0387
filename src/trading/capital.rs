//! Master capital sampling with a staleness window.

use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::api::{with_timeout, ExchangeConnector};
use crate::error::ConnectorResult;

/// Caches the master's wallet balance so one burst of executions costs at
/// most one balance call.
pub struct MasterCapital {
    staleness: Duration,
    timeout: Duration,
    sample: Mutex<Option<(Decimal, Instant)>>,
}

impl MasterCapital {
    pub fn new(staleness: Duration, timeout: Duration) -> Self {
        Self {
            staleness,
            timeout,
            sample: Mutex::new(None),
        }
    }

    /// Cached capital if still fresh, otherwise a new sample.
    pub async fn get(&self, master: &dyn ExchangeConnector) -> ConnectorResult<Decimal> {
        let mut sample = self.sample.lock().await;
        if let Some((value, at)) = *sample {
            if at.elapsed() <= self.staleness {
                return Ok(value);
            }
        }
        let value = with_timeout(self.timeout, master.get_wallet_balance()).await?;
        debug!(capital = %value, "Sampled master capital");
        *sample = Some((value, Instant::now()));
        Ok(value)
    }

    /// Always read the balance, replacing the cached sample.
    pub async fn refresh(&self, master: &dyn ExchangeConnector) -> ConnectorResult<Decimal> {
        let mut sample = self.sample.lock().await;
        let value = with_timeout(self.timeout, master.get_wallet_balance()).await?;
        *sample = Some((value, Instant::now()));
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockExchange;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_cached_within_window() {
        let master = MockExchange::new(dec!(100000));
        let capital = MasterCapital::new(Duration::from_secs(60), Duration::from_secs(1));

        assert_eq!(capital.get(master.as_ref()).await.unwrap(), dec!(100000));
        master.set_balance(dec!(50000));
        assert_eq!(capital.get(master.as_ref()).await.unwrap(), dec!(100000));
        assert_eq!(capital.refresh(master.as_ref()).await.unwrap(), dec!(50000));
    }

    #[tokio::test]
    async fn test_stale_sample_is_replaced() {
        let master = MockExchange::new(dec!(100000));
        let capital = MasterCapital::new(Duration::ZERO, Duration::from_secs(1));

        capital.get(master.as_ref()).await.unwrap();
        master.set_balance(dec!(80000));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(capital.get(master.as_ref()).await.unwrap(), dec!(80000));
    }
}
