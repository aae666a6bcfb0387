//! Exchange connector boundary: the operations the engine needs from a
//! brokerage, plus the Bybit v5 implementation.

mod bybit_client;
mod bybit_stream;
#[cfg(test)]
pub mod mock;
mod types;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::error::{ConnectorError, ConnectorResult};
use crate::models::{ApiCredentials, Position};

pub use bybit_client::{BybitConfig, BybitConnectorFactory, BYBIT_REST_URL, BYBIT_WS_URL};
pub use bybit_stream::BybitStreamSource;
pub use types::*;

/// Operations against one exchange account (master or copier).
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// Total account equity in USD.
    async fn get_wallet_balance(&self) -> ConnectorResult<Decimal>;

    /// Open positions, optionally filtered to one symbol.
    async fn get_positions(&self, symbol: Option<&str>) -> ConnectorResult<Vec<Position>>;

    /// Place an order. Resubmitting a `client_order_id` the exchange has
    /// already accepted returns the original order instead of a new one.
    async fn place_order(&self, request: &OrderRequest) -> ConnectorResult<OrderResult>;

    /// Reduce-only market order against an existing position.
    async fn close_position(&self, request: &OrderRequest) -> ConnectorResult<OrderResult>;

    async fn internal_transfer(&self, request: &TransferRequest) -> ConnectorResult<TransferResult>;

    /// Realized profit over a time window.
    async fn get_closed_pnl(&self, window: PnlWindow) -> ConnectorResult<Decimal>;

    /// Check the keys and return the exchange account ID they belong to.
    async fn validate_credentials(&self) -> ConnectorResult<String>;
}

/// Builds connectors from credential pairs.
pub trait ConnectorFactory: Send + Sync {
    fn connector(
        &self,
        credentials: &ApiCredentials,
    ) -> ConnectorResult<Arc<dyn ExchangeConnector>>;
}

/// Receiving half of a private stream. Dropping it closes the subscription.
pub type EventReceiver = mpsc::Receiver<ConnectorResult<StreamEvent>>;

/// Opens the master's private position/execution/order stream.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn connect(&self, credentials: &ApiCredentials) -> ConnectorResult<EventReceiver>;
}

/// Run a connector call with a hard deadline.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> ConnectorResult<T>
where
    F: Future<Output = ConnectorResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ConnectorError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: ConnectorResult<()> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(ConnectorError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_through() {
        let value =
            tokio_test::assert_ok!(with_timeout(Duration::from_secs(1), async { Ok(7) }).await);
        assert_eq!(value, 7);
    }
}
