//! Error taxonomy for exchange calls and replication failures.

use std::time::Duration;

use thiserror::Error;

/// How the engine reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network trouble or timeouts; retried up to the task's budget
    Transient,
    /// Breaks a copier's risk limits; never retried
    PolicyViolation,
    /// Invalid or expired keys; the copier is suspended
    Credential,
    /// Nothing tradable on the copier side; skipped with a warning
    DataInconsistency,
}

/// Error returned by an exchange connector.
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("exchange error {code}: {message}")]
    Exchange { code: i64, message: String },

    #[error("credential error: {0}")]
    Credential(String),

    #[error("symbol not tradable: {0}")]
    UnknownSymbol(String),

    #[error("no position to close: {0}")]
    NothingToClose(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("order id already used: {0}")]
    DuplicateOrder(String),
}

impl ConnectorError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ConnectorError::Credential(_) => FailureKind::Credential,
            ConnectorError::UnknownSymbol(_) | ConnectorError::NothingToClose(_) => {
                FailureKind::DataInconsistency
            }
            ConnectorError::Timeout(_)
            | ConnectorError::Transport(_)
            | ConnectorError::Exchange { .. }
            | ConnectorError::Decode(_)
            | ConnectorError::DuplicateOrder(_) => FailureKind::Transient,
        }
    }

    /// Classify a non-zero Bybit `retCode`.
    pub fn from_bybit(code: i64, message: &str) -> Self {
        let lower = message.to_lowercase();
        match code {
            10003 | 10004 | 10005 | 33004 => {
                ConnectorError::Credential(format!("{} (code {})", message, code))
            }
            110072 => ConnectorError::DuplicateOrder(message.to_string()),
            10001 | 110017 | 110043 if lower.contains("symbol") => {
                ConnectorError::UnknownSymbol(message.to_string())
            }
            // Reduce-only order against a flat position
            110017 | 110009 if lower.contains("position is zero") => {
                ConnectorError::NothingToClose(message.to_string())
            }
            _ if lower.contains("symbol not exist") || lower.contains("symbol invalid") => {
                ConnectorError::UnknownSymbol(message.to_string())
            }
            _ => ConnectorError::Exchange {
                code,
                message: message.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ConnectorError::Timeout(Duration::ZERO);
        }
        if let Some(status) = err.status() {
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                return ConnectorError::Credential(err.to_string());
            }
        }
        if err.is_decode() {
            return ConnectorError::Decode(err.to_string());
        }
        ConnectorError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(err: serde_json::Error) -> Self {
        ConnectorError::Decode(err.to_string())
    }
}

pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;
