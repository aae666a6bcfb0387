//! Master and copier account configuration.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// API key pair for one exchange account.
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl ApiCredentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }
}

// Keep secrets out of logs.
impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"***")
            .finish()
    }
}

/// Singleton master account configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    pub credentials: ApiCredentials,

    /// Exchange account that receives the platform's profit share
    pub settlement_account_id: String,
}

/// Replication status of a copier, set from outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyStatus {
    Active,
    Paused,
    Inactive,
}

impl CopyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyStatus::Active => "active",
            CopyStatus::Paused => "paused",
            CopyStatus::Inactive => "inactive",
        }
    }
}

impl fmt::Display for CopyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CopyStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(CopyStatus::Active),
            "paused" => Ok(CopyStatus::Paused),
            "inactive" => Ok(CopyStatus::Inactive),
            other => anyhow::bail!("unknown copy status '{}'", other),
        }
    }
}

/// Risk and sizing settings of one copier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopierSettings {
    /// Maximum notional per opened position (<= 0 means no limit)
    pub max_position_size: Decimal,

    /// Only these symbols are copied when set
    pub allowed_symbols: Option<Vec<String>>,

    /// These symbols are never copied
    pub blocked_symbols: Option<Vec<String>>,

    /// Scaling factor applied on top of the capital ratio
    pub copy_multiplier: Decimal,
}

impl CopierSettings {
    /// Does this copier copy trades on `symbol`?
    pub fn allows_symbol(&self, symbol: &str) -> bool {
        if let Some(blocked) = &self.blocked_symbols {
            if blocked.iter().any(|s| s.eq_ignore_ascii_case(symbol)) {
                return false;
            }
        }
        match &self.allowed_symbols {
            Some(allowed) => allowed.iter().any(|s| s.eq_ignore_ascii_case(symbol)),
            None => true,
        }
    }

    /// Does an order of this notional breach the position limit?
    pub fn exceeds_position_limit(&self, notional: Decimal) -> bool {
        self.max_position_size > Decimal::ZERO && notional > self.max_position_size
    }
}

/// A copier account as stored in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopierAccount {
    pub id: String,

    pub user_id: String,

    pub credentials: ApiCredentials,

    /// Exchange-side account ID, recorded when credentials are validated
    pub exchange_account_id: Option<String>,

    /// Capital the copier dedicates to mirroring, in USD
    pub capital: Decimal,

    /// Informational risk budget in percent of capital
    pub max_risk_percent: Decimal,

    pub copy_status: CopyStatus,

    pub settings: CopierSettings,

    pub created_at: DateTime<Utc>,
}

impl CopierAccount {
    pub fn is_active(&self) -> bool {
        self.copy_status == CopyStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn settings() -> CopierSettings {
        CopierSettings {
            max_position_size: dec!(1000),
            allowed_symbols: None,
            blocked_symbols: None,
            copy_multiplier: Decimal::ONE,
        }
    }

    #[test]
    fn test_symbol_filters() {
        let mut s = settings();
        assert!(s.allows_symbol("BTCUSDT"));

        s.blocked_symbols = Some(vec!["BTCUSDT".to_string()]);
        assert!(!s.allows_symbol("BTCUSDT"));
        assert!(s.allows_symbol("ETHUSDT"));

        s.allowed_symbols = Some(vec!["SOLUSDT".to_string()]);
        assert!(!s.allows_symbol("ETHUSDT"));
        assert!(s.allows_symbol("solusdt"));
    }

    #[test]
    fn test_position_limit() {
        let mut s = settings();
        assert!(s.exceeds_position_limit(dec!(1000.01)));
        assert!(!s.exceeds_position_limit(dec!(1000)));

        s.max_position_size = Decimal::ZERO;
        assert!(!s.exceeds_position_limit(dec!(1000000)));
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let creds = ApiCredentials::new("key", "very-secret");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("key"));
        assert!(!printed.contains("very-secret"));
    }
}
