//! Trade-level types: order side, order type and master executions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an order or position, using the exchange's spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }

    /// The side that reduces a position held on `self`.
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => anyhow::bail!("unknown side '{}'", other),
        }
    }
}

/// Order type submitted to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "Market",
            OrderType::Limit => "Limit",
        }
    }
}

impl FromStr for OrderType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "market" => Ok(OrderType::Market),
            "limit" => Ok(OrderType::Limit),
            other => anyhow::bail!("unknown order type '{}'", other),
        }
    }
}

/// A fill on the master account, as reported by the private execution stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterExecution {
    /// Exchange execution ID; the idempotence key for generated tasks
    pub exec_id: String,

    /// Master order that produced this fill
    pub order_id: String,

    pub symbol: String,

    pub side: Side,

    /// Filled quantity in contracts/base units
    pub exec_qty: Decimal,

    /// Fill price
    pub exec_price: Decimal,

    /// Quantity of an existing position closed by this fill (0 when opening)
    #[serde(default)]
    pub closed_size: Decimal,

    pub exec_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_parsing() {
        assert_eq!("Buy".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("SELL".parse::<Side>().unwrap(), Side::Sell);
        assert!("hold".parse::<Side>().is_err());
        assert_eq!(Side::Buy.opposite(), Side::Sell);
    }

    #[test]
    fn test_order_type_round_trip() {
        let parsed: OrderType = OrderType::Limit.as_str().parse().unwrap();
        assert_eq!(parsed, OrderType::Limit);
    }
}
