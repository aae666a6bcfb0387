//! Position model and the master's position book.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::trade::{MasterExecution, Side};

/// Open position on an exchange account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,

    /// Direction of the position
    pub side: Side,

    /// Absolute position size
    pub size: Decimal,

    /// Average entry price
    #[serde(default)]
    pub entry_price: Decimal,

    /// Current mark price
    #[serde(default)]
    pub mark_price: Decimal,
}

impl Position {
    /// Check if this position is closed (size is zero or negligible).
    pub fn is_closed(&self) -> bool {
        self.size < Decimal::new(1, 8)
    }

    /// Best available price for valuing the position.
    pub fn reference_price(&self) -> Decimal {
        if self.mark_price > Decimal::ZERO {
            self.mark_price
        } else {
            self.entry_price
        }
    }
}

/// Whether a position grew or shrank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionAction {
    Opened,
    Closed,
}

/// Result of applying a position-stream update to the book.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionChange {
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub previous_size: Decimal,
    pub action: PositionAction,
}

/// The master's current open positions, keyed by symbol.
///
/// Owned by the stream dispatcher; nothing else reads or writes it.
#[derive(Debug, Default)]
pub struct MasterPositionBook {
    positions: HashMap<String, Position>,
}

impl MasterPositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole book, e.g. from a REST snapshot after (re)connecting.
    pub fn load(&mut self, positions: Vec<Position>) {
        self.positions = positions
            .into_iter()
            .filter(|p| !p.is_closed())
            .map(|p| (p.symbol.clone(), p))
            .collect();
    }

    /// Apply a position-stream update. A closed position is removed.
    ///
    /// Returns `None` when the size did not change.
    pub fn apply(&mut self, update: Position) -> Option<PositionChange> {
        let previous = self.positions.get(&update.symbol);
        let previous_size = previous.map(|p| p.size).unwrap_or(Decimal::ZERO);
        // A flat update carries no meaningful side; report the one that closed.
        let side = match previous {
            Some(p) if update.is_closed() => p.side,
            _ => update.side,
        };

        let change = if update.size == previous_size {
            None
        } else {
            Some(PositionChange {
                symbol: update.symbol.clone(),
                side,
                size: update.size,
                previous_size,
                action: if update.size > previous_size {
                    PositionAction::Opened
                } else {
                    PositionAction::Closed
                },
            })
        };

        if update.is_closed() {
            self.positions.remove(&update.symbol);
        } else {
            self.positions.insert(update.symbol.clone(), update);
        }

        change
    }

    /// Does this execution shrink the master's exposure?
    pub fn reduces_exposure(&self, execution: &MasterExecution) -> bool {
        if execution.closed_size > Decimal::ZERO {
            return true;
        }
        self.positions
            .get(&execution.symbol)
            .map(|p| p.side != execution.side && !p.is_closed())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn position(symbol: &str, side: Side, size: Decimal) -> Position {
        Position {
            symbol: symbol.to_string(),
            side,
            size,
            entry_price: dec!(100),
            mark_price: dec!(100),
        }
    }

    fn execution(symbol: &str, side: Side, closed: Decimal) -> MasterExecution {
        MasterExecution {
            exec_id: "e1".to_string(),
            order_id: "o1".to_string(),
            symbol: symbol.to_string(),
            side,
            exec_qty: dec!(1),
            exec_price: dec!(100),
            closed_size: closed,
            exec_time: Utc::now(),
        }
    }

    #[test]
    fn test_book_tracks_open_and_close() {
        let mut book = MasterPositionBook::new();

        let change = book.apply(position("BTCUSDT", Side::Buy, dec!(2))).unwrap();
        assert_eq!(change.action, PositionAction::Opened);
        assert_eq!(change.previous_size, dec!(0));
        assert_eq!(book.len(), 1);

        let change = book.apply(position("BTCUSDT", Side::Buy, dec!(0))).unwrap();
        assert_eq!(change.action, PositionAction::Closed);
        assert_eq!(change.previous_size, dec!(2));
        assert_eq!(book.len(), 0);

        // Unchanged size produces no change
        book.apply(position("ETHUSDT", Side::Sell, dec!(3)));
        assert!(book.apply(position("ETHUSDT", Side::Sell, dec!(3))).is_none());
    }

    #[test]
    fn test_reduces_exposure() {
        let mut book = MasterPositionBook::new();
        book.apply(position("BTCUSDT", Side::Buy, dec!(1)));

        assert!(book.reduces_exposure(&execution("BTCUSDT", Side::Sell, dec!(0))));
        assert!(!book.reduces_exposure(&execution("BTCUSDT", Side::Buy, dec!(0))));
        // Unknown symbol but the exchange says it closed something
        assert!(book.reduces_exposure(&execution("SOLUSDT", Side::Sell, dec!(1))));
        assert!(!book.reduces_exposure(&execution("SOLUSDT", Side::Sell, dec!(0))));
    }
}
