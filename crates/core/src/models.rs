use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

/// Direction of a position or order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// A single open position as reported by the terminal.
///
/// `sl`/`tp` are `None` when the level is unset (the terminal reports 0.0
/// on the wire for unset levels; adapters translate that to `None`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// Terminal-assigned position ticket.
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    /// Volume in lots.
    pub volume: Decimal,
    pub open_price: Decimal,
    pub sl: Option<Decimal>,
    pub tp: Option<Decimal>,
    /// Expert advisor magic number attached to the position.
    pub magic: i64,
    pub comment: String,
    pub opened_at: DateTime<Utc>,
    /// Floating profit in account currency.
    pub profit: Decimal,
}

// ---------------------------------------------------------------------------
// Symbols & Quotes
// ---------------------------------------------------------------------------

/// Trading properties of a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    /// Number of decimal digits in quoted prices.
    pub digits: u32,
    /// Smallest price increment (10^-digits).
    pub point: Decimal,
    pub volume_min: Decimal,
    pub volume_max: Decimal,
    /// Lot granularity accepted by the broker.
    pub volume_step: Decimal,
    /// Whether the symbol is selected in Market Watch.
    pub visible: bool,
}

impl SymbolInfo {
    /// Round a price to the symbol's quote precision.
    pub fn normalize_price(&self, price: Decimal) -> Decimal {
        price.round_dp_with_strategy(self.digits, RoundingStrategy::MidpointAwayFromZero)
    }

    /// Snap a volume down to the symbol's lot step and clamp it into the
    /// broker's allowed range.
    pub fn normalize_volume(&self, volume: Decimal) -> Decimal {
        let stepped = if self.volume_step.is_zero() {
            volume
        } else {
            (volume / self.volume_step).floor() * self.volume_step
        };
        stepped.clamp(self.volume_min, self.volume_max)
    }
}

/// Latest bid/ask for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub time: DateTime<Utc>,
}

impl Quote {
    /// Market entry price for the given side: buys lift the ask, sells hit
    /// the bid.
    pub fn entry_price(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.ask,
            Side::Sell => self.bid,
        }
    }
}

// ---------------------------------------------------------------------------
// Trade requests
// ---------------------------------------------------------------------------

/// A market deal request. Filled FOK, good-till-cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketOrderRequest {
    /// Client-side id for log correlation; the terminal assigns its own
    /// tickets.
    pub client_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub sl: Option<Decimal>,
    pub tp: Option<Decimal>,
    /// Max accepted slippage, in points.
    pub deviation_points: u32,
    pub magic: i64,
    pub comment: String,
}

impl MarketOrderRequest {
    pub fn new(symbol: &str, side: Side, volume: Decimal) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            volume,
            sl: None,
            tp: None,
            deviation_points: 0,
            magic: 0,
            comment: String::new(),
        }
    }
}

/// Close an open position by ticket (the terminal executes the opposite
/// side against the position id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseRequest {
    pub ticket: u64,
    pub symbol: String,
    /// Side of the position being closed.
    pub side: Side,
    pub volume: Decimal,
    pub deviation_points: u32,
    pub magic: i64,
    pub comment: String,
}

/// Replace the SL/TP levels on an open position. `None` clears the level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SltpRequest {
    pub ticket: u64,
    pub symbol: String,
    pub sl: Option<Decimal>,
    pub tp: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// Trade results
// ---------------------------------------------------------------------------

/// MT5 trade server return codes we act on.
pub mod retcode {
    pub const DONE: u32 = 10009;
    pub const DONE_PARTIAL: u32 = 10010;
    pub const REQUOTE: u32 = 10004;
    pub const REJECT: u32 = 10006;
    pub const INVALID_VOLUME: u32 = 10014;
    pub const NO_MONEY: u32 = 10019;
}

/// Terminal answer to a trade request.
///
/// `order` and `deal` are the tickets assigned to the order and the deal;
/// the resulting *position* ticket is not part of the answer and has to be
/// recovered by scanning positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub retcode: u32,
    pub order: u64,
    pub deal: u64,
    pub price: Option<Decimal>,
    pub comment: String,
}

impl OrderReceipt {
    pub fn is_done(&self) -> bool {
        self.retcode == retcode::DONE || self.retcode == retcode::DONE_PARTIAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn eurusd() -> SymbolInfo {
        SymbolInfo {
            symbol: "EURUSD".to_string(),
            digits: 5,
            point: dec!(0.00001),
            volume_min: dec!(0.01),
            volume_max: dec!(100),
            volume_step: dec!(0.01),
            visible: true,
        }
    }

    #[test]
    fn test_normalize_price_rounds_to_digits() {
        let info = eurusd();
        assert_eq!(info.normalize_price(dec!(1.234567)), dec!(1.23457));
        assert_eq!(info.normalize_price(dec!(1.2)), dec!(1.2));
    }

    #[test]
    fn test_normalize_volume_snaps_and_clamps() {
        let info = eurusd();
        assert_eq!(info.normalize_volume(dec!(0.119)), dec!(0.11));
        assert_eq!(info.normalize_volume(dec!(0.005)), dec!(0.01));
        assert_eq!(info.normalize_volume(dec!(250)), dec!(100));
    }

    #[test]
    fn test_entry_price_by_side() {
        let quote = Quote {
            symbol: "EURUSD".to_string(),
            bid: dec!(1.10000),
            ask: dec!(1.10012),
            time: Utc::now(),
        };
        assert_eq!(quote.entry_price(Side::Buy), dec!(1.10012));
        assert_eq!(quote.entry_price(Side::Sell), dec!(1.10000));
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_receipt_done() {
        let receipt = OrderReceipt {
            retcode: retcode::DONE,
            order: 1,
            deal: 2,
            price: Some(dec!(1.1)),
            comment: "done".to_string(),
        };
        assert!(receipt.is_done());

        let rejected = OrderReceipt {
            retcode: retcode::REJECT,
            ..receipt
        };
        assert!(!rejected.is_done());
    }
}
