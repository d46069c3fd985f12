use chrono::{DateTime, Utc};
use revbot_core::{PositionSnapshot, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Messages sent from the bot TO the bridge EA.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    /// Request open positions, optionally filtered by symbol.
    #[serde(rename = "positions_request")]
    PositionsRequest { symbol: Option<String> },
    /// Request a symbol's trading properties.
    #[serde(rename = "symbol_info_request")]
    SymbolInfoRequest { symbol: String },
    /// Select a symbol into Market Watch.
    #[serde(rename = "symbol_select")]
    SymbolSelect { symbol: String },
    /// Request the latest bid/ask.
    #[serde(rename = "quote_request")]
    QuoteRequest { symbol: String },
    /// Submit a market deal. FOK filling, good-till-cancelled.
    #[serde(rename = "market_order")]
    MarketOrder {
        client_id: String,
        symbol: String,
        side: Side,
        volume: Decimal,
        price: Decimal,
        /// 0.0 means no level.
        sl: Decimal,
        tp: Decimal,
        deviation: u32,
        magic: i64,
        comment: String,
    },
    /// Close a position by ticket with an opposite-side deal.
    #[serde(rename = "close_position")]
    ClosePosition {
        ticket: u64,
        symbol: String,
        side: Side,
        volume: Decimal,
        price: Decimal,
        deviation: u32,
        magic: i64,
        comment: String,
    },
    /// Replace a position's SL/TP. 0.0 clears a level.
    #[serde(rename = "modify_sltp")]
    ModifySltp {
        ticket: u64,
        symbol: String,
        sl: Decimal,
        tp: Decimal,
    },
    /// Heartbeat.
    #[serde(rename = "heartbeat")]
    Heartbeat { timestamp: DateTime<Utc> },
}

/// Messages received FROM the bridge EA.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    /// Connection established.
    #[serde(rename = "connected")]
    Connected { version: String },
    /// Open positions snapshot.
    #[serde(rename = "positions")]
    Positions { positions: Vec<WirePosition> },
    /// Symbol trading properties.
    #[serde(rename = "symbol_info")]
    SymbolInfo {
        symbol: String,
        digits: u32,
        point: Decimal,
        volume_min: Decimal,
        volume_max: Decimal,
        volume_step: Decimal,
        visible: bool,
    },
    /// Latest bid/ask.
    #[serde(rename = "quote")]
    Quote {
        symbol: String,
        bid: Decimal,
        ask: Decimal,
        time: DateTime<Utc>,
    },
    /// Trade server answer to a deal/modify request.
    #[serde(rename = "trade_result")]
    TradeResult {
        retcode: u32,
        order: u64,
        deal: u64,
        price: Option<Decimal>,
        comment: String,
    },
    /// Plain acknowledgement (symbol select, heartbeat).
    #[serde(rename = "ack")]
    Ack,
    /// Error message.
    #[serde(rename = "error")]
    Error { message: String },
}

/// A position as the EA reports it. SL/TP come through as 0.0 when unset,
/// matching the terminal's own convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirePosition {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub sl: Decimal,
    pub tp: Decimal,
    pub magic: i64,
    pub comment: String,
    pub open_time: DateTime<Utc>,
    pub profit: Decimal,
}

impl From<WirePosition> for PositionSnapshot {
    fn from(wire: WirePosition) -> Self {
        let level = |v: Decimal| if v > Decimal::ZERO { Some(v) } else { None };
        PositionSnapshot {
            ticket: wire.ticket,
            symbol: wire.symbol,
            side: wire.side,
            volume: wire.volume,
            open_price: wire.open_price,
            sl: level(wire.sl),
            tp: level(wire.tp),
            magic: wire.magic,
            comment: wire.comment,
            opened_at: wire.open_time,
            profit: wire.profit,
        }
    }
}

/// Frame a message with a 4-byte length prefix (big-endian).
pub fn frame_message(msg: &[u8]) -> Vec<u8> {
    let len = msg.len() as u32;
    let mut framed = Vec::with_capacity(4 + msg.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(msg);
    framed
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_frame_message_prefix() {
        let framed = frame_message(b"hello");
        assert_eq!(&framed[..4], &5u32.to_be_bytes());
        assert_eq!(&framed[4..], b"hello");
    }

    #[test]
    fn test_message_tags() {
        let msg = OutboundMessage::PositionsRequest { symbol: None };
        let json: serde_json::Value = serde_json::from_slice(
            &serde_json::to_vec(&msg).unwrap(),
        )
        .unwrap();
        assert_eq!(json["type"], "positions_request");

        let msg = OutboundMessage::Heartbeat {
            timestamp: Utc::now(),
        };
        let json: serde_json::Value =
            serde_json::from_slice(&serde_json::to_vec(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "heartbeat");
    }

    #[test]
    fn test_wire_position_zero_levels_become_unset() {
        let wire = WirePosition {
            ticket: 7,
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            volume: dec!(0.1),
            open_price: dec!(1.1),
            sl: Decimal::ZERO,
            tp: dec!(1.2),
            magic: 0,
            comment: String::new(),
            open_time: Utc::now(),
            profit: Decimal::ZERO,
        };
        let snapshot = PositionSnapshot::from(wire);
        assert_eq!(snapshot.sl, None);
        assert_eq!(snapshot.tp, Some(dec!(1.2)));
    }
}
