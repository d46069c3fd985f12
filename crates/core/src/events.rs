use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Events emitted by the mirror engine during a poll cycle.
///
/// The engine returns these instead of logging directly so callers decide
/// how to surface them and tests can assert on exact outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MirrorEvent {
    /// A reverse deal was accepted for an original position.
    ReverseOpened {
        original: u64,
        symbol: String,
        volume: Decimal,
        order: u64,
    },
    /// The reverse position ticket was found and mapped to its original.
    ReverseLinked { original: u64, reverse: u64 },
    /// An existing reverse was re-adopted from its comment after a restart.
    ReverseAdopted { original: u64, reverse: u64 },
    /// The original closed, so its reverse was closed.
    ReverseClosed { original: u64, reverse: u64 },
    /// The reverse disappeared on its own (SL/TP or manual close); the pair
    /// is dropped and never reopened.
    ReverseDetached { original: u64, reverse: u64 },
    /// The reverse's SL/TP were re-sent to follow the original.
    SltpSynced {
        reverse: u64,
        sl: Option<Decimal>,
        tp: Option<Decimal>,
    },
    /// A trade request was rejected by the terminal.
    OrderRejected {
        original: u64,
        retcode: u32,
        message: String,
    },
    /// The symbol of an original could not be selected for trading.
    SymbolUnavailable { original: u64, symbol: String },
}
