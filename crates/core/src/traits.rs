use crate::models::*;
use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Terminal Trait
// ---------------------------------------------------------------------------

/// Errors that can occur while talking to the trading terminal.
#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Symbol not available: {0}")]
    SymbolUnavailable(String),
    #[error("No quote for symbol: {0}")]
    NoQuote(String),
    #[error("Trade request rejected: retcode={retcode}, {message}")]
    Rejected { retcode: u32, message: String },
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Terminal error: {0}")]
    Other(String),
}

/// A trading terminal the mirror engine polls and trades through.
///
/// Implemented by the live MT5 bridge adapter and by the simulated
/// terminal used in tests and dry runs.
#[async_trait]
pub trait Terminal: Send + Sync {
    /// Connect to the terminal.
    async fn connect(&mut self) -> Result<(), TerminalError>;

    /// Disconnect from the terminal.
    async fn disconnect(&mut self) -> Result<(), TerminalError>;

    /// Check if connected.
    fn is_connected(&self) -> bool;

    /// All currently open positions.
    async fn positions(&mut self) -> Result<Vec<PositionSnapshot>, TerminalError>;

    /// Open positions on one symbol.
    async fn positions_for(&mut self, symbol: &str)
        -> Result<Vec<PositionSnapshot>, TerminalError>;

    /// Trading properties of a symbol.
    async fn symbol_info(&mut self, symbol: &str) -> Result<SymbolInfo, TerminalError>;

    /// Make sure the symbol is selected in Market Watch so it can be
    /// quoted and traded.
    async fn ensure_symbol(&mut self, symbol: &str) -> Result<(), TerminalError>;

    /// Latest bid/ask for a symbol.
    async fn quote(&mut self, symbol: &str) -> Result<Quote, TerminalError>;

    /// Submit a market deal.
    async fn market_order(&mut self, req: MarketOrderRequest)
        -> Result<OrderReceipt, TerminalError>;

    /// Close an open position by ticket.
    async fn close_position(&mut self, req: CloseRequest) -> Result<OrderReceipt, TerminalError>;

    /// Replace SL/TP on an open position.
    async fn modify_sltp(&mut self, req: SltpRequest) -> Result<OrderReceipt, TerminalError>;
}
