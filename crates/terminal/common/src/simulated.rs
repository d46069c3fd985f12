use async_trait::async_trait;
use chrono::Utc;
use revbot_core::*;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};

/// An in-memory terminal for engine tests and dry runs.
///
/// Positions live in a ticket-keyed book. Position tickets and order
/// tickets come from separate ranges so callers cannot shortcut the
/// link-by-comment step the live terminal forces on them.
pub struct SimulatedTerminal {
    connected: bool,
    next_position_ticket: u64,
    next_order_ticket: u64,
    next_deal_ticket: u64,
    positions: BTreeMap<u64, PositionSnapshot>,
    symbols: HashMap<String, SymbolInfo>,
    quotes: HashMap<String, Quote>,
    /// When set, the next trade request answers with this retcode instead
    /// of executing.
    scripted_reject: Option<(u32, String)>,
}

impl Default for SimulatedTerminal {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTerminal {
    pub fn new() -> Self {
        Self {
            connected: false,
            next_position_ticket: 1_000,
            next_order_ticket: 900_000,
            next_deal_ticket: 500_000,
            positions: BTreeMap::new(),
            symbols: HashMap::new(),
            quotes: HashMap::new(),
            scripted_reject: None,
        }
    }

    /// Register a symbol with its trading properties.
    pub fn add_symbol(&mut self, info: SymbolInfo) {
        self.symbols.insert(info.symbol.clone(), info);
    }

    /// Set the current bid/ask for a symbol.
    pub fn set_quote(&mut self, symbol: &str, bid: Decimal, ask: Decimal) {
        self.quotes.insert(
            symbol.to_string(),
            Quote {
                symbol: symbol.to_string(),
                bid,
                ask,
                time: Utc::now(),
            },
        );
    }

    /// Open a position as if a trader had done it in the terminal.
    /// Returns the position ticket.
    pub fn open_original(
        &mut self,
        symbol: &str,
        side: Side,
        volume: Decimal,
        sl: Option<Decimal>,
        tp: Option<Decimal>,
    ) -> u64 {
        let ticket = self.next_position_ticket;
        self.next_position_ticket += 1;
        let open_price = self
            .quotes
            .get(symbol)
            .map(|q| q.entry_price(side))
            .unwrap_or(Decimal::ZERO);
        self.positions.insert(
            ticket,
            PositionSnapshot {
                ticket,
                symbol: symbol.to_string(),
                side,
                volume,
                open_price,
                sl,
                tp,
                magic: 0,
                comment: String::new(),
                opened_at: Utc::now(),
                profit: Decimal::ZERO,
            },
        );
        ticket
    }

    /// Remove a position as if it was closed in the terminal (manually or
    /// by SL/TP).
    pub fn remove_position(&mut self, ticket: u64) -> bool {
        self.positions.remove(&ticket).is_some()
    }

    /// Change SL/TP on a position as if the trader modified it.
    pub fn set_position_sltp(&mut self, ticket: u64, sl: Option<Decimal>, tp: Option<Decimal>) {
        if let Some(pos) = self.positions.get_mut(&ticket) {
            pos.sl = sl;
            pos.tp = tp;
        }
    }

    /// Answer the next trade request with the given retcode.
    pub fn reject_next_trade(&mut self, retcode: u32, message: &str) {
        self.scripted_reject = Some((retcode, message.to_string()));
    }

    pub fn position(&self, ticket: u64) -> Option<&PositionSnapshot> {
        self.positions.get(&ticket)
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    fn next_receipt(&mut self) -> OrderReceipt {
        let order = self.next_order_ticket;
        let deal = self.next_deal_ticket;
        self.next_order_ticket += 1;
        self.next_deal_ticket += 1;
        OrderReceipt {
            retcode: retcode::DONE,
            order,
            deal,
            price: None,
            comment: "done".to_string(),
        }
    }

    fn take_scripted_reject(&mut self) -> Option<OrderReceipt> {
        self.scripted_reject.take().map(|(rc, msg)| OrderReceipt {
            retcode: rc,
            order: 0,
            deal: 0,
            price: None,
            comment: msg,
        })
    }
}

#[async_trait]
impl Terminal for SimulatedTerminal {
    async fn connect(&mut self) -> Result<(), TerminalError> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TerminalError> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn positions(&mut self) -> Result<Vec<PositionSnapshot>, TerminalError> {
        Ok(self.positions.values().cloned().collect())
    }

    async fn positions_for(
        &mut self,
        symbol: &str,
    ) -> Result<Vec<PositionSnapshot>, TerminalError> {
        Ok(self
            .positions
            .values()
            .filter(|p| p.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn symbol_info(&mut self, symbol: &str) -> Result<SymbolInfo, TerminalError> {
        self.symbols
            .get(symbol)
            .cloned()
            .ok_or_else(|| TerminalError::SymbolUnavailable(symbol.to_string()))
    }

    async fn ensure_symbol(&mut self, symbol: &str) -> Result<(), TerminalError> {
        match self.symbols.get_mut(symbol) {
            Some(info) => {
                info.visible = true;
                Ok(())
            }
            None => Err(TerminalError::SymbolUnavailable(symbol.to_string())),
        }
    }

    async fn quote(&mut self, symbol: &str) -> Result<Quote, TerminalError> {
        self.quotes
            .get(symbol)
            .cloned()
            .ok_or_else(|| TerminalError::NoQuote(symbol.to_string()))
    }

    async fn market_order(
        &mut self,
        req: MarketOrderRequest,
    ) -> Result<OrderReceipt, TerminalError> {
        if let Some(receipt) = self.take_scripted_reject() {
            return Ok(receipt);
        }
        let info = self.symbol_info(&req.symbol).await?;
        if req.volume < info.volume_min || req.volume > info.volume_max {
            return Ok(OrderReceipt {
                retcode: retcode::INVALID_VOLUME,
                order: 0,
                deal: 0,
                price: None,
                comment: format!("invalid volume {}", req.volume),
            });
        }
        let quote = self.quote(&req.symbol).await?;
        let fill_price = quote.entry_price(req.side);

        let ticket = self.next_position_ticket;
        self.next_position_ticket += 1;
        self.positions.insert(
            ticket,
            PositionSnapshot {
                ticket,
                symbol: req.symbol.clone(),
                side: req.side,
                volume: req.volume,
                open_price: fill_price,
                sl: req.sl,
                tp: req.tp,
                magic: req.magic,
                comment: req.comment.clone(),
                opened_at: Utc::now(),
                profit: Decimal::ZERO,
            },
        );

        let mut receipt = self.next_receipt();
        receipt.price = Some(fill_price);
        Ok(receipt)
    }

    async fn close_position(&mut self, req: CloseRequest) -> Result<OrderReceipt, TerminalError> {
        if let Some(receipt) = self.take_scripted_reject() {
            return Ok(receipt);
        }
        if self.positions.remove(&req.ticket).is_none() {
            return Ok(OrderReceipt {
                retcode: retcode::REJECT,
                order: 0,
                deal: 0,
                price: None,
                comment: format!("position #{} not found", req.ticket),
            });
        }
        Ok(self.next_receipt())
    }

    async fn modify_sltp(&mut self, req: SltpRequest) -> Result<OrderReceipt, TerminalError> {
        if let Some(receipt) = self.take_scripted_reject() {
            return Ok(receipt);
        }
        match self.positions.get_mut(&req.ticket) {
            Some(pos) => {
                pos.sl = req.sl;
                pos.tp = req.tp;
                Ok(self.next_receipt())
            }
            None => Ok(OrderReceipt {
                retcode: retcode::REJECT,
                order: 0,
                deal: 0,
                price: None,
                comment: format!("position #{} not found", req.ticket),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn terminal_with_eurusd() -> SimulatedTerminal {
        let mut term = SimulatedTerminal::new();
        term.add_symbol(SymbolInfo {
            symbol: "EURUSD".to_string(),
            digits: 5,
            point: dec!(0.00001),
            volume_min: dec!(0.01),
            volume_max: dec!(100),
            volume_step: dec!(0.01),
            visible: true,
        });
        term.set_quote("EURUSD", dec!(1.10000), dec!(1.10012));
        term
    }

    #[tokio::test]
    async fn test_market_order_opens_position() {
        let mut term = terminal_with_eurusd();
        let mut req = MarketOrderRequest::new("EURUSD", Side::Sell, dec!(0.2));
        req.magic = 42;
        req.comment = "tagged".to_string();

        let receipt = term.market_order(req).await.unwrap();
        assert!(receipt.is_done());
        assert_eq!(receipt.price, Some(dec!(1.10000)));

        let positions = term.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].magic, 42);
        assert_eq!(positions[0].comment, "tagged");
        // The receipt's order ticket never doubles as the position ticket.
        assert_ne!(positions[0].ticket, receipt.order);
    }

    #[tokio::test]
    async fn test_volume_outside_limits_rejected() {
        let mut term = terminal_with_eurusd();
        let req = MarketOrderRequest::new("EURUSD", Side::Buy, dec!(500));
        let receipt = term.market_order(req).await.unwrap();
        assert_eq!(receipt.retcode, retcode::INVALID_VOLUME);
        assert_eq!(term.open_position_count(), 0);
    }

    #[tokio::test]
    async fn test_close_unknown_ticket_rejected() {
        let mut term = terminal_with_eurusd();
        let receipt = term
            .close_position(CloseRequest {
                ticket: 99,
                symbol: "EURUSD".to_string(),
                side: Side::Buy,
                volume: dec!(0.1),
                deviation_points: 20,
                magic: 42,
                comment: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(receipt.retcode, retcode::REJECT);
    }

    #[tokio::test]
    async fn test_scripted_reject_consumed_once() {
        let mut term = terminal_with_eurusd();
        term.reject_next_trade(retcode::NO_MONEY, "not enough money");

        let req = MarketOrderRequest::new("EURUSD", Side::Buy, dec!(0.1));
        let first = term.market_order(req.clone()).await.unwrap();
        assert_eq!(first.retcode, retcode::NO_MONEY);

        let second = term.market_order(req).await.unwrap();
        assert!(second.is_done());
    }
}
