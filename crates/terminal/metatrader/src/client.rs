use async_trait::async_trait;
use chrono::Utc;
use revbot_core::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::info;

use crate::protocol::*;

/// Configuration for connecting to the MetaTrader 5 bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaTraderConfig {
    /// Host address (e.g. "127.0.0.1").
    pub host: String,
    /// Port the MT5 bridge EA is listening on.
    pub port: u16,
    /// Reconnect interval in seconds.
    pub reconnect_interval_secs: u64,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
}

impl Default for MetaTraderConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5557,
            reconnect_interval_secs: 5,
            heartbeat_interval_secs: 10,
        }
    }
}

/// MetaTrader 5 terminal adapter.
///
/// Talks to an MQL5 bridge EA running inside the terminal over a TCP
/// socket, with length-prefixed JSON messages in strict request/response
/// order.
pub struct MetaTraderTerminal {
    config: MetaTraderConfig,
    stream: Option<TcpStream>,
    connected: bool,
}

impl MetaTraderTerminal {
    pub fn new(config: MetaTraderConfig) -> Self {
        Self {
            config,
            stream: None,
            connected: false,
        }
    }

    /// Send a message to the bridge.
    async fn send(&mut self, msg: &OutboundMessage) -> Result<(), TerminalError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TerminalError::ConnectionFailed("Not connected".to_string()))?;

        let json = serde_json::to_vec(msg)
            .map_err(|e| TerminalError::Protocol(format!("Serialization error: {}", e)))?;
        let framed = frame_message(&json);

        stream
            .write_all(&framed)
            .await
            .map_err(|e| TerminalError::ConnectionFailed(format!("Write error: {}", e)))?;

        Ok(())
    }

    /// Read a single framed message from the bridge.
    async fn recv(&mut self) -> Result<InboundMessage, TerminalError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TerminalError::ConnectionFailed("Not connected".to_string()))?;

        // 4-byte length prefix, then the body
        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| TerminalError::ConnectionFailed(format!("Read error: {}", e)))?;
        let len = u32::from_be_bytes(len_buf) as usize;

        let mut body = vec![0u8; len];
        stream
            .read_exact(&mut body)
            .await
            .map_err(|e| TerminalError::ConnectionFailed(format!("Read error: {}", e)))?;

        let msg: InboundMessage = serde_json::from_slice(&body)
            .map_err(|e| TerminalError::Protocol(format!("Deserialization error: {}", e)))?;

        Ok(msg)
    }

    /// Send a request and read its answer, surfacing bridge errors.
    async fn request(&mut self, msg: &OutboundMessage) -> Result<InboundMessage, TerminalError> {
        self.send(msg).await?;
        match self.recv().await? {
            InboundMessage::Error { message } => Err(TerminalError::Other(message)),
            answer => Ok(answer),
        }
    }

    fn trade_receipt(answer: InboundMessage) -> Result<OrderReceipt, TerminalError> {
        match answer {
            InboundMessage::TradeResult {
                retcode,
                order,
                deal,
                price,
                comment,
            } => Ok(OrderReceipt {
                retcode,
                order,
                deal,
                price,
                comment,
            }),
            other => Err(TerminalError::Protocol(format!(
                "Expected trade_result, got {:?}",
                other
            ))),
        }
    }

    /// Ping the bridge. Used by the health check.
    pub async fn heartbeat(&mut self) -> Result<(), TerminalError> {
        let answer = self
            .request(&OutboundMessage::Heartbeat {
                timestamp: Utc::now(),
            })
            .await?;
        match answer {
            InboundMessage::Ack => Ok(()),
            other => Err(TerminalError::Protocol(format!(
                "Expected ack, got {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
impl Terminal for MetaTraderTerminal {
    async fn connect(&mut self) -> Result<(), TerminalError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("Connecting to MetaTrader bridge at {}", addr);

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| TerminalError::ConnectionFailed(format!("TCP connect failed: {}", e)))?;

        self.stream = Some(stream);

        // The bridge greets with a connected message
        match self.recv().await? {
            InboundMessage::Connected { version } => {
                info!("Connected to MetaTrader bridge v{}", version);
                self.connected = true;
                Ok(())
            }
            InboundMessage::Error { message } => Err(TerminalError::ConnectionFailed(message)),
            _ => Err(TerminalError::ConnectionFailed(
                "Unexpected initial message".to_string(),
            )),
        }
    }

    async fn disconnect(&mut self) -> Result<(), TerminalError> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.connected = false;
        info!("Disconnected from MetaTrader bridge");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn positions(&mut self) -> Result<Vec<PositionSnapshot>, TerminalError> {
        let answer = self
            .request(&OutboundMessage::PositionsRequest { symbol: None })
            .await?;
        match answer {
            InboundMessage::Positions { positions } => {
                Ok(positions.into_iter().map(Into::into).collect())
            }
            other => Err(TerminalError::Protocol(format!(
                "Expected positions, got {:?}",
                other
            ))),
        }
    }

    async fn positions_for(
        &mut self,
        symbol: &str,
    ) -> Result<Vec<PositionSnapshot>, TerminalError> {
        let answer = self
            .request(&OutboundMessage::PositionsRequest {
                symbol: Some(symbol.to_string()),
            })
            .await?;
        match answer {
            InboundMessage::Positions { positions } => {
                Ok(positions.into_iter().map(Into::into).collect())
            }
            other => Err(TerminalError::Protocol(format!(
                "Expected positions, got {:?}",
                other
            ))),
        }
    }

    async fn symbol_info(&mut self, symbol: &str) -> Result<SymbolInfo, TerminalError> {
        let answer = self
            .request(&OutboundMessage::SymbolInfoRequest {
                symbol: symbol.to_string(),
            })
            .await?;
        match answer {
            InboundMessage::SymbolInfo {
                symbol,
                digits,
                point,
                volume_min,
                volume_max,
                volume_step,
                visible,
            } => Ok(SymbolInfo {
                symbol,
                digits,
                point,
                volume_min,
                volume_max,
                volume_step,
                visible,
            }),
            other => Err(TerminalError::Protocol(format!(
                "Expected symbol_info, got {:?}",
                other
            ))),
        }
    }

    async fn ensure_symbol(&mut self, symbol: &str) -> Result<(), TerminalError> {
        let info = self
            .symbol_info(symbol)
            .await
            .map_err(|_| TerminalError::SymbolUnavailable(symbol.to_string()))?;
        if info.visible {
            return Ok(());
        }
        let answer = self
            .request(&OutboundMessage::SymbolSelect {
                symbol: symbol.to_string(),
            })
            .await
            .map_err(|_| TerminalError::SymbolUnavailable(symbol.to_string()))?;
        match answer {
            InboundMessage::Ack => Ok(()),
            _ => Err(TerminalError::SymbolUnavailable(symbol.to_string())),
        }
    }

    async fn quote(&mut self, symbol: &str) -> Result<Quote, TerminalError> {
        let answer = self
            .request(&OutboundMessage::QuoteRequest {
                symbol: symbol.to_string(),
            })
            .await?;
        match answer {
            InboundMessage::Quote {
                symbol,
                bid,
                ask,
                time,
            } => Ok(Quote {
                symbol,
                bid,
                ask,
                time,
            }),
            other => Err(TerminalError::Protocol(format!(
                "Expected quote, got {:?}",
                other
            ))),
        }
    }

    async fn market_order(
        &mut self,
        req: MarketOrderRequest,
    ) -> Result<OrderReceipt, TerminalError> {
        // Market deals still need an entry price: buys at ask, sells at bid.
        let quote = self.quote(&req.symbol).await?;
        let price = quote.entry_price(req.side);

        let answer = self
            .request(&OutboundMessage::MarketOrder {
                client_id: req.client_id.to_string(),
                symbol: req.symbol,
                side: req.side,
                volume: req.volume,
                price,
                sl: req.sl.unwrap_or(Decimal::ZERO),
                tp: req.tp.unwrap_or(Decimal::ZERO),
                deviation: req.deviation_points,
                magic: req.magic,
                comment: req.comment,
            })
            .await?;
        Self::trade_receipt(answer)
    }

    async fn close_position(&mut self, req: CloseRequest) -> Result<OrderReceipt, TerminalError> {
        let close_side = req.side.opposite();
        let quote = self.quote(&req.symbol).await?;
        let price = quote.entry_price(close_side);

        let answer = self
            .request(&OutboundMessage::ClosePosition {
                ticket: req.ticket,
                symbol: req.symbol,
                side: close_side,
                volume: req.volume,
                price,
                deviation: req.deviation_points,
                magic: req.magic,
                comment: req.comment,
            })
            .await?;
        Self::trade_receipt(answer)
    }

    async fn modify_sltp(&mut self, req: SltpRequest) -> Result<OrderReceipt, TerminalError> {
        let answer = self
            .request(&OutboundMessage::ModifySltp {
                ticket: req.ticket,
                symbol: req.symbol,
                sl: req.sl.unwrap_or(Decimal::ZERO),
                tp: req.tp.unwrap_or(Decimal::ZERO),
            })
            .await?;
        Self::trade_receipt(answer)
    }
}
