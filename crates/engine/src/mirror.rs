use revbot_core::*;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Configuration for the reverse-mirror engine.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Magic number that marks our reverse positions.
    pub magic: i64,
    /// Comment prefix used to tag reverses with their original ticket.
    /// The embedded ticket is what lets the mapping survive restarts.
    pub comment_prefix: String,
    /// Max accepted slippage for market deals, in points.
    pub deviation_points: u32,
    /// Delay between poll cycles.
    pub poll_interval: Duration,
    /// Reverse volume = multiplier x original volume.
    pub volume_multiplier: Decimal,
    /// How many times to rescan for the new reverse position after a deal
    /// is accepted, and how long to wait between scans.
    pub link_attempts: u32,
    pub link_delay: Duration,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            magic: 987_654_321,
            comment_prefix: "REV of ".to_string(),
            deviation_points: 20,
            poll_interval: Duration::from_secs(1),
            volume_multiplier: Decimal::TWO,
            link_attempts: 5,
            link_delay: Duration::from_millis(200),
        }
    }
}

impl MirrorConfig {
    /// Comment tagging a reverse with its original ticket.
    pub fn reverse_comment(&self, original: u64) -> String {
        format!("{}{}", self.comment_prefix, original)
    }

    /// Recover the original ticket from a reverse comment. The ticket must
    /// be the entire remainder after the prefix.
    pub fn parse_origin_ticket(&self, comment: &str) -> Option<u64> {
        let rest = comment.strip_prefix(&self.comment_prefix)?;
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        rest.parse().ok()
    }

    /// Whether a position is one of our reverses (magic and comment both
    /// have to match; magic alone could belong to another expert).
    pub fn is_reverse(&self, pos: &PositionSnapshot) -> bool {
        pos.magic == self.magic && pos.comment.starts_with(&self.comment_prefix)
    }
}

/// SL/TP for the reverse: its SL is the original's TP and its TP is the
/// original's SL. Non-positive levels count as unset.
pub fn desired_reverse_sltp(original: &PositionSnapshot) -> (Option<Decimal>, Option<Decimal>) {
    let keep = |level: Option<Decimal>| level.filter(|v| v > &Decimal::ZERO);
    (keep(original.tp), keep(original.sl))
}

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error(transparent)]
    Terminal(#[from] TerminalError),
}

/// The reverse-mirror engine.
///
/// Keeps a process-local map of original ticket -> reverse ticket plus the
/// set of originals that have ever been reversed. Both are rebuilt from
/// position comments on restart; nothing is persisted.
pub struct MirrorEngine<T: Terminal> {
    config: MirrorConfig,
    terminal: T,
    /// original ticket -> reverse ticket
    pairs: HashMap<u64, u64>,
    /// Originals that were reversed at least once. A ticket in here with no
    /// live pair means its reverse closed on its own; it must not be
    /// reversed again.
    reversed_once: HashSet<u64>,
}

impl<T: Terminal> MirrorEngine<T> {
    pub fn new(terminal: T, config: MirrorConfig) -> Self {
        Self {
            config,
            terminal,
            pairs: HashMap::new(),
            reversed_once: HashSet::new(),
        }
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    /// Tracked original -> reverse pairs.
    pub fn pairs(&self) -> &HashMap<u64, u64> {
        &self.pairs
    }

    pub fn terminal_mut(&mut self) -> &mut T {
        &mut self.terminal
    }

    pub fn into_terminal(self) -> T {
        self.terminal
    }

    /// Poll until the task is dropped. Each tick runs one cycle; a failed
    /// cycle is logged and retried on the next tick.
    pub async fn run(&mut self) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.run_cycle().await {
                Ok(events) => log_events(&events),
                Err(e) => warn!(error = %e, "poll cycle failed"),
            }
        }
    }

    /// One poll iteration: adopt stray reverses, open reverses for new
    /// originals, then close/sync against a fresh snapshot.
    pub async fn run_cycle(&mut self) -> Result<Vec<MirrorEvent>, MirrorError> {
        let mut events = Vec::new();

        let all = self.terminal.positions().await?;
        let (reverses, originals): (Vec<_>, Vec<_>) =
            all.into_iter().partition(|p| self.config.is_reverse(p));

        self.adopt_reverses(&reverses, &mut events);

        for original in &originals {
            if self.pairs.contains_key(&original.ticket)
                || self.reversed_once.contains(&original.ticket)
            {
                continue;
            }
            if let Err(e) = self.open_reverse(original, &mut events).await {
                match e {
                    TerminalError::SymbolUnavailable(symbol) => {
                        events.push(MirrorEvent::SymbolUnavailable {
                            original: original.ticket,
                            symbol,
                        });
                    }
                    TerminalError::Rejected { retcode, message } => {
                        events.push(MirrorEvent::OrderRejected {
                            original: original.ticket,
                            retcode,
                            message,
                        });
                    }
                    other => return Err(other.into()),
                }
            }
        }

        self.close_and_sync(&mut events).await?;

        Ok(events)
    }

    /// Rebuild the pair map from reverse comments. Makes the mapping
    /// restart-safe and picks up reverses whose post-submit link scan
    /// missed.
    fn adopt_reverses(&mut self, reverses: &[PositionSnapshot], events: &mut Vec<MirrorEvent>) {
        for reverse in reverses {
            let Some(original) = self.config.parse_origin_ticket(&reverse.comment) else {
                continue;
            };
            self.reversed_once.insert(original);
            match self.pairs.insert(original, reverse.ticket) {
                Some(prev) if prev == reverse.ticket => {}
                _ => events.push(MirrorEvent::ReverseAdopted {
                    original,
                    reverse: reverse.ticket,
                }),
            }
        }
    }

    /// Open the reverse for one original and try to link its position
    /// ticket. The deal result only carries order/deal tickets, so the
    /// position ticket is recovered by rescanning the symbol.
    async fn open_reverse(
        &mut self,
        original: &PositionSnapshot,
        events: &mut Vec<MirrorEvent>,
    ) -> Result<(), TerminalError> {
        self.terminal.ensure_symbol(&original.symbol).await?;
        let info = self.terminal.symbol_info(&original.symbol).await?;

        let volume = info.normalize_volume(original.volume * self.config.volume_multiplier);
        let (sl, tp) = desired_reverse_sltp(original);

        let mut req = MarketOrderRequest::new(
            &original.symbol,
            original.side.opposite(),
            volume,
        );
        req.sl = sl.map(|v| info.normalize_price(v));
        req.tp = tp.map(|v| info.normalize_price(v));
        req.deviation_points = self.config.deviation_points;
        req.magic = self.config.magic;
        req.comment = self.config.reverse_comment(original.ticket);

        let receipt = self.terminal.market_order(req).await?;
        if !receipt.is_done() {
            events.push(MirrorEvent::OrderRejected {
                original: original.ticket,
                retcode: receipt.retcode,
                message: receipt.comment,
            });
            return Ok(());
        }

        // From here the reverse exists on the broker even if we fail to
        // find its ticket; never open a second one.
        self.reversed_once.insert(original.ticket);
        events.push(MirrorEvent::ReverseOpened {
            original: original.ticket,
            symbol: original.symbol.clone(),
            volume,
            order: receipt.order,
        });

        for attempt in 0..self.config.link_attempts {
            if attempt > 0 || !self.config.link_delay.is_zero() {
                tokio::time::sleep(self.config.link_delay).await;
            }
            let candidates = self.terminal.positions_for(&original.symbol).await?;
            let found = candidates.iter().find(|p| {
                self.config.is_reverse(p)
                    && self.config.parse_origin_ticket(&p.comment) == Some(original.ticket)
            });
            if let Some(reverse) = found {
                self.pairs.insert(original.ticket, reverse.ticket);
                events.push(MirrorEvent::ReverseLinked {
                    original: original.ticket,
                    reverse: reverse.ticket,
                });
                return Ok(());
            }
        }

        // Not fatal: the adopt pass will find it by comment next cycle.
        warn!(
            original = original.ticket,
            symbol = %original.symbol,
            "reverse accepted but position ticket not found yet"
        );
        Ok(())
    }

    /// Walk the tracked pairs against a fresh snapshot: close reverses
    /// whose original is gone, drop pairs whose reverse is gone, and keep
    /// the surviving reverses' SL/TP following their originals.
    async fn close_and_sync(&mut self, events: &mut Vec<MirrorEvent>) -> Result<(), MirrorError> {
        let by_ticket: HashMap<u64, PositionSnapshot> = self
            .terminal
            .positions()
            .await?
            .into_iter()
            .map(|p| (p.ticket, p))
            .collect();

        let mut info_cache: HashMap<String, SymbolInfo> = HashMap::new();
        let tracked: Vec<(u64, u64)> = self.pairs.iter().map(|(&o, &r)| (o, r)).collect();

        for (original, reverse) in tracked {
            match (by_ticket.get(&original), by_ticket.get(&reverse)) {
                (None, Some(rev_pos)) => {
                    // Original closed: close the reverse. On rejection the
                    // pair is kept so the close is retried next cycle.
                    let receipt = self
                        .terminal
                        .close_position(CloseRequest {
                            ticket: rev_pos.ticket,
                            symbol: rev_pos.symbol.clone(),
                            side: rev_pos.side,
                            volume: rev_pos.volume,
                            deviation_points: self.config.deviation_points,
                            magic: self.config.magic,
                            comment: "close reverse (orig closed)".to_string(),
                        })
                        .await?;
                    if receipt.is_done() {
                        self.pairs.remove(&original);
                        events.push(MirrorEvent::ReverseClosed { original, reverse });
                    } else {
                        events.push(MirrorEvent::OrderRejected {
                            original,
                            retcode: receipt.retcode,
                            message: receipt.comment,
                        });
                    }
                }
                (None, None) => {
                    self.pairs.remove(&original);
                }
                (Some(_), None) => {
                    // Reverse closed on its own (SL/TP or manual). One
                    // reverse per trade only: drop the pair, never reopen.
                    self.pairs.remove(&original);
                    events.push(MirrorEvent::ReverseDetached { original, reverse });
                }
                (Some(orig_pos), Some(rev_pos)) => {
                    self.sync_sltp(orig_pos, rev_pos, &mut info_cache, events)
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Re-send the reverse's SL/TP when the original's levels changed.
    /// Levels are normalized to the symbol's precision before comparing so
    /// equal prices don't generate modify spam.
    async fn sync_sltp(
        &mut self,
        original: &PositionSnapshot,
        reverse: &PositionSnapshot,
        info_cache: &mut HashMap<String, SymbolInfo>,
        events: &mut Vec<MirrorEvent>,
    ) -> Result<(), MirrorError> {
        let info = match info_cache.get(&reverse.symbol) {
            Some(info) => info.clone(),
            None => {
                let info = self.terminal.symbol_info(&reverse.symbol).await?;
                info_cache.insert(reverse.symbol.clone(), info.clone());
                info
            }
        };

        let (desired_sl, desired_tp) = desired_reverse_sltp(original);
        let desired_sl = desired_sl.map(|v| info.normalize_price(v));
        let desired_tp = desired_tp.map(|v| info.normalize_price(v));
        let current_sl = reverse.sl.map(|v| info.normalize_price(v));
        let current_tp = reverse.tp.map(|v| info.normalize_price(v));

        if desired_sl == current_sl && desired_tp == current_tp {
            return Ok(());
        }

        let receipt = self
            .terminal
            .modify_sltp(SltpRequest {
                ticket: reverse.ticket,
                symbol: reverse.symbol.clone(),
                sl: desired_sl,
                tp: desired_tp,
            })
            .await?;
        if receipt.is_done() {
            events.push(MirrorEvent::SltpSynced {
                reverse: reverse.ticket,
                sl: desired_sl,
                tp: desired_tp,
            });
        } else {
            events.push(MirrorEvent::OrderRejected {
                original: original.ticket,
                retcode: receipt.retcode,
                message: receipt.comment,
            });
        }
        Ok(())
    }
}

/// Surface a cycle's events through tracing.
pub fn log_events(events: &[MirrorEvent]) {
    for event in events {
        match event {
            MirrorEvent::ReverseOpened {
                original,
                symbol,
                volume,
                order,
            } => info!(original, %symbol, %volume, order, "reverse opened"),
            MirrorEvent::ReverseLinked { original, reverse } => {
                info!(original, reverse, "reverse linked")
            }
            MirrorEvent::ReverseAdopted { original, reverse } => {
                info!(original, reverse, "reverse adopted from comment")
            }
            MirrorEvent::ReverseClosed { original, reverse } => {
                info!(original, reverse, "reverse closed (original closed)")
            }
            MirrorEvent::ReverseDetached { original, reverse } => {
                info!(original, reverse, "reverse closed on its own; not reopening")
            }
            MirrorEvent::SltpSynced { reverse, sl, tp } => {
                info!(reverse, sl = ?sl, tp = ?tp, "reverse sl/tp synced")
            }
            MirrorEvent::OrderRejected {
                original,
                retcode,
                message,
            } => warn!(original, retcode, %message, "trade request rejected"),
            MirrorEvent::SymbolUnavailable { original, symbol } => {
                warn!(original, %symbol, "symbol not available")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revbot_terminal_common::simulated::SimulatedTerminal;
    use rust_decimal_macros::dec;

    fn test_config() -> MirrorConfig {
        MirrorConfig {
            link_attempts: 1,
            link_delay: Duration::ZERO,
            ..MirrorConfig::default()
        }
    }

    fn terminal_with_symbols() -> SimulatedTerminal {
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
        term.add_symbol(SymbolInfo {
            symbol: "XAUUSD".to_string(),
            digits: 2,
            point: dec!(0.01),
            volume_min: dec!(0.01),
            volume_max: dec!(50),
            volume_step: dec!(0.01),
            visible: true,
        });
        term.set_quote("XAUUSD", dec!(2650.00), dec!(2650.50));
        term
    }

    fn engine() -> MirrorEngine<SimulatedTerminal> {
        MirrorEngine::new(terminal_with_symbols(), test_config())
    }

    fn reverse_of(
        engine: &mut MirrorEngine<SimulatedTerminal>,
        original: u64,
    ) -> PositionSnapshot {
        let reverse = *engine.pairs().get(&original).expect("pair tracked");
        engine
            .terminal_mut()
            .position(reverse)
            .expect("reverse open")
            .clone()
    }

    #[tokio::test]
    async fn test_reverse_opened_with_swapped_sltp_and_doubled_volume() {
        let mut engine = engine();
        let original = engine.terminal_mut().open_original(
            "EURUSD",
            Side::Buy,
            dec!(0.10),
            Some(dec!(1.09500)),
            Some(dec!(1.10500)),
        );

        let events = engine.run_cycle().await.unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, MirrorEvent::ReverseLinked { .. })));

        let reverse = reverse_of(&mut engine, original);
        assert_eq!(reverse.side, Side::Sell);
        assert_eq!(reverse.volume, dec!(0.20));
        // Reverse SL = original TP, reverse TP = original SL.
        assert_eq!(reverse.sl, Some(dec!(1.10500)));
        assert_eq!(reverse.tp, Some(dec!(1.09500)));
        assert_eq!(reverse.magic, engine.config().magic);
        assert_eq!(reverse.comment, format!("REV of {}", original));
    }

    #[tokio::test]
    async fn test_exactly_one_reverse_per_original() {
        let mut engine = engine();
        engine
            .terminal_mut()
            .open_original("EURUSD", Side::Buy, dec!(0.10), None, None);

        engine.run_cycle().await.unwrap();
        assert_eq!(engine.terminal_mut().open_position_count(), 2);

        // Further cycles must not open anything else.
        engine.run_cycle().await.unwrap();
        engine.run_cycle().await.unwrap();
        assert_eq!(engine.terminal_mut().open_position_count(), 2);
        assert_eq!(engine.pairs().len(), 1);
    }

    #[tokio::test]
    async fn test_reverse_closed_when_original_closes() {
        let mut engine = engine();
        let original =
            engine
                .terminal_mut()
                .open_original("XAUUSD", Side::Sell, dec!(0.05), None, None);

        engine.run_cycle().await.unwrap();
        let reverse = *engine.pairs().get(&original).unwrap();

        engine.terminal_mut().remove_position(original);
        let events = engine.run_cycle().await.unwrap();

        assert!(events.iter().any(|e| matches!(
            e,
            MirrorEvent::ReverseClosed { original: o, reverse: r } if *o == original && *r == reverse
        )));
        assert!(engine.terminal_mut().position(reverse).is_none());
        assert!(engine.pairs().is_empty());
    }

    #[tokio::test]
    async fn test_no_reopen_after_reverse_closes_on_its_own() {
        let mut engine = engine();
        let original =
            engine
                .terminal_mut()
                .open_original("EURUSD", Side::Buy, dec!(0.10), None, None);

        engine.run_cycle().await.unwrap();
        let reverse = *engine.pairs().get(&original).unwrap();

        // Reverse hit its SL (or was closed by hand).
        engine.terminal_mut().remove_position(reverse);
        let events = engine.run_cycle().await.unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, MirrorEvent::ReverseDetached { .. })));

        // Original is still open but must not be reversed again.
        engine.run_cycle().await.unwrap();
        assert_eq!(engine.terminal_mut().open_position_count(), 1);
        assert!(engine.pairs().is_empty());
    }

    #[tokio::test]
    async fn test_sltp_modification_propagates() {
        let mut engine = engine();
        let original = engine.terminal_mut().open_original(
            "EURUSD",
            Side::Buy,
            dec!(0.10),
            Some(dec!(1.09000)),
            Some(dec!(1.11000)),
        );

        engine.run_cycle().await.unwrap();

        // Trader moves the original's levels.
        engine.terminal_mut().set_position_sltp(
            original,
            Some(dec!(1.09500)),
            Some(dec!(1.12000)),
        );
        let events = engine.run_cycle().await.unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, MirrorEvent::SltpSynced { .. })));

        let reverse = reverse_of(&mut engine, original);
        assert_eq!(reverse.sl, Some(dec!(1.12000)));
        assert_eq!(reverse.tp, Some(dec!(1.09500)));

        // Unchanged levels must not produce another modify.
        let events = engine.run_cycle().await.unwrap();
        assert!(!events
            .iter()
            .any(|e| matches!(e, MirrorEvent::SltpSynced { .. })));
    }

    #[tokio::test]
    async fn test_original_without_levels_keeps_reverse_bare() {
        let mut engine = engine();
        let original =
            engine
                .terminal_mut()
                .open_original("EURUSD", Side::Sell, dec!(0.30), None, None);

        engine.run_cycle().await.unwrap();
        let reverse = reverse_of(&mut engine, original);
        assert_eq!(reverse.side, Side::Buy);
        assert_eq!(reverse.sl, None);
        assert_eq!(reverse.tp, None);

        // Setting only a TP on the original gives the reverse only an SL.
        engine
            .terminal_mut()
            .set_position_sltp(original, None, Some(dec!(1.09000)));
        engine.run_cycle().await.unwrap();
        let reverse = reverse_of(&mut engine, original);
        assert_eq!(reverse.sl, Some(dec!(1.09000)));
        assert_eq!(reverse.tp, None);
    }

    #[tokio::test]
    async fn test_mapping_rebuilt_after_restart() {
        let mut term = terminal_with_symbols();
        let original = term.open_original("EURUSD", Side::Buy, dec!(0.10), None, None);

        let mut engine = MirrorEngine::new(term, test_config());
        engine.run_cycle().await.unwrap();
        let reverse = *engine.pairs().get(&original).unwrap();

        // New engine over the same terminal state, as after a restart.
        let mut engine = MirrorEngine::new(engine.into_terminal(), test_config());
        let events = engine.run_cycle().await.unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            MirrorEvent::ReverseAdopted { original: o, reverse: r } if *o == original && *r == reverse
        )));
        // Adopted, not duplicated.
        assert_eq!(engine.terminal_mut().open_position_count(), 2);

        engine.terminal_mut().remove_position(original);
        engine.run_cycle().await.unwrap();
        assert!(engine.terminal_mut().position(reverse).is_none());
    }

    #[tokio::test]
    async fn test_rejected_open_is_retried_next_cycle() {
        let mut engine = engine();
        engine
            .terminal_mut()
            .open_original("EURUSD", Side::Buy, dec!(0.10), None, None);
        engine
            .terminal_mut()
            .reject_next_trade(retcode::NO_MONEY, "not enough money");

        let events = engine.run_cycle().await.unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            MirrorEvent::OrderRejected { retcode: rc, .. } if *rc == retcode::NO_MONEY
        )));
        assert_eq!(engine.terminal_mut().open_position_count(), 1);

        // Next cycle succeeds and opens exactly one reverse.
        engine.run_cycle().await.unwrap();
        assert_eq!(engine.terminal_mut().open_position_count(), 2);
        assert_eq!(engine.pairs().len(), 1);
    }

    #[tokio::test]
    async fn test_reverse_volume_snapped_to_lot_step() {
        let mut engine = engine();
        engine.terminal_mut().add_symbol(SymbolInfo {
            symbol: "ODDLOT".to_string(),
            digits: 3,
            point: dec!(0.001),
            volume_min: dec!(0.04),
            volume_max: dec!(10),
            volume_step: dec!(0.04),
            visible: true,
        });
        engine
            .terminal_mut()
            .set_quote("ODDLOT", dec!(5.000), dec!(5.010));
        let original =
            engine
                .terminal_mut()
                .open_original("ODDLOT", Side::Buy, dec!(0.05), None, None);

        engine.run_cycle().await.unwrap();
        let reverse = reverse_of(&mut engine, original);
        // 0.05 x 2 = 0.10 -> snapped down to the 0.04 step = 0.08.
        assert_eq!(reverse.volume, dec!(0.08));
    }

    #[test]
    fn test_comment_round_trip() {
        let config = MirrorConfig::default();
        let comment = config.reverse_comment(123_456);
        assert_eq!(comment, "REV of 123456");
        assert_eq!(config.parse_origin_ticket(&comment), Some(123_456));
        assert_eq!(config.parse_origin_ticket("REV of "), None);
        assert_eq!(config.parse_origin_ticket("REV of 12x"), None);
        assert_eq!(config.parse_origin_ticket("something else"), None);
    }

    #[test]
    fn test_desired_reverse_sltp_swaps_and_drops_zero() {
        let pos = PositionSnapshot {
            ticket: 1,
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            volume: dec!(0.1),
            open_price: dec!(1.1),
            sl: Some(dec!(1.05)),
            tp: Some(Decimal::ZERO),
            magic: 0,
            comment: String::new(),
            opened_at: chrono::Utc::now(),
            profit: Decimal::ZERO,
        };
        let (sl, tp) = desired_reverse_sltp(&pos);
        assert_eq!(sl, None);
        assert_eq!(tp, Some(dec!(1.05)));
    }
}
