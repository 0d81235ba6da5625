// =============================================================================
// Engine — Bollinger band-cross state machine over bar-close events
// =============================================================================
//
// One engine instance owns one symbol. It ticks only on BarClosed events from
// the market feed, never on wall-clock time. All state transitions, adapter
// calls, and store writes happen on this single task, which is what makes the
// position/trade ledger single-writer.
//
// Transition rules (close c against the bands of the same bar, strict
// inequalities throughout — touching a band is not a cross):
//
//   waiting                   c > up   -> above_up_wait_fall
//   above_up_wait_fall        c < up   -> open short           -> holding_short
//   holding_short             c > up   -> close short (stop)   -> above_up_stopped_wait_fall
//                             c < mid  ->                      -> below_mid_wait
//   above_up_stopped_wait_fall c < up  -> open short           -> holding_short
//   below_mid_wait            c > mid  -> close short (tp), open long -> holding_long
//                             c < dn   ->                      -> below_dn_wait_reclaim
//   holding_long              c < mid  -> close long (stop)    -> waiting
//                             c > up   -> close long (tp), open short -> holding_short
//   below_dn_wait_reclaim     c > dn   -> close short if open (tp), open long -> holding_long
//   above_mid_wait            c > up   ->                      -> above_up_wait_fall
//                             c < mid  -> close long (tp), open short -> holding_short
//
// Compound transitions run both legs inside one bar handler; their trade rows
// and the position replace commit in a single store transaction. A failed
// first leg reverts to the prior state; a failed second leg persists the
// executed close and falls flat to waiting. A partial close keeps the
// residual position and the pre-close state.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::adapter::{round_to_step, AdapterError, AdapterResult, TradeAdapter};
use crate::config::BotConfig;
use crate::feed::BarClosed;
use crate::indicator::{bollinger_latest, BollPoint};
use crate::store::{PositionUpdate, Store};
use crate::types::{Fill, LogLevel, Mode, Position, PositionSide, Trade, TradeSide};

/// Deadline applied to every trading-adapter call.
const ADAPTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Quantity slack when deciding whether a close fill was partial.
const QTY_EPSILON: f64 = 1e-9;

// =============================================================================
// States
// =============================================================================

/// The eight engine states. Exhaustive by construction: every bar-close
/// handler must say what each state does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Waiting,
    AboveUpWaitFall,
    HoldingShort,
    AboveUpStoppedWaitFall,
    BelowMidWait,
    HoldingLong,
    BelowDnWaitReclaim,
    AboveMidWait,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::AboveUpWaitFall => "above_up_wait_fall",
            Self::HoldingShort => "holding_short",
            Self::AboveUpStoppedWaitFall => "above_up_stopped_wait_fall",
            Self::BelowMidWait => "below_mid_wait",
            Self::HoldingLong => "holding_long",
            Self::BelowDnWaitReclaim => "below_dn_wait_reclaim",
            Self::AboveMidWait => "above_mid_wait",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Snapshot / handle
// =============================================================================

/// Live engine view for the dashboard. Written only by the engine task;
/// readers take a brief shared lock.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub symbol: String,
    pub interval: String,
    pub state: EngineState,
    pub running: bool,
    pub last_close: f64,
    pub last_bar_time: i64,
    pub boll_upper: Option<f64>,
    pub boll_middle: Option<f64>,
    pub boll_lower: Option<f64>,
    pub balance: Option<f64>,
}

/// Control surface handed to the embedder: start/stop plus a status snapshot.
/// Nothing here can force a state transition; the state machine is the sole
/// decider.
#[derive(Clone)]
pub struct EngineHandle {
    snapshot: Arc<RwLock<EngineSnapshot>>,
    active: Arc<AtomicBool>,
}

impl EngineHandle {
    pub fn status(&self) -> EngineSnapshot {
        self.snapshot.read().clone()
    }

    pub fn start(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Internal transition bookkeeping
// =============================================================================

/// Result of one close attempt that already filled.
enum CloseOutcome {
    Full(Trade),
    Partial { trade: Trade, residual: Position },
}

// =============================================================================
// Engine
// =============================================================================

pub struct Engine {
    config: BotConfig,
    store: Arc<Store>,
    adapter: Arc<dyn TradeAdapter>,
    state: EngineState,
    snapshot: Arc<RwLock<EngineSnapshot>>,
    active: Arc<AtomicBool>,
    /// Reference fill price for the simulated adapter; written with the bar
    /// close before dispatch so sim fills happen at the last close.
    sim_ref_price: Option<Arc<Mutex<f64>>>,
}

impl Engine {
    pub fn new(
        config: BotConfig,
        store: Arc<Store>,
        adapter: Arc<dyn TradeAdapter>,
        sim_ref_price: Option<Arc<Mutex<f64>>>,
    ) -> (Self, EngineHandle) {
        let snapshot = Arc::new(RwLock::new(EngineSnapshot {
            symbol: config.symbol.clone(),
            interval: config.interval.as_str().to_string(),
            state: EngineState::Waiting,
            running: true,
            last_close: 0.0,
            last_bar_time: 0,
            boll_upper: None,
            boll_middle: None,
            boll_lower: None,
            balance: None,
        }));
        let active = Arc::new(AtomicBool::new(true));
        let handle = EngineHandle {
            snapshot: snapshot.clone(),
            active: active.clone(),
        };
        let engine = Self {
            config,
            store,
            adapter,
            state: EngineState::Waiting,
            snapshot,
            active,
            sim_ref_price,
        };
        (engine, handle)
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    // -------------------------------------------------------------------------
    // Startup recovery
    // -------------------------------------------------------------------------

    /// Derive the starting state from the open position: short -> holding
    /// short, long -> holding long, none -> waiting. In live mode the venue
    /// is the source of truth and the store row is reconciled to it; in sim
    /// mode the store row is canonical.
    pub async fn recover_state(&mut self) -> Result<()> {
        let symbol = self.config.symbol.clone();

        let position = match self.config.mode {
            Mode::Live => {
                let venue = self
                    .call(self.adapter.positions(&symbol))
                    .await
                    .map_err(|e| anyhow::anyhow!("startup position probe failed: {e}"))?;
                let venue_pos = venue.into_iter().next();
                let stored = self.store.get_position(&symbol)?;
                match (&venue_pos, &stored) {
                    (Some(v), _) => {
                        // Venue wins; refresh the store row.
                        let ts = crate::binance::BinanceClient::timestamp_ms();
                        self.store
                            .set_position(&symbol, v.side, v.qty, v.entry_price, ts)?;
                    }
                    (None, Some(_)) => {
                        warn!(symbol = %symbol, "store had a position the venue does not; clearing");
                        self.store.clear_position(&symbol)?;
                    }
                    (None, None) => {}
                }
                venue_pos
            }
            Mode::Sim => self.store.get_position(&symbol)?,
        };

        self.state = match &position {
            Some(pos) if pos.side == PositionSide::Short => EngineState::HoldingShort,
            Some(pos) if pos.side == PositionSide::Long => EngineState::HoldingLong,
            _ => EngineState::Waiting,
        };

        let ts = crate::binance::BinanceClient::timestamp_ms();
        match &position {
            Some(pos) => {
                let msg = format!(
                    "startup: detected existing {} position qty={:.6} entry={:.2}, state={}",
                    pos.side, pos.qty, pos.entry_price, self.state
                );
                info!(symbol = %symbol, side = %pos.side, qty = pos.qty, "existing position detected at startup");
                self.store.append_log(ts, LogLevel::Info, &msg)?;
            }
            None => {
                info!(symbol = %symbol, "no open position at startup");
                self.store
                    .append_log(ts, LogLevel::Info, "startup: no open position, waiting for entry")?;
            }
        }

        self.snapshot.write().state = self.state;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Run loop
    // -------------------------------------------------------------------------

    /// Consume BarClosed events until the channel closes or shutdown is
    /// signalled, then drain whatever is already queued (3 s deadline).
    /// Returns an error only on a fatal condition (store write failure or an
    /// invariant violation); the process should restart and re-derive state.
    pub async fn run(
        mut self,
        mut rx: tokio::sync::mpsc::Receiver<BarClosed>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(event) => self.on_bar_closed(event).await?,
                    None => {
                        info!("bar channel closed, engine exiting");
                        return Ok(());
                    }
                },
                _ = shutdown.changed() => {
                    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
                    while let Ok(event) = rx.try_recv() {
                        if tokio::time::Instant::now() >= deadline {
                            warn!("shutdown drain deadline reached with bars pending");
                            break;
                        }
                        self.on_bar_closed(event).await?;
                    }
                    info!("engine drained and stopped");
                    return Ok(());
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Bar-close handler
    // -------------------------------------------------------------------------

    /// Handle one closed bar: read the window, compute bands, dispatch the
    /// state machine, persist, and log the transition.
    pub async fn on_bar_closed(&mut self, event: BarClosed) -> Result<()> {
        let c = event.close;

        if let Some(cell) = &self.sim_ref_price {
            *cell.lock() = c;
        }

        let closes = self.store.fetch_closes_up_to(
            &self.config.symbol,
            self.config.interval.as_str(),
            event.open_time,
            self.config.boll_period,
        )?;

        let bands = if closes.len() >= self.config.boll_period {
            bollinger_latest(&closes, self.config.boll_period, self.config.boll_std)
        } else {
            None
        };

        let Some(bands) = bands else {
            debug!(
                have = closes.len(),
                need = self.config.boll_period,
                "not enough closed bars for bands, skipping"
            );
            self.update_snapshot(event, None);
            return Ok(());
        };

        if !self.active.load(Ordering::SeqCst) {
            debug!(open_time = event.open_time, "engine stopped, bar ignored");
            self.update_snapshot(event, Some(bands));
            return Ok(());
        }

        let prior = self.state;
        let action = self.dispatch(c, bands).await?;

        let ts = crate::binance::BinanceClient::timestamp_ms();
        let msg = format!(
            "bar {}: close={:.2} up={:.2} mid={:.2} dn={:.2} state {} -> {} action={}",
            event.open_time, c, bands.upper, bands.middle, bands.lower, prior, self.state, action
        );
        info!(
            open_time = event.open_time,
            close = c,
            prior = %prior,
            state = %self.state,
            action = %action,
            "bar processed"
        );
        self.store.append_log(ts, LogLevel::Info, &msg)?;

        self.update_snapshot(event, Some(bands));
        Ok(())
    }

    fn update_snapshot(&self, event: BarClosed, bands: Option<BollPoint>) {
        let mut snap = self.snapshot.write();
        snap.state = self.state;
        snap.running = self.active.load(Ordering::SeqCst);
        snap.last_close = event.close;
        snap.last_bar_time = event.open_time;
        snap.boll_upper = bands.map(|b| b.upper);
        snap.boll_middle = bands.map(|b| b.middle);
        snap.boll_lower = bands.map(|b| b.lower);
    }

    // -------------------------------------------------------------------------
    // State dispatch
    // -------------------------------------------------------------------------

    /// Dispatch one bar through the transition table. Returns a short action
    /// description for the transition log. Errors are fatal (store failure or
    /// invariant violation); adapter failures are absorbed here per policy.
    async fn dispatch(&mut self, c: f64, bands: BollPoint) -> Result<String> {
        let BollPoint { middle: mid, upper: up, lower: dn } = bands;

        let action = match self.state {
            EngineState::Waiting => {
                if c > up {
                    self.state = EngineState::AboveUpWaitFall;
                    "armed short setup (close above upper)".to_string()
                } else {
                    "none".to_string()
                }
            }

            EngineState::AboveUpWaitFall => {
                if c < up {
                    self.enter_short(c, EngineState::AboveUpWaitFall).await?
                } else {
                    "none".to_string()
                }
            }

            EngineState::HoldingShort => {
                if c > up {
                    let pos = self.require_position(PositionSide::Short)?;
                    self.close_only(pos, TradeSide::CloseShort, EngineState::AboveUpStoppedWaitFall, "stop")
                        .await?
                } else if c < mid {
                    self.state = EngineState::BelowMidWait;
                    "short below middle, watching for reclaim".to_string()
                } else {
                    "none".to_string()
                }
            }

            EngineState::AboveUpStoppedWaitFall => {
                if c < up {
                    self.enter_short(c, EngineState::AboveUpStoppedWaitFall).await?
                } else {
                    "none".to_string()
                }
            }

            EngineState::BelowMidWait => {
                if c > mid {
                    self.close_then_open(
                        c,
                        PositionSide::Short,
                        PositionSide::Long,
                        EngineState::HoldingLong,
                        "take_profit",
                    )
                    .await?
                } else if c < dn {
                    self.state = EngineState::BelowDnWaitReclaim;
                    "close below lower band, waiting for reclaim".to_string()
                } else {
                    "none".to_string()
                }
            }

            EngineState::HoldingLong => {
                if c < mid {
                    let pos = self.require_position(PositionSide::Long)?;
                    self.close_only(pos, TradeSide::CloseLong, EngineState::Waiting, "stop")
                        .await?
                } else if c > up {
                    self.close_then_open(
                        c,
                        PositionSide::Long,
                        PositionSide::Short,
                        EngineState::HoldingShort,
                        "take_profit",
                    )
                    .await?
                } else {
                    "none".to_string()
                }
            }

            EngineState::BelowDnWaitReclaim => {
                if c > dn {
                    self.close_then_open(
                        c,
                        PositionSide::Short,
                        PositionSide::Long,
                        EngineState::HoldingLong,
                        "take_profit",
                    )
                    .await?
                } else {
                    "none".to_string()
                }
            }

            EngineState::AboveMidWait => {
                if c > up {
                    self.state = EngineState::AboveUpWaitFall;
                    "continuation above upper, re-arming short setup".to_string()
                } else if c < mid {
                    self.close_then_open(
                        c,
                        PositionSide::Long,
                        PositionSide::Short,
                        EngineState::HoldingShort,
                        "take_profit",
                    )
                    .await?
                } else {
                    "none".to_string()
                }
            }
        };

        Ok(action)
    }

    // -------------------------------------------------------------------------
    // Transition building blocks
    // -------------------------------------------------------------------------

    /// Wrap an adapter call with the mandatory deadline.
    async fn call<T>(
        &self,
        fut: impl std::future::Future<Output = AdapterResult<T>>,
    ) -> AdapterResult<T> {
        match tokio::time::timeout(ADAPTER_TIMEOUT, fut).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout),
        }
    }

    /// Fetch the position this state requires; its absence is an invariant
    /// violation and halts the engine.
    fn require_position(&self, side: PositionSide) -> Result<Position> {
        match self.store.get_position(&self.config.symbol)? {
            Some(pos) if pos.side == side => Ok(pos),
            other => {
                let msg = format!(
                    "invariant violation: state {} requires an open {} position, store has {:?}",
                    self.state, side, other
                );
                error!("{msg}");
                let ts = crate::binance::BinanceClient::timestamp_ms();
                let _ = self.store.append_log(ts, LogLevel::Error, &msg);
                Err(anyhow::anyhow!(msg))
            }
        }
    }

    /// Size an open: qty = balance * F * L / price, floored to the lot step.
    /// Returns Ok(None) when the rounded size is non-positive.
    async fn sized_qty(&self, price: f64) -> AdapterResult<Option<f64>> {
        let balance = self.call(self.adapter.balance()).await?;
        self.snapshot.write().balance = Some(balance);

        let raw = (balance * self.config.trade_percent * self.config.leverage as f64) / price;
        let qty = round_to_step(raw, self.adapter.lot_step());
        if qty <= 0.0 {
            warn!(balance, price, raw, "computed open size rounds to zero, skipping open");
            Ok(None)
        } else {
            Ok(Some(qty))
        }
    }

    /// Execute an open and build its ledger row. `Ok(None)` means the open
    /// was skipped for size; adapter failures bubble up.
    async fn do_open(
        &self,
        side: PositionSide,
        price_hint: f64,
    ) -> AdapterResult<Option<(Trade, Position)>> {
        let Some(qty) = self.sized_qty(price_hint).await? else {
            return Ok(None);
        };

        let symbol = &self.config.symbol;
        let fill = match side {
            PositionSide::Long => self.call(self.adapter.open_long(symbol, qty)).await?,
            PositionSide::Short => self.call(self.adapter.open_short(symbol, qty)).await?,
        };

        let trade = Trade {
            ts: fill.ts,
            symbol: symbol.clone(),
            side: match side {
                PositionSide::Long => TradeSide::Buy,
                PositionSide::Short => TradeSide::Sell,
            },
            qty: fill.qty,
            price: fill.fill_price,
            fee: fill.fee,
            pnl: 0.0,
            simulate: self.config.mode == Mode::Sim,
        };
        let position = Position {
            symbol: symbol.clone(),
            side,
            qty: fill.qty,
            entry_price: fill.fill_price,
            opened_at: fill.ts,
        };
        Ok(Some((trade, position)))
    }

    /// Execute a close of the full position and classify the fill.
    async fn do_close(&self, pos: &Position) -> AdapterResult<CloseOutcome> {
        let symbol = &self.config.symbol;
        let fill: Fill = match pos.side {
            PositionSide::Long => self.call(self.adapter.close_long(symbol, pos.qty)).await?,
            PositionSide::Short => self.call(self.adapter.close_short(symbol, pos.qty)).await?,
        };

        let pnl = match pos.side {
            PositionSide::Long => (fill.fill_price - pos.entry_price) * fill.qty,
            PositionSide::Short => (pos.entry_price - fill.fill_price) * fill.qty,
        };
        let trade = Trade {
            ts: fill.ts,
            symbol: symbol.clone(),
            side: match pos.side {
                PositionSide::Long => TradeSide::CloseLong,
                PositionSide::Short => TradeSide::CloseShort,
            },
            qty: fill.qty,
            price: fill.fill_price,
            fee: fill.fee,
            pnl,
            simulate: self.config.mode == Mode::Sim,
        };

        if fill.qty + QTY_EPSILON < pos.qty {
            let residual = Position {
                qty: pos.qty - fill.qty,
                ..pos.clone()
            };
            Ok(CloseOutcome::Partial { trade, residual })
        } else {
            Ok(CloseOutcome::Full(trade))
        }
    }

    /// Armed short entry: open a short; stay in `revert_to` on failure or zero
    /// size.
    async fn enter_short(&mut self, c: f64, revert_to: EngineState) -> Result<String> {
        match self.do_open(PositionSide::Short, c).await {
            Ok(Some((trade, position))) => {
                let desc = format!(
                    "open_short qty={:.6} @ {:.2}",
                    trade.qty, trade.price
                );
                self.store
                    .commit_bar(std::slice::from_ref(&trade), PositionUpdate::Set(position))?;
                self.state = EngineState::HoldingShort;
                Ok(desc)
            }
            Ok(None) => {
                self.state = revert_to;
                Ok("open_short skipped (size rounds to zero)".to_string())
            }
            Err(e) => {
                self.state = revert_to;
                self.log_adapter_error("open_short", &e)?;
                Ok(format!("open_short aborted ({e})"))
            }
        }
    }

    /// Plain close (stop or take-profit) with no second leg. Partial fills
    /// keep the residual position and the current state.
    async fn close_only(
        &mut self,
        pos: Position,
        side: TradeSide,
        next: EngineState,
        reason: &str,
    ) -> Result<String> {
        match self.do_close(&pos).await {
            Ok(CloseOutcome::Full(trade)) => {
                let desc = format!(
                    "{} {} qty={:.6} @ {:.2} pnl={:.4}",
                    side, reason, trade.qty, trade.price, trade.pnl
                );
                self.store.commit_bar(
                    std::slice::from_ref(&trade),
                    PositionUpdate::Clear(self.config.symbol.clone()),
                )?;
                self.state = next;
                Ok(desc)
            }
            Ok(CloseOutcome::Partial { trade, residual }) => {
                let desc = format!(
                    "{} {} partial fill {:.6}/{:.6}, position stays open",
                    side, reason, trade.qty, pos.qty
                );
                warn!(filled = trade.qty, requested = pos.qty, "partial close fill");
                self.store
                    .commit_bar(std::slice::from_ref(&trade), PositionUpdate::Set(residual))?;
                Ok(desc)
            }
            Err(e) => {
                self.log_adapter_error(side.as_str(), &e)?;
                Ok(format!("{side} aborted ({e})"))
            }
        }
    }

    /// Compound transition: close any open `close_side` position with
    /// take-profit, then open `open_side`. First-leg failure reverts to the
    /// prior state; second-leg failure persists the close and falls flat to
    /// waiting; a partial close keeps the pre-close state.
    async fn close_then_open(
        &mut self,
        c: f64,
        close_side: PositionSide,
        open_side: PositionSide,
        next: EngineState,
        reason: &str,
    ) -> Result<String> {
        let symbol = self.config.symbol.clone();
        let pos = self.store.get_position(&symbol)?;

        let mut trades: Vec<Trade> = Vec::new();
        let mut closed_desc = String::new();

        if let Some(pos) = pos {
            if pos.side != close_side {
                let msg = format!(
                    "invariant violation: state {} expected a {} position to close, found {}",
                    self.state, close_side, pos.side
                );
                error!("{msg}");
                let ts = crate::binance::BinanceClient::timestamp_ms();
                let _ = self.store.append_log(ts, LogLevel::Error, &msg);
                return Err(anyhow::anyhow!(msg));
            }

            match self.do_close(&pos).await {
                Ok(CloseOutcome::Full(trade)) => {
                    closed_desc = format!(
                        "{} {} qty={:.6} @ {:.2} pnl={:.4}",
                        trade.side, reason, trade.qty, trade.price, trade.pnl
                    );
                    trades.push(trade);
                }
                Ok(CloseOutcome::Partial { trade, residual }) => {
                    warn!(filled = trade.qty, requested = pos.qty, "partial close fill");
                    let desc = format!(
                        "{} {} partial fill {:.6}/{:.6}, position stays open",
                        trade.side, reason, trade.qty, pos.qty
                    );
                    self.store
                        .commit_bar(std::slice::from_ref(&trade), PositionUpdate::Set(residual))?;
                    return Ok(desc);
                }
                Err(e) => {
                    // First leg failed: nothing happened, stay put.
                    self.log_adapter_error("close leg", &e)?;
                    return Ok(format!("close leg aborted ({e}), state unchanged"));
                }
            }
        }

        match self.do_open(open_side, c).await {
            Ok(Some((trade, position))) => {
                let open_desc = format!(
                    "{} qty={:.6} @ {:.2}",
                    trade.side, trade.qty, trade.price
                );
                trades.push(trade);
                self.store
                    .commit_bar(&trades, PositionUpdate::Set(position))?;
                self.state = next;
                if closed_desc.is_empty() {
                    Ok(open_desc)
                } else {
                    Ok(format!("{closed_desc}; {open_desc}"))
                }
            }
            Ok(None) => {
                self.settle_failed_open(&trades, "size rounds to zero")?;
                Ok(format!(
                    "{closed_desc}; open leg skipped (size rounds to zero)"
                ))
            }
            Err(e) => {
                self.log_adapter_error("open leg", &e)?;
                self.settle_failed_open(&trades, "adapter error")?;
                Ok(format!("{closed_desc}; open leg aborted ({e})"))
            }
        }
    }

    /// Second leg of a compound failed. If the close already filled, persist
    /// it and fall flat to waiting; otherwise stay where we are.
    fn settle_failed_open(&mut self, trades: &[Trade], why: &str) -> Result<()> {
        if trades.is_empty() {
            return Ok(());
        }
        warn!(why, "open leg failed after a filled close, going flat");
        self.store
            .commit_bar(trades, PositionUpdate::Clear(self.config.symbol.clone()))?;
        self.state = EngineState::Waiting;
        Ok(())
    }

    fn log_adapter_error(&self, what: &str, err: &AdapterError) -> Result<()> {
        error!(what, error = %err, "adapter call failed, transition aborted");
        let ts = crate::binance::BinanceClient::timestamp_ms();
        self.store.append_log(
            ts,
            LogLevel::Error,
            &format!("adapter failure on {what}: {err}"),
        )?;
        Ok(())
    }

}

// =============================================================================
// Tests — scripted adapter + scenario walks
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::SimAdapter;
    use crate::feed::BarClosed;
    use crate::types::Interval;
    use async_trait::async_trait;

    const P: usize = 20;

    fn test_config() -> BotConfig {
        let mut cfg = BotConfig::default();
        cfg.symbol = "BTCUSDT".into();
        cfg.interval = Interval::M15;
        cfg.boll_period = P;
        cfg.boll_std = 2.0;
        cfg.leverage = 10;
        cfg.trade_percent = 0.7;
        cfg.fee_rate = 0.0005;
        cfg.lot_step = 0.001;
        cfg.mode = Mode::Sim;
        cfg.sim_balance = 1000.0;
        cfg
    }

    fn kline(open_time: i64, close: f64) -> crate::types::Kline {
        crate::types::Kline {
            open_time,
            close_time: open_time + 899_999,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            quote_volume: close,
            trades: 1,
            taker_buy_base: 0.5,
            taker_buy_quote: close / 2.0,
        }
    }

    /// Test rig: sim adapter + in-memory store + engine, pre-seeded with a
    /// flat price history so the bands are well defined from the first bar.
    struct Rig {
        engine: Engine,
        store: Arc<Store>,
        price: Arc<Mutex<f64>>,
        next_time: i64,
    }

    impl Rig {
        fn new() -> Self {
            Self::with_history(&vec![100.0; P])
        }

        fn with_history(history: &[f64]) -> Self {
            let cfg = test_config();
            let store = Arc::new(Store::open_in_memory().unwrap());
            let price = Arc::new(Mutex::new(0.0));
            let adapter = Arc::new(SimAdapter::new(
                cfg.symbol.clone(),
                cfg.sim_balance,
                cfg.fee_rate,
                cfg.lot_step,
                price.clone(),
            ));
            let (engine, _handle) = Engine::new(cfg, store.clone(), adapter, Some(price.clone()));

            let rows: Vec<crate::types::Kline> = history
                .iter()
                .enumerate()
                .map(|(i, c)| kline(i as i64 * 900_000, *c))
                .collect();
            store.upsert_klines("BTCUSDT", "15m", &rows).unwrap();

            Self {
                engine,
                store,
                price,
                next_time: history.len() as i64 * 900_000,
            }
        }

        /// Append a closed bar and run the handler on it.
        async fn push(&mut self, close: f64) {
            let t = self.next_time;
            self.next_time += 900_000;
            self.store
                .upsert_klines("BTCUSDT", "15m", &[kline(t, close)])
                .unwrap();
            self.engine
                .on_bar_closed(BarClosed {
                    open_time: t,
                    close,
                })
                .await
                .unwrap();
        }

        /// Bands the engine will see for a hypothetical next close.
        fn bands_for(&self, close: f64) -> BollPoint {
            let mut closes = self
                .store
                .fetch_closes_up_to("BTCUSDT", "15m", self.next_time - 900_000, P - 1)
                .unwrap();
            closes.push(close);
            bollinger_latest(&closes, P, 2.0).unwrap()
        }

        fn trades(&self) -> Vec<Trade> {
            let mut t = self.store.fetch_trades("BTCUSDT", 100).unwrap();
            t.reverse(); // chronological
            t
        }

        fn position(&self) -> Option<Position> {
            self.store.get_position("BTCUSDT").unwrap()
        }
    }

    // -------------------------------------------------------------------------
    // Scenario A — short entry and stop
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn scenario_a_short_entry_then_stop() {
        let mut rig = Rig::new();

        // Break above the upper band.
        let bands = rig.bands_for(101.0);
        assert!(101.0 > bands.upper);
        rig.push(101.0).await;
        assert_eq!(rig.engine.state(), EngineState::AboveUpWaitFall);
        assert!(rig.trades().is_empty());

        // Fall back below: open short.
        let bands = rig.bands_for(100.0);
        assert!(100.0 < bands.upper);
        rig.push(100.0).await;
        assert_eq!(rig.engine.state(), EngineState::HoldingShort);
        let pos = rig.position().expect("short open");
        assert_eq!(pos.side, PositionSide::Short);
        // qty = 1000 * 0.7 * 10 / 100 = 70, already on the lot step.
        assert!((pos.qty - 70.0).abs() < 1e-9);

        // Re-break above: stop the short.
        let bands = rig.bands_for(101.0);
        assert!(101.0 > bands.upper);
        rig.push(101.0).await;
        assert_eq!(rig.engine.state(), EngineState::AboveUpStoppedWaitFall);
        assert!(rig.position().is_none());

        let trades = rig.trades();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].side, TradeSide::Sell);
        assert!((trades[0].pnl).abs() < 1e-12);
        assert_eq!(trades[1].side, TradeSide::CloseShort);
        // pnl = (entry - exit) * qty = (100 - 101) * 70.
        assert!((trades[1].pnl - (100.0 - 101.0) * 70.0).abs() < 1e-9);
        assert!(trades.iter().all(|t| t.fee > 0.0));
    }

    // -------------------------------------------------------------------------
    // Scenario B — short to long reversal via the middle band
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn scenario_b_short_to_long_via_middle() {
        let mut rig = Rig::new();
        rig.push(101.0).await; // waiting -> armed
        rig.push(100.0).await; // armed -> holding short @ 100
        assert_eq!(rig.engine.state(), EngineState::HoldingShort);

        // Below the middle band.
        let bands = rig.bands_for(99.0);
        assert!(99.0 < bands.middle);
        rig.push(99.0).await;
        assert_eq!(rig.engine.state(), EngineState::BelowMidWait);
        // No trade fired on that bar.
        assert_eq!(rig.trades().len(), 1);

        // Reclaim the middle: close short with profit, open long.
        let bands = rig.bands_for(101.0);
        assert!(101.0 > bands.middle);
        rig.push(101.0).await;
        assert_eq!(rig.engine.state(), EngineState::HoldingLong);

        let trades = rig.trades();
        assert_eq!(trades.len(), 3);
        assert_eq!(trades[0].side, TradeSide::Sell);
        assert_eq!(trades[1].side, TradeSide::CloseShort);
        assert_eq!(trades[2].side, TradeSide::Buy);

        let pos = rig.position().expect("long open");
        assert_eq!(pos.side, PositionSide::Long);
        assert!((pos.entry_price - 101.0).abs() < 1e-12);
    }

    // -------------------------------------------------------------------------
    // Scenario C — long take-profit above the upper band, reverse to short
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn scenario_c_long_take_profit_reverses_to_short() {
        let mut rig = Rig::new();
        rig.push(101.0).await; // armed
        rig.push(100.0).await; // short @ 100
        rig.push(99.0).await; // below middle
        rig.push(101.0).await; // reversed: long @ 101
        assert_eq!(rig.engine.state(), EngineState::HoldingLong);

        // Close above the upper band: take-profit the long, open short.
        let bands = rig.bands_for(103.0);
        assert!(103.0 > bands.upper);
        rig.push(103.0).await;
        assert_eq!(rig.engine.state(), EngineState::HoldingShort);

        let trades = rig.trades();
        assert_eq!(trades.len(), 5);
        assert_eq!(trades[3].side, TradeSide::CloseLong);
        assert!(trades[3].pnl > 0.0);
        assert_eq!(trades[4].side, TradeSide::Sell);

        // Compound atomicity: close row and open row are both there and the
        // position table holds exactly the new short.
        let pos = rig.position().expect("short open");
        assert_eq!(pos.side, PositionSide::Short);
        assert!((pos.entry_price - 103.0).abs() < 1e-12);
    }

    // -------------------------------------------------------------------------
    // Scenario E — adapter failure on the open-short leg
    // -------------------------------------------------------------------------

    /// Adapter that fails a programmed number of times, then delegates to a
    /// sim adapter.
    struct FlakyAdapter {
        inner: SimAdapter,
        fail_opens: Mutex<u32>,
    }

    #[async_trait]
    impl TradeAdapter for FlakyAdapter {
        async fn balance(&self) -> AdapterResult<f64> {
            self.inner.balance().await
        }
        async fn positions(&self, symbol: &str) -> AdapterResult<Vec<Position>> {
            self.inner.positions(symbol).await
        }
        async fn open_long(&self, symbol: &str, qty: f64) -> AdapterResult<Fill> {
            self.maybe_fail()?;
            self.inner.open_long(symbol, qty).await
        }
        async fn open_short(&self, symbol: &str, qty: f64) -> AdapterResult<Fill> {
            self.maybe_fail()?;
            self.inner.open_short(symbol, qty).await
        }
        async fn close_long(&self, symbol: &str, qty: f64) -> AdapterResult<Fill> {
            self.inner.close_long(symbol, qty).await
        }
        async fn close_short(&self, symbol: &str, qty: f64) -> AdapterResult<Fill> {
            self.inner.close_short(symbol, qty).await
        }
        fn lot_step(&self) -> f64 {
            self.inner.lot_step()
        }
    }

    impl FlakyAdapter {
        fn maybe_fail(&self) -> AdapterResult<()> {
            let mut remaining = self.fail_opens.lock();
            if *remaining > 0 {
                *remaining -= 1;
                Err(AdapterError::Rejected("injected failure".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn scenario_e_open_failure_reverts_state() {
        let cfg = test_config();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let price = Arc::new(Mutex::new(0.0));
        let adapter = Arc::new(FlakyAdapter {
            inner: SimAdapter::new(
                cfg.symbol.clone(),
                cfg.sim_balance,
                cfg.fee_rate,
                cfg.lot_step,
                price.clone(),
            ),
            fail_opens: Mutex::new(1),
        });
        let (engine, _handle) = Engine::new(cfg, store.clone(), adapter, Some(price.clone()));
        let mut rig = Rig {
            engine,
            store: store.clone(),
            price,
            next_time: P as i64 * 900_000,
        };
        let rows: Vec<crate::types::Kline> =
            (0..P).map(|i| kline(i as i64 * 900_000, 100.0)).collect();
        store.upsert_klines("BTCUSDT", "15m", &rows).unwrap();

        rig.push(101.0).await; // waiting -> armed
        assert_eq!(rig.engine.state(), EngineState::AboveUpWaitFall);

        // Open short leg fails: state reverts to armed, no SELL row, error log.
        rig.push(100.0).await;
        assert_eq!(rig.engine.state(), EngineState::AboveUpWaitFall);
        assert!(rig.trades().is_empty());
        assert!(rig.position().is_none());
        let logs = rig.store.fetch_logs(50).unwrap();
        assert_eq!(logs.iter().filter(|l| l.level == "error").count(), 1);

        // Next bar the adapter recovers and the short opens.
        rig.push(100.0).await;
        assert_eq!(rig.engine.state(), EngineState::HoldingShort);
        assert_eq!(rig.trades().len(), 1);
    }

    // -------------------------------------------------------------------------
    // Scenario F — equality is not a cross
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn scenario_f_equality_boundary_does_not_fire() {
        let mut rig = Rig::new();
        // On a flat history the bands collapse onto the price: c == up exactly.
        let bands = rig.bands_for(100.0);
        assert!((bands.upper - 100.0).abs() < 1e-12);
        rig.push(100.0).await;
        assert_eq!(rig.engine.state(), EngineState::Waiting);
        assert!(rig.trades().is_empty());
    }

    // -------------------------------------------------------------------------
    // Warmup and sizing edge cases
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn insufficient_history_skips_dispatch() {
        let mut rig = Rig::with_history(&vec![100.0; P - 5]);
        rig.push(150.0).await;
        // Far above any band, but the window is not full yet.
        assert_eq!(rig.engine.state(), EngineState::Waiting);
        assert!(rig.trades().is_empty());
    }

    #[tokio::test]
    async fn zero_size_open_keeps_state() {
        let cfg = {
            let mut c = test_config();
            c.sim_balance = 0.0005; // rounds to zero qty at lot step 0.001
            c
        };
        let store = Arc::new(Store::open_in_memory().unwrap());
        let price = Arc::new(Mutex::new(0.0));
        let adapter = Arc::new(SimAdapter::new(
            cfg.symbol.clone(),
            cfg.sim_balance,
            cfg.fee_rate,
            cfg.lot_step,
            price.clone(),
        ));
        let (engine, _handle) = Engine::new(cfg, store.clone(), adapter, Some(price.clone()));
        let mut rig = Rig {
            engine,
            store: store.clone(),
            price,
            next_time: P as i64 * 900_000,
        };
        let rows: Vec<crate::types::Kline> =
            (0..P).map(|i| kline(i as i64 * 900_000, 100.0)).collect();
        store.upsert_klines("BTCUSDT", "15m", &rows).unwrap();

        rig.push(101.0).await;
        rig.push(100.0).await;
        // Too small to open: remain armed, nothing persisted.
        assert_eq!(rig.engine.state(), EngineState::AboveUpWaitFall);
        assert!(rig.trades().is_empty());
    }

    // -------------------------------------------------------------------------
    // Ledger conservation (property 3)
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn ledger_conservation_over_a_round_trip() {
        let mut rig = Rig::new();
        rig.push(101.0).await;
        rig.push(100.0).await; // open short @ 100
        rig.push(101.0).await; // stop @ 101

        let trades = rig.trades();
        let open = &trades[0];
        let close = &trades[1];
        let expected = (open.price - close.price) * close.qty; // short
        assert!((close.pnl - expected).abs() < 1e-9);
        assert!((open.pnl).abs() < 1e-12);
        assert!(open.fee >= 0.0 && close.fee >= 0.0);
    }

    // -------------------------------------------------------------------------
    // Determinism (property 5)
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn identical_inputs_yield_identical_ledgers() {
        let script = [101.0, 100.0, 99.0, 101.0, 103.0, 101.0, 99.0];

        let mut ledgers = Vec::new();
        for _ in 0..2 {
            let mut rig = Rig::new();
            for c in script {
                rig.push(c).await;
            }
            let ledger: Vec<(String, f64, f64, f64)> = rig
                .trades()
                .iter()
                .map(|t| (t.side.as_str().to_string(), t.qty, t.price, t.pnl))
                .collect();
            ledgers.push((ledger, rig.engine.state()));
        }
        assert_eq!(ledgers[0].0, ledgers[1].0);
        assert_eq!(ledgers[0].1, ledgers[1].1);
        assert!(!ledgers[0].0.is_empty());
    }

    // -------------------------------------------------------------------------
    // Restart recovery (property 6)
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn restart_mid_run_yields_same_decisions() {
        let script = [101.0, 100.0, 99.0, 101.0, 103.0];
        let split = 2; // restart after the short is open

        // Uninterrupted run.
        let mut reference = Rig::new();
        for c in script {
            reference.push(c).await;
        }

        // Interrupted run: new engine over the same store + adapter state.
        let mut rig = Rig::new();
        for c in &script[..split] {
            rig.push(*c).await;
        }
        let Rig {
            store,
            price,
            next_time,
            ..
        } = rig;
        let adapter = Arc::new(SimAdapter::new(
            "BTCUSDT",
            // Balance after the open leg's fee, matching the reference run.
            1000.0 - 70.0 * 100.0 * 0.0005,
            0.0005,
            0.001,
            price.clone(),
        ));
        // The canonical position lives in the store; replay it into the
        // restarted sim adapter, the way main does on boot.
        let stored = store.get_position("BTCUSDT").unwrap().unwrap();
        adapter.restore_position(stored.side, stored.qty, stored.entry_price);
        let (mut engine, _handle) =
            Engine::new(test_config(), store.clone(), adapter, Some(price.clone()));
        engine.recover_state().await.unwrap();
        assert_eq!(engine.state(), EngineState::HoldingShort);

        let mut rig = Rig {
            engine,
            store,
            price,
            next_time,
        };
        for c in &script[split..] {
            rig.push(*c).await;
        }

        let fingerprint = |r: &Rig| -> Vec<(String, f64)> {
            r.trades()
                .iter()
                .map(|t| (t.side.as_str().to_string(), t.price))
                .collect()
        };
        assert_eq!(fingerprint(&reference), fingerprint(&rig));
        assert_eq!(reference.engine.state(), rig.engine.state());
    }

    // -------------------------------------------------------------------------
    // One-position invariant (property 2)
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn at_most_one_position_at_every_step() {
        let script = [101.0, 100.0, 99.0, 101.0, 103.0, 101.0];
        let mut rig = Rig::new();
        for c in script {
            rig.push(c).await;
            // The positions relation is keyed by symbol, so the check is that
            // the row, when present, matches the state's expectation.
            let pos = rig.position();
            match rig.engine.state() {
                EngineState::HoldingShort => {
                    assert_eq!(pos.unwrap().side, PositionSide::Short)
                }
                EngineState::HoldingLong => {
                    assert_eq!(pos.unwrap().side, PositionSide::Long)
                }
                EngineState::Waiting
                | EngineState::AboveUpWaitFall
                | EngineState::AboveUpStoppedWaitFall => assert!(pos.is_none()),
                // The wait states between mid and bands may carry the
                // still-open short.
                _ => {}
            }
        }
    }

    // -------------------------------------------------------------------------
    // Lower-band reclaim with the short still open
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn below_dn_reclaim_closes_short_then_opens_long() {
        let mut rig = Rig::new();
        rig.push(101.0).await; // armed
        rig.push(100.0).await; // short @ 100
        rig.push(99.0).await; // below middle
        let bands = rig.bands_for(97.0);
        assert!(97.0 < bands.lower);
        rig.push(97.0).await; // below lower band, short still open
        assert_eq!(rig.engine.state(), EngineState::BelowDnWaitReclaim);
        assert_eq!(rig.position().unwrap().side, PositionSide::Short);

        let bands = rig.bands_for(99.5);
        assert!(99.5 > bands.lower);
        rig.push(99.5).await; // reclaim: close short (tp) + open long
        assert_eq!(rig.engine.state(), EngineState::HoldingLong);

        let trades = rig.trades();
        let n = trades.len();
        assert_eq!(trades[n - 2].side, TradeSide::CloseShort);
        assert!(trades[n - 2].pnl > 0.0); // entry 100, exit 99.5, short gains
        assert_eq!(trades[n - 1].side, TradeSide::Buy);
    }

    // -------------------------------------------------------------------------
    // Stopped engine observes but does not act
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn stopped_engine_takes_no_transition() {
        let cfg = test_config();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let price = Arc::new(Mutex::new(0.0));
        let adapter = Arc::new(SimAdapter::new(
            cfg.symbol.clone(),
            cfg.sim_balance,
            cfg.fee_rate,
            cfg.lot_step,
            price.clone(),
        ));
        let (engine, handle) = Engine::new(cfg, store.clone(), adapter, Some(price.clone()));
        let rows: Vec<crate::types::Kline> =
            (0..P).map(|i| kline(i as i64 * 900_000, 100.0)).collect();
        store.upsert_klines("BTCUSDT", "15m", &rows).unwrap();
        let mut rig = Rig {
            engine,
            store,
            price,
            next_time: P as i64 * 900_000,
        };

        handle.stop();
        rig.push(101.0).await;
        assert_eq!(rig.engine.state(), EngineState::Waiting);

        handle.start();
        rig.push(101.0).await;
        assert_eq!(rig.engine.state(), EngineState::AboveUpWaitFall);
    }

    // -------------------------------------------------------------------------
    // Recovery from a stored position (sim mode)
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn recover_state_maps_position_to_state() {
        for (side, expected) in [
            (PositionSide::Short, EngineState::HoldingShort),
            (PositionSide::Long, EngineState::HoldingLong),
        ] {
            let cfg = test_config();
            let store = Arc::new(Store::open_in_memory().unwrap());
            store.set_position("BTCUSDT", side, 1.0, 100.0, 1).unwrap();
            let price = Arc::new(Mutex::new(0.0));
            let adapter = Arc::new(SimAdapter::new(
                "BTCUSDT", 1000.0, 0.0005, 0.001, price.clone(),
            ));
            let (mut engine, _handle) = Engine::new(cfg, store.clone(), adapter, Some(price));
            engine.recover_state().await.unwrap();
            assert_eq!(engine.state(), expected);
            // Startup detection was journaled.
            assert!(!store.fetch_logs(10).unwrap().is_empty());
        }
    }
}
