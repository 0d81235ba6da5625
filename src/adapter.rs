// =============================================================================
// Trading Adapter — one capability set, two implementations (live + sim)
// =============================================================================
//
// The engine only ever talks to `TradeAdapter`. The live implementation
// forwards to the signed futures REST client; the simulated one keeps an
// ephemeral balance and manufactures fills at a caller-supplied reference
// price. Quantities are base-asset and must already be rounded to the lot
// step (`round_to_step`) before submission.
// =============================================================================

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::binance::BinanceClient;
use crate::types::{Fill, Position, PositionSide};

/// Typed adapter failure. The engine branches on kind: every variant aborts
/// the triggering transition, none of them is fatal to the engine.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("network error: {0}")]
    Network(String),
    #[error("authorization error: {0}")]
    Auth(String),
    #[error("insufficient margin")]
    InsufficientMargin,
    #[error("order below minimum notional")]
    MinNotional,
    #[error("no open position to close")]
    NoPosition,
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("adapter call timed out")]
    Timeout,
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Round `qty` down to a multiple of `step`. Returns 0.0 when the rounded
/// quantity would not be positive.
pub fn round_to_step(qty: f64, step: f64) -> f64 {
    if step <= 0.0 || !qty.is_finite() {
        return 0.0;
    }
    let units = (qty / step).floor();
    if units <= 0.0 {
        0.0
    } else {
        units * step
    }
}

/// Exchange capability set used by the engine.
#[async_trait]
pub trait TradeAdapter: Send + Sync {
    /// Available quote (USDT) balance.
    async fn balance(&self) -> AdapterResult<f64>;

    /// Open positions for `symbol` as seen by the venue.
    async fn positions(&self, symbol: &str) -> AdapterResult<Vec<Position>>;

    async fn open_long(&self, symbol: &str, qty: f64) -> AdapterResult<Fill>;
    async fn open_short(&self, symbol: &str, qty: f64) -> AdapterResult<Fill>;
    async fn close_long(&self, symbol: &str, qty: f64) -> AdapterResult<Fill>;
    async fn close_short(&self, symbol: &str, qty: f64) -> AdapterResult<Fill>;

    /// Lot step quantities must be rounded to before submission.
    fn lot_step(&self) -> f64;
}

// =============================================================================
// Live adapter
// =============================================================================

/// Maps venue rejections onto the typed error kinds via the numeric error
/// codes Binance embeds in its JSON error bodies.
fn map_venue_error(err: anyhow::Error) -> AdapterError {
    let text = format!("{err:#}");
    if text.contains("-2019") {
        AdapterError::InsufficientMargin
    } else if text.contains("-4164") {
        AdapterError::MinNotional
    } else if text.contains("-2022") {
        // ReduceOnly order rejected: nothing left to reduce.
        AdapterError::NoPosition
    } else if text.contains("-2015") || text.contains("-1022") || text.contains("401") {
        AdapterError::Auth(text)
    } else if text.contains("returned") {
        AdapterError::Rejected(text)
    } else {
        AdapterError::Network(text)
    }
}

/// Live adapter over the signed futures REST client. Fees are estimated at
/// the configured taker rate; the ledger keeps them separate from PnL either
/// way.
pub struct LiveAdapter {
    client: BinanceClient,
    lot_step: f64,
    fee_rate: f64,
}

impl LiveAdapter {
    /// Build a live adapter, fetching the symbol's lot step from exchange
    /// info so order quantities land on valid boundaries.
    pub async fn connect(client: BinanceClient, symbol: &str, fee_rate: f64) -> AdapterResult<Self> {
        let lot_step = client.lot_step(symbol).await.map_err(map_venue_error)?;
        info!(symbol, lot_step, "live adapter connected");
        Ok(Self {
            client,
            lot_step,
            fee_rate,
        })
    }

    async fn submit(
        &self,
        symbol: &str,
        side: &str,
        qty: f64,
        reduce_only: bool,
    ) -> AdapterResult<Fill> {
        if qty <= 0.0 {
            return Err(AdapterError::Rejected("non-positive quantity".into()));
        }
        let resp = self
            .client
            .market_order(symbol, side, qty, reduce_only)
            .await
            .map_err(map_venue_error)?;

        if resp.executed_qty <= 0.0 || resp.avg_price <= 0.0 {
            return Err(AdapterError::Rejected(format!(
                "order {} reported no fill",
                resp.order_id
            )));
        }

        Ok(Fill {
            order_id: resp.order_id,
            qty: resp.executed_qty,
            fill_price: resp.avg_price,
            fee: resp.executed_qty * resp.avg_price * self.fee_rate,
            ts: resp.ts,
        })
    }
}

#[async_trait]
impl TradeAdapter for LiveAdapter {
    async fn balance(&self) -> AdapterResult<f64> {
        self.client
            .available_balance("USDT")
            .await
            .map_err(map_venue_error)
    }

    async fn positions(&self, symbol: &str) -> AdapterResult<Vec<Position>> {
        let venue = self
            .client
            .position_risk(symbol)
            .await
            .map_err(map_venue_error)?;
        Ok(venue
            .into_iter()
            .map(|p| Position {
                symbol: p.symbol,
                side: if p.position_amt > 0.0 {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                },
                qty: p.position_amt.abs(),
                entry_price: p.entry_price,
                opened_at: 0,
            })
            .collect())
    }

    async fn open_long(&self, symbol: &str, qty: f64) -> AdapterResult<Fill> {
        self.submit(symbol, "BUY", qty, false).await
    }

    async fn open_short(&self, symbol: &str, qty: f64) -> AdapterResult<Fill> {
        self.submit(symbol, "SELL", qty, false).await
    }

    async fn close_long(&self, symbol: &str, qty: f64) -> AdapterResult<Fill> {
        self.submit(symbol, "SELL", qty, true).await
    }

    async fn close_short(&self, symbol: &str, qty: f64) -> AdapterResult<Fill> {
        self.submit(symbol, "BUY", qty, true).await
    }

    fn lot_step(&self) -> f64 {
        self.lot_step
    }
}

// =============================================================================
// Simulated adapter
// =============================================================================

/// Minimum notional the venue would accept; enforced in sim too so the two
/// modes fail identically.
const SIM_MIN_NOTIONAL: f64 = 5.0;

struct SimPosition {
    side: PositionSide,
    qty: f64,
    entry_price: f64,
}

struct SimInner {
    balance: f64,
    position: Option<SimPosition>,
}

/// Simulated adapter: local balance, fills manufactured at the shared
/// reference price (the engine sets it to the last bar close before each
/// call). Fees are charged at the configured rate; the balance moves by
/// `-fee` on opens and `realized_pnl - fee` on closes.
pub struct SimAdapter {
    symbol: String,
    fee_rate: f64,
    lot_step: f64,
    /// Reference fill price, written by the engine on every bar close.
    ref_price: Arc<Mutex<f64>>,
    inner: Mutex<SimInner>,
}

impl SimAdapter {
    pub fn new(
        symbol: impl Into<String>,
        initial_balance: f64,
        fee_rate: f64,
        lot_step: f64,
        ref_price: Arc<Mutex<f64>>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            fee_rate,
            lot_step,
            ref_price,
            inner: Mutex::new(SimInner {
                balance: initial_balance,
                position: None,
            }),
        }
    }

    /// Re-seed the ephemeral position after a restart. The canonical row
    /// lives in the store; sim mode replays it into the adapter so closes
    /// keep working across process restarts.
    pub fn restore_position(&self, side: PositionSide, qty: f64, entry_price: f64) {
        let mut inner = self.inner.lock();
        inner.position = Some(SimPosition {
            side,
            qty,
            entry_price,
        });
        info!(side = %side, qty, entry_price, "sim position restored");
    }

    fn fill_price(&self) -> AdapterResult<f64> {
        let price = *self.ref_price.lock();
        if price > 0.0 {
            Ok(price)
        } else {
            Err(AdapterError::Rejected("no reference price yet".into()))
        }
    }

    fn open(&self, qty: f64, side: PositionSide) -> AdapterResult<Fill> {
        if qty <= 0.0 {
            return Err(AdapterError::Rejected("non-positive quantity".into()));
        }
        let price = self.fill_price()?;
        if qty * price < SIM_MIN_NOTIONAL {
            return Err(AdapterError::MinNotional);
        }

        let mut inner = self.inner.lock();
        if let Some(pos) = &inner.position {
            if pos.side != side {
                // Reversal must be modeled as close-then-open by the caller.
                return Err(AdapterError::Rejected(
                    "opposite position already open".into(),
                ));
            }
        }

        let fee = qty * price * self.fee_rate;
        if fee > inner.balance {
            return Err(AdapterError::InsufficientMargin);
        }
        inner.balance -= fee;

        match inner.position.as_mut() {
            // Same-direction add: average the entry.
            Some(pos) => {
                let total = pos.qty + qty;
                pos.entry_price = (pos.entry_price * pos.qty + price * qty) / total;
                pos.qty = total;
            }
            None => {
                inner.position = Some(SimPosition {
                    side,
                    qty,
                    entry_price: price,
                });
            }
        }

        debug!(symbol = %self.symbol, side = %side, qty, price, fee, "sim open fill");
        Ok(Fill {
            order_id: Uuid::new_v4().to_string(),
            qty,
            fill_price: price,
            fee,
            ts: crate::binance::BinanceClient::timestamp_ms(),
        })
    }

    fn close(&self, qty: f64, side: PositionSide) -> AdapterResult<Fill> {
        if qty <= 0.0 {
            return Err(AdapterError::Rejected("non-positive quantity".into()));
        }
        let price = self.fill_price()?;

        let mut inner = self.inner.lock();
        let pos = match &mut inner.position {
            Some(pos) if pos.side == side => pos,
            _ => return Err(AdapterError::NoPosition),
        };

        let close_qty = qty.min(pos.qty);
        let pnl = match side {
            PositionSide::Long => (price - pos.entry_price) * close_qty,
            PositionSide::Short => (pos.entry_price - price) * close_qty,
        };
        let fee = close_qty * price * self.fee_rate;

        pos.qty -= close_qty;
        if pos.qty <= f64::EPSILON {
            inner.position = None;
        }
        inner.balance += pnl - fee;

        debug!(symbol = %self.symbol, side = %side, close_qty, price, pnl, fee, "sim close fill");
        Ok(Fill {
            order_id: Uuid::new_v4().to_string(),
            qty: close_qty,
            fill_price: price,
            fee,
            ts: crate::binance::BinanceClient::timestamp_ms(),
        })
    }
}

#[async_trait]
impl TradeAdapter for SimAdapter {
    async fn balance(&self) -> AdapterResult<f64> {
        Ok(self.inner.lock().balance)
    }

    async fn positions(&self, symbol: &str) -> AdapterResult<Vec<Position>> {
        if symbol != self.symbol {
            warn!(requested = symbol, own = %self.symbol, "sim adapter asked about a foreign symbol");
            return Ok(Vec::new());
        }
        let inner = self.inner.lock();
        Ok(inner
            .position
            .as_ref()
            .map(|pos| Position {
                symbol: self.symbol.clone(),
                side: pos.side,
                qty: pos.qty,
                entry_price: pos.entry_price,
                opened_at: 0,
            })
            .into_iter()
            .collect())
    }

    async fn open_long(&self, _symbol: &str, qty: f64) -> AdapterResult<Fill> {
        self.open(qty, PositionSide::Long)
    }

    async fn open_short(&self, _symbol: &str, qty: f64) -> AdapterResult<Fill> {
        self.open(qty, PositionSide::Short)
    }

    async fn close_long(&self, _symbol: &str, qty: f64) -> AdapterResult<Fill> {
        self.close(qty, PositionSide::Long)
    }

    async fn close_short(&self, _symbol: &str, qty: f64) -> AdapterResult<Fill> {
        self.close(qty, PositionSide::Short)
    }

    fn lot_step(&self) -> f64 {
        self.lot_step
    }
}
