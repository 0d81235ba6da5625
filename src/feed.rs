// =============================================================================
// Market Feed — REST bootstrap + live kline WebSocket
// =============================================================================
//
// Two phases, run in order. Bootstrap fills the kline cache over REST
// (idempotent upserts, gap-fill against what the store already holds). The
// stream then pushes live updates: a forming bar mutates the tail row and the
// shared last-price cell; a finalized bar is upserted and emits exactly one
// BarClosed to the engine over a bounded channel. Losing a bar close is
// unacceptable, so a full channel blocks the feed instead of dropping.
//
// Reconnects back off exponentially (1 s doubling to a 30 s cap) and re-run
// bootstrap so bars missed during the outage land in the store; the emission
// watermark keeps BarClosed strictly increasing across reconnects.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::binance::BinanceClient;
use crate::store::Store;
use crate::types::{Interval, Kline};

/// The sole trigger the engine responds to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarClosed {
    pub open_time: i64,
    pub close: f64,
}

/// Bounded capacity of the BarClosed channel.
pub const BAR_CHANNEL_CAPACITY: usize = 8;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Streaming kline payload: the row plus whether the bar is finalized.
#[derive(Debug, Clone)]
struct StreamKline {
    kline: Kline,
    is_closed: bool,
}

/// Two-phase market data producer for one `(symbol, interval)`.
pub struct MarketFeed {
    client: BinanceClient,
    store: Arc<Store>,
    symbol: String,
    interval: Interval,
    bootstrap_bars: usize,
    stream_base: String,
    last_price: Arc<RwLock<f64>>,
    tx: mpsc::Sender<BarClosed>,
}

impl MarketFeed {
    pub fn new(
        client: BinanceClient,
        store: Arc<Store>,
        symbol: impl Into<String>,
        interval: Interval,
        boll_period: usize,
        last_price: Arc<RwLock<f64>>,
        tx: mpsc::Sender<BarClosed>,
    ) -> Self {
        Self {
            client,
            store,
            symbol: symbol.into(),
            interval,
            bootstrap_bars: boll_period.max(50),
            stream_base: "wss://fstream.binance.com/ws".to_string(),
            last_price,
            tx,
        }
    }

    // -------------------------------------------------------------------------
    // Phase 1: REST bootstrap
    // -------------------------------------------------------------------------

    /// Fetch the most recent bars over REST and upsert them, then close any
    /// gap between what the store already held and the fetched window.
    /// Returns the number of rows upserted.
    pub async fn bootstrap(&self) -> Result<usize> {
        let interval = self.interval.as_str();
        let stored_latest = self.store.latest_kline_time(&self.symbol, interval)?;

        let rows = self
            .client
            .klines(&self.symbol, interval, self.bootstrap_bars as u32, None)
            .await
            .context("bootstrap kline fetch failed")?;
        if rows.is_empty() {
            anyhow::bail!("bootstrap returned no klines for {}", self.symbol);
        }

        let oldest_fetched = rows[0].open_time;
        let outcome = self.store.upsert_klines(&self.symbol, interval, &rows)?;
        let mut total = rows.len();

        // Gap-fill: the store's history ends more than one interval before
        // the fetched window starts.
        let dur = self.interval.duration_ms();
        if stored_latest > 0 && stored_latest + dur < oldest_fetched {
            let mut cursor = stored_latest + dur;
            while cursor < oldest_fetched {
                let fill = self
                    .client
                    .klines(&self.symbol, interval, 1000, Some(cursor))
                    .await
                    .context("gap-fill kline fetch failed")?;
                if fill.is_empty() {
                    break;
                }
                let last = fill.last().map(|k| k.open_time).unwrap_or(cursor);
                self.store.upsert_klines(&self.symbol, interval, &fill)?;
                total += fill.len();
                cursor = last + dur;
            }
        }

        info!(
            symbol = %self.symbol,
            interval = %self.interval,
            rows = total,
            inserted = outcome.inserted,
            replaced = outcome.replaced,
            "bootstrap complete"
        );
        Ok(total)
    }

    // -------------------------------------------------------------------------
    // Phase 2: streaming
    // -------------------------------------------------------------------------

    /// Run the stream until shutdown. Reconnects internally with exponential
    /// backoff; each reconnect re-runs bootstrap to recover missed bars.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF;
        // Highest open_time ever emitted; bars at or below it are not
        // re-emitted after a reconnect.
        let mut watermark: i64 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self
                .run_stream_once(&mut watermark, &mut backoff, &mut shutdown)
                .await
            {
                Ok(()) => {
                    // Clean shutdown requested.
                    break;
                }
                Err(e) => {
                    error!(
                        symbol = %self.symbol,
                        error = %e,
                        backoff_s = backoff.as_secs(),
                        "kline stream error, reconnecting"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => break,
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);

            // Recover anything missed during the outage; duplicates are
            // absorbed by the idempotent upsert.
            if let Err(e) = self.bootstrap().await {
                warn!(symbol = %self.symbol, error = %e, "re-bootstrap after reconnect failed");
            }
        }

        info!(symbol = %self.symbol, "market feed stopped");
    }

    /// One connection lifetime. Returns Ok(()) only on shutdown; any stream
    /// failure surfaces as an error so the caller can back off.
    async fn run_stream_once(
        &self,
        watermark: &mut i64,
        backoff: &mut Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let url = format!(
            "{}/{}@kline_{}",
            self.stream_base,
            self.symbol.to_lowercase(),
            self.interval.as_str()
        );
        info!(url = %url, "connecting to kline WebSocket");

        let (ws_stream, _response) = connect_async(&url)
            .await
            .context("failed to connect to kline WebSocket")?;
        info!(symbol = %self.symbol, interval = %self.interval, "kline WebSocket connected");
        // A healthy connection resets the reconnect schedule.
        *backoff = INITIAL_BACKOFF;

        let (_write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                        match parse_kline_message(&text) {
                            Ok(update) => self.apply_update(update, watermark).await?,
                            Err(e) => warn!(error = %e, "failed to parse kline message"),
                        }
                    }
                    // tungstenite answers pings itself; other frames are noise.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(e).context("kline WebSocket read error");
                    }
                    None => {
                        anyhow::bail!("kline WebSocket stream ended");
                    }
                },
                _ = shutdown.changed() => {
                    return Ok(());
                }
            }
        }
    }

    /// Apply one stream update: forming bars touch the tail row and the
    /// last-price cell; finalized bars emit a BarClosed past the watermark.
    async fn apply_update(&self, update: StreamKline, watermark: &mut i64) -> Result<()> {
        let interval = self.interval.as_str();
        *self.last_price.write() = update.kline.close;

        self.store
            .upsert_klines(&self.symbol, interval, std::slice::from_ref(&update.kline))?;

        if !update.is_closed {
            return Ok(());
        }

        if update.kline.open_time <= *watermark {
            debug!(
                open_time = update.kline.open_time,
                watermark = *watermark,
                "suppressing duplicate bar close"
            );
            return Ok(());
        }
        *watermark = update.kline.open_time;

        let event = BarClosed {
            open_time: update.kline.open_time,
            close: update.kline.close,
        };
        debug!(open_time = event.open_time, close = event.close, "bar closed");

        // Backpressure: block rather than drop.
        self.tx
            .send(event)
            .await
            .context("engine closed the BarClosed channel")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Message parsing
// ---------------------------------------------------------------------------

/// Parse a kline stream message. Handles both the single-stream payload and
/// the combined-stream envelope:
/// ```json
/// { "e": "kline", "s": "BTCUSDT", "k": { "t": ..., "x": false, ... } }
/// ```
fn parse_kline_message(text: &str) -> Result<StreamKline> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };
    let k = &data["k"];
    if k.is_null() {
        anyhow::bail!("message has no kline payload");
    }

    let kline = Kline {
        open_time: k["t"].as_i64().context("missing field k.t")?,
        close_time: k["T"].as_i64().context("missing field k.T")?,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        volume: parse_string_f64(&k["v"], "k.v")?,
        quote_volume: parse_string_f64(&k["q"], "k.q")?,
        trades: k["n"].as_i64().context("missing field k.n")?,
        taker_buy_base: parse_string_f64(&k["V"], "k.V")?,
        taker_buy_quote: parse_string_f64(&k["Q"], "k.Q")?,
    };
    let is_closed = k["x"].as_bool().context("missing field k.x")?;

    Ok(StreamKline { kline, is_closed })
}

/// Kline payloads quote their numbers ("37020.00"); tolerate plain JSON
/// numbers too.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    if let Some(n) = val.as_f64() {
        return Ok(n);
    }
    val.as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .with_context(|| format!("kline field {name} is not numeric: {val}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
