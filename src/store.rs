// =============================================================================
// Store — durable SQLite state: klines, positions, trades, logs
// =============================================================================
//
// Four relations, one writer discipline: the engine task performs all
// position/trade writes, the feed task performs kline upserts, the dashboard
// only reads. Kline upserts are idempotent on (symbol, interval, open_time);
// the trade rows of one bar-close handler and the accompanying position
// replace commit in a single transaction so a reader never observes a partial
// position+trade view.
// =============================================================================

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::types::{Kline, LogLevel, Position, PositionSide, Trade, TradeSide};

/// Storage failure. Fatal for the operation that hit it; `main` maps an open
/// failure to exit code 4.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Maximum rows retained in the `logs` ring.
const MAX_LOG_ROWS: i64 = 1000;

/// Outcome of a kline upsert batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub replaced: usize,
}

/// How a bar commit changes the position row.
#[derive(Debug, Clone)]
pub enum PositionUpdate {
    /// Leave the position row untouched.
    Keep,
    /// Replace (or create) the singleton row for the symbol.
    Set(Position),
    /// Remove the row for the symbol.
    Clear(String),
}

/// One durable log line.
#[derive(Debug, Clone, Serialize)]
pub struct LogRow {
    pub ts: i64,
    pub level: String,
    pub message: String,
}

/// Per-day profit aggregation row. Trade counts cover closing trades only;
/// fees cover every fill of the day; `net_pnl = gross_pnl - fees`.
#[derive(Debug, Clone, Serialize)]
pub struct ProfitRow {
    pub date: String,
    pub trade_count: i64,
    pub profit_count: i64,
    pub loss_count: i64,
    pub gross_pnl: f64,
    pub fees: f64,
    pub net_pnl: f64,
}

/// Daily rows (newest first) plus a cumulative summary.
#[derive(Debug, Clone, Serialize)]
pub struct ProfitSummary {
    pub total: ProfitRow,
    pub days: Vec<ProfitRow>,
}

/// SQLite-backed store. The connection sits behind a mutex; callers hold it
/// only for the duration of one operation.
pub struct Store {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
BEGIN;
CREATE TABLE IF NOT EXISTS klines (
    symbol          TEXT NOT NULL,
    interval        TEXT NOT NULL,
    open_time       INTEGER NOT NULL,
    close_time      INTEGER NOT NULL,
    open            REAL NOT NULL,
    high            REAL NOT NULL,
    low             REAL NOT NULL,
    close           REAL NOT NULL,
    volume          REAL NOT NULL,
    quote_volume    REAL NOT NULL,
    trades          INTEGER NOT NULL,
    taker_buy_base  REAL NOT NULL,
    taker_buy_quote REAL NOT NULL,
    UNIQUE(symbol, interval, open_time)
);
CREATE INDEX IF NOT EXISTS idx_klines_key
    ON klines(symbol, interval, open_time);
CREATE TABLE IF NOT EXISTS positions (
    symbol      TEXT PRIMARY KEY,
    side        TEXT NOT NULL,
    qty         REAL NOT NULL,
    entry_price REAL NOT NULL,
    ts          INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS trades (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    ts       INTEGER NOT NULL,
    symbol   TEXT NOT NULL,
    side     TEXT NOT NULL,
    qty      REAL NOT NULL,
    price    REAL NOT NULL,
    fee      REAL NOT NULL,
    pnl      REAL NOT NULL,
    simulate INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_trades_ts ON trades(ts);
CREATE TABLE IF NOT EXISTS logs (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    ts      INTEGER NOT NULL,
    level   TEXT NOT NULL,
    message TEXT NOT NULL
);
COMMIT;
";

impl Store {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: &str) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        debug!(path, "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests.
    #[cfg(test)]
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // -------------------------------------------------------------------------
    // Klines
    // -------------------------------------------------------------------------

    /// Idempotently upsert kline rows. Existing rows with the same
    /// (symbol, interval, open_time) are overwritten in place, which is how
    /// the forming tail bar gets its streaming updates.
    pub fn upsert_klines(
        &self,
        symbol: &str,
        interval: &str,
        rows: &[Kline],
    ) -> StoreResult<UpsertOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut outcome = UpsertOutcome {
            inserted: 0,
            replaced: 0,
        };
        {
            let mut exists = tx.prepare_cached(
                "SELECT 1 FROM klines WHERE symbol = ?1 AND interval = ?2 AND open_time = ?3",
            )?;
            let mut upsert = tx.prepare_cached(
                "INSERT INTO klines (
                    symbol, interval, open_time, close_time,
                    open, high, low, close,
                    volume, quote_volume, trades, taker_buy_base, taker_buy_quote
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(symbol, interval, open_time) DO UPDATE SET
                    close_time = excluded.close_time,
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume,
                    quote_volume = excluded.quote_volume,
                    trades = excluded.trades,
                    taker_buy_base = excluded.taker_buy_base,
                    taker_buy_quote = excluded.taker_buy_quote",
            )?;
            for k in rows {
                let already: Option<i64> = exists
                    .query_row(params![symbol, interval, k.open_time], |r| r.get(0))
                    .optional()?;
                upsert.execute(params![
                    symbol,
                    interval,
                    k.open_time,
                    k.close_time,
                    k.open,
                    k.high,
                    k.low,
                    k.close,
                    k.volume,
                    k.quote_volume,
                    k.trades,
                    k.taker_buy_base,
                    k.taker_buy_quote,
                ])?;
                if already.is_some() {
                    outcome.replaced += 1;
                } else {
                    outcome.inserted += 1;
                }
            }
        }
        tx.commit()?;
        Ok(outcome)
    }

    /// Last `limit` kline rows, ascending by open_time.
    pub fn fetch_klines(&self, symbol: &str, interval: &str, limit: usize) -> StoreResult<Vec<Kline>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT open_time, close_time, open, high, low, close,
                    volume, quote_volume, trades, taker_buy_base, taker_buy_quote
             FROM klines
             WHERE symbol = ?1 AND interval = ?2
             ORDER BY open_time DESC
             LIMIT ?3",
        )?;
        let mut rows: Vec<Kline> = stmt
            .query_map(params![symbol, interval, limit as i64], |r| {
                Ok(Kline {
                    open_time: r.get(0)?,
                    close_time: r.get(1)?,
                    open: r.get(2)?,
                    high: r.get(3)?,
                    low: r.get(4)?,
                    close: r.get(5)?,
                    volume: r.get(6)?,
                    quote_volume: r.get(7)?,
                    trades: r.get(8)?,
                    taker_buy_base: r.get(9)?,
                    taker_buy_quote: r.get(10)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    /// Last `limit` close prices with open_time <= `up_to`, ascending. The
    /// engine uses this to exclude a forming tail bar from its window.
    pub fn fetch_closes_up_to(
        &self,
        symbol: &str,
        interval: &str,
        up_to: i64,
        limit: usize,
    ) -> StoreResult<Vec<f64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT close FROM klines
             WHERE symbol = ?1 AND interval = ?2 AND open_time <= ?3
             ORDER BY open_time DESC
             LIMIT ?4",
        )?;
        let mut closes: Vec<f64> = stmt
            .query_map(params![symbol, interval, up_to, limit as i64], |r| r.get(0))?
            .collect::<Result<_, _>>()?;
        closes.reverse();
        Ok(closes)
    }

    /// Max open_time for the series, or 0 when empty.
    pub fn latest_kline_time(&self, symbol: &str, interval: &str) -> StoreResult<i64> {
        let conn = self.conn.lock();
        let t: Option<i64> = conn.query_row(
            "SELECT MAX(open_time) FROM klines WHERE symbol = ?1 AND interval = ?2",
            params![symbol, interval],
            |r| r.get(0),
        )?;
        Ok(t.unwrap_or(0))
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    pub fn get_position(&self, symbol: &str) -> StoreResult<Option<Position>> {
        let conn = self.conn.lock();
        Self::read_position(&conn, symbol)
    }

    fn read_position(conn: &Connection, symbol: &str) -> StoreResult<Option<Position>> {
        let row = conn
            .query_row(
                "SELECT symbol, side, qty, entry_price, ts FROM positions WHERE symbol = ?1",
                params![symbol],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, f64>(2)?,
                        r.get::<_, f64>(3)?,
                        r.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((symbol, side, qty, entry_price, ts)) => {
                let side = PositionSide::parse(&side)
                    .ok_or_else(|| StoreError::Corrupt(format!("position side '{side}'")))?;
                Ok(Some(Position {
                    symbol,
                    side,
                    qty,
                    entry_price,
                    opened_at: ts,
                }))
            }
        }
    }

    pub fn set_position(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        entry_price: f64,
        ts: i64,
    ) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO positions (symbol, side, qty, entry_price, ts)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(symbol) DO UPDATE SET
                side = excluded.side,
                qty = excluded.qty,
                entry_price = excluded.entry_price,
                ts = excluded.ts",
            params![symbol, side.as_str(), qty, entry_price, ts],
        )?;
        Ok(())
    }

    pub fn clear_position(&self, symbol: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM positions WHERE symbol = ?1", params![symbol])?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Trades / logs
    // -------------------------------------------------------------------------

    pub fn append_trade(&self, trade: &Trade) -> StoreResult<()> {
        let conn = self.conn.lock();
        Self::insert_trade(&conn, trade)?;
        Ok(())
    }

    fn insert_trade(conn: &Connection, trade: &Trade) -> StoreResult<()> {
        conn.execute(
            "INSERT INTO trades (ts, symbol, side, qty, price, fee, pnl, simulate)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                trade.ts,
                trade.symbol,
                trade.side.as_str(),
                trade.qty,
                trade.price,
                trade.fee,
                trade.pnl,
                trade.simulate as i64,
            ],
        )?;
        Ok(())
    }

    /// Last `limit` trades, descending by ts.
    pub fn fetch_trades(&self, symbol: &str, limit: usize) -> StoreResult<Vec<Trade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT ts, symbol, side, qty, price, fee, pnl, simulate
             FROM trades
             WHERE symbol = ?1
             ORDER BY ts DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![symbol, limit as i64], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, f64>(3)?,
                r.get::<_, f64>(4)?,
                r.get::<_, f64>(5)?,
                r.get::<_, f64>(6)?,
                r.get::<_, i64>(7)?,
            ))
        })?;
        let mut trades = Vec::new();
        for row in rows {
            let (ts, symbol, side, qty, price, fee, pnl, simulate) = row?;
            let side = TradeSide::parse(&side)
                .ok_or_else(|| StoreError::Corrupt(format!("trade side '{side}'")))?;
            trades.push(Trade {
                ts,
                symbol,
                side,
                qty,
                price,
                fee,
                pnl,
                simulate: simulate != 0,
            });
        }
        Ok(trades)
    }

    /// Append one log line and trim the ring to its cap.
    pub fn append_log(&self, ts: i64, level: LogLevel, message: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO logs (ts, level, message) VALUES (?1, ?2, ?3)",
            params![ts, level.as_str(), message],
        )?;
        conn.execute(
            "DELETE FROM logs WHERE id NOT IN
                 (SELECT id FROM logs ORDER BY id DESC LIMIT ?1)",
            params![MAX_LOG_ROWS],
        )?;
        Ok(())
    }

    /// Last `limit` log lines, descending by insertion order.
    pub fn fetch_logs(&self, limit: usize) -> StoreResult<Vec<LogRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT ts, level, message FROM logs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |r| {
                Ok(LogRow {
                    ts: r.get(0)?,
                    level: r.get(1)?,
                    message: r.get(2)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Bar commit — trades + position change, atomically
    // -------------------------------------------------------------------------

    /// Persist everything one bar-close handler produced in a single
    /// transaction: zero or more trade rows plus the position replace/clear.
    /// Either all of it commits or none of it does.
    pub fn commit_bar(&self, trades: &[Trade], update: PositionUpdate) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for trade in trades {
            Self::insert_trade(&tx, trade)?;
        }
        match &update {
            PositionUpdate::Keep => {}
            PositionUpdate::Set(pos) => {
                tx.execute(
                    "INSERT INTO positions (symbol, side, qty, entry_price, ts)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(symbol) DO UPDATE SET
                        side = excluded.side,
                        qty = excluded.qty,
                        entry_price = excluded.entry_price,
                        ts = excluded.ts",
                    params![pos.symbol, pos.side.as_str(), pos.qty, pos.entry_price, pos.opened_at],
                )?;
            }
            PositionUpdate::Clear(symbol) => {
                tx.execute("DELETE FROM positions WHERE symbol = ?1", params![symbol])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Aggregations (dashboard only)
    // -------------------------------------------------------------------------

    /// Per-UTC-day PnL rows (newest first) plus a cumulative summary. Trade
    /// counts cover closing trades; fees cover every fill; PnL is stored
    /// gross, so net is derived here.
    pub fn daily_profit_summary(&self, symbol: &str) -> StoreResult<ProfitSummary> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT date(ts / 1000, 'unixepoch') AS day,
                    SUM(CASE WHEN side IN ('CLOSE_LONG','CLOSE_SHORT') THEN 1 ELSE 0 END),
                    SUM(CASE WHEN side IN ('CLOSE_LONG','CLOSE_SHORT') AND pnl > 0 THEN 1 ELSE 0 END),
                    SUM(CASE WHEN side IN ('CLOSE_LONG','CLOSE_SHORT') AND pnl < 0 THEN 1 ELSE 0 END),
                    SUM(CASE WHEN side IN ('CLOSE_LONG','CLOSE_SHORT') THEN pnl ELSE 0.0 END),
                    SUM(fee)
             FROM trades
             WHERE symbol = ?1
             GROUP BY day
             ORDER BY day DESC",
        )?;
        let days: Vec<ProfitRow> = stmt
            .query_map(params![symbol], |r| {
                let gross: f64 = r.get(4)?;
                let fees: f64 = r.get(5)?;
                Ok(ProfitRow {
                    date: r.get(0)?,
                    trade_count: r.get(1)?,
                    profit_count: r.get(2)?,
                    loss_count: r.get(3)?,
                    gross_pnl: gross,
                    fees,
                    net_pnl: gross - fees,
                })
            })?
            .collect::<Result<_, _>>()?;

        let mut total = ProfitRow {
            date: "total".to_string(),
            trade_count: 0,
            profit_count: 0,
            loss_count: 0,
            gross_pnl: 0.0,
            fees: 0.0,
            net_pnl: 0.0,
        };
        for d in &days {
            total.trade_count += d.trade_count;
            total.profit_count += d.profit_count;
            total.loss_count += d.loss_count;
            total.gross_pnl += d.gross_pnl;
            total.fees += d.fees;
        }
        total.net_pnl = total.gross_pnl - total.fees;

        Ok(ProfitSummary { total, days })
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn kline(open_time: i64, close: f64) -> Kline {
        Kline {
            open_time,
            close_time: open_time + 899_999,
            open: close - 1.0,
            high: close + 2.0,
            low: close - 2.0,
            close,
            volume: 10.0,
            quote_volume: 1000.0,
            trades: 42,
            taker_buy_base: 5.0,
            taker_buy_quote: 500.0,
        }
    }

    fn trade(ts: i64, side: TradeSide, pnl: f64, fee: f64) -> Trade {
        Trade {
            ts,
            symbol: "BTCUSDT".into(),
            side,
            qty: 1.0,
            price: 100.0,
            fee,
            pnl,
            simulate: true,
        }
    }

    #[test]
    fn upsert_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let rows: Vec<Kline> = (0..60).map(|i| kline(i * 900_000, 100.0 + i as f64)).collect();

        let first = store.upsert_klines("BTCUSDT", "15m", &rows).unwrap();
        assert_eq!(first.inserted, 60);
        assert_eq!(first.replaced, 0);

        // Overlapping re-delivery in a different order changes nothing.
        let mut overlap: Vec<Kline> = rows[20..].to_vec();
        overlap.reverse();
        let second = store.upsert_klines("BTCUSDT", "15m", &overlap).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.replaced, 40);

        let fetched = store.fetch_klines("BTCUSDT", "15m", 100).unwrap();
        assert_eq!(fetched.len(), 60);
        assert!((fetched[0].close - 100.0).abs() < 1e-12);
        assert!((fetched[59].close - 159.0).abs() < 1e-12);
    }

    #[test]
    fn fetch_klines_returns_ascending_tail() {
        let store = Store::open_in_memory().unwrap();
        let rows: Vec<Kline> = (0..10).map(|i| kline(i * 900_000, i as f64)).collect();
        store.upsert_klines("BTCUSDT", "15m", &rows).unwrap();

        let tail = store.fetch_klines("BTCUSDT", "15m", 3).unwrap();
        let times: Vec<i64> = tail.iter().map(|k| k.open_time).collect();
        assert_eq!(times, vec![7 * 900_000, 8 * 900_000, 9 * 900_000]);
    }

    #[test]
    fn closes_up_to_excludes_forming_tail() {
        let store = Store::open_in_memory().unwrap();
        let rows: Vec<Kline> = (0..5).map(|i| kline(i * 900_000, i as f64)).collect();
        store.upsert_klines("BTCUSDT", "15m", &rows).unwrap();

        let closes = store
            .fetch_closes_up_to("BTCUSDT", "15m", 3 * 900_000, 10)
            .unwrap();
        assert_eq!(closes, vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn latest_kline_time_defaults_to_zero() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.latest_kline_time("BTCUSDT", "15m").unwrap(), 0);
        store
            .upsert_klines("BTCUSDT", "15m", &[kline(900_000, 1.0)])
            .unwrap();
        assert_eq!(store.latest_kline_time("BTCUSDT", "15m").unwrap(), 900_000);
    }

    #[test]
    fn position_is_a_singleton_per_symbol() {
        let store = Store::open_in_memory().unwrap();
        store
            .set_position("BTCUSDT", PositionSide::Short, 1.0, 100.0, 1)
            .unwrap();
        store
            .set_position("BTCUSDT", PositionSide::Long, 2.0, 98.0, 2)
            .unwrap();

        let pos = store.get_position("BTCUSDT").unwrap().unwrap();
        assert_eq!(pos.side, PositionSide::Long);
        assert!((pos.qty - 2.0).abs() < 1e-12);

        store.clear_position("BTCUSDT").unwrap();
        assert!(store.get_position("BTCUSDT").unwrap().is_none());
    }

    #[test]
    fn commit_bar_writes_trades_and_position_together() {
        let store = Store::open_in_memory().unwrap();
        store
            .set_position("BTCUSDT", PositionSide::Short, 1.0, 100.0, 1)
            .unwrap();

        // Close-and-reverse: two trade rows, position flips to long.
        let trades = vec![
            trade(10, TradeSide::CloseShort, 2.0, 0.05),
            trade(10, TradeSide::Buy, 0.0, 0.05),
        ];
        store
            .commit_bar(
                &trades,
                PositionUpdate::Set(Position {
                    symbol: "BTCUSDT".into(),
                    side: PositionSide::Long,
                    qty: 1.0,
                    entry_price: 98.0,
                    opened_at: 10,
                }),
            )
            .unwrap();

        let pos = store.get_position("BTCUSDT").unwrap().unwrap();
        assert_eq!(pos.side, PositionSide::Long);
        let rows = store.fetch_trades("BTCUSDT", 10).unwrap();
        assert_eq!(rows.len(), 2);
        // Descending: the open leg was inserted last.
        assert_eq!(rows[0].side, TradeSide::Buy);
        assert_eq!(rows[1].side, TradeSide::CloseShort);
    }

    #[test]
    fn log_ring_is_capped() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..(MAX_LOG_ROWS + 50) {
            store.append_log(i, LogLevel::Info, &format!("line {i}")).unwrap();
        }
        let logs = store.fetch_logs(2000).unwrap();
        assert_eq!(logs.len(), MAX_LOG_ROWS as usize);
        // Newest first, oldest 50 evicted.
        assert_eq!(logs[0].ts, MAX_LOG_ROWS + 49);
        assert_eq!(logs.last().unwrap().ts, 50);
    }

    #[test]
    fn daily_summary_derives_net_from_gross() {
        let store = Store::open_in_memory().unwrap();
        let day_ms = 86_400_000i64;
        // Day 0: open + profitable close. Day 1: open + losing close.
        store.append_trade(&trade(100, TradeSide::Sell, 0.0, 0.1)).unwrap();
        store
            .append_trade(&trade(200, TradeSide::CloseShort, 5.0, 0.1))
            .unwrap();
        store
            .append_trade(&trade(day_ms + 100, TradeSide::Buy, 0.0, 0.2))
            .unwrap();
        store
            .append_trade(&trade(day_ms + 200, TradeSide::CloseLong, -3.0, 0.2))
            .unwrap();

        let summary = store.daily_profit_summary("BTCUSDT").unwrap();
        assert_eq!(summary.days.len(), 2);

        // Newest day first.
        let newest = &summary.days[0];
        assert_eq!(newest.trade_count, 1);
        assert_eq!(newest.loss_count, 1);
        assert!((newest.gross_pnl + 3.0).abs() < 1e-12);
        assert!((newest.fees - 0.4).abs() < 1e-12);
        assert!((newest.net_pnl + 3.4).abs() < 1e-12);

        let total = &summary.total;
        assert_eq!(total.trade_count, 2);
        assert_eq!(total.profit_count, 1);
        assert!((total.gross_pnl - 2.0).abs() < 1e-12);
        assert!((total.net_pnl - (2.0 - 0.6)).abs() < 1e-12);
    }

    #[test]
    fn reopen_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bandline.db");
        let path = path.to_str().unwrap();

        {
            let store = Store::open(path).unwrap();
            store
                .upsert_klines("BTCUSDT", "15m", &[kline(900_000, 42.0)])
                .unwrap();
            store
                .set_position("BTCUSDT", PositionSide::Short, 1.5, 42.0, 900_000)
                .unwrap();
        }

        let store = Store::open(path).unwrap();
        assert_eq!(store.latest_kline_time("BTCUSDT", "15m").unwrap(), 900_000);
        let pos = store.get_position("BTCUSDT").unwrap().unwrap();
        assert_eq!(pos.side, PositionSide::Short);
        assert!((pos.qty - 1.5).abs() < 1e-12);
    }
}
