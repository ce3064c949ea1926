//! SQLite-backed persistence.
//!
//! One connection behind a `parking_lot::Mutex`, WAL mode, schema applied at
//! open. Calls are short and index-backed, so holding the lock across a
//! statement is fine even from async tasks.
//!
//! Unique indexes the engine relies on:
//! - `(mm_id, outcome, side, tier)` on tracked orders (one slot per key);
//! - `(order_id, matched_total)` on pending fill events;
//! - `(order_id, matched_total)` on applied-fill keys (apply_fill idempotency).

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::config::RuntimeSettings;
use crate::errors::EngineResult;
use crate::types::{
    Candidate, FillRecord, Market, MmConfig, MmRecord, MmState, OrderKey, OrderSide, Outcome,
    PendingFillEvent, PendingFillStatus, PriceRange, QuoteEvent, QuoteEventKind, TrackedOrder,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS markets (
    market_id     TEXT PRIMARY KEY,
    venue         TEXT NOT NULL,
    question      TEXT NOT NULL DEFAULT '',
    yes_token     TEXT NOT NULL,
    no_token      TEXT NOT NULL,
    price_ranges  TEXT NOT NULL DEFAULT '[]',
    yes_mid       REAL,
    no_mid        REAL,
    last_updated  TEXT,
    end_time      TEXT,
    active        INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS market_makers (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id     TEXT NOT NULL UNIQUE REFERENCES markets(market_id),
    active        INTEGER NOT NULL DEFAULT 1,
    paused        INTEGER NOT NULL DEFAULT 0,
    config        TEXT NOT NULL,
    yes_inventory REAL NOT NULL DEFAULT 0,
    no_inventory  REAL NOT NULL DEFAULT 0,
    avg_yes_cost  REAL NOT NULL DEFAULT 0,
    avg_no_cost   REAL NOT NULL DEFAULT 0,
    realized_pnl  REAL NOT NULL DEFAULT 0,
    last_quote_at TEXT,
    volatility_pause_until TEXT
);

CREATE TABLE IF NOT EXISTS tracked_orders (
    mm_id         INTEGER NOT NULL REFERENCES market_makers(id),
    outcome       TEXT NOT NULL,
    side          TEXT NOT NULL,
    tier          INTEGER NOT NULL DEFAULT 0,
    order_id      TEXT NOT NULL,
    client_order_id TEXT,
    order_group_id  TEXT,
    token         TEXT NOT NULL,
    price         REAL NOT NULL,
    size          REAL NOT NULL,
    last_matched_size REAL,
    placed_at     TEXT NOT NULL,
    UNIQUE (mm_id, outcome, side, tier)
);
CREATE INDEX IF NOT EXISTS idx_tracked_order_id ON tracked_orders(order_id);

CREATE TABLE IF NOT EXISTS fills (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    mm_id         INTEGER NOT NULL,
    outcome       TEXT NOT NULL,
    side          TEXT NOT NULL,
    price         REAL NOT NULL,
    size          REAL NOT NULL,
    value         REAL NOT NULL,
    realized_pnl_delta REAL NOT NULL DEFAULT 0,
    filled_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_fills_mm ON fills(mm_id, filled_at DESC);

CREATE TABLE IF NOT EXISTS pending_fill_events (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    mm_id         INTEGER NOT NULL,
    order_id      TEXT NOT NULL,
    matched_total REAL NOT NULL,
    outcome       TEXT NOT NULL,
    side          TEXT NOT NULL,
    price         REAL NOT NULL,
    size          REAL NOT NULL,
    status        TEXT NOT NULL DEFAULT 'PENDING',
    observed_at   TEXT NOT NULL,
    UNIQUE (order_id, matched_total)
);
CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_fill_events(status, observed_at);

CREATE TABLE IF NOT EXISTS applied_fill_keys (
    order_id      TEXT NOT NULL,
    matched_total REAL NOT NULL,
    applied_at    TEXT NOT NULL,
    UNIQUE (order_id, matched_total)
);

CREATE TABLE IF NOT EXISTS quote_history (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    mm_id         INTEGER NOT NULL,
    kind          TEXT NOT NULL,
    payload       TEXT NOT NULL DEFAULT '{}',
    at            TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_mm ON quote_history(mm_id, at DESC);

CREATE TABLE IF NOT EXISTS candidates (
    market_id     TEXT PRIMARY KEY,
    venue         TEXT NOT NULL,
    payload       TEXT NOT NULL,
    scored_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
    key           TEXT PRIMARY KEY,
    value         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS advisory_locks (
    name          TEXT PRIMARY KEY,
    holder        TEXT NOT NULL,
    acquired_at   TEXT NOT NULL,
    expires_at    TEXT NOT NULL
);
"#;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

fn parse_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        info!("💾 store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ─────────────────────────────────────────────────
    // Markets
    // ─────────────────────────────────────────────────

    pub fn upsert_market(&self, m: &Market) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO markets (market_id, venue, question, yes_token, no_token, price_ranges,
                                  yes_mid, no_mid, last_updated, end_time, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(market_id) DO UPDATE SET
                question = excluded.question,
                price_ranges = excluded.price_ranges,
                yes_mid = excluded.yes_mid,
                no_mid = excluded.no_mid,
                last_updated = excluded.last_updated,
                end_time = excluded.end_time,
                active = excluded.active",
            params![
                m.market_id,
                m.venue,
                m.question,
                m.yes_token,
                m.no_token,
                serde_json::to_string(&m.price_ranges).unwrap_or_else(|_| "[]".into()),
                m.yes_mid,
                m.no_mid,
                m.last_updated.map(fmt_ts),
                m.end_time.map(fmt_ts),
                m.active as i64,
            ],
        )?;
        Ok(())
    }

    pub fn update_market_mids(
        &self,
        market_id: &str,
        yes_mid: f64,
        no_mid: f64,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE markets SET yes_mid = ?2, no_mid = ?3, last_updated = ?4 WHERE market_id = ?1",
            params![market_id, yes_mid, no_mid, fmt_ts(at)],
        )?;
        Ok(())
    }

    pub fn deactivate_market(&self, market_id: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE markets SET active = 0 WHERE market_id = ?1",
            params![market_id],
        )?;
        Ok(())
    }

    pub fn get_market(&self, market_id: &str) -> EngineResult<Option<Market>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT market_id, venue, question, yes_token, no_token, price_ranges,
                        yes_mid, no_mid, last_updated, end_time, active
                 FROM markets WHERE market_id = ?1",
                params![market_id],
                Self::market_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_active_markets(&self) -> EngineResult<Vec<Market>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT market_id, venue, question, yes_token, no_token, price_ranges,
                    yes_mid, no_mid, last_updated, end_time, active
             FROM markets WHERE active = 1",
        )?;
        let rows = stmt
            .query_map([], Self::market_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn market_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Market> {
        let ranges_json: String = row.get(5)?;
        let price_ranges: Vec<PriceRange> =
            serde_json::from_str(&ranges_json).unwrap_or_default();
        Ok(Market {
            market_id: row.get(0)?,
            venue: row.get(1)?,
            question: row.get(2)?,
            yes_token: row.get(3)?,
            no_token: row.get(4)?,
            price_ranges,
            yes_mid: row.get(6)?,
            no_mid: row.get(7)?,
            last_updated: parse_ts(row.get(8)?),
            end_time: parse_ts(row.get(9)?),
            active: row.get::<_, i64>(10)? != 0,
        })
    }

    // ─────────────────────────────────────────────────
    // Market makers
    // ─────────────────────────────────────────────────

    pub fn create_mm(&self, market_id: &str, config: &MmConfig) -> EngineResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO market_makers (market_id, config) VALUES (?1, ?2)",
            params![market_id, serde_json::to_string(config).unwrap_or_default()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_mm(&self, id: i64) -> EngineResult<Option<MmRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, market_id, active, paused, config, yes_inventory, no_inventory,
                        avg_yes_cost, avg_no_cost, realized_pnl, last_quote_at,
                        volatility_pause_until
                 FROM market_makers WHERE id = ?1",
                params![id],
                Self::mm_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_mm_by_market(&self, market_id: &str) -> EngineResult<Option<MmRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, market_id, active, paused, config, yes_inventory, no_inventory,
                        avg_yes_cost, avg_no_cost, realized_pnl, last_quote_at,
                        volatility_pause_until
                 FROM market_makers WHERE market_id = ?1",
                params![market_id],
                Self::mm_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_active_mms(&self) -> EngineResult<Vec<MmRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, market_id, active, paused, config, yes_inventory, no_inventory,
                    avg_yes_cost, avg_no_cost, realized_pnl, last_quote_at,
                    volatility_pause_until
             FROM market_makers WHERE active = 1",
        )?;
        let rows = stmt
            .query_map([], Self::mm_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn mm_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MmRecord> {
        let config_json: String = row.get(4)?;
        let config: MmConfig = serde_json::from_str(&config_json).unwrap_or_default();
        Ok(MmRecord {
            id: row.get(0)?,
            market_id: row.get(1)?,
            active: row.get::<_, i64>(2)? != 0,
            paused: row.get::<_, i64>(3)? != 0,
            config,
            state: MmState {
                yes_inventory: row.get(5)?,
                no_inventory: row.get(6)?,
                avg_yes_cost: row.get(7)?,
                avg_no_cost: row.get(8)?,
                realized_pnl: row.get(9)?,
                last_quote_at: parse_ts(row.get(10)?),
                volatility_pause_until: parse_ts(row.get(11)?),
            },
        })
    }

    /// Overwrite the runtime columns. Only the inventory FSM and
    /// reconciliation call this.
    pub fn write_mm_state(&self, mm_id: i64, state: &MmState) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE market_makers SET yes_inventory = ?2, no_inventory = ?3, avg_yes_cost = ?4,
                    avg_no_cost = ?5, realized_pnl = ?6, last_quote_at = ?7,
                    volatility_pause_until = ?8
             WHERE id = ?1",
            params![
                mm_id,
                state.yes_inventory,
                state.no_inventory,
                state.avg_yes_cost,
                state.avg_no_cost,
                state.realized_pnl,
                state.last_quote_at.map(fmt_ts),
                state.volatility_pause_until.map(fmt_ts),
            ],
        )?;
        Ok(())
    }

    pub fn set_mm_paused(&self, mm_id: i64, paused: bool) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE market_makers SET paused = ?2 WHERE id = ?1",
            params![mm_id, paused as i64],
        )?;
        Ok(())
    }

    pub fn set_mm_active(&self, mm_id: i64, active: bool) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE market_makers SET active = ?2 WHERE id = ?1",
            params![mm_id, active as i64],
        )?;
        Ok(())
    }

    pub fn update_mm_config(&self, mm_id: i64, config: &MmConfig) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE market_makers SET config = ?2 WHERE id = ?1",
            params![mm_id, serde_json::to_string(config).unwrap_or_default()],
        )?;
        Ok(())
    }

    pub fn bump_last_quote_at(&self, mm_id: i64, at: DateTime<Utc>) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE market_makers SET last_quote_at = ?2 WHERE id = ?1",
            params![mm_id, fmt_ts(at)],
        )?;
        Ok(())
    }

    pub fn set_volatility_pause(
        &self,
        mm_id: i64,
        until: Option<DateTime<Utc>>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE market_makers SET volatility_pause_until = ?2 WHERE id = ?1",
            params![mm_id, until.map(fmt_ts)],
        )?;
        Ok(())
    }

    // ─────────────────────────────────────────────────
    // Tracked orders (insert/delete only)
    // ─────────────────────────────────────────────────

    pub fn insert_tracked_order(&self, o: &TrackedOrder) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tracked_orders (mm_id, outcome, side, tier, order_id, client_order_id,
                                         order_group_id, token, price, size, last_matched_size,
                                         placed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                o.mm_id,
                o.key.outcome.as_str(),
                o.key.side.as_str(),
                o.key.tier,
                o.order_id,
                o.client_order_id,
                o.order_group_id,
                o.token,
                o.price,
                o.size,
                o.last_matched_size,
                fmt_ts(o.placed_at),
            ],
        )?;
        Ok(())
    }

    pub fn delete_tracked_order(&self, order_id: &str) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM tracked_orders WHERE order_id = ?1",
            params![order_id],
        )?;
        Ok(n > 0)
    }

    pub fn delete_tracked_orders_for_mm(&self, mm_id: i64) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM tracked_orders WHERE mm_id = ?1",
            params![mm_id],
        )?;
        Ok(n)
    }

    pub fn get_tracked_order(&self, order_id: &str) -> EngineResult<Option<TrackedOrder>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT mm_id, outcome, side, tier, order_id, client_order_id, order_group_id,
                        token, price, size, last_matched_size, placed_at
                 FROM tracked_orders WHERE order_id = ?1",
                params![order_id],
                Self::order_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_tracked_orders(&self, mm_id: i64) -> EngineResult<Vec<TrackedOrder>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT mm_id, outcome, side, tier, order_id, client_order_id, order_group_id,
                    token, price, size, last_matched_size, placed_at
             FROM tracked_orders WHERE mm_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![mm_id], Self::order_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_all_tracked_orders(&self) -> EngineResult<Vec<TrackedOrder>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT mm_id, outcome, side, tier, order_id, client_order_id, order_group_id,
                    token, price, size, last_matched_size, placed_at
             FROM tracked_orders",
        )?;
        let rows = stmt
            .query_map([], Self::order_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_last_matched(&self, order_id: &str, matched: f64) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tracked_orders SET last_matched_size = ?2 WHERE order_id = ?1",
            params![order_id, matched],
        )?;
        Ok(())
    }

    fn order_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrackedOrder> {
        let outcome: String = row.get(1)?;
        let side: String = row.get(2)?;
        Ok(TrackedOrder {
            mm_id: row.get(0)?,
            key: OrderKey {
                outcome: Outcome::from_str_loose(&outcome).unwrap_or(Outcome::Yes),
                side: OrderSide::from_str_loose(&side).unwrap_or(OrderSide::Buy),
                tier: row.get(3)?,
            },
            order_id: row.get(4)?,
            client_order_id: row.get(5)?,
            order_group_id: row.get(6)?,
            token: row.get(7)?,
            price: row.get(8)?,
            size: row.get(9)?,
            last_matched_size: row.get(10)?,
            placed_at: parse_ts(row.get(11)?).unwrap_or_else(Utc::now),
        })
    }

    // ─────────────────────────────────────────────────
    // Fills & idempotency keys
    // ─────────────────────────────────────────────────

    pub fn insert_fill(&self, f: &FillRecord) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO fills (mm_id, outcome, side, price, size, value, realized_pnl_delta,
                                filled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                f.mm_id,
                f.outcome.as_str(),
                f.side.as_str(),
                f.price,
                f.size,
                f.value,
                f.realized_pnl_delta,
                fmt_ts(f.filled_at),
            ],
        )?;
        Ok(())
    }

    pub fn recent_fills(&self, mm_id: i64, since: DateTime<Utc>) -> EngineResult<Vec<FillRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT mm_id, outcome, side, price, size, value, realized_pnl_delta, filled_at
             FROM fills WHERE mm_id = ?1 AND filled_at >= ?2 ORDER BY filled_at DESC",
        )?;
        let rows = stmt
            .query_map(params![mm_id, fmt_ts(since)], |row| {
                let outcome: String = row.get(1)?;
                let side: String = row.get(2)?;
                Ok(FillRecord {
                    mm_id: row.get(0)?,
                    outcome: Outcome::from_str_loose(&outcome).unwrap_or(Outcome::Yes),
                    side: OrderSide::from_str_loose(&side).unwrap_or(OrderSide::Buy),
                    price: row.get(3)?,
                    size: row.get(4)?,
                    value: row.get(5)?,
                    realized_pnl_delta: row.get(6)?,
                    filled_at: parse_ts(row.get(7)?).unwrap_or_else(Utc::now),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Whether this `(order_id, matched_total_after)` was already applied.
    pub fn fill_already_applied(&self, order_id: &str, matched_total: f64) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM applied_fill_keys WHERE order_id = ?1 AND matched_total = ?2",
            params![order_id, matched_total],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// Claim the idempotency key for a fill. Returns false when the same
    /// `(order_id, matched_total_after)` was already applied.
    pub fn try_mark_fill_applied(&self, order_id: &str, matched_total: f64) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "INSERT OR IGNORE INTO applied_fill_keys (order_id, matched_total, applied_at)
             VALUES (?1, ?2, ?3)",
            params![order_id, matched_total, fmt_ts(Utc::now())],
        )?;
        Ok(n > 0)
    }

    // ─────────────────────────────────────────────────
    // Pending fill events
    // ─────────────────────────────────────────────────

    /// Record a provisional fill. Duplicate `(order_id, matched_total)` is a
    /// no-op and returns None.
    pub fn insert_pending_fill(&self, e: &PendingFillEvent) -> EngineResult<Option<i64>> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "INSERT OR IGNORE INTO pending_fill_events
                 (mm_id, order_id, matched_total, outcome, side, price, size, status, observed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                e.mm_id,
                e.order_id,
                e.matched_total,
                e.outcome.as_str(),
                e.side.as_str(),
                e.price,
                e.size,
                e.status.as_str(),
                fmt_ts(e.observed_at),
            ],
        )?;
        if n == 0 {
            debug!(order_id = %e.order_id, matched_total = e.matched_total, "pending fill already recorded");
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    pub fn list_pending_fills(&self, mm_id: i64) -> EngineResult<Vec<PendingFillEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, mm_id, order_id, matched_total, outcome, side, price, size, status,
                    observed_at
             FROM pending_fill_events WHERE mm_id = ?1 AND status = 'PENDING'
             ORDER BY observed_at ASC",
        )?;
        let rows = stmt
            .query_map(params![mm_id], Self::pending_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_pending_fill_status(&self, id: i64, status: PendingFillStatus) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE pending_fill_events SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    /// Shrink a partially promoted event to its unconfirmed remainder.
    pub fn shrink_pending_fill(&self, id: i64, remaining: f64) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE pending_fill_events SET size = ?2 WHERE id = ?1",
            params![id, remaining],
        )?;
        Ok(())
    }

    /// Flip PENDING events older than the TTL to REJECTED. Returns count.
    pub fn expire_pending_fills(&self, ttl: Duration) -> EngineResult<usize> {
        let cutoff = Utc::now() - ttl;
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE pending_fill_events SET status = 'REJECTED'
             WHERE status = 'PENDING' AND observed_at < ?1",
            params![fmt_ts(cutoff)],
        )?;
        if n > 0 {
            warn!("⏱️ expired {n} pending fill event(s) past TTL");
        }
        Ok(n)
    }

    fn pending_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingFillEvent> {
        let outcome: String = row.get(4)?;
        let side: String = row.get(5)?;
        let status: String = row.get(8)?;
        Ok(PendingFillEvent {
            id: row.get(0)?,
            mm_id: row.get(1)?,
            order_id: row.get(2)?,
            matched_total: row.get(3)?,
            outcome: Outcome::from_str_loose(&outcome).unwrap_or(Outcome::Yes),
            side: OrderSide::from_str_loose(&side).unwrap_or(OrderSide::Buy),
            price: row.get(6)?,
            size: row.get(7)?,
            status: PendingFillStatus::from_str_loose(&status)
                .unwrap_or(PendingFillStatus::Pending),
            observed_at: parse_ts(row.get(9)?).unwrap_or_else(Utc::now),
        })
    }

    // ─────────────────────────────────────────────────
    // Quote history
    // ─────────────────────────────────────────────────

    pub fn log_event(
        &self,
        mm_id: i64,
        kind: QuoteEventKind,
        payload: serde_json::Value,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO quote_history (mm_id, kind, payload, at) VALUES (?1, ?2, ?3, ?4)",
            params![mm_id, kind.as_str(), payload.to_string(), fmt_ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn recent_events(&self, mm_id: i64, limit: usize) -> EngineResult<Vec<QuoteEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT mm_id, kind, payload, at FROM quote_history
             WHERE mm_id = ?1 ORDER BY at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![mm_id, limit as i64], |row| {
                let kind: String = row.get(1)?;
                let payload: String = row.get(2)?;
                Ok(QuoteEvent {
                    mm_id: row.get(0)?,
                    kind: match kind.as_str() {
                        "QUOTE_PLACED" => QuoteEventKind::QuotePlaced,
                        "QUOTE_CANCELLED" => QuoteEventKind::QuoteCancelled,
                        "FILL" => QuoteEventKind::Fill,
                        "PAUSE" => QuoteEventKind::Pause,
                        "SANITY_CHECK_FAILED" => QuoteEventKind::SanityCheckFailed,
                        "ORDER_STALE" => QuoteEventKind::OrderStale,
                        "ORDER_CANCELLED" => QuoteEventKind::OrderCancelled,
                        "PARTIAL_FILL" => QuoteEventKind::PartialFill,
                        _ => QuoteEventKind::Error,
                    },
                    payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
                    at: parse_ts(row.get(3)?).unwrap_or_else(Utc::now),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─────────────────────────────────────────────────
    // Candidates
    // ─────────────────────────────────────────────────

    pub fn upsert_candidate(&self, c: &Candidate) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO candidates (market_id, venue, payload, scored_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(market_id) DO UPDATE SET
                payload = excluded.payload, scored_at = excluded.scored_at",
            params![
                c.market_id,
                c.venue,
                serde_json::to_string(c).unwrap_or_default(),
                fmt_ts(c.scored_at),
            ],
        )?;
        Ok(())
    }

    /// Cached candidate if scored within the TTL.
    pub fn fresh_candidate(&self, market_id: &str, ttl_hours: f64) -> EngineResult<Option<Candidate>> {
        let conn = self.conn.lock();
        let row: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT payload, scored_at FROM candidates WHERE market_id = ?1",
                params![market_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((payload, scored_at)) = row else {
            return Ok(None);
        };
        let Some(at) = parse_ts(scored_at) else {
            return Ok(None);
        };
        if (Utc::now() - at).num_seconds() as f64 > ttl_hours * 3600.0 {
            return Ok(None);
        }
        Ok(serde_json::from_str(&payload).ok())
    }

    pub fn list_candidates(&self) -> EngineResult<Vec<Candidate>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT payload FROM candidates ORDER BY scored_at DESC")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|p| serde_json::from_str(&p).ok())
            .collect())
    }

    // ─────────────────────────────────────────────────
    // Settings
    // ─────────────────────────────────────────────────

    pub fn load_settings(&self) -> EngineResult<Option<RuntimeSettings>> {
        let conn = self.conn.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = 'runtime'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| serde_json::from_str(&v).ok()))
    }

    pub fn save_settings(&self, s: &RuntimeSettings) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES ('runtime', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![serde_json::to_string(s).unwrap_or_default()],
        )?;
        Ok(())
    }

    // ─────────────────────────────────────────────────
    // Advisory locks (cross-process)
    // ─────────────────────────────────────────────────

    /// Acquire or renew a named lease. A lease held by another instance is
    /// stolen only after it expires.
    pub fn try_acquire_lock(&self, name: &str, holder: &str, lease_secs: i64) -> EngineResult<bool> {
        let now = Utc::now();
        let expires = now + Duration::seconds(lease_secs);
        let conn = self.conn.lock();
        let n = conn.execute(
            "INSERT INTO advisory_locks (name, holder, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
             WHERE advisory_locks.holder = excluded.holder
                OR advisory_locks.expires_at < ?3",
            params![name, holder, fmt_ts(now), fmt_ts(expires)],
        )?;
        Ok(n > 0)
    }

    pub fn release_lock(&self, name: &str, holder: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM advisory_locks WHERE name = ?1 AND holder = ?2",
            params![name, holder],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn store() -> (Store, NamedTempFile) {
        let f = NamedTempFile::new().unwrap();
        let s = Store::open(f.path()).unwrap();
        (s, f)
    }

    fn market(id: &str) -> Market {
        Market {
            market_id: id.to_string(),
            venue: "clob".to_string(),
            question: "Will it settle YES?".to_string(),
            yes_token: format!("{id}-yes"),
            no_token: format!("{id}-no"),
            price_ranges: vec![],
            yes_mid: Some(0.5),
            no_mid: Some(0.5),
            last_updated: Some(Utc::now()),
            end_time: Some(Utc::now() + Duration::days(7)),
            active: true,
        }
    }

    fn tracked(mm_id: i64, outcome: Outcome, side: OrderSide, order_id: &str) -> TrackedOrder {
        TrackedOrder {
            mm_id,
            key: OrderKey::new(outcome, side, 0),
            order_id: order_id.to_string(),
            client_order_id: None,
            order_group_id: None,
            token: "tok".to_string(),
            price: 0.48,
            size: 10.0,
            last_matched_size: None,
            placed_at: Utc::now(),
        }
    }

    #[test]
    fn test_market_round_trip() {
        let (s, _f) = store();
        let m = market("m1");
        s.upsert_market(&m).unwrap();
        let got = s.get_market("m1").unwrap().unwrap();
        assert_eq!(got.yes_token, "m1-yes");
        assert!(got.active);

        s.deactivate_market("m1").unwrap();
        assert!(s.list_active_markets().unwrap().is_empty());
    }

    #[test]
    fn test_mm_state_writer() {
        let (s, _f) = store();
        s.upsert_market(&market("m1")).unwrap();
        let id = s.create_mm("m1", &MmConfig::default()).unwrap();

        let mut st = MmState::default();
        st.yes_inventory = 25.0;
        st.avg_yes_cost = 0.44;
        st.realized_pnl = 1.25;
        s.write_mm_state(id, &st).unwrap();

        let got = s.get_mm(id).unwrap().unwrap();
        assert!((got.state.yes_inventory - 25.0).abs() < 1e-9);
        assert!((got.state.realized_pnl - 1.25).abs() < 1e-9);
    }

    #[test]
    fn test_tracked_order_slot_unique() {
        let (s, _f) = store();
        s.upsert_market(&market("m1")).unwrap();
        let id = s.create_mm("m1", &MmConfig::default()).unwrap();

        s.insert_tracked_order(&tracked(id, Outcome::Yes, OrderSide::Buy, "o1"))
            .unwrap();
        // Same slot twice must violate the unique index.
        let dup = s.insert_tracked_order(&tracked(id, Outcome::Yes, OrderSide::Buy, "o2"));
        assert!(dup.is_err());

        // Different side is a different slot.
        s.insert_tracked_order(&tracked(id, Outcome::Yes, OrderSide::Sell, "o3"))
            .unwrap();
        assert_eq!(s.list_tracked_orders(id).unwrap().len(), 2);

        assert!(s.delete_tracked_order("o1").unwrap());
        assert!(!s.delete_tracked_order("o1").unwrap());
    }

    #[test]
    fn test_fill_idempotency_key() {
        let (s, _f) = store();
        assert!(s.try_mark_fill_applied("o1", 10.0).unwrap());
        assert!(!s.try_mark_fill_applied("o1", 10.0).unwrap());
        assert!(s.try_mark_fill_applied("o1", 17.5).unwrap());
    }

    #[test]
    fn test_pending_fill_lifecycle() {
        let (s, _f) = store();
        s.upsert_market(&market("m1")).unwrap();
        let id = s.create_mm("m1", &MmConfig::default()).unwrap();

        let e = PendingFillEvent {
            id: 0,
            mm_id: id,
            order_id: "o1".to_string(),
            matched_total: 10.0,
            outcome: Outcome::Yes,
            side: OrderSide::Buy,
            price: 0.40,
            size: 10.0,
            status: PendingFillStatus::Pending,
            observed_at: Utc::now(),
        };
        let row_id = s.insert_pending_fill(&e).unwrap().unwrap();
        // Duplicate key is swallowed.
        assert!(s.insert_pending_fill(&e).unwrap().is_none());

        let pending = s.list_pending_fills(id).unwrap();
        assert_eq!(pending.len(), 1);

        s.set_pending_fill_status(row_id, PendingFillStatus::Confirmed)
            .unwrap();
        assert!(s.list_pending_fills(id).unwrap().is_empty());
    }

    #[test]
    fn test_pending_ttl_expiry() {
        let (s, _f) = store();
        s.upsert_market(&market("m1")).unwrap();
        let id = s.create_mm("m1", &MmConfig::default()).unwrap();
        let e = PendingFillEvent {
            id: 0,
            mm_id: id,
            order_id: "old".to_string(),
            matched_total: 5.0,
            outcome: Outcome::No,
            side: OrderSide::Buy,
            price: 0.30,
            size: 5.0,
            status: PendingFillStatus::Pending,
            observed_at: Utc::now() - Duration::minutes(20),
        };
        s.insert_pending_fill(&e).unwrap();
        let expired = s.expire_pending_fills(Duration::minutes(15)).unwrap();
        assert_eq!(expired, 1);
        assert!(s.list_pending_fills(id).unwrap().is_empty());
    }

    #[test]
    fn test_settings_round_trip() {
        let (s, _f) = store();
        assert!(s.load_settings().unwrap().is_none());
        let mut rs = RuntimeSettings::default();
        rs.kill_switch_active = true;
        s.save_settings(&rs).unwrap();
        let got = s.load_settings().unwrap().unwrap();
        assert!(got.kill_switch_active);
    }

    #[test]
    fn test_advisory_lock_lease() {
        let (s, _f) = store();
        assert!(s.try_acquire_lock("full_sync", "a", 60).unwrap());
        // Same holder renews; another holder is refused while leased.
        assert!(s.try_acquire_lock("full_sync", "a", 60).unwrap());
        assert!(!s.try_acquire_lock("full_sync", "b", 60).unwrap());

        s.release_lock("full_sync", "a").unwrap();
        assert!(s.try_acquire_lock("full_sync", "b", 60).unwrap());
    }

    #[test]
    fn test_expired_lease_stolen() {
        let (s, _f) = store();
        assert!(s.try_acquire_lock("job", "a", -1).unwrap()); // already expired
        assert!(s.try_acquire_lock("job", "b", 60).unwrap());
    }

    #[test]
    fn test_history_and_candidates() {
        let (s, _f) = store();
        s.upsert_market(&market("m1")).unwrap();
        let id = s.create_mm("m1", &MmConfig::default()).unwrap();

        s.log_event(id, QuoteEventKind::QuotePlaced, serde_json::json!({"price": 0.48}))
            .unwrap();
        s.log_event(id, QuoteEventKind::Fill, serde_json::json!({"size": 10.0}))
            .unwrap();
        let events = s.recent_events(id, 10).unwrap();
        assert_eq!(events.len(), 2);

        let c = Candidate {
            market_id: "m1".to_string(),
            venue: "clob".to_string(),
            metrics: Default::default(),
            scores: Default::default(),
            eligible: true,
            disqualify_reasons: vec![],
            flags: vec![],
            scored_at: Utc::now(),
        };
        s.upsert_candidate(&c).unwrap();
        assert!(s.fresh_candidate("m1", 36.0).unwrap().is_some());
        assert!(s.fresh_candidate("m1", 0.0).unwrap().is_none());
    }
}
