// =============================================================================
// Series Store — bitemporal SQLite persistence
// =============================================================================
//
// Append-only vintage table plus the registry, QT caps, snapshot and event
// tables. A single bundled SQLite connection behind a parking_lot Mutex is
// the only shared mutable resource in the process; every statement runs with
// the lock held and transactions are per-request.
//
// Timestamps are stored as fixed-width UTC RFC 3339 text (millisecond
// precision, trailing 'Z') so lexicographic comparison inside SQL equals
// chronological comparison. Calendar dates are 'YYYY-MM-DD' text.
// =============================================================================

mod registry;
mod series;
mod snapshots;

pub use registry::QtCap;
pub use series::{NewPoint, SeriesPoint};
pub use snapshots::{IndicatorHistoryRow, PersistedSnapshot, SnapshotHistoryRow, SnapshotRecord};

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use tracing::info;

use crate::registry::IndicatorSpec;

/// Full schema. `IF NOT EXISTS` everywhere so opening an existing database is
/// a no-op.
const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS series_vintages (
    vintage_id       TEXT PRIMARY KEY,
    series_id        TEXT NOT NULL,
    observation_date TEXT NOT NULL,
    vintage_date     TEXT,
    publication_date TEXT,
    fetched_at       TEXT NOT NULL,
    value_numeric    REAL NOT NULL,
    units            TEXT NOT NULL,
    scale            REAL NOT NULL DEFAULT 1,
    source           TEXT NOT NULL,
    source_url       TEXT,
    source_version   TEXT
);

CREATE INDEX IF NOT EXISTS idx_vintages_series_obs
    ON series_vintages(series_id, observation_date);
CREATE INDEX IF NOT EXISTS idx_vintages_series_fetched
    ON series_vintages(series_id, fetched_at);

CREATE TABLE IF NOT EXISTS indicator_registry (
    indicator_id    TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    category        TEXT NOT NULL,
    series_json     TEXT NOT NULL,
    cadence         TEXT NOT NULL,
    directionality  TEXT NOT NULL,
    trigger_default TEXT NOT NULL,
    scoring         TEXT NOT NULL,
    rule_json       TEXT NOT NULL,
    z_cutoff        REAL,
    persistence     INTEGER,
    duplicates_of   TEXT,
    notes           TEXT
);

CREATE TABLE IF NOT EXISTS qt_caps (
    effective_date   TEXT PRIMARY KEY,
    ust_cap_usd_week REAL NOT NULL,
    mbs_cap_usd_week REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshots (
    snapshot_id      TEXT PRIMARY KEY,
    as_of            TEXT NOT NULL,
    horizon          TEXT NOT NULL,
    frozen_inputs_id TEXT NOT NULL,
    regime_label     TEXT NOT NULL,
    tilt             TEXT NOT NULL,
    score            INTEGER NOT NULL,
    max_score        INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_horizon_asof
    ON snapshots(horizon, as_of);

CREATE TABLE IF NOT EXISTS frozen_inputs (
    frozen_inputs_id TEXT PRIMARY KEY,
    inputs_json      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshot_indicators (
    snapshot_id     TEXT NOT NULL REFERENCES snapshots(snapshot_id) ON DELETE CASCADE,
    indicator_id    TEXT NOT NULL,
    value_numeric   REAL,
    window          TEXT,
    z20             REAL,
    status          TEXT NOT NULL,
    flip_trigger    TEXT NOT NULL,
    provenance_json TEXT NOT NULL,
    PRIMARY KEY (snapshot_id, indicator_id)
);

CREATE TABLE IF NOT EXISTS events_log (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type          TEXT NOT NULL,
    series_or_indicator TEXT,
    scheduled_for       TEXT,
    started_at          TEXT NOT NULL,
    finished_at         TEXT,
    status              TEXT NOT NULL,
    details             TEXT
);

CREATE VIEW IF NOT EXISTS series_latest AS
SELECT series_id, observation_date, vintage_id, value_numeric, units, scale,
       source, source_url, source_version, vintage_date, publication_date, fetched_at
FROM (
    SELECT sv.*, ROW_NUMBER() OVER (
        PARTITION BY series_id, observation_date
        ORDER BY COALESCE(vintage_date, date(publication_date), date(fetched_at)) DESC,
                 fetched_at DESC
    ) AS rn
    FROM series_vintages sv
)
WHERE rn = 1;
"#;

/// Handle to the SQLite-backed store.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    /// Cached registry specs, invalidated by the loader. Requests share the
    /// Arc instead of re-reading the table.
    registry_cache: RwLock<Option<Arc<Vec<IndicatorSpec>>>>,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open store at {}", path.display()))?;
        conn.execute_batch(SCHEMA_SQL).context("failed to apply store schema")?;
        info!(path = %path.display(), "store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            registry_cache: RwLock::new(None),
        })
    }

    /// Open a fresh in-memory store. Used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        conn.execute_batch(SCHEMA_SQL).context("failed to apply store schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            registry_cache: RwLock::new(None),
        })
    }

    /// Run `f` with the connection lock held.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }

    pub(crate) fn invalidate_registry_cache(&self) {
        *self.registry_cache.write() = None;
    }

    pub(crate) fn cached_registry(&self) -> Option<Arc<Vec<IndicatorSpec>>> {
        self.registry_cache.read().clone()
    }

    pub(crate) fn set_cached_registry(&self, specs: Arc<Vec<IndicatorSpec>>) {
        *self.registry_cache.write() = Some(specs);
    }
}

// =============================================================================
// Date / timestamp encoding helpers
// =============================================================================

/// Fixed-width UTC timestamp encoding (`2025-08-01T12:00:00.000Z`).
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc))
}

pub(crate) fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

/// Parse a `YYYY-MM-DD` date string. Route-parameter helper.
pub fn parse_date_str(s: &str) -> Option<NaiveDate> {
    parse_date(s)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamp_encoding_is_fixed_width_and_ordered() {
        let a = Utc.with_ymd_and_hms(2025, 8, 1, 12, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2025, 8, 1, 12, 0, 1).unwrap();
        let sa = fmt_ts(a);
        let sb = fmt_ts(b);
        assert_eq!(sa.len(), sb.len());
        assert!(sa < sb, "lexicographic order must match chronological order");
        assert_eq!(parse_ts(&sa).unwrap(), a);
    }

    #[test]
    fn date_encoding_round_trips() {
        let d = NaiveDate::from_ymd_opt(2025, 8, 1).unwrap();
        assert_eq!(fmt_date(d), "2025-08-01");
        assert_eq!(parse_date("2025-08-01").unwrap(), d);
        assert!(parse_date("garbage").is_none());
    }

    #[test]
    fn schema_applies_to_fresh_database() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                let n: i64 = conn
                    .query_row("SELECT COUNT(*) FROM series_vintages", [], |r| r.get(0))
                    .unwrap();
                assert_eq!(n, 0);
                Ok(())
            })
            .unwrap();
    }
}
