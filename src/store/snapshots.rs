// =============================================================================
// Snapshot persistence — frozen inputs, indicator rows, day-level upsert
// =============================================================================

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::params;
use serde::Serialize;
use uuid::Uuid;

use super::{fmt_date, fmt_ts, parse_ts, Store};

/// Persisted regime header row.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotRecord {
    pub snapshot_id: String,
    pub as_of: DateTime<Utc>,
    pub horizon: String,
    pub frozen_inputs_id: String,
    pub regime_label: String,
    pub tilt: String,
    pub score: i64,
    pub max_score: i64,
}

/// One `snapshot_indicators` row as handed to / read from the store.
#[derive(Debug, Clone, Serialize)]
pub struct PersistedSnapshot {
    pub indicator_id: String,
    pub value_numeric: Option<f64>,
    pub window: Option<String>,
    pub z20: Option<f64>,
    pub status: String,
    pub flip_trigger: String,
    pub provenance_json: serde_json::Value,
}

/// Per-day indicator history item (joined through `snapshots`).
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorHistoryRow {
    pub as_of: DateTime<Utc>,
    pub value_numeric: Option<f64>,
    pub z20: Option<f64>,
    pub status: String,
    pub flip_trigger: String,
}

/// Per-day snapshot history item.
pub type SnapshotHistoryRow = SnapshotRecord;

impl Store {
    /// Persist a snapshot with its frozen inputs and one row per evaluated
    /// indicator, in a single transaction.
    ///
    /// With `replace_day`, any prior snapshot for `(horizon, date(as_of))` is
    /// deleted first inside the same transaction, which makes day-level
    /// persistence idempotent.
    pub fn persist_snapshot(
        &self,
        as_of: DateTime<Utc>,
        horizon: &str,
        regime_label: &str,
        tilt: &str,
        score: i64,
        max_score: i64,
        frozen_inputs: &serde_json::Value,
        indicators: &[PersistedSnapshot],
        replace_day: bool,
    ) -> Result<(String, String)> {
        self.with_conn(|conn| {
            let tx = conn.transaction().context("begin snapshot transaction")?;

            if replace_day {
                tx.execute(
                    "DELETE FROM snapshots WHERE horizon = ?1 AND date(as_of) = ?2",
                    params![horizon, fmt_date(as_of.date_naive())],
                )?;
            }

            let frozen_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO frozen_inputs (frozen_inputs_id, inputs_json) VALUES (?1, ?2)",
                params![frozen_id, serde_json::to_string(frozen_inputs)?],
            )?;

            let snapshot_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO snapshots \
                 (snapshot_id, as_of, horizon, frozen_inputs_id, regime_label, tilt, score, max_score) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    snapshot_id,
                    fmt_ts(as_of),
                    horizon,
                    frozen_id,
                    regime_label,
                    tilt,
                    score,
                    max_score
                ],
            )?;

            for row in indicators {
                tx.execute(
                    "INSERT INTO snapshot_indicators \
                     (snapshot_id, indicator_id, value_numeric, window, z20, status, flip_trigger, provenance_json) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        snapshot_id,
                        row.indicator_id,
                        row.value_numeric,
                        row.window,
                        row.z20,
                        row.status,
                        row.flip_trigger,
                        serde_json::to_string(&row.provenance_json)?
                    ],
                )?;
            }

            tx.commit().context("commit snapshot transaction")?;
            Ok((snapshot_id, frozen_id))
        })
    }

    /// Saved snapshots for `horizon` within the last `days` (all when `days`
    /// is 0 or negative), deduplicated by calendar day keeping the last
    /// snapshot per day, ascending.
    pub fn snapshot_history(
        &self,
        horizon: &str,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<SnapshotHistoryRow>> {
        let rows = self.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT snapshot_id, as_of, horizon, frozen_inputs_id, regime_label, tilt, \
                        score, max_score \
                 FROM snapshots WHERE horizon = ?1",
            );
            let mut p: Vec<rusqlite::types::Value> =
                vec![rusqlite::types::Value::from(horizon.to_string())];
            if days > 0 {
                sql.push_str(" AND as_of >= ?2");
                p.push(rusqlite::types::Value::from(fmt_ts(now - Duration::days(days))));
            }
            sql.push_str(" ORDER BY as_of ASC");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(p), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        // Ascending input order means the last snapshot of each day wins.
        let mut by_day: BTreeMap<NaiveDate, SnapshotHistoryRow> = BTreeMap::new();
        for (snapshot_id, as_of, horizon, frozen, label, tilt, score, max_score) in rows {
            let Some(as_of) = parse_ts(&as_of) else { continue };
            by_day.insert(
                as_of.date_naive(),
                SnapshotRecord {
                    snapshot_id,
                    as_of,
                    horizon,
                    frozen_inputs_id: frozen,
                    regime_label: label,
                    tilt,
                    score,
                    max_score,
                },
            );
        }
        Ok(by_day.into_values().collect())
    }

    /// Per-indicator history joined through saved snapshots, deduplicated by
    /// day, ascending.
    pub fn indicator_history(
        &self,
        indicator_id: &str,
        horizon: &str,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<IndicatorHistoryRow>> {
        let rows = self.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT s.as_of, si.value_numeric, si.z20, si.status, si.flip_trigger \
                 FROM snapshots s \
                 JOIN snapshot_indicators si ON si.snapshot_id = s.snapshot_id \
                 WHERE si.indicator_id = ?1 AND s.horizon = ?2",
            );
            let mut p: Vec<rusqlite::types::Value> = vec![
                rusqlite::types::Value::from(indicator_id.to_string()),
                rusqlite::types::Value::from(horizon.to_string()),
            ];
            if days > 0 {
                sql.push_str(" AND s.as_of >= ?3");
                p.push(rusqlite::types::Value::from(fmt_ts(now - Duration::days(days))));
            }
            sql.push_str(" ORDER BY s.as_of ASC");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(p), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut by_day: BTreeMap<NaiveDate, IndicatorHistoryRow> = BTreeMap::new();
        for (as_of, value_numeric, z20, status, flip_trigger) in rows {
            let Some(as_of) = parse_ts(&as_of) else { continue };
            by_day.insert(
                as_of.date_naive(),
                IndicatorHistoryRow { as_of, value_numeric, z20, status, flip_trigger },
            );
        }
        Ok(by_day.into_values().collect())
    }

    /// Number of snapshot header rows for `(horizon, day)`. Test/diagnostic
    /// helper backing the day-level idempotence invariant.
    pub fn snapshots_on_day(&self, horizon: &str, day: NaiveDate) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM snapshots WHERE horizon = ?1 AND date(as_of) = ?2",
                params![horizon, fmt_date(day)],
                |row| row.get(0),
            )?)
        })
    }

    /// Read back the frozen-inputs JSON for a persisted snapshot.
    pub fn frozen_inputs(&self, frozen_inputs_id: &str) -> Result<Option<serde_json::Value>> {
        self.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT inputs_json FROM frozen_inputs WHERE frozen_inputs_id = ?1",
                    params![frozen_inputs_id],
                    |row| row.get(0),
                )
                .ok();
            Ok(match raw {
                Some(s) => Some(serde_json::from_str(&s).context("parse frozen inputs json")?),
                None => None,
            })
        })
    }
}
