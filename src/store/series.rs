// =============================================================================
// Series vintages — idempotent upserts and as-of reads
// =============================================================================
//
// Every read path applies the same recency rule:
//   (COALESCE(vintage_date, date(publication_date), date(fetched_at)),
//    fetched_at)  compared lexicographically, DESC.
// That tuple is the only tie-break between vintages of one observation.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Row};
use serde::Serialize;
use uuid::Uuid;

use super::{fmt_date, fmt_ts, Store};
use crate::types::AsOfMode;

/// One row of the bitemporal vintage table.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesPoint {
    pub series_id: String,
    pub observation_date: NaiveDate,
    pub vintage_id: String,
    pub value_numeric: f64,
    pub units: String,
    pub scale: f64,
    pub source: String,
    pub source_url: Option<String>,
    pub source_version: Option<String>,
    pub vintage_date: Option<NaiveDate>,
    pub publication_date: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}

impl SeriesPoint {
    /// Value scaled into its natural unit (USD, percent, …).
    pub fn scaled_value(&self) -> f64 {
        self.value_numeric * self.scale
    }
}

/// An incoming observation prior to upsert. `fetched_at` defaults to now.
#[derive(Debug, Clone)]
pub struct NewPoint {
    pub observation_date: NaiveDate,
    pub vintage_date: Option<NaiveDate>,
    pub publication_date: Option<DateTime<Utc>>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub value_numeric: f64,
}

impl NewPoint {
    pub fn new(observation_date: NaiveDate, value_numeric: f64) -> Self {
        Self {
            observation_date,
            vintage_date: None,
            publication_date: None,
            fetched_at: None,
            value_numeric,
        }
    }

    pub fn fetched(mut self, at: DateTime<Utc>) -> Self {
        self.fetched_at = Some(at);
        self
    }
}

const POINT_COLUMNS: &str = "series_id, observation_date, vintage_id, value_numeric, units, \
                             scale, source, source_url, source_version, vintage_date, \
                             publication_date, fetched_at";

fn conv_err(idx: usize, e: chrono::ParseError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn row_to_point(row: &Row<'_>) -> rusqlite::Result<SeriesPoint> {
    let obs: String = row.get("observation_date")?;
    let vintage_date: Option<String> = row.get("vintage_date")?;
    let publication_date: Option<String> = row.get("publication_date")?;
    let fetched_at: String = row.get("fetched_at")?;

    Ok(SeriesPoint {
        series_id: row.get("series_id")?,
        observation_date: NaiveDate::parse_from_str(&obs, "%Y-%m-%d")
            .map_err(|e| conv_err(1, e))?,
        vintage_id: row.get("vintage_id")?,
        value_numeric: row.get("value_numeric")?,
        units: row.get("units")?,
        scale: row.get("scale")?,
        source: row.get("source")?,
        source_url: row.get("source_url")?,
        source_version: row.get("source_version")?,
        vintage_date: vintage_date
            .map(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| conv_err(9, e)))
            .transpose()?,
        publication_date: publication_date
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| conv_err(10, e))
            })
            .transpose()?,
        fetched_at: DateTime::parse_from_rfc3339(&fetched_at)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conv_err(11, e))?,
    })
}

/// Build the best-known-per-observation query with an optional extra filter.
/// `?1` = series_id, `?2` = limit, `?3` = the filter's cutoff (when present).
fn best_known_sql(extra_filter: &str) -> String {
    format!(
        "SELECT {cols} FROM ( \
           SELECT {cols} FROM ( \
             SELECT sv.*, ROW_NUMBER() OVER ( \
               PARTITION BY observation_date \
               ORDER BY COALESCE(vintage_date, date(publication_date), date(fetched_at)) DESC, \
                        fetched_at DESC \
             ) AS rn \
             FROM series_vintages sv \
             WHERE sv.series_id = ?1{extra_filter} \
           ) WHERE rn = 1 \
           ORDER BY observation_date DESC \
           LIMIT ?2 \
         ) ORDER BY observation_date ASC",
        cols = POINT_COLUMNS,
        extra_filter = extra_filter,
    )
}

impl Store {
    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Idempotently upsert `rows` for `series_id`.
    ///
    /// The unique key is `(series_id, observation_date, vintage_date,
    /// publication_date)` with nulls comparing equal (`IS` lookups). A key
    /// match rewrites `value_numeric`, `units`, `scale` and the `source*`
    /// columns; rows are never deleted here.
    pub fn upsert_points(
        &self,
        series_id: &str,
        rows: &[NewPoint],
        units: &str,
        scale: f64,
        source: &str,
        source_url: Option<&str>,
        source_version: Option<&str>,
    ) -> Result<usize> {
        let insert_sql = format!(
            "INSERT INTO series_vintages ({POINT_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        );
        self.with_conn(|conn| {
            let tx = conn.transaction().context("begin upsert transaction")?;
            let mut count = 0usize;
            for r in rows {
                let obs = fmt_date(r.observation_date);
                let vintage = r.vintage_date.map(fmt_date);
                let publication = r.publication_date.map(fmt_ts);
                let fetched = fmt_ts(r.fetched_at.unwrap_or_else(Utc::now));

                let existing: Option<String> = tx
                    .query_row(
                        "SELECT vintage_id FROM series_vintages \
                         WHERE series_id = ?1 AND observation_date = ?2 \
                           AND vintage_date IS ?3 AND publication_date IS ?4",
                        params![series_id, obs, vintage, publication],
                        |row| row.get(0),
                    )
                    .ok();

                match existing {
                    Some(vintage_id) => {
                        tx.execute(
                            "UPDATE series_vintages SET value_numeric = ?1, units = ?2, \
                             scale = ?3, source = ?4, source_url = ?5, source_version = ?6 \
                             WHERE vintage_id = ?7",
                            params![
                                r.value_numeric,
                                units,
                                scale,
                                source,
                                source_url,
                                source_version,
                                vintage_id
                            ],
                        )
                        .context("rewrite existing vintage")?;
                    }
                    None => {
                        tx.execute(
                            &insert_sql,
                            params![
                                series_id,
                                obs,
                                Uuid::new_v4().to_string(),
                                r.value_numeric,
                                units,
                                scale,
                                source,
                                source_url,
                                source_version,
                                vintage,
                                publication,
                                fetched
                            ],
                        )
                        .context("insert new vintage")?;
                    }
                }
                count += 1;
            }
            tx.commit().context("commit upsert transaction")?;
            Ok(count)
        })
    }

    // -------------------------------------------------------------------------
    // Reads — all return empty collections on no data, never error for
    // missing series.
    // -------------------------------------------------------------------------

    /// Most recent `limit` observations, best-known vintage each, ascending
    /// by observation date.
    pub fn latest_points(&self, series_id: &str, limit: usize) -> Result<Vec<SeriesPoint>> {
        self.query_points(&best_known_sql(""), vec![
            Value::from(series_id.to_string()),
            Value::from(limit as i64),
        ])
    }

    /// Points visible at `as_of` on the fetch timeline (`fetched_at <= as_of`).
    pub fn as_of_fetched(
        &self,
        series_id: &str,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SeriesPoint>> {
        self.query_points(&best_known_sql(" AND sv.fetched_at <= ?3"), vec![
            Value::from(series_id.to_string()),
            Value::from(limit as i64),
            Value::from(fmt_ts(as_of)),
        ])
    }

    /// Points whose publication timeline key is on or before `as_of`'s date.
    pub fn as_of_publication(
        &self,
        series_id: &str,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SeriesPoint>> {
        self.query_points(
            &best_known_sql(
                " AND COALESCE(sv.vintage_date, date(sv.publication_date), date(sv.fetched_at)) <= ?3",
            ),
            vec![
                Value::from(series_id.to_string()),
                Value::from(limit as i64),
                Value::from(fmt_date(as_of.date_naive())),
            ],
        )
    }

    /// Observations with `observation_date <= as_of` date, best-known vintage
    /// for each.
    pub fn up_to_observation_date(
        &self,
        series_id: &str,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SeriesPoint>> {
        self.query_points(&best_known_sql(" AND sv.observation_date <= ?3"), vec![
            Value::from(series_id.to_string()),
            Value::from(limit as i64),
            Value::from(fmt_date(as_of.date_naive())),
        ])
    }

    /// Dispatch helper: resolve points for an optional `as_of` in the given
    /// mode. `None` falls back to the latest best-known timeline.
    pub fn points_for_mode(
        &self,
        series_id: &str,
        as_of: Option<DateTime<Utc>>,
        mode: AsOfMode,
        limit: usize,
    ) -> Result<Vec<SeriesPoint>> {
        match as_of {
            None => self.latest_points(series_id, limit),
            Some(at) => match mode {
                AsOfMode::Fetched => self.as_of_fetched(series_id, at, limit),
                AsOfMode::Pub => self.as_of_publication(series_id, at, limit),
                AsOfMode::Obs => self.up_to_observation_date(series_id, at, limit),
            },
        }
    }

    /// Full best-known series for one id via the `series_latest` view,
    /// ascending by observation date.
    pub fn latest_values(&self, series_id: &str) -> Result<Vec<SeriesPoint>> {
        let sql = format!(
            "SELECT {POINT_COLUMNS} FROM series_latest WHERE series_id = ?1 \
             ORDER BY observation_date ASC"
        );
        self.query_points(&sql, vec![Value::from(series_id.to_string())])
    }

    /// The single most recent row per requested series by best-known recency.
    pub fn latest_for_series(&self, series_ids: &[String]) -> Result<Vec<SeriesPoint>> {
        if series_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=series_ids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {POINT_COLUMNS} FROM ( \
               SELECT sv.*, ROW_NUMBER() OVER ( \
                 PARTITION BY series_id \
                 ORDER BY COALESCE(vintage_date, date(publication_date), date(fetched_at)) DESC, \
                          fetched_at DESC \
               ) AS rn \
               FROM series_vintages sv \
               WHERE sv.series_id IN ({placeholders}) \
             ) WHERE rn = 1 ORDER BY series_id"
        );
        let params: Vec<Value> = series_ids.iter().map(|s| Value::from(s.clone())).collect();
        self.query_points(&sql, params)
    }

    /// All distinct series ids, sorted.
    pub fn list_series_ids(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT DISTINCT series_id FROM series_vintages ORDER BY series_id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }

    /// Whether any vintage exists for `series_id`.
    pub fn series_has_data(&self, series_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM series_vintages WHERE series_id = ?1)",
                params![series_id],
                |row| row.get(0),
            )?;
            Ok(n != 0)
        })
    }

    fn query_points(&self, sql: &str, params: Vec<Value>) -> Result<Vec<SeriesPoint>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql).context("prepare series query")?;
            let points = stmt
                .query_map(params_from_iter(params), row_to_point)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("map series rows")?;
            Ok(points)
        })
    }
}
