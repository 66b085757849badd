// =============================================================================
// Registry & QT caps persistence
// =============================================================================

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use rusqlite::params;
use serde::Serialize;
use tracing::info;

use super::{fmt_date, parse_date, Store};
use crate::registry::{default_registry, IndicatorSpec, ScoringRule};
use crate::types::{Directionality, Scoring};

/// One row of the QT runoff-cap table.
#[derive(Debug, Clone, Serialize)]
pub struct QtCap {
    pub effective_date: NaiveDate,
    pub ust_cap_usd_week: f64,
    pub mbs_cap_usd_week: f64,
}

/// Published SOMA runoff caps, converted to weekly USD. Operators override
/// through `upsert_qt_cap` when the FOMC changes the schedule.
fn default_qt_caps() -> Vec<QtCap> {
    fn cap(y: i32, m: u32, d: u32, ust: f64, mbs: f64) -> QtCap {
        QtCap {
            effective_date: NaiveDate::from_ymd_opt(y, m, d).expect("valid cap date"),
            ust_cap_usd_week: ust,
            mbs_cap_usd_week: mbs,
        }
    }
    vec![
        // $60B/mo UST + $35B/mo MBS
        cap(2022, 9, 1, 13.8e9, 8.1e9),
        // UST cap lowered to $25B/mo
        cap(2024, 6, 1, 5.8e9, 8.1e9),
        // UST cap lowered to $5B/mo
        cap(2025, 4, 1, 1.2e9, 8.1e9),
    ]
}

fn directionality_str(d: Directionality) -> &'static str {
    match d {
        Directionality::HigherIsSupportive => "higher_is_supportive",
        Directionality::LowerIsSupportive => "lower_is_supportive",
        Directionality::HigherIsDraining => "higher_is_draining",
    }
}

fn directionality_from_str(s: &str) -> Result<Directionality> {
    match s {
        "higher_is_supportive" => Ok(Directionality::HigherIsSupportive),
        "lower_is_supportive" => Ok(Directionality::LowerIsSupportive),
        "higher_is_draining" => Ok(Directionality::HigherIsDraining),
        other => Err(anyhow!("unknown directionality '{other}'")),
    }
}

fn scoring_str(s: Scoring) -> &'static str {
    match s {
        Scoring::Z => "z",
        Scoring::Threshold => "threshold",
    }
}

fn scoring_from_str(s: &str) -> Result<Scoring> {
    match s {
        "z" => Ok(Scoring::Z),
        "threshold" => Ok(Scoring::Threshold),
        other => Err(anyhow!("unknown scoring '{other}'")),
    }
}

impl Store {
    // -------------------------------------------------------------------------
    // Indicator registry
    // -------------------------------------------------------------------------

    /// Load the registry, sorted by `indicator_id`, through the process-local
    /// cache. The cache is invalidated by loader runs, not by time.
    pub fn registry(&self) -> Result<Arc<Vec<IndicatorSpec>>> {
        if let Some(cached) = self.cached_registry() {
            return Ok(cached);
        }
        let specs = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT indicator_id, name, category, series_json, cadence, directionality, \
                        trigger_default, scoring, rule_json, z_cutoff, persistence, \
                        duplicates_of, notes \
                 FROM indicator_registry ORDER BY indicator_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, Option<f64>>(9)?,
                    row.get::<_, Option<u32>>(10)?,
                    row.get::<_, Option<String>>(11)?,
                    row.get::<_, Option<String>>(12)?,
                ))
            })?;

            let mut specs = Vec::new();
            for row in rows {
                let (id, name, category, series_json, cadence, dir, trigger, scoring, rule_json,
                    z_cutoff, persistence, duplicates_of, notes) = row?;
                let series: Vec<String> = serde_json::from_str(&series_json)
                    .with_context(|| format!("bad series_json for {id}"))?;
                let rule: ScoringRule = serde_json::from_str(&rule_json)
                    .with_context(|| format!("bad rule_json for {id}"))?;
                specs.push(IndicatorSpec {
                    indicator_id: id,
                    name,
                    category,
                    series,
                    cadence,
                    directionality: directionality_from_str(&dir)?,
                    trigger_default: trigger,
                    scoring: scoring_from_str(&scoring)?,
                    rule,
                    z_cutoff,
                    persistence,
                    duplicates_of,
                    notes,
                });
            }
            Ok(specs)
        })?;
        let specs = Arc::new(specs);
        self.set_cached_registry(specs.clone());
        Ok(specs)
    }

    /// Upsert registry entries and invalidate the cache.
    pub fn upsert_registry(&self, specs: &[IndicatorSpec]) -> Result<usize> {
        let count = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for s in specs {
                tx.execute(
                    "INSERT INTO indicator_registry \
                     (indicator_id, name, category, series_json, cadence, directionality, \
                      trigger_default, scoring, rule_json, z_cutoff, persistence, duplicates_of, notes) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
                     ON CONFLICT(indicator_id) DO UPDATE SET \
                       name = excluded.name, category = excluded.category, \
                       series_json = excluded.series_json, cadence = excluded.cadence, \
                       directionality = excluded.directionality, \
                       trigger_default = excluded.trigger_default, scoring = excluded.scoring, \
                       rule_json = excluded.rule_json, z_cutoff = excluded.z_cutoff, \
                       persistence = excluded.persistence, duplicates_of = excluded.duplicates_of, \
                       notes = excluded.notes",
                    params![
                        s.indicator_id,
                        s.name,
                        s.category,
                        serde_json::to_string(&s.series)?,
                        s.cadence,
                        directionality_str(s.directionality),
                        s.trigger_default,
                        scoring_str(s.scoring),
                        serde_json::to_string(&s.rule)?,
                        s.z_cutoff,
                        s.persistence,
                        s.duplicates_of,
                        s.notes,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(specs.len())
        })?;
        self.invalidate_registry_cache();
        Ok(count)
    }

    /// Seed the built-in registry and cap schedule into an empty database.
    pub fn seed_defaults(&self) -> Result<()> {
        let existing: i64 = self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM indicator_registry", [], |r| r.get(0))?)
        })?;
        if existing == 0 {
            let n = self.upsert_registry(&default_registry())?;
            info!(indicators = n, "seeded default indicator registry");
        }

        let caps: i64 = self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM qt_caps", [], |r| r.get(0))?)
        })?;
        if caps == 0 {
            for cap in default_qt_caps() {
                self.upsert_qt_cap(&cap)?;
            }
            info!("seeded default QT cap schedule");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // QT caps
    // -------------------------------------------------------------------------

    pub fn upsert_qt_cap(&self, cap: &QtCap) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO qt_caps (effective_date, ust_cap_usd_week, mbs_cap_usd_week) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(effective_date) DO UPDATE SET \
                   ust_cap_usd_week = excluded.ust_cap_usd_week, \
                   mbs_cap_usd_week = excluded.mbs_cap_usd_week",
                params![fmt_date(cap.effective_date), cap.ust_cap_usd_week, cap.mbs_cap_usd_week],
            )?;
            Ok(())
        })
    }

    /// The most recent cap row with `effective_date <= obs_date`.
    pub fn qt_cap_as_of(&self, obs_date: NaiveDate) -> Result<Option<QtCap>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT effective_date, ust_cap_usd_week, mbs_cap_usd_week FROM qt_caps \
                     WHERE effective_date <= ?1 ORDER BY effective_date DESC LIMIT 1",
                    params![fmt_date(obs_date)],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, f64>(1)?,
                            row.get::<_, f64>(2)?,
                        ))
                    },
                )
                .ok();
            Ok(row.and_then(|(date, ust, mbs)| {
                Some(QtCap {
                    effective_date: parse_date(&date)?,
                    ust_cap_usd_week: ust,
                    mbs_cap_usd_week: mbs,
                })
            }))
        })
    }

    /// Remove every cap row. Used by tests that install bespoke schedules.
    pub fn clear_qt_caps(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM qt_caps", [])?;
            Ok(())
        })
    }
}
