// =============================================================================
// Snapshot Service — evaluation orchestration and persistence
// =============================================================================
//
// One snapshot computation evaluates every registry indicator in
// `indicator_id` order, drops the unavailable ones, aggregates buckets, and
// selects top-K representatives for the evidence list. Saving freezes the
// exact vintages that fed the evidence so the snapshot can be reproduced.
// =============================================================================

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::aggregate::{aggregate, bucket_weights, BucketDetail, RegimeSummary};
use crate::evaluator::{evaluate, IndicatorEvidence};
use crate::registry::{resolve_series_id, IndicatorSpec};
use crate::stats::{z_score, Z_WINDOW};
use crate::store::{PersistedSnapshot, Store};
use crate::types::{AsOfMode, IndicatorStatus};

/// Full snapshot payload returned by `/snapshot` and the events endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotResponse {
    pub as_of: DateTime<Utc>,
    pub regime: RegimeSummary,
    /// Top-K bucket representatives, sorted by |z20| descending.
    pub indicators: Vec<IndicatorEvidence>,
    pub bucket_details: Vec<BucketDetail>,
    pub bucket_weights: serde_json::Value,
    pub frozen_inputs_id: String,
    pub horizon: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterPick {
    pub id: String,
    pub why: String,
    pub trigger: String,
    pub next_update: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterResponse {
    pub horizon: String,
    pub picks: Vec<RouterPick>,
}

/// Compute the liquidity snapshot.
///
/// With `save`, the frozen inputs, regime header and one row per evaluated
/// indicator are persisted in a single transaction; `replace_day`
/// additionally deletes any prior snapshot for `(horizon, date(as_of))`
/// first, which is what the event endpoints use for day-level idempotence.
pub fn compute_snapshot(
    store: &Store,
    horizon: &str,
    k: usize,
    save: bool,
    as_of: Option<DateTime<Utc>>,
    mode: AsOfMode,
    replace_day: bool,
) -> Result<SnapshotResponse> {
    let specs = store.registry()?;
    let specs_by_id: HashMap<String, IndicatorSpec> = specs
        .iter()
        .map(|s| (s.indicator_id.clone(), s.clone()))
        .collect();

    // Evaluate in indicator_id order (the registry load is sorted).
    let mut evidence: Vec<IndicatorEvidence> = Vec::new();
    let mut contributions: HashMap<String, f64> = HashMap::new();
    for spec in specs.iter() {
        let (row, contribution) = evaluate(store, spec, as_of, mode)?;
        // Unavailable indicators would read as misleading zeros downstream.
        if row.status == IndicatorStatus::NotAvailable {
            continue;
        }
        // The numeric contribution is the status by construction.
        debug_assert_eq!(contribution, row.status.contribution());
        contributions.insert(row.id.clone(), contribution);
        evidence.push(row);
    }

    let aggregation = aggregate(&specs_by_id, &evidence, &contributions);

    // One representative per bucket, ranked by |z20| (unknown z ranks as 0),
    // ties by id, truncated to the top K evidence rows.
    let evidence_by_id: HashMap<&str, &IndicatorEvidence> =
        evidence.iter().map(|e| (e.id.as_str(), e)).collect();
    let mut representatives: Vec<IndicatorEvidence> = aggregation
        .bucket_details
        .iter()
        .filter_map(|b| evidence_by_id.get(b.representative_id.as_str()).copied())
        .cloned()
        .collect();
    representatives.sort_by(|a, b| {
        let za = a.z20.map(f64::abs).unwrap_or(0.0);
        let zb = b.z20.map(f64::abs).unwrap_or(0.0);
        zb.partial_cmp(&za)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    representatives.truncate(k);

    let as_of_now = as_of.unwrap_or_else(Utc::now);
    let mut frozen_inputs_id = "temp".to_string();

    if save {
        let frozen = frozen_items(&representatives);
        let rows: Vec<PersistedSnapshot> = evidence
            .iter()
            .map(|e| PersistedSnapshot {
                indicator_id: e.id.clone(),
                value_numeric: e.value_numeric,
                window: e.window.clone(),
                z20: e.z20,
                status: e.status.as_str().to_string(),
                flip_trigger: e.flip_trigger.clone(),
                provenance_json: e.provenance.clone(),
            })
            .collect();
        let (snapshot_id, frozen_id) = store.persist_snapshot(
            as_of_now,
            horizon,
            aggregation.regime.label.as_str(),
            aggregation.regime.tilt.as_str(),
            aggregation.regime.score,
            aggregation.regime.max_score,
            &frozen,
            &rows,
            replace_day,
        )?;
        info!(
            snapshot_id = %snapshot_id,
            horizon,
            score = aggregation.regime.score,
            indicators = rows.len(),
            "snapshot persisted"
        );
        frozen_inputs_id = frozen_id;
    }

    Ok(SnapshotResponse {
        as_of: as_of_now,
        regime: aggregation.regime,
        indicators: representatives,
        bucket_details: aggregation.bucket_details,
        bucket_weights: bucket_weights(),
        frozen_inputs_id,
        horizon: horizon.to_string(),
    })
}

/// Frozen-inputs rows derived from the evidence provenance: one entry per
/// `(indicator_id, series_id, vintage_id, observation_date)`.
fn frozen_items(evidence: &[IndicatorEvidence]) -> serde_json::Value {
    let mut items = Vec::new();
    for row in evidence {
        let prov = &row.provenance;
        if let Some(inputs) = prov.get("inputs").and_then(|v| v.as_object()) {
            for (series_id, meta) in inputs {
                items.push(json!({
                    "indicator_id": row.id,
                    "series_id": series_id,
                    "vintage_id": meta.get("vintage_id").cloned().unwrap_or(json!(null)),
                    "observation_date": meta.get("observation_date").cloned().unwrap_or(json!(null)),
                }));
            }
        } else {
            let obs = prov.get("observation_date").cloned().unwrap_or(json!(null));
            let vid = prov.get("vintage_id").cloned().unwrap_or(json!(null));
            let series = prov
                .get("series")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            for sid in series {
                items.push(json!({
                    "indicator_id": row.id,
                    "series_id": sid,
                    "vintage_id": vid,
                    "observation_date": obs,
                }));
            }
        }
    }
    json!(items)
}

/// Router: rank indicators by |z20| of their primary series as a proxy for
/// near-term relevance. Missing-data indicators are skipped entirely.
pub fn compute_router(store: &Store, horizon: &str, k: usize) -> Result<RouterResponse> {
    let specs = store.registry()?;
    let mut ranked: Vec<(&IndicatorSpec, f64)> = Vec::new();
    for spec in specs.iter() {
        let Some(primary) = spec.series.first() else { continue };
        let points = store.latest_points(resolve_series_id(primary), 40)?;
        if points.is_empty() {
            continue;
        }
        let values: Vec<f64> = points.iter().map(|p| p.value_numeric).collect();
        let z = z_score(&values, Z_WINDOW).map(f64::abs).unwrap_or(0.0);
        ranked.push((spec, z));
    }
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.indicator_id.cmp(&b.0.indicator_id))
    });

    let picks = ranked
        .into_iter()
        .take(k)
        .map(|(spec, _)| RouterPick {
            id: spec.indicator_id.clone(),
            why: spec.notes.clone().unwrap_or_else(|| spec.name.clone()),
            trigger: spec.trigger_default.clone(),
            next_update: None,
        })
        .collect();

    Ok(RouterResponse { horizon: horizon.to_string(), picks })
}

/// Persist daily snapshots for the last `days` days, normalized to the end of
/// each UTC day. An evaluator error aborts the batch and surfaces.
pub fn backfill_history(
    store: &Store,
    horizon: &str,
    days: i64,
    k: usize,
    mode: AsOfMode,
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut persisted = 0usize;
    for i in (0..=days).rev() {
        let day = (now - Duration::days(i)).date_naive();
        let as_of = day
            .and_hms_opt(23, 59, 59)
            .expect("valid end-of-day time")
            .and_utc();
        compute_snapshot(store, horizon, k, true, Some(as_of), mode, true)?;
        persisted += 1;
    }
    Ok(persisted)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewPoint;
    use chrono::{NaiveDate, TimeZone};

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, day).unwrap()
    }

    fn ts(day: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, day, h, 0, 0).unwrap()
    }

    fn seed(store: &Store, sid: &str, rows: &[(NaiveDate, f64)], units: &str) {
        let now = ts(19, 0);
        let points: Vec<NewPoint> = rows
            .iter()
            .map(|&(obs, v)| NewPoint::new(obs, v).fetched(now))
            .collect();
        store
            .upsert_points(sid, &points, units, 1.0, "TEST", None, None)
            .unwrap();
    }

    /// Store with two evaluable indicators: bill_rrp (threshold, supportive)
    /// and ust_net_w (derived z, draining).
    fn seeded_store() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.seed_defaults().unwrap();

        let bill: Vec<(NaiveDate, f64)> =
            (1..=5).map(|i| (d(i), if i >= 4 { 30.0 } else { 10.0 })).collect();
        seed(&store, "BILL_RRP_BPS", &bill, "bps");

        let weeks = [
            (d(4), -10.0e9),
            (d(11), -5.0e9),
            (d(18), 200.0e9),
        ];
        seed(&store, "UST_NET_SETTLE_W", &weeks, "USD");
        store
    }

    #[test]
    fn snapshot_includes_evaluable_indicators_only() {
        let store = seeded_store();
        let snap = compute_snapshot(&store, "1w", 10, false, None, AsOfMode::Fetched, false).unwrap();

        let ids: Vec<&str> = snap.indicators.iter().map(|e| e.id.as_str()).collect();
        assert!(ids.contains(&"bill_rrp"));
        assert!(ids.contains(&"ust_net_w"));
        // Nothing else has data.
        assert_eq!(snap.bucket_details.len(), 2);
        assert_eq!(snap.frozen_inputs_id, "temp");

        let bill = snap.indicators.iter().find(|e| e.id == "bill_rrp").unwrap();
        assert_eq!(bill.status, IndicatorStatus::Supportive);
        let settle = snap.indicators.iter().find(|e| e.id == "ust_net_w").unwrap();
        assert_eq!(settle.status, IndicatorStatus::Draining);
        assert!(settle.z20.is_some());

        // Representatives are ranked by |z|: the z-scored indicator first.
        assert_eq!(snap.indicators[0].id, "ust_net_w");
    }

    #[test]
    fn snapshot_membership_matches_evaluated_count() {
        let store = seeded_store();
        let snap = compute_snapshot(&store, "1w", 10, false, None, AsOfMode::Fetched, false).unwrap();
        let member_total: usize = snap.bucket_details.iter().map(|b| b.members.len()).sum();
        assert_eq!(member_total, 2);
        for bucket in &snap.bucket_details {
            assert_eq!(
                bucket.members.iter().filter(|m| m.is_representative).count(),
                1
            );
        }
    }

    #[test]
    fn save_persists_rows_for_every_evaluated_indicator() {
        let store = seeded_store();
        let as_of = ts(20, 12);
        let snap =
            compute_snapshot(&store, "1w", 1, true, Some(as_of), AsOfMode::Fetched, true).unwrap();
        assert_ne!(snap.frozen_inputs_id, "temp");
        // k=1 truncates the evidence list, but persistence covers both
        // evaluated indicators.
        assert_eq!(snap.indicators.len(), 1);
        let hist_bill = store
            .indicator_history("bill_rrp", "1w", 0, ts(21, 0))
            .unwrap();
        let hist_settle = store
            .indicator_history("ust_net_w", "1w", 0, ts(21, 0))
            .unwrap();
        assert_eq!(hist_bill.len(), 1);
        assert_eq!(hist_settle.len(), 1);
    }

    #[test]
    fn day_level_persistence_is_idempotent() {
        let store = seeded_store();
        for h in [10, 15] {
            compute_snapshot(&store, "1w", 8, true, Some(ts(20, h)), AsOfMode::Fetched, true)
                .unwrap();
        }
        assert_eq!(store.snapshots_on_day("1w", d(20)).unwrap(), 1);
    }

    #[test]
    fn frozen_inputs_reference_reproducing_rows() {
        let store = seeded_store();
        let as_of = ts(20, 12);
        let snap =
            compute_snapshot(&store, "1w", 10, true, Some(as_of), AsOfMode::Fetched, true).unwrap();

        let frozen = store.frozen_inputs(&snap.frozen_inputs_id).unwrap().unwrap();
        let items = frozen.as_array().unwrap();
        assert!(!items.is_empty());

        // Rebuild a store holding only the referenced vintages and check the
        // evidence values reproduce exactly.
        let referenced: Vec<(String, String)> = items
            .iter()
            .map(|it| {
                (
                    it["series_id"].as_str().unwrap().to_string(),
                    it["vintage_id"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        let replay = Store::open_in_memory().unwrap();
        replay.seed_defaults().unwrap();
        for (series_id, vintage_id) in &referenced {
            let rows = store.latest_points(series_id, 500).unwrap();
            for p in rows.iter().filter(|p| &p.vintage_id == vintage_id) {
                replay
                    .upsert_points(
                        series_id,
                        &[NewPoint {
                            observation_date: p.observation_date,
                            vintage_date: p.vintage_date,
                            publication_date: p.publication_date,
                            fetched_at: Some(p.fetched_at),
                            value_numeric: p.value_numeric,
                        }],
                        &p.units,
                        p.scale,
                        &p.source,
                        p.source_url.as_deref(),
                        None,
                    )
                    .unwrap();
            }
        }

        let replayed =
            compute_snapshot(&replay, "1w", 10, false, Some(as_of), AsOfMode::Fetched, false)
                .unwrap();
        for original in &snap.indicators {
            let again = replayed
                .indicators
                .iter()
                .find(|e| e.id == original.id)
                .unwrap_or_else(|| panic!("{} missing after replay", original.id));
            assert_eq!(again.value_numeric, original.value_numeric, "{}", original.id);
        }
    }

    #[test]
    fn router_ranks_by_absolute_z_and_skips_missing() {
        let store = seeded_store();
        let router = compute_router(&store, "1w", 8).unwrap();
        let ids: Vec<&str> = router.picks.iter().map(|p| p.id.as_str()).collect();
        // bill_rrp's primary series exists; ust_net_w's derived series exists.
        assert!(ids.contains(&"bill_rrp"));
        assert!(ids.contains(&"ust_net_w"));
        assert_eq!(ids.len(), 2, "indicators without data are skipped");
        // The settlement surge has the largest |z|.
        assert_eq!(ids[0], "ust_net_w");
        assert!(!router.picks[0].why.is_empty());
    }

    #[test]
    fn backfill_persists_one_snapshot_per_day() {
        let store = seeded_store();
        let now = ts(20, 12);
        let n = backfill_history(&store, "1w", 3, 8, AsOfMode::Obs, now).unwrap();
        assert_eq!(n, 4);
        for offset in 0..=3u32 {
            assert_eq!(store.snapshots_on_day("1w", d(20 - offset)).unwrap(), 1);
        }
        // Rerunning the backfill stays idempotent.
        backfill_history(&store, "1w", 3, 8, AsOfMode::Obs, now).unwrap();
        assert_eq!(store.snapshots_on_day("1w", d(20)).unwrap(), 1);
    }
}
