// =============================================================================
// Composite indicators — net liquidity, rate spreads, QT caps, bill share
// =============================================================================

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::NaiveDate;
use serde_json::json;

use super::threshold::{build_threshold_evidence, comparator_provenance};
use super::zscore::{z_evidence, z_status};
use super::{not_available, parse_comparator, Cmp, EvalContext, IndicatorEvidence};
use crate::registry::IndicatorSpec;
use crate::store::SeriesPoint;
use crate::types::IndicatorStatus;

/// Composite history cap: enough for a 20-observation z window with slack.
const COMPOSITE_POINT_LIMIT: usize = 40;

fn by_date(points: Vec<SeriesPoint>) -> BTreeMap<NaiveDate, SeriesPoint> {
    points.into_iter().map(|p| (p.observation_date, p)).collect()
}

fn input_entry(p: &SeriesPoint) -> serde_json::Value {
    json!({
        "observation_date": p.observation_date,
        "vintage_id": p.vintage_id,
        "fetched_at": p.fetched_at,
    })
}

// =============================================================================
// Net liquidity: WALCL − TGA − RRP
// =============================================================================

/// Daily composite aligning TGA/RRP dates with the most recent prior WALCL
/// observation, z-scored like any other series.
pub(crate) fn evaluate_net_liquidity(
    ctx: &EvalContext<'_>,
    spec: &IndicatorSpec,
) -> Result<(IndicatorEvidence, f64)> {
    if spec.series.len() < 3 {
        return Ok(not_available(spec));
    }
    let walcl = ctx.pts(&spec.series[0], 60)?;
    let tga = ctx.pts(&spec.series[1], 120)?;
    let rrp = ctx.pts(&spec.series[2], 120)?;
    if walcl.is_empty() || tga.is_empty() || rrp.is_empty() {
        return Ok(not_available(spec));
    }

    let tga_by_date = by_date(tga);
    let rrp_by_date = by_date(rrp);

    // Composite per common TGA/RRP date. The WALCL observation actually used
    // (most recent with observation_date <= date) travels with each point.
    struct CompositePoint {
        date: NaiveDate,
        value: f64,
        inputs: serde_json::Value,
    }

    let mut composite: Vec<CompositePoint> = Vec::new();
    for (date, tga_p) in &tga_by_date {
        let Some(rrp_p) = rrp_by_date.get(date) else { continue };
        let Some(walcl_p) = walcl.iter().rev().find(|w| w.observation_date <= *date) else {
            continue;
        };
        let value = walcl_p.scaled_value() - tga_p.scaled_value() - rrp_p.scaled_value();
        let mut inputs = serde_json::Map::new();
        inputs.insert(spec.series[0].clone(), input_entry(walcl_p));
        inputs.insert(spec.series[1].clone(), input_entry(tga_p));
        inputs.insert(spec.series[2].clone(), input_entry(rrp_p));
        composite.push(CompositePoint {
            date: *date,
            value,
            inputs: serde_json::Value::Object(inputs),
        });
    }

    let start = composite.len().saturating_sub(COMPOSITE_POINT_LIMIT);
    let composite = &composite[start..];
    if composite.is_empty() {
        return Ok(not_available(spec));
    }

    let values: Vec<f64> = composite.iter().map(|c| c.value).collect();
    let (z, status) = z_status(
        &values,
        spec.cutoff(),
        spec.streak_required(),
        spec.directionality.sign(),
    );

    let last = composite.last().expect("non-empty composite");
    let (mut evidence, contrib) = z_evidence(
        spec,
        &spec.series,
        &[],
        Some(last.value),
        z,
        status,
        Some(last.inputs.clone()),
    );
    if let Some(obj) = evidence.provenance.as_object_mut() {
        obj.insert("observation_date".into(), json!(last.date));
    }
    Ok((evidence, contrib))
}

// =============================================================================
// Spread threshold: series[0] − series[1] on the date intersection
// =============================================================================

pub(crate) fn evaluate_spread(
    ctx: &EvalContext<'_>,
    spec: &IndicatorSpec,
) -> Result<(IndicatorEvidence, f64)> {
    if spec.series.len() < 2 {
        return Ok(not_available(spec));
    }
    let a = ctx.pts(&spec.series[0], 60)?;
    let b = ctx.pts(&spec.series[1], 60)?;
    if a.is_empty() || b.is_empty() {
        return Ok(not_available(spec));
    }

    let a_by_date = by_date(a);
    let b_by_date = by_date(b);
    let spreads: Vec<(NaiveDate, f64)> = a_by_date
        .iter()
        .filter_map(|(date, pa)| {
            b_by_date
                .get(date)
                .map(|pb| (*date, pa.value_numeric - pb.value_numeric))
        })
        .collect();
    if spreads.is_empty() {
        return Ok(not_available(spec));
    }

    let comparator = parse_comparator(&spec.trigger_default).or(Some((Cmp::Gt, 0.0)));
    let required = spec.streak_required();
    let tail_start = spreads.len().saturating_sub(required);
    let ok = spreads[tail_start..]
        .iter()
        .filter(|(_, s)| {
            let (cmp, threshold) = comparator.expect("comparator defaulted");
            cmp.eval(*s, threshold)
        })
        .count();
    let status = if ok >= required { spec.directionality.sign() } else { 0.0 };

    let (last_date, last_spread) = *spreads.last().expect("non-empty spreads");
    let latest_a = &a_by_date[&last_date];

    let (mut evidence, contrib) = build_threshold_evidence(
        spec,
        &spec.series,
        latest_a,
        last_spread,
        comparator_provenance(comparator),
        ok,
        required,
        status,
    );
    if let Some(obj) = evidence.provenance.as_object_mut() {
        obj.insert("observation_date".into(), json!(last_date));
    }
    Ok((evidence, contrib))
}

// =============================================================================
// QT pace vs caps
// =============================================================================

/// Format a cap for the flip trigger, e.g. `$9.00B`.
fn fmt_cap(value: f64) -> String {
    let v = value.abs();
    if v >= 1e12 {
        format!("${:.2}T", v / 1e12)
    } else if v >= 1e9 {
        format!("${:.2}B", v / 1e9)
    } else if v >= 1e6 {
        format!("${:.2}M", v / 1e6)
    } else if v >= 1e3 {
        format!("${:.2}K", v / 1e3)
    } else {
        let s = format!("${v:.2}");
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// Weekly runoff of the two holdings series against the applicable caps.
/// Either runoff at or above its cap flags a headwind (−1); otherwise 0.
pub(crate) fn evaluate_cap_comparison(
    ctx: &EvalContext<'_>,
    spec: &IndicatorSpec,
) -> Result<(IndicatorEvidence, f64)> {
    if spec.series.len() < 2 {
        return Ok(not_available(spec));
    }
    let ust = ctx.pts(&spec.series[0], 2)?;
    let mbs = ctx.pts(&spec.series[1], 2)?;
    if ust.len() < 2 || mbs.len() < 2 {
        return Ok(not_available(spec));
    }

    let runoff = |latest: &SeriesPoint, prev: &SeriesPoint| {
        f64::max(0.0, -(latest.scaled_value() - prev.scaled_value()))
    };
    let ust_latest = &ust[ust.len() - 1];
    let mbs_latest = &mbs[mbs.len() - 1];
    let ust_runoff = runoff(ust_latest, &ust[ust.len() - 2]);
    let mbs_runoff = runoff(mbs_latest, &mbs[mbs.len() - 2]);

    let Some(cap) = ctx.store.qt_cap_as_of(ust_latest.observation_date)? else {
        return Ok(not_available(spec));
    };

    let at_cap = ust_runoff >= cap.ust_cap_usd_week || mbs_runoff >= cap.mbs_cap_usd_week;
    let status = if at_cap { -1.0 } else { 0.0 };

    let fetched_at = std::cmp::max(ust_latest.fetched_at, mbs_latest.fetched_at);
    let provenance = json!({
        "series": spec.series,
        "fetched_at": fetched_at,
        "observation_date": ust_latest.observation_date,
        "qt_caps": {
            "effective_date": cap.effective_date,
            "ust_cap_usd_week": cap.ust_cap_usd_week,
            "mbs_cap_usd_week": cap.mbs_cap_usd_week,
        },
    });

    Ok((
        IndicatorEvidence {
            id: spec.indicator_id.clone(),
            value_numeric: Some(ust_runoff + mbs_runoff),
            window: None,
            z20: None,
            status: IndicatorStatus::from_sign(status),
            // Explicit numeric caps so briefs can cite them.
            flip_trigger: format!(
                "UST ≥ {}/w or MBS ≥ {}/w",
                fmt_cap(cap.ust_cap_usd_week),
                fmt_cap(cap.mbs_cap_usd_week)
            ),
            provenance,
        },
        status,
    ))
}

// =============================================================================
// Bill share of auction offerings
// =============================================================================

pub(crate) fn evaluate_bill_share(
    ctx: &EvalContext<'_>,
    spec: &IndicatorSpec,
) -> Result<(IndicatorEvidence, f64)> {
    if spec.series.len() < 2 {
        return Ok(not_available(spec));
    }
    let bills = ctx.pts(&spec.series[0], 120)?;
    let total = ctx.pts(&spec.series[1], 120)?;
    if bills.is_empty() || total.is_empty() {
        return Ok(not_available(spec));
    }

    let bills_by_date = by_date(bills);
    let total_by_date = by_date(total);
    let mut pct_points: Vec<(NaiveDate, f64)> = Vec::new();
    for (date, total_p) in &total_by_date {
        let tot = total_p.value_numeric;
        if tot <= 0.0 {
            continue;
        }
        let bill_amt = bills_by_date.get(date).map(|p| p.value_numeric);
        let Some(bill_amt) = bill_amt else { continue };
        pct_points.push((*date, 100.0 * bill_amt / tot));
    }
    if pct_points.is_empty() {
        return Ok(not_available(spec));
    }

    let comparator = parse_comparator(&spec.trigger_default).or(Some((Cmp::Ge, 65.0)));
    let required = spec.streak_required();
    let tail_start = pct_points.len().saturating_sub(required);
    let ok = pct_points[tail_start..]
        .iter()
        .filter(|(_, pct)| {
            let (cmp, threshold) = comparator.expect("comparator defaulted");
            cmp.eval(*pct, threshold)
        })
        .count();
    let status = if ok >= required { spec.directionality.sign() } else { 0.0 };

    let (latest_date, latest_pct) = *pct_points.last().expect("non-empty pct points");
    let (cmp, threshold) = comparator.expect("comparator defaulted");
    let provenance = json!({
        "series": spec.series,
        "auction_date": latest_date,
        "bill_share_pct": latest_pct,
        "threshold": { "op": cmp.as_str(), "value": threshold, "units": "%" },
        "streak": { "current": ok, "required": required },
    });

    Ok((
        IndicatorEvidence {
            id: spec.indicator_id.clone(),
            value_numeric: Some(latest_pct),
            window: None,
            z20: None,
            status: IndicatorStatus::from_sign(status),
            flip_trigger: spec.trigger_default.clone(),
            provenance,
        },
        status,
    ))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::evaluate;
    use crate::registry::default_registry;
    use crate::store::{NewPoint, QtCap, Store};
    use crate::types::AsOfMode;
    use chrono::{Duration, TimeZone, Utc};

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, day).unwrap()
    }

    fn seed(store: &Store, sid: &str, rows: &[(NaiveDate, f64)], scale: f64) {
        let now = Utc.with_ymd_and_hms(2025, 8, 25, 0, 0, 0).unwrap();
        let points: Vec<NewPoint> = rows
            .iter()
            .map(|&(obs, v)| NewPoint::new(obs, v).fetched(now))
            .collect();
        store
            .upsert_points(sid, &points, "USD", scale, "TEST", None, None)
            .unwrap();
    }

    fn spec(id: &str) -> crate::registry::IndicatorSpec {
        default_registry().into_iter().find(|s| s.indicator_id == id).unwrap()
    }

    // ---- sofr_iorb spread -------------------------------------------------

    #[test]
    fn spread_persistent_above_zero_is_draining() {
        let store = Store::open_in_memory().unwrap();
        // SOFR prints above IORB for the last 3 days.
        let sofr: Vec<(NaiveDate, f64)> =
            [5.0, 5.0, 5.1, 5.1, 5.1].iter().enumerate().map(|(i, v)| (d(1) + Duration::days(i as i64), *v)).collect();
        let iorb: Vec<(NaiveDate, f64)> =
            (0..5).map(|i| (d(1) + Duration::days(i as i64), 5.0)).collect();
        seed(&store, "SOFR", &sofr, 1.0);
        seed(&store, "IORB", &iorb, 1.0);

        let (ev, contrib) = evaluate(&store, &spec("sofr_iorb"), None, AsOfMode::Fetched).unwrap();
        assert_eq!(ev.status, IndicatorStatus::Draining);
        assert_eq!(contrib, -1.0);
        assert!((ev.value_numeric.unwrap() - 0.1).abs() < 1e-9);
        assert_eq!(ev.provenance["streak"], json!({"current": 3, "required": 3}));
    }

    #[test]
    fn spread_broken_streak_is_neutral() {
        let store = Store::open_in_memory().unwrap();
        // Only the last 2 of 3 required days are above zero.
        let sofr: Vec<(NaiveDate, f64)> =
            [5.0, 5.0, 5.0, 5.1, 5.1].iter().enumerate().map(|(i, v)| (d(1) + Duration::days(i as i64), *v)).collect();
        let iorb: Vec<(NaiveDate, f64)> =
            (0..5).map(|i| (d(1) + Duration::days(i as i64), 5.0)).collect();
        seed(&store, "SOFR", &sofr, 1.0);
        seed(&store, "IORB", &iorb, 1.0);

        let (ev, contrib) = evaluate(&store, &spec("sofr_iorb"), None, AsOfMode::Fetched).unwrap();
        assert_eq!(ev.status, IndicatorStatus::Neutral);
        assert_eq!(contrib, 0.0);
    }

    #[test]
    fn spread_requires_date_intersection() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "SOFR", &[(d(1), 5.1)], 1.0);
        seed(&store, "IORB", &[(d(2), 5.0)], 1.0);
        let (ev, _) = evaluate(&store, &spec("sofr_iorb"), None, AsOfMode::Fetched).unwrap();
        assert_eq!(ev.status, IndicatorStatus::NotAvailable);
    }

    // ---- qt_pace ----------------------------------------------------------

    fn seed_qt(store: &Store, ust: (f64, f64), mbs: (f64, f64)) {
        seed(store, "WSHOSHO", &[(d(11), ust.0), (d(18), ust.1)], 1.0);
        seed(store, "WSHOMCB", &[(d(11), mbs.0), (d(18), mbs.1)], 1.0);
    }

    fn set_caps(store: &Store, ust: f64, mbs: f64) {
        store.clear_qt_caps().unwrap();
        store
            .upsert_qt_cap(&QtCap {
                effective_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                ust_cap_usd_week: ust,
                mbs_cap_usd_week: mbs,
            })
            .unwrap();
    }

    #[test]
    fn qt_runoff_at_cap_is_headwind() {
        let store = Store::open_in_memory().unwrap();
        seed_qt(&store, (100.0, 90.0), (200.0, 195.0));
        set_caps(&store, 9.0, 8.0);

        let (ev, contrib) = evaluate(&store, &spec("qt_pace"), None, AsOfMode::Fetched).unwrap();
        // UST runoff 10 ≥ cap 9.
        assert_eq!(ev.status, IndicatorStatus::Draining);
        assert_eq!(contrib, -1.0);
        assert!((ev.value_numeric.unwrap() - 15.0).abs() < 1e-9);
        assert!(ev.flip_trigger.contains("UST ≥"));
    }

    #[test]
    fn qt_runoff_under_raised_caps_is_neutral() {
        let store = Store::open_in_memory().unwrap();
        seed_qt(&store, (100.0, 90.0), (200.0, 195.0));
        set_caps(&store, 15.0, 12.0);

        let (ev, contrib) = evaluate(&store, &spec("qt_pace"), None, AsOfMode::Fetched).unwrap();
        assert_eq!(ev.status, IndicatorStatus::Neutral);
        assert_eq!(contrib, 0.0);
    }

    #[test]
    fn qt_growing_holdings_have_zero_runoff() {
        let store = Store::open_in_memory().unwrap();
        seed_qt(&store, (100.0, 120.0), (200.0, 230.0));
        set_caps(&store, 1.0, 1.0);
        let (ev, _) = evaluate(&store, &spec("qt_pace"), None, AsOfMode::Fetched).unwrap();
        assert_eq!(ev.status, IndicatorStatus::Neutral);
        assert_eq!(ev.value_numeric, Some(0.0));
    }

    #[test]
    fn qt_without_applicable_cap_is_not_available() {
        let store = Store::open_in_memory().unwrap();
        seed_qt(&store, (100.0, 90.0), (200.0, 195.0));
        store.clear_qt_caps().unwrap();
        let (ev, _) = evaluate(&store, &spec("qt_pace"), None, AsOfMode::Fetched).unwrap();
        assert_eq!(ev.status, IndicatorStatus::NotAvailable);
    }

    #[test]
    fn qt_needs_two_weekly_points_per_series() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "WSHOSHO", &[(d(18), 100.0)], 1.0);
        seed(&store, "WSHOMCB", &[(d(11), 200.0), (d(18), 195.0)], 1.0);
        set_caps(&store, 9.0, 8.0);
        let (ev, _) = evaluate(&store, &spec("qt_pace"), None, AsOfMode::Fetched).unwrap();
        assert_eq!(ev.status, IndicatorStatus::NotAvailable);
    }

    #[test]
    fn cap_formatting() {
        assert_eq!(fmt_cap(9.0e9), "$9.00B");
        assert_eq!(fmt_cap(1.25e12), "$1.25T");
        assert_eq!(fmt_cap(5.0e6), "$5.00M");
    }

    // ---- bill_share -------------------------------------------------------

    #[test]
    fn bill_share_above_threshold_is_supportive() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "UST_AUCTION_OFFERINGS", &[(d(1), 100.0), (d(2), 100.0)], 1.0);
        seed(&store, "UST_BILL_OFFERINGS", &[(d(1), 50.0), (d(2), 70.0)], 1.0);

        let (ev, contrib) = evaluate(&store, &spec("bill_share"), None, AsOfMode::Fetched).unwrap();
        // Latest auction day: 70% ≥ 65%.
        assert_eq!(ev.status, IndicatorStatus::Supportive);
        assert_eq!(contrib, 1.0);
        assert!((ev.value_numeric.unwrap() - 70.0).abs() < 1e-9);
        assert_eq!(ev.provenance["threshold"]["units"], json!("%"));
        assert_eq!(ev.provenance["auction_date"], json!("2025-08-02"));
    }

    #[test]
    fn bill_share_below_threshold_is_neutral() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "UST_AUCTION_OFFERINGS", &[(d(1), 100.0)], 1.0);
        seed(&store, "UST_BILL_OFFERINGS", &[(d(1), 40.0)], 1.0);
        let (ev, contrib) = evaluate(&store, &spec("bill_share"), None, AsOfMode::Fetched).unwrap();
        assert_eq!(ev.status, IndicatorStatus::Neutral);
        assert_eq!(contrib, 0.0);
    }

    #[test]
    fn bill_share_skips_zero_total_days() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "UST_AUCTION_OFFERINGS", &[(d(1), 0.0), (d(2), 100.0)], 1.0);
        seed(&store, "UST_BILL_OFFERINGS", &[(d(1), 10.0), (d(2), 70.0)], 1.0);
        let (ev, _) = evaluate(&store, &spec("bill_share"), None, AsOfMode::Fetched).unwrap();
        assert_eq!(ev.status, IndicatorStatus::Supportive);
    }

    // ---- net_liq ----------------------------------------------------------

    #[test]
    fn net_liq_composite_aligns_walcl_and_carries_inputs() {
        let store = Store::open_in_memory().unwrap();
        // Weekly WALCL, daily TGA/RRP. Scales in millions.
        seed(&store, "WALCL", &[(d(6), 7.0e6), (d(13), 7.1e6)], 1e6);
        let tga: Vec<(NaiveDate, f64)> =
            (14..=20).map(|day| (d(day), 0.5e6)).collect();
        let rrp: Vec<(NaiveDate, f64)> =
            (14..=20).map(|day| (d(day), 0.3e6)).collect();
        seed(&store, "TGA", &tga, 1e6);
        seed(&store, "RRPONTSYD", &rrp, 1e6);

        let (ev, _) = evaluate(&store, &spec("net_liq"), None, AsOfMode::Fetched).unwrap();
        assert_ne!(ev.status, IndicatorStatus::NotAvailable);
        // 7.1e12 − 0.5e12 − 0.3e12
        assert!((ev.value_numeric.unwrap() - 6.3e12).abs() < 1e3);
        let inputs = &ev.provenance["inputs"];
        assert_eq!(inputs["WALCL"]["observation_date"], json!("2025-08-13"));
        assert!(inputs["WALCL"]["vintage_id"].is_string());
        assert_eq!(inputs["TGA"]["observation_date"], json!("2025-08-20"));
        assert_eq!(ev.provenance["observation_date"], json!("2025-08-20"));
    }

    #[test]
    fn net_liq_spike_in_tga_drains() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "WALCL", &[(d(1), 7.0e6)], 1e6);
        // TGA stable then surges, shrinking the composite.
        let mut tga: Vec<(NaiveDate, f64)> = (2..=24)
            .map(|day| (d(day), 0.5e6 + (day % 3) as f64 * 0.002e6))
            .collect();
        tga.push((d(25), 1.4e6));
        let rrp: Vec<(NaiveDate, f64)> = (2..=25).map(|day| (d(day), 0.3e6)).collect();
        seed(&store, "TGA", &tga, 1e6);
        seed(&store, "RRPONTSYD", &rrp, 1e6);

        let (ev, contrib) = evaluate(&store, &spec("net_liq"), None, AsOfMode::Fetched).unwrap();
        // Composite fell hard → z below −1 → draining for higher_is_supportive.
        assert!(ev.z20.unwrap() < -1.0);
        assert_eq!(ev.status, IndicatorStatus::Draining);
        assert_eq!(contrib, -1.0);
    }

    #[test]
    fn net_liq_without_prior_walcl_is_not_available() {
        let store = Store::open_in_memory().unwrap();
        // WALCL exists only after every TGA/RRP date.
        seed(&store, "WALCL", &[(d(20), 7.0e6)], 1e6);
        seed(&store, "TGA", &[(d(14), 0.5e6)], 1e6);
        seed(&store, "RRPONTSYD", &[(d(14), 0.3e6)], 1e6);
        let (ev, _) = evaluate(&store, &spec("net_liq"), None, AsOfMode::Fetched).unwrap();
        assert_eq!(ev.status, IndicatorStatus::NotAvailable);
    }
}
