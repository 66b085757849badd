// =============================================================================
// Threshold-scored indicators — comparator and percentile flavors
// =============================================================================

use anyhow::Result;
use serde_json::json;

use super::{not_available, parse_comparator, point_provenance, streak_over_last, EvalContext, IndicatorEvidence};
use crate::registry::IndicatorSpec;
use crate::store::SeriesPoint;
use crate::types::IndicatorStatus;

/// Points loaded for threshold evaluation; generous relative to any sane
/// persistence setting.
const THRESHOLD_POINT_LIMIT: usize = 60;

/// Rolling window for percentile thresholds (~1 year of business days).
const PERCENTILE_WINDOW: usize = 252;

/// Generic comparator threshold on the primary series.
///
/// The comparator is parsed from `trigger_default`; a parse failure leaves the
/// threshold unsatisfiable and the status neutral. The last `persistence`
/// observations must all satisfy for the status to flip to
/// `directionality_sign`.
pub(crate) fn evaluate_generic(
    ctx: &EvalContext<'_>,
    spec: &IndicatorSpec,
) -> Result<(IndicatorEvidence, f64)> {
    let points = ctx.pts(&spec.series[0], THRESHOLD_POINT_LIMIT)?;
    if points.is_empty() {
        return Ok(not_available(spec));
    }

    let comparator = parse_comparator(&spec.trigger_default);
    let required = spec.streak_required();
    let values: Vec<f64> = points.iter().map(|p| p.value_numeric).collect();
    let ok = streak_over_last(&values, required, comparator);

    let status = if ok >= required { spec.directionality.sign() } else { 0.0 };
    let latest = points.last().expect("non-empty points");

    Ok(build_threshold_evidence(
        spec,
        &spec.series,
        latest,
        latest.value_numeric,
        comparator_provenance(comparator),
        ok,
        required,
        status,
    ))
}

/// Percentile threshold: the last `persistence` observations must each exceed
/// the nearest-rank percentile of the rolling window.
pub(crate) fn evaluate_percentile(
    ctx: &EvalContext<'_>,
    spec: &IndicatorSpec,
    pct: f64,
) -> Result<(IndicatorEvidence, f64)> {
    let points = ctx.pts(&spec.series[0], PERCENTILE_WINDOW)?;
    let start = points.len().saturating_sub(PERCENTILE_WINDOW);
    let window: Vec<f64> = points[start..].iter().map(|p| p.value_numeric).collect();
    if window.len() < 3 {
        return Ok(not_available(spec));
    }

    let cutoff = nearest_rank_percentile(&window, pct / 100.0);
    let required = spec.streak_required();
    let tail_start = points.len().saturating_sub(required);
    let ok = points[tail_start..]
        .iter()
        .filter(|p| p.value_numeric > cutoff)
        .count();

    let status = if ok >= required { spec.directionality.sign() } else { 0.0 };
    let latest = points.last().expect("non-empty points");

    Ok(build_threshold_evidence(
        spec,
        &spec.series,
        latest,
        latest.value_numeric,
        json!({ "type": "percentile", "pct": pct, "cutoff_value": cutoff }),
        ok,
        required,
        status,
    ))
}

/// Nearest-rank percentile: `sorted(values)[ceil(p·n) − 1]`, clamped.
pub(crate) fn nearest_rank_percentile(values: &[f64], p: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    let k = ((p * n as f64).ceil() as isize - 1).clamp(0, n as isize - 1) as usize;
    sorted[k]
}

pub(crate) fn comparator_provenance(comparator: Option<(super::Cmp, f64)>) -> serde_json::Value {
    match comparator {
        Some((cmp, value)) => json!({ "op": cmp.as_str(), "value": value }),
        None => json!({ "op": "", "value": null }),
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn build_threshold_evidence(
    spec: &IndicatorSpec,
    series_in_provenance: &[String],
    latest: &SeriesPoint,
    value: f64,
    threshold: serde_json::Value,
    streak_current: usize,
    streak_required: usize,
    status: f64,
) -> (IndicatorEvidence, f64) {
    let mut provenance = serde_json::Map::new();
    provenance.insert("series".into(), json!(series_in_provenance));
    provenance.extend(point_provenance(latest));
    provenance.insert("threshold".into(), threshold);
    provenance.insert(
        "streak".into(),
        json!({ "current": streak_current, "required": streak_required }),
    );

    (
        IndicatorEvidence {
            id: spec.indicator_id.clone(),
            value_numeric: Some(value),
            window: None,
            z20: None,
            status: IndicatorStatus::from_sign(status),
            flip_trigger: spec.trigger_default.clone(),
            provenance: serde_json::Value::Object(provenance),
        },
        status,
    )
}
