// =============================================================================
// Z-scored indicators — trailing window, persistence, directionality
// =============================================================================

use anyhow::Result;
use serde_json::json;

use super::{derive_measurement_window, not_available, point_provenance, EvalContext, IndicatorEvidence};
use crate::registry::IndicatorSpec;
use crate::stats::{z_score, Z_WINDOW};
use crate::store::SeriesPoint;
use crate::types::IndicatorStatus;

/// Number of best-known points loaded for a z evaluation. Twice the z window
/// so persistence walks never run out of history prematurely.
pub(crate) const Z_POINT_LIMIT: usize = 40;

/// Persistence walk over trailing suffixes.
///
/// For persistence `P`, the suffixes truncating the last `0..P` points must
/// each carry `|z| >= cutoff` and agree in sign after directionality. All `P`
/// qualifying positive yields `+1`, all negative `-1`, anything else `0`.
pub(crate) fn z_status(values: &[f64], cutoff: f64, required: usize, dir_sign: f64) -> (Option<f64>, f64) {
    let z = z_score(values, Z_WINDOW);
    let Some(_) = z else { return (None, 0.0) };

    let walk = |wanted_sign: f64| -> bool {
        let mut qualifying = 0usize;
        for back in 0..required {
            if values.len().saturating_sub(back) < 3 {
                break;
            }
            let suffix = &values[..values.len() - back];
            let Some(zi) = z_score(suffix, Z_WINDOW) else { break };
            if zi.abs() < cutoff {
                break;
            }
            if zi * dir_sign * wanted_sign > 0.0 {
                qualifying += 1;
            } else {
                break;
            }
        }
        qualifying >= required
    };

    if walk(1.0) {
        (z, 1.0)
    } else if walk(-1.0) {
        (z, -1.0)
    } else {
        (z, 0.0)
    }
}

/// Assemble the evidence row shared by all z-scored flavors.
pub(crate) fn z_evidence(
    spec: &IndicatorSpec,
    series_in_provenance: &[String],
    points: &[SeriesPoint],
    value: Option<f64>,
    z: Option<f64>,
    status: f64,
    inputs: Option<serde_json::Value>,
) -> (IndicatorEvidence, f64) {
    let mut provenance = serde_json::Map::new();
    provenance.insert("series".into(), json!(series_in_provenance));
    if let Some(last) = points.last() {
        provenance.extend(point_provenance(last));
    }
    if let Some(inputs) = inputs {
        provenance.insert("inputs".into(), inputs);
    }
    provenance.insert("z_window".into(), json!(Z_WINDOW));

    (
        IndicatorEvidence {
            id: spec.indicator_id.clone(),
            value_numeric: value,
            window: derive_measurement_window(&spec.trigger_default, &spec.cadence),
            z20: z,
            status: IndicatorStatus::from_sign(status),
            flip_trigger: spec.trigger_default.clone(),
            provenance: serde_json::Value::Object(provenance),
        },
        status,
    )
}

/// Plain z scoring on the primary series.
pub(crate) fn evaluate_primary(
    ctx: &EvalContext<'_>,
    spec: &IndicatorSpec,
) -> Result<(IndicatorEvidence, f64)> {
    let points = ctx.pts(&spec.series[0], Z_POINT_LIMIT)?;
    evaluate_points(spec, &spec.series, points)
}

/// z scoring with the primary series substituted by a derived series.
pub(crate) fn evaluate_derived(
    ctx: &EvalContext<'_>,
    spec: &IndicatorSpec,
    series_id: &str,
) -> Result<(IndicatorEvidence, f64)> {
    let points = ctx.pts(series_id, Z_POINT_LIMIT)?;
    evaluate_points(spec, &[series_id.to_string()], points)
}

fn evaluate_points(
    spec: &IndicatorSpec,
    series_in_provenance: &[String],
    points: Vec<SeriesPoint>,
) -> Result<(IndicatorEvidence, f64)> {
    if points.is_empty() {
        return Ok(not_available(spec));
    }
    // z runs over raw values; the evidence value is scaled into natural units.
    let values: Vec<f64> = points.iter().map(|p| p.value_numeric).collect();
    let (z, status) = z_status(
        &values,
        spec.cutoff(),
        spec.streak_required(),
        spec.directionality.sign(),
    );
    let value = points.last().map(|p| p.scaled_value());
    Ok(z_evidence(spec, series_in_provenance, &points, value, z, status, None))
}
