// =============================================================================
// Indicator Evaluator — per-indicator evidence with provenance
// =============================================================================
//
// `evaluate` resolves the indicator's input points for the requested as-of
// timeline, dispatches on the registry's scoring variant, and produces an
// evidence row plus a numeric contribution in {−1, 0, +1}.
//
// Missing inputs are never an error: the indicator degrades to status "n/a"
// and the aggregator excludes it. Store failures are the only errors that
// propagate.
// =============================================================================

mod composite;
mod threshold;
mod zscore;

use std::sync::OnceLock;

use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::json;

use crate::registry::{resolve_series_id, IndicatorSpec, ScoringRule};
use crate::store::{SeriesPoint, Store};
use crate::types::{AsOfMode, IndicatorStatus};

/// Evaluator output for one indicator.
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorEvidence {
    pub id: String,
    pub value_numeric: Option<f64>,
    pub window: Option<String>,
    pub z20: Option<f64>,
    pub status: IndicatorStatus,
    pub flip_trigger: String,
    pub provenance: serde_json::Value,
}

/// Read context: one as-of selection shared by every series an indicator
/// touches.
pub struct EvalContext<'a> {
    pub store: &'a Store,
    pub as_of: Option<DateTime<Utc>>,
    pub mode: AsOfMode,
}

impl<'a> EvalContext<'a> {
    pub fn new(store: &'a Store, as_of: Option<DateTime<Utc>>, mode: AsOfMode) -> Self {
        Self { store, as_of, mode }
    }

    /// Points for `series_id` (registry aliases resolved) on this context's
    /// timeline.
    pub fn pts(&self, series_id: &str, limit: usize) -> Result<Vec<SeriesPoint>> {
        self.store
            .points_for_mode(resolve_series_id(series_id), self.as_of, self.mode, limit)
    }
}

/// Evaluate one indicator. Returns the evidence row and its contribution.
pub fn evaluate(
    store: &Store,
    spec: &IndicatorSpec,
    as_of: Option<DateTime<Utc>>,
    mode: AsOfMode,
) -> Result<(IndicatorEvidence, f64)> {
    let ctx = EvalContext::new(store, as_of, mode);

    if spec.series.is_empty() {
        return Ok(not_available(spec));
    }

    match &spec.rule {
        ScoringRule::Z => zscore::evaluate_primary(&ctx, spec),
        ScoringRule::DerivedZ { series_id } => zscore::evaluate_derived(&ctx, spec, series_id),
        ScoringRule::CompositeZ => composite::evaluate_net_liquidity(&ctx, spec),
        ScoringRule::Threshold => threshold::evaluate_generic(&ctx, spec),
        ScoringRule::PercentileThreshold { pct } => threshold::evaluate_percentile(&ctx, spec, *pct),
        ScoringRule::SpreadThreshold => composite::evaluate_spread(&ctx, spec),
        ScoringRule::CapComparison => composite::evaluate_cap_comparison(&ctx, spec),
        ScoringRule::BillShareThreshold => composite::evaluate_bill_share(&ctx, spec),
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

/// The `n/a` evidence row: no data, zero contribution.
pub(crate) fn not_available(spec: &IndicatorSpec) -> (IndicatorEvidence, f64) {
    (
        IndicatorEvidence {
            id: spec.indicator_id.clone(),
            value_numeric: None,
            window: None,
            z20: None,
            status: IndicatorStatus::NotAvailable,
            flip_trigger: spec.trigger_default.clone(),
            provenance: json!({ "series": spec.series }),
        },
        0.0,
    )
}

/// Provenance fields describing the exact point a value came from.
pub(crate) fn point_provenance(p: &SeriesPoint) -> serde_json::Map<String, serde_json::Value> {
    let mut m = serde_json::Map::new();
    m.insert("observation_date".into(), json!(p.observation_date));
    m.insert("publication_date".into(), json!(p.publication_date));
    m.insert("vintage_date".into(), json!(p.vintage_date));
    m.insert("fetched_at".into(), json!(p.fetched_at));
    m.insert("vintage_id".into(), json!(p.vintage_id));
    m.insert("source".into(), json!(p.source));
    m.insert("source_url".into(), json!(p.source_url));
    m
}

/// Comparison operator parsed from a flip-trigger expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cmp {
    Gt,
    Ge,
    Lt,
    Le,
}

impl Cmp {
    pub fn eval(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Ge => value >= threshold,
            Self::Lt => value < threshold,
            Self::Le => value <= threshold,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }
}

/// Parse `(comparator, operand)` out of a trigger expression such as
/// `">= 25 bps"`. Returns `None` when no ASCII comparator is present; the
/// caller then treats the threshold as unsatisfiable.
pub(crate) fn parse_comparator(trigger: &str) -> Option<(Cmp, f64)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)(>=|>|<=|<)\s*([+-]?\d+(?:\.\d+)?(?:e[+-]?\d+)?)").expect("valid regex")
    });
    let caps = re.captures(trigger)?;
    let cmp = match &caps[1] {
        ">" => Cmp::Gt,
        ">=" => Cmp::Ge,
        "<" => Cmp::Lt,
        "<=" => Cmp::Le,
        _ => return None,
    };
    let value: f64 = caps[2].parse().ok()?;
    Some((cmp, value))
}

/// Derive the measurement-window tag shown next to an indicator's value
/// (`w`, `5d`, …). This is the window of the measured change, not the z
/// lookback.
pub(crate) fn derive_measurement_window(trigger: &str, cadence: &str) -> Option<String> {
    static SLASH: OnceLock<Regex> = OnceLock::new();
    static OVER: OnceLock<Regex> = OnceLock::new();
    let slash = SLASH
        .get_or_init(|| Regex::new(r"(?i)/\s*([0-9]+[dw]|[dw])\b").expect("valid regex"));
    let over = OVER.get_or_init(|| Regex::new(r"(?i)over\s+([0-9]+[dw])\b").expect("valid regex"));

    if let Some(caps) = slash.captures(trigger) {
        return Some(caps[1].to_lowercase());
    }
    if let Some(caps) = over.captures(trigger) {
        return Some(caps[1].to_lowercase());
    }
    if cadence.eq_ignore_ascii_case("weekly") {
        return Some("w".to_string());
    }
    None
}

/// Count how many of the last `required` values satisfy the comparator.
/// `None` comparator satisfies nothing.
pub(crate) fn streak_over_last(
    values: &[f64],
    required: usize,
    comparator: Option<(Cmp, f64)>,
) -> usize {
    let Some((cmp, threshold)) = comparator else { return 0 };
    let start = values.len().saturating_sub(required);
    values[start..].iter().filter(|v| cmp.eval(**v, threshold)).count()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::default_registry;

    #[test]
    fn comparator_parsing() {
        assert_eq!(parse_comparator(">= 25 bps"), Some((Cmp::Ge, 25.0)));
        assert_eq!(parse_comparator("> 0 bps for 3d"), Some((Cmp::Gt, 0.0)));
        assert_eq!(parse_comparator("<= -1.5"), Some((Cmp::Le, -1.5)));
        assert_eq!(parse_comparator("< 3e2"), Some((Cmp::Lt, 300.0)));
        assert_eq!(parse_comparator("@cap => headwind"), None);
        assert_eq!(parse_comparator(""), None);
    }

    #[test]
    fn comparator_semantics() {
        assert!(Cmp::Ge.eval(25.0, 25.0));
        assert!(!Cmp::Gt.eval(25.0, 25.0));
        assert!(Cmp::Lt.eval(-1.0, 0.0));
        assert!(Cmp::Le.eval(0.0, 0.0));
    }

    #[test]
    fn measurement_window_derivation() {
        assert_eq!(derive_measurement_window("Δ ≥ +$25B/w", "weekly"), Some("w".into()));
        assert_eq!(derive_measurement_window("Δ ≥ +$75B over 5d", "daily"), Some("5d".into()));
        assert_eq!(derive_measurement_window("Δ ≥ +$50B over 2w", "weekly_daily"), Some("2w".into()));
        assert_eq!(derive_measurement_window("> 0 bps", "weekly"), Some("w".into()));
        assert_eq!(derive_measurement_window("> 0 bps", "daily"), None);
    }

    #[test]
    fn empty_series_list_is_not_available() {
        let store = Store::open_in_memory().unwrap();
        let mut spec = default_registry().remove(0);
        spec.series.clear();
        let (ev, contrib) = evaluate(&store, &spec, None, AsOfMode::Fetched).unwrap();
        assert_eq!(ev.status, IndicatorStatus::NotAvailable);
        assert_eq!(contrib, 0.0);
    }

    #[test]
    fn missing_store_points_is_not_available() {
        let store = Store::open_in_memory().unwrap();
        let specs = default_registry();
        for spec in &specs {
            let (ev, contrib) = evaluate(&store, spec, None, AsOfMode::Fetched).unwrap();
            assert_eq!(ev.status, IndicatorStatus::NotAvailable, "{}", spec.indicator_id);
            assert_eq!(contrib, 0.0);
        }
    }

    #[test]
    fn streak_counts_only_last_required() {
        let vals = [1.0, 30.0, 30.0];
        assert_eq!(streak_over_last(&vals, 2, Some((Cmp::Ge, 25.0))), 2);
        assert_eq!(streak_over_last(&vals, 3, Some((Cmp::Ge, 25.0))), 2);
        assert_eq!(streak_over_last(&vals, 2, None), 0);
    }
}
