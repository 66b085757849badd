// =============================================================================
// Indicator Registry — specs, scoring variants, bucket roots
// =============================================================================
//
// Every indicator names a scoring variant explicitly. The evaluator dispatches
// on the variant, never on the indicator id, so adding an indicator is a
// registry change rather than a code change.
// =============================================================================

use std::collections::HashMap;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{Directionality, Scoring};

/// Maximum hops when resolving `duplicates_of` chains. Chains are expected to
/// be a forest of depth 1 in practice; the cap guards against bad data.
const MAX_ROOT_HOPS: usize = 32;

// =============================================================================
// Scoring variants
// =============================================================================

/// Tagged scoring variant dispatched by the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScoringRule {
    /// Trailing-20 z-score with persistence/hysteresis.
    Z,
    /// Comparator parsed from `trigger_default` applied to the last
    /// `persistence` observations of the primary series.
    Threshold,
    /// Latest observations must exceed the nearest-rank percentile of a
    /// rolling window (up to 252 observations).
    PercentileThreshold { pct: f64 },
    /// Weekly runoff of two holdings series compared against the applicable
    /// QT caps.
    CapComparison,
    /// Spread of the first two series on their date intersection, thresholded
    /// over the last `persistence` days.
    SpreadThreshold,
    /// Composite net-liquidity series (WALCL − TGA − RRP) z-scored.
    CompositeZ,
    /// Substitute the primary series with a derived series, then z-score.
    DerivedZ { series_id: String },
    /// Bill offerings as a percentage of total offerings per auction date,
    /// thresholded.
    BillShareThreshold,
}

impl ScoringRule {
    /// The coarse scoring family shown on the registry API surface.
    pub fn family(&self) -> Scoring {
        match self {
            Self::Z | Self::CompositeZ | Self::DerivedZ { .. } => Scoring::Z,
            _ => Scoring::Threshold,
        }
    }
}

// =============================================================================
// IndicatorSpec
// =============================================================================

/// One registry entry. Immutable during a snapshot computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSpec {
    #[serde(rename = "id")]
    pub indicator_id: String,
    pub name: String,
    pub category: String,
    pub series: Vec<String>,
    pub cadence: String,
    pub directionality: Directionality,
    pub trigger_default: String,
    pub scoring: Scoring,
    pub rule: ScoringRule,
    pub z_cutoff: Option<f64>,
    pub persistence: Option<u32>,
    pub duplicates_of: Option<String>,
    pub notes: Option<String>,
}

impl IndicatorSpec {
    /// z-cutoff with the registry default of 1.0.
    pub fn cutoff(&self) -> f64 {
        self.z_cutoff.unwrap_or(1.0)
    }

    /// Required consecutive qualifying observations, minimum 1.
    pub fn streak_required(&self) -> usize {
        self.persistence.unwrap_or(1).max(1) as usize
    }
}

/// Map abstract registry series ids to concrete store ids where they differ.
///
/// Lets the registry use canonical names (e.g. `RRP`) while the store holds
/// the actual series (`RRPONTSYD`).
pub fn resolve_series_id(series_id: &str) -> &str {
    match series_id {
        "RRP" => "RRPONTSYD",
        other => other,
    }
}

/// Resolve the bucket root of `indicator_id` by following `duplicates_of`
/// to a fixed point.
///
/// Hops are capped and cycles are broken at the first revisited id (which
/// becomes the root, with a warning) so malformed registries cannot hang a
/// snapshot computation.
pub fn root_of(specs_by_id: &HashMap<String, IndicatorSpec>, indicator_id: &str) -> String {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut current = indicator_id;
    for _ in 0..MAX_ROOT_HOPS {
        if !seen.insert(current) {
            warn!(indicator_id, root = current, "duplicates_of cycle detected");
            return current.to_string();
        }
        match specs_by_id.get(current).and_then(|s| s.duplicates_of.as_deref()) {
            Some(parent) => current = parent,
            None => return current.to_string(),
        }
    }
    warn!(indicator_id, "duplicates_of chain exceeded hop cap");
    current.to_string()
}

// =============================================================================
// Default registry seed
// =============================================================================

/// Built-in registry covering every scoring variant. Loaded into the store on
/// first start; operators replace entries through the registry loader.
pub fn default_registry() -> Vec<IndicatorSpec> {
    fn spec(
        id: &str,
        name: &str,
        category: &str,
        series: &[&str],
        cadence: &str,
        directionality: Directionality,
        trigger: &str,
        rule: ScoringRule,
        z_cutoff: Option<f64>,
        persistence: Option<u32>,
        duplicates_of: Option<&str>,
        notes: &str,
    ) -> IndicatorSpec {
        IndicatorSpec {
            indicator_id: id.to_string(),
            name: name.to_string(),
            category: category.to_string(),
            series: series.iter().map(|s| s.to_string()).collect(),
            cadence: cadence.to_string(),
            directionality,
            trigger_default: trigger.to_string(),
            scoring: rule.family(),
            rule,
            z_cutoff,
            persistence,
            duplicates_of: duplicates_of.map(|s| s.to_string()),
            notes: if notes.is_empty() { None } else { Some(notes.to_string()) },
        }
    }

    use Directionality::*;

    vec![
        spec(
            "net_liq",
            "Net liquidity (WALCL − TGA − RRP)",
            "core_plumbing",
            &["WALCL", "TGA", "RRP"],
            "weekly_daily",
            HigherIsSupportive,
            "Δ ≥ +$50B over 2w",
            ScoringRule::CompositeZ,
            Some(1.0),
            Some(1),
            None,
            "Fed balance sheet net of TGA and ON RRP; the broadest plumbing gauge",
        ),
        spec(
            "reserves_w",
            "Bank reserves (weekly)",
            "core_plumbing",
            &["RESPPLLOPNWW"],
            "weekly",
            HigherIsSupportive,
            "Δ ≥ +$25B/w",
            ScoringRule::Z,
            Some(1.0),
            Some(1),
            Some("net_liq"),
            "Reserve balances with Federal Reserve Banks; overlaps net_liq",
        ),
        spec(
            "tga_level",
            "Treasury General Account balance",
            "core_plumbing",
            &["TGA"],
            "daily",
            HigherIsDraining,
            "Δ ≥ +$75B over 5d",
            ScoringRule::Z,
            Some(1.0),
            Some(1),
            None,
            "TGA rebuilds pull cash out of the banking system",
        ),
        spec(
            "rrp_level",
            "ON RRP outstanding",
            "floor",
            &["RRPONTSYD"],
            "daily",
            HigherIsDraining,
            "Δ ≥ +$100B over 5d",
            ScoringRule::Z,
            Some(1.0),
            Some(1),
            None,
            "Cash parked at the ON RRP facility is idle liquidity",
        ),
        spec(
            "sofr_iorb",
            "SOFR − IORB spread",
            "floor",
            &["SOFR", "IORB"],
            "daily",
            HigherIsDraining,
            "> 0 bps for 3d",
            ScoringRule::SpreadThreshold,
            None,
            Some(3),
            None,
            "Repo printing above the floor signals reserve scarcity",
        ),
        spec(
            "bill_rrp",
            "1–3m bill − RRP (bps)",
            "floor",
            &["BILL_RRP_BPS"],
            "daily",
            HigherIsSupportive,
            ">= 25 bps",
            ScoringRule::Threshold,
            None,
            Some(2),
            None,
            "Bills cheap to RRP coax cash out of the facility",
        ),
        spec(
            "qt_pace",
            "QT runoff vs caps",
            "qt_qe",
            &["WSHOSHO", "WSHOMCB"],
            "weekly",
            HigherIsDraining,
            "@cap => headwind",
            ScoringRule::CapComparison,
            None,
            Some(1),
            None,
            "Weekly SOMA runoff at or above the published caps",
        ),
        spec(
            "ust_net_w",
            "Net UST settlements (weekly)",
            "supply",
            &["UST_NET_SETTLE_W"],
            "weekly",
            HigherIsDraining,
            "> +$80B/w",
            ScoringRule::DerivedZ { series_id: "UST_NET_SETTLE_W".to_string() },
            Some(1.0),
            Some(1),
            None,
            "Issues minus redemptions minus interest, settled per week",
        ),
        spec(
            "bill_share",
            "Bill share of auction offerings",
            "supply",
            &["UST_BILL_OFFERINGS", "UST_AUCTION_OFFERINGS"],
            "sched",
            HigherIsSupportive,
            ">= 65%",
            ScoringRule::BillShareThreshold,
            None,
            Some(1),
            None,
            "Bill-heavy issuance is absorbed by money funds, not banks",
        ),
        spec(
            "ofr_liq_idx",
            "OFR UST liquidity stress index",
            "stress",
            &["OFR_LIQ_IDX"],
            "daily",
            HigherIsDraining,
            "> 80th pct",
            ScoringRule::PercentileThreshold { pct: 80.0 },
            None,
            Some(2),
            None,
            "Market-depth stress in the Treasury curve",
        ),
    ]
}
