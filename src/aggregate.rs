// =============================================================================
// Bucket & Regime Aggregator — duplicate collapse and weighted scoring
// =============================================================================
//
// Evaluated indicators are partitioned into concept buckets by following
// `duplicates_of` to its root. Bucket contributions are averaged, category
// weights produce a continuous score, and the score maps onto a regime label
// (±2 integer thresholds) and a tilt (sign of the continuous score).
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::evaluator::IndicatorEvidence;
use crate::registry::{root_of, IndicatorSpec};
use crate::types::{IndicatorStatus, RegimeLabel, Tilt};

/// Category weights applied to bucket aggregates. Buckets whose root category
/// is absent here contribute zero to the regime score.
pub fn category_weight(category: &str) -> f64 {
    match category {
        "core_plumbing" => 0.50,
        "floor" => 0.30,
        "supply" => 0.20,
        _ => 0.0,
    }
}

/// Weight table exposed on the snapshot response.
pub fn bucket_weights() -> serde_json::Value {
    serde_json::json!({
        "core_plumbing": 0.50,
        "floor": 0.30,
        "supply": 0.20,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketMember {
    pub id: String,
    pub status: IndicatorStatus,
    pub z20: Option<f64>,
    pub is_root: bool,
    pub is_representative: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketDetail {
    pub bucket_id: String,
    pub category: Option<String>,
    pub weight: f64,
    pub aggregate_status: IndicatorStatus,
    pub representative_id: String,
    pub members: Vec<BucketMember>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegimeSummary {
    pub label: RegimeLabel,
    pub tilt: Tilt,
    pub score: i64,
    pub max_score: i64,
    pub score_cont: f64,
}

#[derive(Debug, Clone)]
pub struct Aggregation {
    pub regime: RegimeSummary,
    pub bucket_details: Vec<BucketDetail>,
}

/// Aggregate evaluated (non-`n/a`) indicators into buckets and the weighted
/// regime.
///
/// `contributions` carries one entry per evidence row. Determinism: bucket
/// iteration and member lists are sorted, and representative ties break to
/// the lexicographically smallest id.
pub fn aggregate(
    specs_by_id: &HashMap<String, IndicatorSpec>,
    evidence: &[IndicatorEvidence],
    contributions: &HashMap<String, f64>,
) -> Aggregation {
    let z_abs: HashMap<&str, f64> = evidence
        .iter()
        .map(|e| (e.id.as_str(), e.z20.map(f64::abs).unwrap_or(0.0)))
        .collect();
    let evidence_by_id: HashMap<&str, &IndicatorEvidence> =
        evidence.iter().map(|e| (e.id.as_str(), e)).collect();

    // Partition into buckets; sorted maps keep everything deterministic.
    let mut members_by_bucket: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for e in evidence {
        let root = root_of(specs_by_id, &e.id);
        members_by_bucket.entry(root).or_default().push(e.id.clone());
    }
    for members in members_by_bucket.values_mut() {
        members.sort();
    }

    // Mean contribution per bucket.
    let mut bucket_aggregate: BTreeMap<&str, f64> = BTreeMap::new();
    for (root, members) in &members_by_bucket {
        let sum: f64 = members
            .iter()
            .map(|m| contributions.get(m).copied().unwrap_or(0.0))
            .sum();
        bucket_aggregate.insert(root.as_str(), sum / members.len() as f64);
    }

    // Weighted continuous score over buckets with a weighted root category.
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    let mut weighted_buckets = 0i64;
    for (root, agg) in &bucket_aggregate {
        let Some(root_spec) = specs_by_id.get(*root) else { continue };
        let w = category_weight(&root_spec.category);
        if w == 0.0 {
            continue;
        }
        weighted_sum += w * agg;
        total_weight += w;
        weighted_buckets += 1;
    }

    // With no weighted bucket at all, fall back to the raw contribution sum
    // so sparse databases still produce a sensible tilt.
    let score_cont = if total_weight > 0.0 {
        weighted_sum
    } else {
        contributions.values().sum()
    };
    let score = score_cont.round() as i64;
    let max_score = weighted_buckets.max(1);

    let regime = RegimeSummary {
        label: RegimeLabel::from_score(score),
        tilt: Tilt::from_score(score_cont),
        score,
        max_score,
        score_cont: (score_cont * 100.0).round() / 100.0,
    };

    // Representative per bucket: largest |z20|, ties to the smallest id
    // (members are sorted, so the first strict maximum wins).
    let mut bucket_details = Vec::with_capacity(members_by_bucket.len());
    for (root, members) in &members_by_bucket {
        let mut representative = members[0].as_str();
        let mut best = z_abs.get(representative).copied().unwrap_or(0.0);
        for m in &members[1..] {
            let z = z_abs.get(m.as_str()).copied().unwrap_or(0.0);
            if z > best {
                best = z;
                representative = m.as_str();
            }
        }

        let agg = bucket_aggregate[root.as_str()];
        let member_rows = members
            .iter()
            .map(|m| BucketMember {
                id: m.clone(),
                status: IndicatorStatus::from_sign(
                    contributions.get(m).copied().unwrap_or(0.0),
                ),
                z20: evidence_by_id.get(m.as_str()).and_then(|e| e.z20),
                is_root: m == root,
                is_representative: m == representative,
            })
            .collect();

        let root_spec = specs_by_id.get(root.as_str());
        bucket_details.push(BucketDetail {
            bucket_id: root.clone(),
            category: root_spec.map(|s| s.category.clone()),
            weight: root_spec.map(|s| category_weight(&s.category)).unwrap_or(0.0),
            aggregate_status: IndicatorStatus::from_sign(agg),
            representative_id: representative.to_string(),
            members: member_rows,
        });
    }

    Aggregation { regime, bucket_details }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ScoringRule;
    use crate::types::Directionality;

    fn spec(id: &str, category: &str, duplicates_of: Option<&str>) -> IndicatorSpec {
        IndicatorSpec {
            indicator_id: id.to_string(),
            name: id.to_string(),
            category: category.to_string(),
            series: vec!["S".to_string()],
            cadence: "daily".to_string(),
            directionality: Directionality::HigherIsSupportive,
            trigger_default: String::new(),
            scoring: crate::types::Scoring::Z,
            rule: ScoringRule::Z,
            z_cutoff: Some(1.0),
            persistence: Some(1),
            duplicates_of: duplicates_of.map(|s| s.to_string()),
            notes: None,
        }
    }

    fn evidence(id: &str, z: Option<f64>, status: f64) -> IndicatorEvidence {
        IndicatorEvidence {
            id: id.to_string(),
            value_numeric: Some(1.0),
            window: None,
            z20: z,
            status: IndicatorStatus::from_sign(status),
            flip_trigger: String::new(),
            provenance: serde_json::json!({}),
        }
    }

    fn run(
        specs: Vec<IndicatorSpec>,
        rows: Vec<(IndicatorEvidence, f64)>,
    ) -> Aggregation {
        let specs_by_id: HashMap<String, IndicatorSpec> =
            specs.into_iter().map(|s| (s.indicator_id.clone(), s)).collect();
        let evidence: Vec<IndicatorEvidence> = rows.iter().map(|(e, _)| e.clone()).collect();
        let contributions: HashMap<String, f64> =
            rows.iter().map(|(e, c)| (e.id.clone(), *c)).collect();
        aggregate(&specs_by_id, &evidence, &contributions)
    }

    #[test]
    fn duplicates_collapse_into_one_bucket_with_z_representative() {
        let specs = vec![
            spec("root_a", "core_plumbing", None),
            spec("a1", "core_plumbing", Some("root_a")),
            spec("a2", "core_plumbing", Some("root_a")),
        ];
        let rows = vec![
            (evidence("root_a", None, 1.0), 1.0),
            (evidence("a1", None, 1.0), 1.0),
            (evidence("a2", Some(1.8), 1.0), 1.0),
        ];
        let agg = run(specs, rows);

        assert_eq!(agg.bucket_details.len(), 1);
        let bucket = &agg.bucket_details[0];
        assert_eq!(bucket.bucket_id, "root_a");
        assert_eq!(bucket.representative_id, "a2");
        assert_eq!(bucket.aggregate_status, IndicatorStatus::Supportive);
        assert_eq!(bucket.members.len(), 3);
        let reps: Vec<&BucketMember> =
            bucket.members.iter().filter(|m| m.is_representative).collect();
        assert_eq!(reps.len(), 1, "exactly one representative per bucket");
        assert_eq!(reps[0].id, "a2");
        assert!(bucket.members.iter().any(|m| m.is_root && m.id == "root_a"));
    }

    #[test]
    fn mixed_bucket_averages_to_its_sign() {
        let specs = vec![
            spec("root_a", "core_plumbing", None),
            spec("a1", "core_plumbing", Some("root_a")),
        ];
        let rows = vec![
            (evidence("root_a", None, 1.0), 1.0),
            (evidence("a1", None, -1.0), -1.0),
        ];
        let agg = run(specs, rows);
        assert_eq!(agg.bucket_details[0].aggregate_status, IndicatorStatus::Neutral);
        assert_eq!(agg.regime.tilt, Tilt::Flat);
    }

    #[test]
    fn representative_tie_breaks_to_lexicographic_id() {
        let specs = vec![
            spec("root_a", "core_plumbing", None),
            spec("a1", "core_plumbing", Some("root_a")),
        ];
        // No member has a z at all.
        let rows = vec![
            (evidence("root_a", None, 0.0), 0.0),
            (evidence("a1", None, 0.0), 0.0),
        ];
        let agg = run(specs, rows);
        assert_eq!(agg.bucket_details[0].representative_id, "a1");
    }

    #[test]
    fn weights_and_label_thresholds() {
        let specs = vec![
            spec("core", "core_plumbing", None),
            spec("floor", "floor", None),
            spec("supply", "supply", None),
            spec("stress", "stress", None),
        ];
        // All supportive: score_cont = 0.5 + 0.3 + 0.2 = 1.0 (stress unweighted).
        let rows = vec![
            (evidence("core", Some(2.0), 1.0), 1.0),
            (evidence("floor", Some(1.5), 1.0), 1.0),
            (evidence("supply", Some(1.2), 1.0), 1.0),
            (evidence("stress", Some(3.0), 1.0), 1.0),
        ];
        let agg = run(specs, rows);
        assert_eq!(agg.regime.score, 1);
        assert_eq!(agg.regime.max_score, 3, "stress bucket carries no weight");
        assert_eq!(agg.regime.label, RegimeLabel::Neutral);
        assert_eq!(agg.regime.tilt, Tilt::Positive);
        assert!((agg.regime.score_cont - 1.0).abs() < 1e-9);
    }

    #[test]
    fn members_count_equals_evaluated_indicators() {
        let specs = vec![
            spec("root_a", "core_plumbing", None),
            spec("a1", "core_plumbing", Some("root_a")),
            spec("b", "floor", None),
        ];
        let rows = vec![
            (evidence("root_a", None, 1.0), 1.0),
            (evidence("a1", None, 0.0), 0.0),
            (evidence("b", None, -1.0), -1.0),
        ];
        let agg = run(specs, rows);
        let member_total: usize = agg.bucket_details.iter().map(|b| b.members.len()).sum();
        assert_eq!(member_total, 3);
    }

    #[test]
    fn unweighted_only_falls_back_to_contribution_sum() {
        let specs = vec![spec("stress", "stress", None)];
        let rows = vec![(evidence("stress", None, -1.0), -1.0)];
        let agg = run(specs, rows);
        assert_eq!(agg.regime.score, -1);
        assert_eq!(agg.regime.max_score, 1);
        assert_eq!(agg.regime.tilt, Tilt::Negative);
    }
}
