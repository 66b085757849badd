// =============================================================================
// Brief generator — snapshot-grounded markdown with a numeric-parity verifier
// =============================================================================
//
// The model is handed only snapshot-derived fields and a strict template; the
// verifier then checks structure, length, bullet coverage, and that every
// number in the markdown exists in the snapshot context. The verifier never
// rewrites — the raw markdown is returned alongside the report.
// =============================================================================

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::aggregate::RegimeSummary;
use crate::app_state::AppState;
use crate::snapshot::{compute_snapshot, compute_router, RouterResponse, SnapshotResponse};
use crate::types::{parse_as_of, AsOfMode, IndicatorStatus};

use super::prompts::build_brief_prompt;
use super::provider::LlmProvider;

/// Hard wall-clock limit on the provider call. A timeout yields empty
/// markdown, which the verifier then rejects.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(20);

/// Word budget enforced by the verifier.
const MAX_WORDS: usize = 320;

/// Registry- and snapshot-backed fields for one indicator bullet.
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorInfo {
    pub id: String,
    pub name: String,
    pub latest_value: String,
    pub z20: Option<f64>,
    pub status: String,
    pub status_label: String,
    pub obs_date: Option<String>,
    pub window: Option<String>,
    pub flip_trigger: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifierReport {
    pub ok: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BriefResponse {
    pub horizon: String,
    pub as_of: DateTime<Utc>,
    pub frozen_inputs_id: String,
    pub snapshot: SnapshotResponse,
    pub router: RouterResponse,
    pub markdown: String,
    pub json: serde_json::Value,
    pub verifier: VerifierReport,
}

// =============================================================================
// Formatting helpers
// =============================================================================

/// Compact value formatting for bullets: dollar suffixes above 1e6, plain
/// numbers below, `bps` appended for IORB-spread indicators.
pub fn format_compact_value(indicator_id: &str, value: Option<f64>) -> String {
    let Some(v) = value else { return String::new() };

    let sign = if v < 0.0 { "-" } else { "" };
    let av = v.abs();

    let mut out = if av >= 1e6 {
        let core = if av >= 1e12 {
            format!("${:.1}T", av / 1e12)
        } else if av >= 1e9 {
            format!("${:.1}B", av / 1e9)
        } else {
            format!("${:.1}M", av / 1e6)
        };
        format!("{sign}{core}")
    } else {
        let s = format!("{v:.3}");
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    };

    if indicator_id.to_lowercase().contains("iorb") {
        out.push_str(" bps");
    }
    out
}

/// Keep only the trigger expression, dropping commentary after `=>`.
pub fn clean_flip_trigger(flip: &str) -> String {
    flip.split("=>").next().unwrap_or(flip).trim().to_string()
}

/// Extract normalized numeric tokens: commas stripped, en-dash ranges split.
fn numeric_tokens(text: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid regex"));
    let cleaned = text.replace(',', "").replace('–', "-");
    re.find_iter(&cleaned).map(|m| m.as_str().to_string()).collect()
}

// =============================================================================
// Verifier
// =============================================================================

/// Check structure, length, bullet coverage and numeric parity.
pub fn verify_brief(
    markdown: &str,
    infos: &[IndicatorInfo],
    regime: &RegimeSummary,
) -> VerifierReport {
    let mut issues: Vec<String> = Vec::new();
    let lower = markdown.to_lowercase();

    // Sections.
    if !lower.contains("regime:") {
        issues.push("missing Regime line".to_string());
    }
    if !lower.contains("evidence:") {
        issues.push("missing Evidence section".to_string());
    }
    if !lower.contains("interpretation") {
        issues.push("missing Interpretation section".to_string());
    }

    // Length.
    let words = markdown.split_whitespace().count();
    if words > MAX_WORDS {
        issues.push(format!("too long: {words} words > {MAX_WORDS}"));
    }

    // Evidence bullet coverage.
    if let Some((_, evidence_part)) = markdown.split_once("Evidence:") {
        let bullets = evidence_part
            .lines()
            .filter(|l| l.trim_start().starts_with('-'))
            .count();
        let expected = infos.len().min(12);
        let required = expected.min(3);
        if expected > 0 && bullets < required {
            issues.push(format!("too few evidence bullets: {bullets} < {required}"));
        }
    }

    // Numeric parity: every number in the markdown must exist in the allowed
    // set built from the snapshot context.
    let mut allowed: Vec<f64> = vec![regime.score as f64, regime.max_score as f64];
    for info in infos {
        for tok in numeric_tokens(&info.latest_value) {
            if let Ok(f) = tok.parse::<f64>() {
                allowed.push(f);
            }
        }
        if let Some(z) = info.z20 {
            allowed.push(z);
        }
        for tok in numeric_tokens(&info.flip_trigger) {
            if let Ok(f) = tok.parse::<f64>() {
                allowed.push(f);
            }
        }
    }

    let mut parity_issues = 0usize;
    for tok in numeric_tokens(markdown) {
        let Ok(f) = tok.parse::<f64>() else { continue };
        if !allowed.iter().any(|af| (f - af).abs() <= 1e-6) {
            issues.push(format!("number not in snapshot context: {tok}"));
            parity_issues += 1;
            if parity_issues >= 5 {
                break;
            }
        }
    }

    VerifierReport { ok: issues.is_empty(), issues }
}

// =============================================================================
// Generation
// =============================================================================

fn status_label(status: IndicatorStatus) -> &'static str {
    match status {
        IndicatorStatus::Supportive => "supportive",
        IndicatorStatus::Draining => "draining",
        _ => "neutral",
    }
}

/// Snapshot-attached info rows for the prompt and the verifier.
pub fn indicator_infos(state: &AppState, snap: &SnapshotResponse) -> Result<Vec<IndicatorInfo>> {
    let specs = state.store.registry()?;
    let by_id: HashMap<&str, &crate::registry::IndicatorSpec> =
        specs.iter().map(|s| (s.indicator_id.as_str(), s)).collect();

    Ok(snap
        .indicators
        .iter()
        .filter_map(|row| {
            let spec = by_id.get(row.id.as_str())?;
            Some(IndicatorInfo {
                id: row.id.clone(),
                name: spec.name.clone(),
                latest_value: format_compact_value(&row.id, row.value_numeric),
                z20: row.z20,
                status: row.status.as_str().to_string(),
                status_label: status_label(row.status).to_string(),
                obs_date: row
                    .provenance
                    .get("observation_date")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                window: row.window.clone(),
                flip_trigger: clean_flip_trigger(&row.flip_trigger),
            })
        })
        .collect())
}

/// Build the brief: snapshot (not persisted, observation timeline) + router
/// + model markdown + verifier report. Also primes the brief and snapshot
/// caches for the streaming agent.
pub async fn generate_brief(
    state: &AppState,
    horizon: &str,
    as_of: Option<&str>,
    k: usize,
) -> Result<BriefResponse> {
    let as_of_dt = as_of.and_then(parse_as_of);
    let snap = compute_snapshot(&state.store, horizon, k, false, as_of_dt, AsOfMode::Obs, false)?;
    let router = compute_router(&state.store, horizon, k)?;

    let infos = indicator_infos(state, &snap)?;
    let indicator_ids: Vec<String> = snap.indicators.iter().map(|e| e.id.clone()).collect();
    let prompt = build_brief_prompt(&snap.regime, &indicator_ids, &infos);

    let markdown =
        match tokio::time::timeout(COMPLETION_TIMEOUT, state.provider.complete(&prompt)).await {
            Ok(Ok(md)) => md,
            Ok(Err(e)) => {
                warn!(error = %e, "brief completion failed");
                String::new()
            }
            Err(_) => {
                warn!("brief completion timed out");
                String::new()
            }
        };

    let verifier = verify_brief(&markdown, &infos, &snap.regime);

    // Prime caches so ask_stream can reuse without recomputing.
    state
        .brief_cache
        .set((horizon.to_string(), k), markdown.clone());
    state.snapshot_cache.set(
        horizon.to_string(),
        json!({
            "snapshot": serde_json::to_value(&snap)?,
            "router": serde_json::to_value(&router)?,
            "as_of": snap.as_of,
        }),
    );

    Ok(BriefResponse {
        horizon: horizon.to_string(),
        as_of: snap.as_of,
        frozen_inputs_id: snap.frozen_inputs_id.clone(),
        json: json!({
            "regime": snap.regime,
            "top_indicators": indicator_ids.iter().take(5).collect::<Vec<_>>(),
            "top_picks": [],
        }),
        snapshot: snap,
        router,
        markdown,
        verifier,
    })
}
