// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Every route returns JSON. Parameter validation is the only failure that
// crosses the HTTP boundary: `as_of` strings reject with 400 on POST
// endpoints and are silently ignored on GET /snapshot. CORS is permissive
// for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::AppState;
use crate::llm::brief::generate_brief;
use crate::registry::{resolve_series_id, root_of};
use crate::snapshot::{backfill_history, compute_router, compute_snapshot};
use crate::types::{parse_as_of, AsOfMode};

type ApiError = (StatusCode, Json<serde_json::Value>);

fn bad_request(detail: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "detail": detail })))
}

fn internal_error(e: anyhow::Error) -> ApiError {
    tracing::error!(error = %e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "detail": "internal error" })),
    )
}

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/indicators", get(list_indicators))
        .route("/indicators/list", get(list_indicator_ids))
        .route("/indicators/:id/history", get(indicator_history))
        .route("/registry/buckets", get(registry_buckets))
        .route("/series/list", get(list_series_ids))
        .route("/series/:id", get(get_series))
        .route("/snapshot", get(get_snapshot))
        .route("/snapshot/history", get(snapshot_history))
        .route("/router", get(get_router))
        .route("/events/recompute", post(events_recompute))
        .route("/events/backfill_history", post(events_backfill))
        .route("/llm/brief", post(llm_brief))
        .route("/llm/ask_stream", get(crate::api::stream::ask_stream_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Deserialize)]
struct AvailabilityQuery {
    #[serde(default)]
    only_available: bool,
}

fn indicator_has_data(state: &AppState, spec: &crate::registry::IndicatorSpec) -> bool {
    spec.series
        .iter()
        .any(|sid| state.store.series_has_data(resolve_series_id(sid)).unwrap_or(false))
}

async fn list_indicators(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AvailabilityQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let specs = state.store.registry().map_err(internal_error)?;
    let filtered: Vec<_> = specs
        .iter()
        .filter(|s| !q.only_available || indicator_has_data(&state, s))
        .cloned()
        .collect();
    Ok(Json(filtered))
}

async fn list_indicator_ids(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AvailabilityQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let specs = state.store.registry().map_err(internal_error)?;
    let ids: Vec<String> = specs
        .iter()
        .filter(|s| !q.only_available || indicator_has_data(&state, s))
        .map(|s| s.indicator_id.clone())
        .collect();
    Ok(Json(ids))
}

/// Static bucket map: root id → sorted member ids, over the whole registry.
async fn registry_buckets(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let specs = state.store.registry().map_err(internal_error)?;
    let by_id: std::collections::HashMap<String, crate::registry::IndicatorSpec> = specs
        .iter()
        .map(|s| (s.indicator_id.clone(), s.clone()))
        .collect();

    let mut buckets: std::collections::BTreeMap<String, Vec<String>> =
        std::collections::BTreeMap::new();
    for spec in specs.iter() {
        let root = root_of(&by_id, &spec.indicator_id);
        buckets.entry(root).or_default().push(spec.indicator_id.clone());
    }
    for members in buckets.values_mut() {
        members.sort();
    }
    Ok(Json(buckets))
}

// =============================================================================
// Series
// =============================================================================

#[derive(Deserialize)]
struct SeriesQuery {
    start: Option<String>,
    end: Option<String>,
    limit: Option<usize>,
    as_of: Option<String>,
}

async fn get_series(
    State(state): State<Arc<AppState>>,
    Path(series_id): Path<String>,
    Query(q): Query<SeriesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let resolved = resolve_series_id(&series_id).to_string();

    let mut points = match &q.as_of {
        Some(raw) => {
            let as_of = parse_as_of(raw).ok_or_else(|| {
                bad_request("Invalid as_of; use ISO 8601 (e.g., 2025-08-02T12:00:00Z)")
            })?;
            state
                .store
                .as_of_fetched(&resolved, as_of, 10_000)
                .map_err(internal_error)?
        }
        None => state.store.latest_values(&resolved).map_err(internal_error)?,
    };

    if let Some(start) = q.start.as_deref().and_then(crate::store::parse_date_str) {
        points.retain(|p| p.observation_date >= start);
    }
    if let Some(end) = q.end.as_deref().and_then(crate::store::parse_date_str) {
        points.retain(|p| p.observation_date <= end);
    }

    let limit = q.limit.unwrap_or(500);
    if limit > 0 && points.len() > limit {
        points = points.split_off(points.len() - limit);
    }

    Ok(Json(serde_json::json!({ "series_id": series_id, "points": points })))
}

async fn list_series_ids(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_series_ids().map_err(internal_error)?))
}

// =============================================================================
// Snapshot & router
// =============================================================================

#[derive(Deserialize)]
struct SnapshotQuery {
    horizon: String,
    #[serde(default = "default_k")]
    k: usize,
    as_of: Option<String>,
}

fn default_k() -> usize {
    8
}

async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SnapshotQuery>,
) -> Result<impl IntoResponse, ApiError> {
    // Invalid as_of on this GET is silently ignored.
    let as_of = q.as_of.as_deref().and_then(parse_as_of);
    let snap =
        compute_snapshot(&state.store, &q.horizon, q.k, false, as_of, AsOfMode::Fetched, false)
            .map_err(internal_error)?;
    Ok(Json(snap))
}

#[derive(Deserialize)]
struct RouterQuery {
    horizon: String,
    #[serde(default = "default_k")]
    k: usize,
}

async fn get_router(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RouterQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let res = compute_router(&state.store, &q.horizon, q.k).map_err(internal_error)?;
    Ok(Json(res))
}

// =============================================================================
// Events
// =============================================================================

#[derive(Deserialize)]
struct RecomputeQuery {
    #[serde(default = "default_horizon")]
    horizon: String,
    #[serde(default = "default_k")]
    k: usize,
    as_of: Option<String>,
    #[serde(default = "default_mode_fetched")]
    as_of_mode: String,
}

fn default_horizon() -> String {
    "1w".to_string()
}

fn default_mode_fetched() -> String {
    "fetched".to_string()
}

fn default_mode_obs() -> String {
    "obs".to_string()
}

async fn events_recompute(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RecomputeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let as_of = match &q.as_of {
        Some(raw) => {
            Some(parse_as_of(raw).ok_or_else(|| bad_request("Invalid as_of; use ISO 8601"))?)
        }
        None => None,
    };
    let mode: AsOfMode = q
        .as_of_mode
        .parse()
        .map_err(|_| bad_request("Invalid as_of_mode; use fetched, pub or obs"))?;

    let snap = compute_snapshot(&state.store, &q.horizon, q.k, true, as_of, mode, true)
        .map_err(internal_error)?;
    info!(horizon = %q.horizon, as_of = %snap.as_of, "snapshot recomputed and saved");
    Ok(Json(serde_json::json!({ "as_of": snap.as_of, "snapshot": snap })))
}

#[derive(Deserialize)]
struct BackfillQuery {
    #[serde(default = "default_horizon")]
    horizon: String,
    #[serde(default = "default_days")]
    days: i64,
    #[serde(default = "default_k")]
    k: usize,
    #[serde(default = "default_mode_obs")]
    as_of_mode: String,
}

fn default_days() -> i64 {
    180
}

async fn events_backfill(
    State(state): State<Arc<AppState>>,
    Query(q): Query<BackfillQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let mode: AsOfMode = q
        .as_of_mode
        .parse()
        .map_err(|_| bad_request("Invalid as_of_mode; use fetched, pub or obs"))?;
    let persisted =
        backfill_history(&state.store, &q.horizon, q.days, q.k, mode, chrono::Utc::now())
            .map_err(internal_error)?;
    Ok(Json(serde_json::json!({
        "horizon": q.horizon,
        "days": q.days,
        "persisted": persisted,
    })))
}

// =============================================================================
// History
// =============================================================================

#[derive(Deserialize)]
struct SnapshotHistoryQuery {
    #[serde(default = "default_horizon")]
    horizon: String,
    #[serde(default = "default_days")]
    days: i64,
    #[serde(default = "default_true")]
    slim: bool,
}

fn default_true() -> bool {
    true
}

async fn snapshot_history(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SnapshotHistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = state
        .store
        .snapshot_history(&q.horizon, q.days, chrono::Utc::now())
        .map_err(internal_error)?;

    let items: Vec<serde_json::Value> = rows
        .iter()
        .map(|r| {
            let mut item = serde_json::json!({
                "as_of": r.as_of,
                "regime": {
                    "label": r.regime_label,
                    "tilt": r.tilt,
                    "score": r.score,
                    "max_score": r.max_score,
                },
            });
            if !q.slim {
                item["snapshot_id"] = serde_json::json!(r.snapshot_id);
                item["frozen_inputs_id"] = serde_json::json!(r.frozen_inputs_id);
            }
            item
        })
        .collect();

    Ok(Json(serde_json::json!({
        "horizon": q.horizon,
        "days": q.days,
        "slim": q.slim,
        "items": items,
    })))
}

#[derive(Deserialize)]
struct IndicatorHistoryQuery {
    #[serde(default = "default_horizon")]
    horizon: String,
    #[serde(default = "default_days")]
    days: i64,
}

async fn indicator_history(
    State(state): State<Arc<AppState>>,
    Path(indicator_id): Path<String>,
    Query(q): Query<IndicatorHistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = state
        .store
        .indicator_history(&indicator_id, &q.horizon, q.days, chrono::Utc::now())
        .map_err(internal_error)?;
    Ok(Json(serde_json::json!({
        "indicator_id": indicator_id,
        "horizon": q.horizon,
        "days": q.days,
        "items": rows,
    })))
}

// =============================================================================
// LLM brief
// =============================================================================

#[derive(Deserialize)]
struct BriefQuery {
    #[serde(default = "default_horizon")]
    horizon: String,
    as_of: Option<String>,
    #[serde(default = "default_brief_k")]
    k: usize,
}

fn default_brief_k() -> usize {
    12
}

async fn llm_brief(
    State(state): State<Arc<AppState>>,
    Query(q): Query<BriefQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(raw) = &q.as_of {
        if parse_as_of(raw).is_none() {
            return Err(bad_request("Invalid as_of; use ISO 8601"));
        }
    }
    let brief = generate_brief(&state, &q.horizon, q.as_of.as_deref(), q.k)
        .await
        .map_err(internal_error)?;
    Ok(Json(brief))
}
