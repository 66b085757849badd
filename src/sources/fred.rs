// =============================================================================
// FRED / ALFRED observations adapter
// =============================================================================

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use serde_json::Value;

use crate::store::NewPoint;

pub const FRED_OBSERVATIONS_URL: &str = "https://api.stlouisfed.org/fred/series/observations";

/// Fetch the observation list for `series_id`.
pub async fn fetch_series(
    client: &reqwest::Client,
    api_key: Option<&str>,
    series_id: &str,
    observation_start: Option<&str>,
) -> Result<Value> {
    let mut params: Vec<(&str, String)> = vec![
        ("series_id", series_id.to_string()),
        ("file_type", "json".to_string()),
    ];
    if let Some(key) = api_key {
        params.push(("api_key", key.to_string()));
    }
    if let Some(start) = observation_start {
        params.push(("observation_start", start.to_string()));
    }

    let resp = client
        .get(FRED_OBSERVATIONS_URL)
        .query(&params)
        .send()
        .await
        .with_context(|| format!("FRED request failed for {series_id}"))?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("FRED {status} for {series_id}");
    }
    resp.json().await.with_context(|| format!("FRED json parse failed for {series_id}"))
}

/// Normalize a FRED observation payload into store rows.
///
/// FRED marks missing observations with a literal `"."`; those and any other
/// non-numeric values are skipped. The top-level realtime window describes
/// the requested vintage range, not per-observation publication dates, so
/// `publication_date` stays unset.
pub fn parse_fred_observations(payload: &Value) -> Vec<NewPoint> {
    let now = Utc::now();
    let Some(observations) = payload.get("observations").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for obs in observations {
        let Some(value_str) = obs.get("value").and_then(|v| v.as_str()) else { continue };
        if value_str == "." {
            continue;
        }
        let Ok(value) = value_str.parse::<f64>() else { continue };
        let Some(date_str) = obs.get("date").and_then(|v| v.as_str()) else { continue };
        let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else { continue };
        out.push(NewPoint::new(date, value).fetched(now));
    }
    out
}
