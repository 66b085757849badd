// =============================================================================
// OFR Financial Stress Index CSV adapter
// =============================================================================

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};

use crate::store::NewPoint;

/// Fetch the raw CSV body.
pub async fn fetch_liquidity_stress_csv(client: &reqwest::Client, url: &str) -> Result<String> {
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("OFR request failed: {url}"))?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("OFR {status} for {url}");
    }
    resp.text().await.context("OFR body read failed")
}

fn normalize_header(h: &str) -> String {
    h.trim()
        .to_lowercase()
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_csv_date(raw: &str) -> Option<NaiveDate> {
    for fmt in ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(raw.trim(), fmt) {
            return Some(d);
        }
    }
    None
}

/// Parse the FSI CSV, strictly requiring a `Date` column and the composite
/// `OFR FSI` column. Other columns (sub-indices) are ignored; malformed rows
/// are skipped.
pub fn parse_liquidity_stress_csv(csv_text: &str) -> Vec<NewPoint> {
    let now = Utc::now();
    let mut lines = csv_text.lines();
    let Some(header) = lines.next() else { return Vec::new() };

    let headers: Vec<String> = header.split(',').map(normalize_header).collect();
    let date_idx = headers
        .iter()
        .position(|h| h == "date" || h == "observation date");
    let value_idx = headers.iter().position(|h| h == "ofr fsi");
    let (Some(date_idx), Some(value_idx)) = (date_idx, value_idx) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        let Some(raw_date) = fields.get(date_idx) else { continue };
        let Some(date) = parse_csv_date(raw_date) else { continue };
        let Some(raw_value) = fields.get(value_idx) else { continue };
        let trimmed = raw_value.trim();
        if trimmed.is_empty() || trimmed == "." {
            continue;
        }
        let Ok(value) = trimmed.parse::<f64>() else { continue };
        out.push(NewPoint::new(date, value).fetched(now));
    }
    out
}
