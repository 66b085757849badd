// =============================================================================
// Bill–RRP Spread — BILL_RRP_BPS
// =============================================================================
//
// spread_bps = (min(DTB3, DTB4WK) − RRP_RATE) × 100 per calendar date.
// Inputs are percent; output is basis points. A date is emitted only when the
// RRP admin rate and at least one bill yield are both present.
// =============================================================================

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{NaiveDate, Utc};

use crate::store::{NewPoint, SeriesPoint, Store};

pub const SERIES_ID: &str = "BILL_RRP_BPS";

const DTB3: &str = "DTB3";
const DTB4WK: &str = "DTB4WK";
const RRP_RATE: &str = "RRP_RATE";

fn by_date(rows: Vec<SeriesPoint>) -> BTreeMap<NaiveDate, f64> {
    rows.into_iter().map(|r| (r.observation_date, r.value_numeric)).collect()
}

/// Compute `(date, spread_bps)` rows, ascending.
pub fn compute_bill_rrp_points(store: &Store, days_back: usize) -> Result<Vec<(NaiveDate, f64)>> {
    let b3 = by_date(store.latest_points(DTB3, days_back)?);
    let b4 = by_date(store.latest_points(DTB4WK, days_back)?);
    let rr = by_date(store.latest_points(RRP_RATE, days_back)?);

    let mut out = Vec::new();
    for (date, rrp) in &rr {
        let bill = match (b3.get(date), b4.get(date)) {
            (Some(a), Some(b)) => f64::min(*a, *b),
            (Some(a), None) => *a,
            (None, Some(b)) => *b,
            // Missing both bill yields suppresses the date.
            (None, None) => continue,
        };
        out.push((*date, (bill - rrp) * 100.0));
    }
    Ok(out)
}

/// Recompute and persist the derived spread. Returns the row count written.
pub fn upsert_bill_rrp_spread(store: &Store, days_back: usize) -> Result<usize> {
    let rows = compute_bill_rrp_points(store, days_back)?;
    let now = Utc::now();
    let payload: Vec<NewPoint> = rows
        .into_iter()
        .map(|(date, bps)| NewPoint::new(date, bps).fetched(now))
        .collect();
    store.upsert_points(SERIES_ID, &payload, "bps", 1.0, "DERIVED", None, None)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, day).unwrap()
    }

    fn seed(store: &Store, sid: &str, rows: &[(NaiveDate, f64)]) {
        let now = Utc.with_ymd_and_hms(2025, 8, 25, 0, 0, 0).unwrap();
        let points: Vec<NewPoint> = rows
            .iter()
            .map(|&(obs, v)| NewPoint::new(obs, v).fetched(now))
            .collect();
        store
            .upsert_points(sid, &points, "percent", 1.0, "TEST", None, None)
            .unwrap();
    }

    #[test]
    fn spread_uses_cheapest_bill_in_bps() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, DTB3, &[(d(1), 5.30)]);
        seed(&store, DTB4WK, &[(d(1), 5.20)]);
        seed(&store, RRP_RATE, &[(d(1), 5.00)]);

        let rows = compute_bill_rrp_points(&store, 60).unwrap();
        assert_eq!(rows.len(), 1);
        // min(5.30, 5.20) − 5.00 = 0.20 pct = 20 bps.
        assert!((rows[0].1 - 20.0).abs() < 1e-9);
    }

    #[test]
    fn single_bill_series_is_enough() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, DTB3, &[(d(1), 5.40)]);
        seed(&store, RRP_RATE, &[(d(1), 5.00)]);

        let rows = compute_bill_rrp_points(&store, 60).unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].1 - 40.0).abs() < 1e-9);
    }

    #[test]
    fn missing_rrp_suppresses_date() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, DTB3, &[(d(1), 5.30), (d(2), 5.30)]);
        seed(&store, RRP_RATE, &[(d(2), 5.00)]);

        let rows = compute_bill_rrp_points(&store, 60).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, d(2));
    }

    #[test]
    fn missing_both_bills_suppresses_date() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, RRP_RATE, &[(d(1), 5.00)]);
        assert!(compute_bill_rrp_points(&store, 60).unwrap().is_empty());
    }

    #[test]
    fn upsert_emits_bps_rows() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, DTB3, &[(d(1), 5.30)]);
        seed(&store, RRP_RATE, &[(d(1), 5.00)]);

        let n = upsert_bill_rrp_spread(&store, 60).unwrap();
        assert_eq!(n, 1);
        let pts = store.latest_points(SERIES_ID, 10).unwrap();
        assert_eq!(pts[0].units, "bps");
        assert_eq!(pts[0].source, "DERIVED");
    }
}
