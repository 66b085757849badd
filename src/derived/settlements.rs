// =============================================================================
// Weekly Net Treasury Settlements — UST_NET_SETTLE_W
// =============================================================================
//
// net = issues − redemptions − interest, summed per Monday-anchored calendar
// week over scaled USD values. A week is emitted only when all three inputs
// contributed at least one observation to it; partially-covered weeks would
// otherwise read as spurious draining or easing.
// =============================================================================

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{Datelike, Duration, NaiveDate, Utc};

use crate::store::{NewPoint, SeriesPoint, Store};

pub const SERIES_ID: &str = "UST_NET_SETTLE_W";

const ISSUES: &str = "UST_AUCTION_ISSUES";
const REDEMPTIONS: &str = "UST_REDEMPTIONS";
const INTEREST: &str = "UST_INTEREST";

/// Monday of the calendar week containing `d`.
pub fn monday_of_week(d: NaiveDate) -> NaiveDate {
    d - Duration::days(d.weekday().num_days_from_monday() as i64)
}

#[derive(Debug, Default, Clone, Copy)]
struct WeekAgg {
    issues: f64,
    redemptions: f64,
    interest: f64,
    has_issues: bool,
    has_redemptions: bool,
    has_interest: bool,
}

impl WeekAgg {
    fn complete(&self) -> bool {
        self.has_issues && self.has_redemptions && self.has_interest
    }
}

/// Compute `(week_monday, net_usd)` rows, ascending, limited to the most
/// recent `weeks_back` complete weeks.
pub fn compute_weekly_net_settlements(
    store: &Store,
    weeks_back: usize,
) -> Result<Vec<(NaiveDate, f64)>> {
    // Fetch a generous number of recent daily points; incomplete weeks are
    // filtered below.
    let limit = weeks_back.saturating_mul(40).max(40);
    let issues = store.latest_points(ISSUES, limit)?;
    let redemptions = store.latest_points(REDEMPTIONS, limit)?;
    let interest = store.latest_points(INTEREST, limit)?;

    let mut weekly: BTreeMap<NaiveDate, WeekAgg> = BTreeMap::new();

    let mut add = |rows: &[SeriesPoint], pick: fn(&mut WeekAgg) -> (&mut f64, &mut bool)| {
        for r in rows {
            let week = monday_of_week(r.observation_date);
            let agg = weekly.entry(week).or_default();
            let (sum, present) = pick(agg);
            *sum += r.scaled_value();
            *present = true;
        }
    };

    add(&issues, |a| (&mut a.issues, &mut a.has_issues));
    add(&redemptions, |a| (&mut a.redemptions, &mut a.has_redemptions));
    add(&interest, |a| (&mut a.interest, &mut a.has_interest));

    let mut out: Vec<(NaiveDate, f64)> = weekly
        .into_iter()
        .filter(|(_, agg)| agg.complete())
        .map(|(week, agg)| (week, agg.issues - agg.redemptions - agg.interest))
        .collect();

    if weeks_back > 0 && out.len() > weeks_back {
        out = out.split_off(out.len() - weeks_back);
    }
    Ok(out)
}

/// Recompute and persist the derived series. Returns the row count written.
pub fn upsert_weekly_net_settlements(store: &Store, weeks_back: usize) -> Result<usize> {
    let rows = compute_weekly_net_settlements(store, weeks_back)?;
    let now = Utc::now();
    let payload: Vec<NewPoint> = rows
        .into_iter()
        .map(|(week, net)| NewPoint::new(week, net).fetched(now))
        .collect();
    store.upsert_points(SERIES_ID, &payload, "USD", 1.0, "DERIVED", None, None)
}
