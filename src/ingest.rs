// =============================================================================
// Ingest orchestration — parallel fetch-then-upsert fan-out
// =============================================================================
//
// Each upstream pull is an independent task: fetch, parse, upsert. A failing
// source logs and is skipped; ingest never aborts on a single source. Derived
// series are rebuilt last so they see the freshest raw inputs.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use futures_util::future::join_all;
use tracing::{info, warn};

use crate::derived::{upsert_bill_rrp_spread, upsert_weekly_net_settlements};
use crate::runtime_config::RuntimeConfig;
use crate::sources::{fred, http_client, ofr, treasury};
use crate::store::Store;

const FRED_SOURCE_URL: &str = "https://fred.stlouisfed.org";
const DTS_SOURCE_URL: &str = "https://api.fiscaldata.treasury.gov";

/// FRED core series with their units, scale and history start.
const FRED_CORE: &[(&str, &str, f64, &str)] = &[
    ("WALCL", "USD", 1e6, "2010-01-01"),
    ("RESPPLLOPNWW", "USD", 1e6, "2010-01-01"),
    ("RRPONTSYD", "USD", 1e6, "2014-01-01"),
    ("SOFR", "percent", 1.0, "2018-01-01"),
    ("IORB", "percent", 1.0, "2008-01-01"),
    ("DTB3", "percent", 1.0, "2000-01-01"),
    ("DTB4WK", "percent", 1.0, "2001-01-01"),
    ("WSHOSHO", "USD", 1e6, "2010-01-01"),
    ("WSHOMCB", "USD", 1e6, "2010-01-01"),
];

async fn ingest_fred_series(
    client: &reqwest::Client,
    store: &Store,
    api_key: Option<&str>,
    fred_id: &str,
    store_id: &str,
    units: &str,
    scale: f64,
    observation_start: &str,
) -> Result<usize> {
    let payload = fred::fetch_series(client, api_key, fred_id, Some(observation_start)).await?;
    let rows = fred::parse_fred_observations(&payload);
    store.upsert_points(store_id, &rows, units, scale, "FRED", Some(FRED_SOURCE_URL), None)
}

/// Run one full ingest pass: FRED core, RRP admin rate, DTS cash series,
/// OFR stress index, Treasury auctions, then derived rebuilds.
pub async fn run_full_ingest(store: Arc<Store>, config: &RuntimeConfig) {
    let client = http_client();
    let api_key = config.fred_api_key.clone();
    let pages = config.fetch_pages;
    let limit = config.fetch_limit;

    // ── FRED core: independent fetches in parallel ──────────────────────
    let fred_results = join_all(FRED_CORE.iter().map(|&(sid, units, scale, start)| {
        let client = client.clone();
        let store = store.clone();
        let api_key = api_key.clone();
        async move {
            let res =
                ingest_fred_series(&client, &store, api_key.as_deref(), sid, sid, units, scale, start)
                    .await;
            (sid, res)
        }
    }))
    .await;
    for (sid, res) in fred_results {
        match res {
            Ok(rows) => info!(series = sid, rows, "FRED series ingested"),
            Err(e) => warn!(series = sid, error = %e, "FRED ingest failed — continuing"),
        }
    }

    // ── RRP admin rate stored under its canonical id ────────────────────
    match ingest_fred_series(
        &client,
        &store,
        api_key.as_deref(),
        "RRPONTSYAWARD",
        "RRP_RATE",
        "percent",
        1.0,
        "2014-01-01",
    )
    .await
    {
        Ok(rows) => info!(series = "RRP_RATE", rows, "RRP admin rate ingested"),
        Err(e) => warn!(error = %e, "RRP admin rate ingest failed — continuing"),
    }

    // ── DTS: TGA balance, redemptions, interest outlays ─────────────────
    let tga = async {
        let payload =
            treasury::fetch_paginated(&client, treasury::DTS_TGA_URL, limit, pages, &[]).await?;
        let rows = treasury::parse_tga_rows(&payload);
        // DTS balances are reported in millions.
        store.upsert_points("TGA", &rows, "USD", 1e6, "DTS", Some(DTS_SOURCE_URL), None)
    };
    let redemptions = async {
        let payload = treasury::fetch_paginated(
            &client,
            treasury::DTS_DEBT_TRANSACTIONS_URL,
            limit,
            pages,
            &[],
        )
        .await?;
        let rows = treasury::parse_redemptions_rows(&payload);
        store.upsert_points("UST_REDEMPTIONS", &rows, "USD", 1e6, "DTS", Some(DTS_SOURCE_URL), None)
    };
    let interest = async {
        let payload = treasury::fetch_paginated(
            &client,
            treasury::DTS_DEPOSITS_WITHDRAWALS_URL,
            limit,
            pages,
            &[],
        )
        .await?;
        let rows = treasury::parse_interest_rows(&payload);
        store.upsert_points("UST_INTEREST", &rows, "USD", 1e6, "DTS", Some(DTS_SOURCE_URL), None)
    };

    let (tga_res, red_res, int_res) = tokio::join!(tga, redemptions, interest);
    for (name, res) in [("TGA", tga_res), ("UST_REDEMPTIONS", red_res), ("UST_INTEREST", int_res)] {
        match res {
            Ok(rows) => info!(series = name, rows, "DTS series ingested"),
            Err(e) => warn!(series = name, error = %e, "DTS ingest failed — continuing"),
        }
    }

    // ── OFR liquidity stress index (optional) ───────────────────────────
    if let Some(url) = &config.ofr_liquidity_stress_url {
        let res: Result<usize> = async {
            let csv = ofr::fetch_liquidity_stress_csv(&client, url).await?;
            let rows = ofr::parse_liquidity_stress_csv(&csv);
            store.upsert_points("OFR_LIQ_IDX", &rows, "index", 1.0, "OFR", Some(url), None)
        }
        .await;
        match res {
            Ok(rows) => info!(series = "OFR_LIQ_IDX", rows, "OFR stress index ingested"),
            Err(e) => warn!(error = %e, "OFR ingest failed — continuing"),
        }
    }

    // ── Treasury auctions → offerings / bill offerings / issues ─────────
    let res: Result<(usize, usize, usize)> = async {
        let start = (Utc::now().date_naive() - Duration::days(365)).to_string();
        let payload = treasury::fetch_paginated(
            &client,
            treasury::TREASURY_AUCTIONS_URL,
            limit,
            pages.min(20),
            &[("filter", format!("auction_date:gte:{start}"))],
        )
        .await?;
        let rows = treasury::parse_auction_rows(&payload);
        let series = treasury::aggregate_auction_series(&rows);
        let a = store.upsert_points(
            "UST_AUCTION_OFFERINGS",
            &series.offerings,
            "USD",
            1.0,
            "DTS",
            Some(DTS_SOURCE_URL),
            None,
        )?;
        let b = store.upsert_points(
            "UST_BILL_OFFERINGS",
            &series.bill_offerings,
            "USD",
            1.0,
            "DTS",
            Some(DTS_SOURCE_URL),
            None,
        )?;
        let c = store.upsert_points(
            "UST_AUCTION_ISSUES",
            &series.issues,
            "USD",
            1.0,
            "DTS",
            Some(DTS_SOURCE_URL),
            None,
        )?;
        Ok((a, b, c))
    }
    .await;
    match res {
        Ok((offerings, bills, issues)) => {
            info!(offerings, bills, issues, "Treasury auctions ingested")
        }
        Err(e) => warn!(error = %e, "Treasury auctions ingest failed — continuing"),
    }

    rebuild_derived_series(&store);
}

/// Rebuild both derived series from current raw inputs.
pub fn rebuild_derived_series(store: &Store) {
    match upsert_weekly_net_settlements(store, 108) {
        Ok(rows) => info!(rows, "weekly net settlements rebuilt"),
        Err(e) => warn!(error = %e, "weekly net settlements rebuild failed"),
    }
    match upsert_bill_rrp_spread(store, 200) {
        Ok(rows) => info!(rows, "bill-RRP spread rebuilt"),
        Err(e) => warn!(error = %e, "bill-RRP spread rebuild failed"),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewPoint;
    use chrono::NaiveDate;

    #[test]
    fn derived_rebuild_covers_both_series() {
        let store = Store::open_in_memory().unwrap();
        let d = |day: u32| NaiveDate::from_ymd_opt(2025, 8, day).unwrap();
        let seed = |sid: &str, rows: &[(NaiveDate, f64)], units: &str| {
            let points: Vec<NewPoint> =
                rows.iter().map(|&(obs, v)| NewPoint::new(obs, v)).collect();
            store.upsert_points(sid, &points, units, 1.0, "TEST", None, None).unwrap();
        };

        seed("UST_AUCTION_ISSUES", &[(d(19), 100.0)], "USD");
        seed("UST_REDEMPTIONS", &[(d(20), 40.0)], "USD");
        seed("UST_INTEREST", &[(d(21), 10.0)], "USD");
        seed("DTB3", &[(d(19), 5.3)], "percent");
        seed("RRP_RATE", &[(d(19), 5.0)], "percent");

        rebuild_derived_series(&store);

        assert_eq!(store.latest_points("UST_NET_SETTLE_W", 10).unwrap().len(), 1);
        assert_eq!(store.latest_points("BILL_RRP_BPS", 10).unwrap().len(), 1);
    }
}
