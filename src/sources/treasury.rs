// =============================================================================
// Treasury DTS adapters — TGA, debt transactions, interest, auctions
// =============================================================================

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use serde_json::Value;

use crate::store::NewPoint;

pub const DTS_TGA_URL: &str =
    "https://api.fiscaldata.treasury.gov/services/api/fiscal_service/v1/accounting/dts/operating_cash_balance";
pub const DTS_DEBT_TRANSACTIONS_URL: &str =
    "https://api.fiscaldata.treasury.gov/services/api/fiscal_service/v1/accounting/dts/public_debt_transactions";
pub const DTS_DEPOSITS_WITHDRAWALS_URL: &str =
    "https://api.fiscaldata.treasury.gov/services/api/fiscal_service/v1/accounting/dts/deposits_withdrawals_operating_cash";
pub const TREASURY_AUCTIONS_URL: &str =
    "https://api.fiscaldata.treasury.gov/services/api/fiscal_service/v1/accounting/od/auctions_query";

/// Fetch a DTS endpoint page by page until a short or empty page, combining
/// every `data` array into one payload.
pub async fn fetch_paginated(
    client: &reqwest::Client,
    url: &str,
    limit: u32,
    pages: u32,
    extra_params: &[(&str, String)],
) -> Result<Value> {
    let mut combined: Vec<Value> = Vec::new();
    for page in 1..=pages.max(1) {
        let mut params: Vec<(&str, String)> = vec![
            ("sort", "-record_date".to_string()),
            ("page[number]", page.to_string()),
            ("page[size]", limit.to_string()),
            ("format", "json".to_string()),
        ];
        params.extend(extra_params.iter().cloned());

        let resp = client
            .get(url)
            .query(&params)
            .send()
            .await
            .with_context(|| format!("DTS request failed: {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("DTS {status} for {url}");
        }
        let body: Value = resp.json().await.context("DTS json parse failed")?;
        let data = body.get("data").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let page_len = data.len();
        combined.extend(data);
        if page_len < limit as usize {
            break;
        }
    }
    Ok(serde_json::json!({ "data": combined }))
}

fn data_rows(payload: &Value) -> &[Value] {
    payload
        .get("data")
        .and_then(|v| v.as_array())
        .map(|v| v.as_slice())
        .unwrap_or(&[])
}

fn parse_record_date(row: &Value) -> Option<NaiveDate> {
    let s = row.get("record_date")?.as_str()?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

fn parse_amount(raw: Option<&Value>) -> Option<f64> {
    match raw? {
        Value::String(s) => {
            let cleaned = s.trim().replace(',', "");
            if cleaned.is_empty() || cleaned == "null" {
                return None;
            }
            cleaned.parse().ok()
        }
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

// =============================================================================
// TGA operating cash balance
// =============================================================================

/// Filter DTS operating-cash rows to the Treasury General Account and emit
/// one point per record date. `close_today_bal` can be null in-day; the
/// opening balance stands in for it.
pub fn parse_tga_rows(payload: &Value) -> Vec<NewPoint> {
    let now = Utc::now();
    let mut out = Vec::new();
    for row in data_rows(payload) {
        let account = row
            .get("account_type")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_lowercase();
        if !(account.contains("treasury general") && account.contains("account")) {
            continue;
        }
        let value = parse_amount(row.get("close_today_bal"))
            .or_else(|| parse_amount(row.get("open_today_bal")));
        let Some(value) = value else { continue };
        let Some(date) = parse_record_date(row) else { continue };
        out.push(NewPoint::new(date, value).fetched(now));
    }
    out
}

// =============================================================================
// Public debt transactions — redemptions
// =============================================================================

/// Sum redemption transactions per record date across security types.
pub fn parse_redemptions_rows(payload: &Value) -> Vec<NewPoint> {
    let now = Utc::now();
    let mut by_date: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for row in data_rows(payload) {
        let tx_type = row
            .get("transaction_type")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if !tx_type.eq_ignore_ascii_case("redemptions") {
            continue;
        }
        let Some(date) = parse_record_date(row) else { continue };
        let Some(amount) = parse_amount(row.get("transaction_today_amt")) else { continue };
        *by_date.entry(date).or_insert(0.0) += amount;
    }
    by_date
        .into_iter()
        .map(|(date, value)| NewPoint::new(date, value).fetched(now))
        .collect()
}

// =============================================================================
// Deposits/withdrawals — interest on Treasury securities
// =============================================================================

/// Sum withdrawal lines categorized as interest on Treasury securities per
/// record date. The category description stands in when the category code is
/// absent.
pub fn parse_interest_rows(payload: &Value) -> Vec<NewPoint> {
    let now = Utc::now();
    let mut by_date: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for row in data_rows(payload) {
        let tx_type = row
            .get("transaction_type")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if !tx_type.eq_ignore_ascii_case("withdrawals") {
            continue;
        }
        let category = row
            .get("transaction_catg")
            .and_then(|v| v.as_str())
            .or_else(|| row.get("transaction_catg_desc").and_then(|v| v.as_str()))
            .unwrap_or_default()
            .to_lowercase();
        if !category.contains("interest on treasury securities") {
            continue;
        }
        let Some(date) = parse_record_date(row) else { continue };
        let Some(amount) = parse_amount(row.get("transaction_today_amt")) else { continue };
        *by_date.entry(date).or_insert(0.0) += amount;
    }
    by_date
        .into_iter()
        .map(|(date, value)| NewPoint::new(date, value).fetched(now))
        .collect()
}

// =============================================================================
// Auctions
// =============================================================================

/// One normalized auction row.
#[derive(Debug, Clone)]
pub struct AuctionRow {
    pub auction_date: NaiveDate,
    pub issue_date: Option<NaiveDate>,
    pub security_type: String,
    pub is_bill: bool,
    pub is_coupon: bool,
    pub offering_amount: Option<f64>,
    pub accepted_amount: Option<f64>,
}

/// Normalize auction-query rows: parse dates and comma-grouped amounts,
/// classify bills vs coupons by `security_type` substring. Rows without an
/// auction date or any amount are dropped.
pub fn parse_auction_rows(payload: &Value) -> Vec<AuctionRow> {
    let mut out = Vec::new();
    for row in data_rows(payload) {
        let auction_date = row
            .get("auction_date")
            .and_then(|v| v.as_str())
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
        let Some(auction_date) = auction_date else { continue };

        let offering_amount = parse_amount(row.get("offering_amt"));
        let accepted_amount =
            parse_amount(row.get("total_accepted")).or_else(|| parse_amount(row.get("accepted_amt")));
        if offering_amount.is_none() && accepted_amount.is_none() {
            continue;
        }

        let security_type = row
            .get("security_type")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let lowered = security_type.to_lowercase();
        let is_bill = lowered.contains("bill");
        let is_coupon = ["note", "bond", "tips", "frn"].iter().any(|t| lowered.contains(t));

        out.push(AuctionRow {
            auction_date,
            issue_date: row
                .get("issue_date")
                .and_then(|v| v.as_str())
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
            security_type,
            is_bill,
            is_coupon,
            offering_amount,
            accepted_amount,
        });
    }
    out
}

/// Aggregated store payloads derived from auction rows.
pub struct AuctionSeries {
    /// Total offerings summed by auction date → `UST_AUCTION_OFFERINGS`.
    pub offerings: Vec<NewPoint>,
    /// Bill offerings summed by auction date → `UST_BILL_OFFERINGS`.
    pub bill_offerings: Vec<NewPoint>,
    /// Accepted (falling back to offering) amounts summed by issue date →
    /// `UST_AUCTION_ISSUES`.
    pub issues: Vec<NewPoint>,
}

pub fn aggregate_auction_series(rows: &[AuctionRow]) -> AuctionSeries {
    let now = Utc::now();
    let mut offering_by_auction: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    let mut bill_by_auction: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    let mut accepted_by_issue: BTreeMap<NaiveDate, f64> = BTreeMap::new();

    for r in rows {
        if let Some(amount) = r.offering_amount {
            *offering_by_auction.entry(r.auction_date).or_insert(0.0) += amount;
            if r.is_bill {
                *bill_by_auction.entry(r.auction_date).or_insert(0.0) += amount;
            }
        }
        let issue_value = r.accepted_amount.or(r.offering_amount);
        if let (Some(value), Some(issue_date)) = (issue_value, r.issue_date) {
            *accepted_by_issue.entry(issue_date).or_insert(0.0) += value;
        }
    }

    let to_points = |m: BTreeMap<NaiveDate, f64>| {
        m.into_iter()
            .map(|(date, value)| NewPoint::new(date, value).fetched(now))
            .collect()
    };

    AuctionSeries {
        offerings: to_points(offering_by_auction),
        bill_offerings: to_points(bill_by_auction),
        issues: to_points(accepted_by_issue),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tga_filters_account_type_and_falls_back_to_open_balance() {
        let payload = json!({
            "data": [
                {"record_date": "2025-08-01", "account_type": "Treasury General Account (TGA)",
                 "close_today_bal": "750000"},
                {"record_date": "2025-08-01", "account_type": "Federal Reserve Account",
                 "close_today_bal": "1"},
                {"record_date": "2025-08-02", "account_type": "Treasury General Account (TGA)",
                 "close_today_bal": null, "open_today_bal": "740,000"},
                {"record_date": "2025-08-03", "account_type": "Treasury General Account (TGA)",
                 "close_today_bal": null, "open_today_bal": null},
            ]
        });
        let rows = parse_tga_rows(&payload);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value_numeric, 750_000.0);
        assert_eq!(rows[1].value_numeric, 740_000.0);
    }

    #[test]
    fn redemptions_sum_all_types_per_day() {
        let payload = json!({
            "data": [
                {"record_date": "2025-08-13", "transaction_type": "Issues", "transaction_today_amt": "100"},
                {"record_date": "2025-08-13", "transaction_type": "Redemptions", "transaction_today_amt": "30"},
                {"record_date": "2025-08-13", "transaction_type": "Redemptions", "transaction_today_amt": "20"},
                {"record_date": "2025-08-14", "transaction_type": "Redemptions", "transaction_today_amt": "5"},
            ]
        });
        let rows = parse_redemptions_rows(&payload);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value_numeric, 50.0);
        assert_eq!(rows[1].value_numeric, 5.0);
    }

    #[test]
    fn interest_picks_only_interest_withdrawals() {
        let payload = json!({
            "data": [
                {"record_date": "2025-08-13", "transaction_type": "Withdrawals",
                 "transaction_catg": "Independent Agencies - misc", "transaction_today_amt": "62"},
                {"record_date": "2025-08-13", "transaction_type": "Withdrawals",
                 "transaction_catg": "Interest on Treasury Securities", "transaction_today_amt": "4"},
                {"record_date": "2025-08-13", "transaction_type": "Deposits",
                 "transaction_catg": "Interest on Treasury Securities", "transaction_today_amt": "9"},
            ]
        });
        let rows = parse_interest_rows(&payload);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value_numeric, 4.0);
    }

    #[test]
    fn interest_category_desc_fallback() {
        let payload = json!({
            "data": [
                {"record_date": "2025-08-14", "transaction_type": "Withdrawals",
                 "transaction_catg": null,
                 "transaction_catg_desc": "Interest on Treasury Securities",
                 "transaction_today_amt": "7"},
            ]
        });
        let rows = parse_interest_rows(&payload);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value_numeric, 7.0);
    }

    #[test]
    fn auction_rows_normalize_and_classify() {
        let payload = json!({
            "data": [
                {"auction_date": "2025-08-10", "issue_date": "2025-08-13",
                 "security_type": "Bill", "offering_amt": "50,000"},
                {"auction_date": "2025-08-10", "issue_date": "2025-08-13",
                 "security_type": "Cash Management Bill", "offering_amt": "5,000"},
                {"auction_date": "2025-08-10", "issue_date": "2025-08-15",
                 "security_type": "Note", "offering_amt": "20,000"},
                {"auction_date": "2025-08-11", "issue_date": "2025-09-30",
                 "security_type": "TIPS", "offering_amt": "8,000"},
                {"auction_date": "2025-08-12", "security_type": "Bond", "offering_amt": ""},
            ]
        });
        let rows = parse_auction_rows(&payload);
        assert_eq!(rows.len(), 4, "row without amounts is dropped");
        assert_eq!(rows.iter().filter(|r| r.is_bill).count(), 2);
        assert_eq!(rows.iter().filter(|r| r.is_coupon).count(), 2);
        assert_eq!(rows[0].offering_amount, Some(50_000.0));
        assert_eq!(
            rows[0].issue_date,
            Some(NaiveDate::from_ymd_opt(2025, 8, 13).unwrap())
        );
    }

    #[test]
    fn auction_aggregation_sums_by_auction_and_issue_dates() {
        let payload = json!({
            "data": [
                {"auction_date": "2025-08-10", "issue_date": "2025-08-13",
                 "security_type": "Bill", "offering_amt": "50,000", "total_accepted": "48,000"},
                {"auction_date": "2025-08-10", "issue_date": "2025-08-13",
                 "security_type": "Note", "offering_amt": "20,000"},
            ]
        });
        let series = aggregate_auction_series(&parse_auction_rows(&payload));

        assert_eq!(series.offerings.len(), 1);
        assert_eq!(series.offerings[0].value_numeric, 70_000.0);

        assert_eq!(series.bill_offerings.len(), 1);
        assert_eq!(series.bill_offerings[0].value_numeric, 50_000.0);

        // Accepted where present, offering as fallback: 48k + 20k on 08-13.
        assert_eq!(series.issues.len(), 1);
        assert_eq!(series.issues[0].value_numeric, 68_000.0);
    }
}
