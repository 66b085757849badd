// =============================================================================
// Upstream source adapters — FRED, Treasury DTS, OFR
// =============================================================================
//
// Each adapter is a thin fetch + parse pair: the fetcher pulls raw payloads
// over HTTP, the parser normalizes them into `NewPoint` rows for the store.
// Parsers are pure and fully unit-tested; fetchers stay minimal.
// =============================================================================

pub mod fred;
pub mod ofr;
pub mod treasury;

use std::time::Duration;

/// Shared HTTP client for all upstream fetches.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("failed to build reqwest client")
}
