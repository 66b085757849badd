// =============================================================================
// Liquidity Nexus — Main Entry Point
// =============================================================================
//
// Boots the bitemporal store, seeds the indicator registry and QT caps on
// first run, launches the HTTP API, and (when configured) a periodic ingest
// loop that fans out over the upstream sources.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregate;
mod api;
mod app_state;
mod cache;
mod derived;
mod evaluator;
mod ingest;
mod llm;
mod registry;
mod runtime_config;
mod snapshot;
mod sources;
mod stats;
mod store;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::llm::provider::provider_from_settings;
use crate::runtime_config::RuntimeConfig;
use crate::store::Store;

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Liquidity Nexus — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Environment overrides for secrets and deployment knobs.
    if let Ok(key) = std::env::var("FRED_API_KEY") {
        if !key.trim().is_empty() {
            config.fred_api_key = Some(key);
        }
    }
    if let Ok(key) = std::env::var("LLM_API_KEY") {
        if !key.trim().is_empty() {
            config.llm.api_key = Some(key);
        }
    }
    if let Ok(url) = std::env::var("OFR_LIQUIDITY_STRESS_URL") {
        if !url.trim().is_empty() {
            config.ofr_liquidity_stress_url = Some(url);
        }
    }
    if let Ok(addr) = std::env::var("NEXUS_BIND_ADDR") {
        if !addr.trim().is_empty() {
            config.bind_addr = addr;
        }
    }

    // ── 2. Open the store and seed defaults ─────────────────────────────
    let store = Arc::new(Store::open(&config.database_path)?);
    store.seed_defaults()?;

    // ── 3. Build shared state ────────────────────────────────────────────
    let provider = provider_from_settings(&config.llm);
    info!(llm_provider = %config.llm.provider, "LLM provider configured");
    let state = Arc::new(AppState::new(config.clone(), store.clone(), provider));

    // ── 4. Background ingest loop ────────────────────────────────────────
    if config.ingest_on_start {
        let ingest_store = store.clone();
        let ingest_config = config.clone();
        tokio::spawn(async move {
            info!("startup ingest running");
            ingest::run_full_ingest(ingest_store, &ingest_config).await;
            info!("startup ingest complete");
        });
    }

    if config.ingest_interval_minutes > 0 {
        let ingest_store = store.clone();
        let ingest_state = state.clone();
        let minutes = config.ingest_interval_minutes;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(minutes * 60));
            // The immediate first tick is covered by ingest_on_start.
            interval.tick().await;
            loop {
                interval.tick().await;
                let config_snapshot = ingest_state.runtime_config.read().clone();
                info!("scheduled ingest running");
                ingest::run_full_ingest(ingest_store.clone(), &config_snapshot).await;
                info!("scheduled ingest complete");
            }
        });
        info!(minutes, "ingest loop scheduled");
    }

    // ── 5. Start the API server ──────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = config.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Liquidity Nexus shut down complete.");
    Ok(())
}
