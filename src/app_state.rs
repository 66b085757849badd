// =============================================================================
// Central Application State — Liquidity Nexus
// =============================================================================
//
// Ties the store, configuration, LLM provider and the process-local TTL
// caches together. Every HTTP handler and background task holds an
// `Arc<AppState>`.
//
// Thread safety:
//   - The store serializes access through its own connection lock.
//   - parking_lot::RwLock guards the runtime configuration.
//   - TTL caches are internally synchronized and tolerate stale reads.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::cache::TtlCache;
use crate::llm::provider::LlmProvider;
use crate::runtime_config::RuntimeConfig;
use crate::store::Store;

/// Tool-level cache TTL for indicator history lookups.
const INDICATOR_HISTORY_TTL: Duration = Duration::from_secs(60);
/// Brief markdown cache TTL per `(horizon, k)`.
const BRIEF_TTL: Duration = Duration::from_secs(300);
/// Snapshot/router context cache TTL per horizon.
const SNAPSHOT_TTL: Duration = Duration::from_secs(300);

/// Central application state shared across all async tasks via
/// `Arc<AppState>`.
pub struct AppState {
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    pub store: Arc<Store>,

    /// LLM provider backing the brief generator and the streaming agent.
    pub provider: Arc<dyn LlmProvider>,

    // ── LLM caches ──────────────────────────────────────────────────────
    /// `(indicator_id, horizon, days)` → history payload.
    pub indicator_history_cache: TtlCache<(String, String, i64), serde_json::Value>,
    /// `(horizon, k)` → brief markdown.
    pub brief_cache: TtlCache<(String, usize), String>,
    /// `horizon` → `{snapshot, router, as_of}` context for the agent.
    pub snapshot_cache: TtlCache<String, serde_json::Value>,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<Store>,
        provider: Arc<dyn LlmProvider>,
    ) -> Self {
        Self {
            runtime_config: Arc::new(RwLock::new(config)),
            store,
            provider,
            indicator_history_cache: TtlCache::new(INDICATOR_HISTORY_TTL),
            brief_cache: TtlCache::new(BRIEF_TTL),
            snapshot_cache: TtlCache::new(SNAPSHOT_TTL),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::MockProvider;

    #[test]
    fn state_construction_wires_caches() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let state = AppState::new(
            RuntimeConfig::default(),
            store,
            Arc::new(MockProvider::default()),
        );
        state.brief_cache.set(("1w".to_string(), 8), "md".to_string());
        assert_eq!(
            state.brief_cache.get(&("1w".to_string(), 8)),
            Some("md".to_string())
        );
        assert!(state.snapshot_cache.get(&"1w".to_string()).is_none());
    }
}
