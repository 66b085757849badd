// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the liquidity engine. Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash. All fields
// carry `#[serde(default)]` so that adding new fields never breaks loading an
// older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_database_path() -> String {
    "liquidity_nexus.db".to_string()
}

fn default_fetch_pages() -> u32 {
    50
}

fn default_fetch_limit() -> u32 {
    1000
}

fn default_ingest_interval_minutes() -> u64 {
    360
}

fn default_llm_provider() -> String {
    "mock".to_string()
}

fn default_llm_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

// =============================================================================
// LlmSettings
// =============================================================================

/// Provider selection for the brief generator and the streaming agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// `mock` or `openrouter`. Unknown values fall back to the mock provider
    /// so local runs never break.
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    /// API key; usually supplied via the LLM_API_KEY environment variable.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Chat-completions base URL override.
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            api_key: None,
            base_url: None,
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Server & storage ----------------------------------------------------

    /// Address the HTTP API binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// SQLite database file backing the series store.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // --- Ingest --------------------------------------------------------------

    /// FRED API key; usually supplied via the FRED_API_KEY environment
    /// variable.
    #[serde(default)]
    pub fred_api_key: Option<String>,

    /// OFR financial stress index CSV URL. Ingest of OFR_LIQ_IDX is skipped
    /// when unset.
    #[serde(default)]
    pub ofr_liquidity_stress_url: Option<String>,

    /// Maximum DTS pages fetched per source per run.
    #[serde(default = "default_fetch_pages")]
    pub fetch_pages: u32,

    /// Page size for DTS requests.
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: u32,

    /// Minutes between background ingest runs. Zero disables the loop.
    #[serde(default = "default_ingest_interval_minutes")]
    pub ingest_interval_minutes: u64,

    /// Run a full ingest once at startup.
    #[serde(default)]
    pub ingest_on_start: bool,

    // --- LLM -----------------------------------------------------------------

    #[serde(default)]
    pub llm: LlmSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_path: default_database_path(),
            fred_api_key: None,
            ofr_liquidity_stress_url: None,
            fetch_pages: default_fetch_pages(),
            fetch_limit: default_fetch_limit(),
            ingest_interval_minutes: default_ingest_interval_minutes(),
            ingest_on_start: false,
            llm: LlmSettings::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            bind_addr = %config.bind_addr,
            database = %config.database_path,
            llm_provider = %config.llm.provider,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8000");
        assert_eq!(cfg.database_path, "liquidity_nexus.db");
        assert_eq!(cfg.fetch_pages, 50);
        assert_eq!(cfg.fetch_limit, 1000);
        assert_eq!(cfg.ingest_interval_minutes, 360);
        assert!(!cfg.ingest_on_start);
        assert_eq!(cfg.llm.provider, "mock");
        assert!(cfg.llm.api_key.is_none());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8000");
        assert_eq!(cfg.llm.provider, "mock");
        assert_eq!(cfg.ingest_interval_minutes, 360);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "bind_addr": "127.0.0.1:9000", "llm": { "provider": "openrouter" } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.llm.provider, "openrouter");
        assert_eq!(cfg.llm.model, "openai/gpt-4o-mini");
        assert_eq!(cfg.fetch_pages, 50);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.bind_addr, cfg2.bind_addr);
        assert_eq!(cfg.database_path, cfg2.database_path);
        assert_eq!(cfg.llm.provider, cfg2.llm.provider);
    }
}
