//! Layered configuration.
//!
//! A JSON file auto-detected next to the database (`memctl.json`) overrides
//! compiled defaults; CLI flags and environment variables override the file
//! (resolution happens in the binary — this crate only loads and merges the
//! file layer). A missing or invalid file silently falls back to defaults,
//! logging at debug level so a typo is still discoverable.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Environment variables recognised by the CLI. Flag > env > file > default.
pub const ENV_DB: &str = "MEMCTL_DB";
pub const ENV_BUDGET: &str = "MEMCTL_BUDGET";
pub const ENV_FTS: &str = "MEMCTL_FTS";
pub const ENV_TIER: &str = "MEMCTL_TIER";
pub const ENV_SESSION: &str = "MEMCTL_SESSION";

/// File name probed next to the database.
pub const CONFIG_FILENAME: &str = "memctl.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// FTS5 tokenizer preset: `fr` (default), `en`, or `raw`.
    pub fts_tokenizer: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            fts_tokenizer: "fr".to_string(),
        }
    }
}

/// Observation thresholds for structural inspect. The values are
/// configurable; their semantics are frozen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectConfig {
    /// One subfolder holds at least this fraction of all chunks.
    pub dominance_frac: f64,
    /// Chunks-per-file ratio below which a corpus reads as low-density.
    pub low_density_threshold: f64,
    /// One extension holds at least this fraction of all chunks.
    pub ext_concentration_frac: f64,
    /// Total chunk count at or below which the corpus is sparse.
    pub sparse_threshold: usize,
}

impl Default for InspectConfig {
    fn default() -> Self {
        Self {
            dominance_frac: 0.40,
            low_density_threshold: 0.10,
            ext_concentration_frac: 0.75,
            sparse_threshold: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Sliding-window bound on retained turns.
    pub history_max: usize,
    /// Sliding-window bound on retained characters.
    pub history_char_budget: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_max: 20,
            history_char_budget: 16_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub inspect: InspectConfig,
    pub chat: ChatConfig,
}

impl AppConfig {
    /// Load from an explicit path, falling back to defaults when the file is
    /// absent or malformed.
    pub fn load_or_default(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<AppConfig>(&raw) {
                Ok(config) => config,
                Err(err) => {
                    debug!(path = %path.display(), %err, "invalid config file; using defaults");
                    AppConfig::default()
                }
            },
            Err(_) => AppConfig::default(),
        }
    }

    /// Probe for `memctl.json` in the database's directory.
    pub fn detect_for_db(db_path: &Path) -> Self {
        let dir = db_path.parent().unwrap_or_else(|| Path::new("."));
        Self::load_or_default(&dir.join(CONFIG_FILENAME))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating config dir {}", parent.display()))?;
        }
        let rendered = serde_json::to_string_pretty(self)?;
        fs::write(path, rendered)
            .with_context(|| format!("writing config to {}", path.display()))?;
        Ok(())
    }
}

/// Resolve the database path: explicit flag, then `MEMCTL_DB`, then the
/// compiled default under the current directory.
pub fn resolve_db_path(flag: Option<&Path>) -> PathBuf {
    if let Some(path) = flag {
        return path.to_path_buf();
    }
    if let Ok(from_env) = env::var(ENV_DB) {
        if !from_env.is_empty() {
            return PathBuf::from(from_env);
        }
    }
    PathBuf::from(".memctl").join("memory.db")
}
