//! Configuration parsing and validation.
//!
//! MarkdownKeeper is configured via a TOML file (default: `./mdk.toml`). The
//! config defines watch roots and debounce timing, the database path, the
//! HTTP API bind address, frontmatter metadata policy, query cache
//! settings, and embedding backend selection.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub watch: WatchConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    pub roots: Vec<PathBuf>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_extensions() -> Vec<String> {
    vec!["md".to_string(), "markdown".to_string()]
}

fn default_debounce_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub database_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4173
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetadataConfig {
    #[serde(default)]
    pub required_frontmatter_fields: Vec<String>,
    #[serde(default)]
    pub auto_fill_category: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true, ttl_seconds: default_ttl_seconds() }
    }
}

fn default_true() -> bool {
    true
}

fn default_ttl_seconds() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingsConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_backend")]
    pub backend: String,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self { model: default_embedding_model(), backend: default_embedding_backend() }
    }
}

fn default_embedding_model() -> String {
    "all-MiniLM-L6-v2".to_string()
}

fn default_embedding_backend() -> String {
    "model".to_string()
}

impl EmbeddingsConfig {
    pub fn is_model_backed(&self) -> bool {
        self.backend == "model"
    }
}

/// Scoring weights and candidate-set sizing for the Retriever. Not named in
/// the wire config table but needed so the hybrid weights aren't hard-coded.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default = "default_min_candidates")]
    pub min_candidates: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_multiplier: default_candidate_multiplier(),
            min_candidates: default_min_candidates(),
        }
    }
}

fn default_candidate_multiplier() -> usize {
    4
}

fn default_min_candidates() -> usize {
    50
}

impl RetrievalConfig {
    /// `max(limit * candidate_multiplier, min_candidates)`, the ANN
    /// candidate-set size from spec §4.G.
    pub fn candidate_set_size(&self, limit: usize) -> usize {
        (limit * self.candidate_multiplier).max(self.min_candidates)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let config: Config =
        toml::from_str(&content).with_context(|| "failed to parse config file")?;

    if config.watch.roots.is_empty() {
        bail!("watch.roots must name at least one directory");
    }
    if config.watch.debounce_ms == 0 {
        bail!("watch.debounce_ms must be > 0");
    }
    if config.cache.ttl_seconds == 0 {
        bail!("cache.ttl_seconds must be > 0");
    }
    match config.embeddings.backend.as_str() {
        "model" | "hash-v1" => {}
        other => bail!("unknown embeddings.backend: '{other}'. Must be 'model' or 'hash-v1'."),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn rejects_empty_watch_roots() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[watch]\nroots = []\n[storage]\ndatabase_path = \"./mdk.db\"\n"
        )
        .unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[watch]\nroots = [\"./notes\"]\n[storage]\ndatabase_path = \"./mdk.db\"\n"
        )
        .unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.api.port, 4173);
        assert_eq!(config.cache.ttl_seconds, 3600);
        assert_eq!(config.embeddings.backend, "model");
    }

    #[test]
    fn candidate_set_size_respects_floor() {
        let retrieval = RetrievalConfig::default();
        assert_eq!(retrieval.candidate_set_size(5), 50);
        assert_eq!(retrieval.candidate_set_size(100), 400);
    }
}
