/// Configuration module for the RAG engine.
///
/// Handles loading, validating, and providing default configuration values.
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::validate_identifier;

// ── Default value functions ──────────────────────────────────────────

fn default_db_path() -> String {
    "./graphrag.db".to_string()
}

fn default_collection() -> String {
    "documents".to_string()
}

fn default_pool_size() -> u32 {
    8
}

fn default_true() -> bool {
    true
}

fn default_interval_ms() -> u64 {
    2000
}

fn default_batch_size() -> usize {
    10
}

fn default_calls_per_second() -> u32 {
    10
}

fn default_embed_timeout_ms() -> u64 {
    30_000
}

fn default_min_chunk_length() -> usize {
    crate::db::documents::MIN_EMBEDDABLE_LENGTH
}

fn default_max_concurrent() -> usize {
    10
}

fn default_llm_timeout_ms() -> u64 {
    60_000
}

fn default_limit() -> usize {
    5
}

fn default_rrf_k() -> f64 {
    60.0
}

fn default_similarity_floor() -> f64 {
    0.75
}

fn default_mix_depth() -> usize {
    1
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// SQLite file, or `:memory:`.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_collection")]
    pub collection: String,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub extraction: ExtractionConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_calls_per_second")]
    pub calls_per_second: u32,

    #[serde(default = "default_embed_timeout_ms")]
    pub call_timeout_ms: u64,

    #[serde(default = "default_min_chunk_length")]
    pub min_chunk_length: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_llm_timeout_ms")]
    pub call_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub record_entity_attributes: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,

    #[serde(default = "default_similarity_floor")]
    pub mix_similarity_floor: f64,

    #[serde(default = "default_mix_depth")]
    pub mix_depth: usize,

    #[serde(default = "default_llm_timeout_ms")]
    pub llm_timeout_ms: u64,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            collection: default_collection(),
            pool_size: default_pool_size(),
            embedding: EmbeddingConfig::default(),
            extraction: ExtractionConfig::default(),
            retrieval: RetrievalConfig::default(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            batch_size: default_batch_size(),
            calls_per_second: default_calls_per_second(),
            call_timeout_ms: default_embed_timeout_ms(),
            min_chunk_length: default_min_chunk_length(),
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_concurrent: default_max_concurrent(),
            call_timeout_ms: default_llm_timeout_ms(),
            record_entity_attributes: default_true(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            rrf_k: default_rrf_k(),
            mix_similarity_floor: default_similarity_floor(),
            mix_depth: default_mix_depth(),
            llm_timeout_ms: default_llm_timeout_ms(),
        }
    }
}

impl EmbeddingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl ExtractionConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl RetrievalConfig {
    pub fn llm_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_timeout_ms)
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// In-memory store with default tuning; handy for tests and demos.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file.
    ///
    /// If `config_path` is empty, defaults to `"graphrag.json"`.
    /// If the file does not exist, returns a default config and optionally
    /// generates a template file.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            "graphrag.json"
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            let cfg = Self::default();

            // Generate template only for the default path
            if path == "graphrag.json" {
                match cfg.save(path) {
                    Ok(()) => info!("Generated config template: {path}"),
                    Err(e) => warn!("Failed to generate config template: {e}"),
                }
            }

            return Ok(cfg);
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let cfg: Config = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) => {
                warn!("Invalid JSON in {path}: {e}");
                warn!("Using default configuration");
                return Ok(Self::default());
            }
        };

        info!("Loaded configuration from {path}");
        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.collection).context("collection must be a plain identifier")?;
        anyhow::ensure!(self.pool_size > 0, "pool_size must be positive");
        anyhow::ensure!(
            self.embedding.interval_ms > 0,
            "embedding.interval_ms must be positive"
        );
        anyhow::ensure!(
            self.embedding.batch_size > 0,
            "embedding.batch_size must be positive"
        );
        anyhow::ensure!(
            self.embedding.calls_per_second > 0,
            "embedding.calls_per_second must be positive"
        );
        anyhow::ensure!(
            self.embedding.call_timeout_ms > 0,
            "embedding.call_timeout_ms must be positive"
        );
        anyhow::ensure!(
            self.extraction.max_concurrent > 0,
            "extraction.max_concurrent must be positive"
        );
        anyhow::ensure!(
            self.retrieval.default_limit > 0,
            "retrieval.default_limit must be positive"
        );
        anyhow::ensure!(self.retrieval.rrf_k > 0.0, "retrieval.rrf_k must be positive");
        anyhow::ensure!(
            (-1.0..=1.0).contains(&self.retrieval.mix_similarity_floor),
            "retrieval.mix_similarity_floor must be within [-1, 1]"
        );
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.collection, "documents");
        assert_eq!(config.embedding.interval(), Duration::from_secs(2));
        assert_eq!(config.embedding.batch_size, 10);
        assert_eq!(config.embedding.min_chunk_length, 10);
        assert_eq!(config.extraction.max_concurrent, 10);
        assert_eq!(config.retrieval.default_limit, 5);
        assert_eq!(config.retrieval.rrf_k, 60.0);
        assert_eq!(config.retrieval.mix_similarity_floor, 0.75);
        assert!(config.extraction.enabled);
    }

    #[test]
    fn test_load_from_json() {
        let json = r#"{"collection": "notes", "retrieval": {"rrf_k": 10}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.collection, "notes");
        assert_eq!(config.retrieval.rrf_k, 10.0);
        // Other fields should have defaults
        assert_eq!(config.retrieval.default_limit, 5);
        assert_eq!(config.embedding.calls_per_second, 10);
    }

    #[test]
    fn test_validate_ok() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::in_memory().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.collection = "bad name".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.embedding.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retrieval.mix_similarity_floor = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_and_invalid_files() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("absent.json");
        let cfg = Config::load(missing.to_str().unwrap()).unwrap();
        assert_eq!(cfg.collection, "documents");
        assert!(!missing.exists(), "templates are only written for the default path");

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ not json").unwrap();
        let cfg = Config::load(broken.to_str().unwrap()).unwrap();
        assert_eq!(cfg.pool_size, 8);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graphrag.json");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.collection = "articles".to_string();
        config.embedding.calls_per_second = 3;
        config.save(path).unwrap();

        let loaded = Config::load(path).unwrap();
        assert_eq!(loaded.collection, "articles");
        assert_eq!(loaded.embedding.calls_per_second, 3);
    }
}
