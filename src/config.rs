use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::{
    store::hnsw::HnswParams,
    storage::{self, StorageManager},
};

const CONFIG_FILE: &str = "config.yaml";

/// Default bind address of the daemon
const DEFAULT_BIND: &str = "127.0.0.1:8080";
/// Default embedding dimensionality (text-embedding-004 / bge-base)
const DEFAULT_DIMENSIONS: usize = 768;
/// Default similarity threshold for search requests
const DEFAULT_SEARCH_THRESHOLD: f32 = 0.7;
/// Default threshold for near-duplicate detection
const DEFAULT_DUPLICATE_THRESHOLD: f32 = 0.95;
const DEFAULT_MAX_RESULTS: usize = 10;
const MAX_RESULTS_LIMIT: usize = 50;
const DEFAULT_GEMINI_MODEL: &str = "text-embedding-004";
const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_LOCAL_MODEL: &str = "bge-base-en-v1.5";
const DEFAULT_API_KEY_ENV: &str = "GEMINI_API_KEY";
const DEFAULT_BATCH_PARALLELISM: usize = 5;
const DEFAULT_BATCH_COOLDOWN_MS: u64 = 1000;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the daemon listens on
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

/// One bearer credential and the owner it resolves to.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub owner_id: String,
}

impl std::fmt::Debug for TokenEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenEntry {{ token: [REDACTED], owner_id: {:?} }}", self.owner_id)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

/// Nearest-neighbour index tuning
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default)]
    pub hnsw: HnswParams,

    /// Partitions with fewer records are searched exhaustively
    #[serde(default = "default_exact_search_below")]
    pub exact_search_below: usize,

    /// Rebuild a partition graph once this share of its nodes are tombstones
    #[serde(default = "default_compact_tombstone_ratio")]
    pub compact_tombstone_ratio: f32,

    /// Near-duplicate candidates pulled from the graph per lookup
    #[serde(default = "default_max_duplicate_candidates")]
    pub max_duplicate_candidates: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            hnsw: HnswParams::default(),
            exact_search_below: default_exact_search_below(),
            compact_tombstone_ratio: default_compact_tombstone_ratio(),
            max_duplicate_candidates: default_max_duplicate_candidates(),
        }
    }
}

fn default_exact_search_below() -> usize {
    1000
}

fn default_compact_tombstone_ratio() -> f32 {
    0.3
}

fn default_max_duplicate_candidates() -> usize {
    100
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Length of every stored vector
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default)]
    pub index: IndexConfig,

    /// Similarity at or above which content counts as a near duplicate
    #[serde(default = "default_duplicate_threshold")]
    pub duplicate_threshold: f32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dimensions: default_dimensions(),
            index: IndexConfig::default(),
            duplicate_threshold: default_duplicate_threshold(),
        }
    }
}

fn default_dimensions() -> usize {
    DEFAULT_DIMENSIONS
}

fn default_duplicate_threshold() -> f32 {
    DEFAULT_DUPLICATE_THRESHOLD
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    Gemini,
    Local,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per embedding call, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8000
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: EmbeddingProvider,

    /// Remote model name (e.g., "text-embedding-004")
    #[serde(default = "default_gemini_model")]
    pub model: String,

    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,

    /// Environment variable holding the provider API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// fastembed model used by the local provider
    #[serde(default = "default_local_model")]
    pub local_model: String,

    /// Longer inputs are cut before being sent to the model
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_gemini_model(),
            base_url: default_gemini_base_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            local_model: default_local_model(),
            max_input_chars: default_max_input_chars(),
            retry: RetryConfig::default(),
        }
    }
}

impl EmbeddingConfig {
    /// Name stamped into partition files; switching models invalidates them.
    pub fn model_name(&self) -> &str {
        match self.provider {
            EmbeddingProvider::Gemini => &self.model,
            EmbeddingProvider::Local => &self.local_model,
        }
    }
}

fn default_provider() -> EmbeddingProvider {
    EmbeddingProvider::Gemini
}

fn default_gemini_model() -> String {
    DEFAULT_GEMINI_MODEL.to_string()
}

fn default_gemini_base_url() -> String {
    DEFAULT_GEMINI_BASE_URL.to_string()
}

fn default_api_key_env() -> String {
    DEFAULT_API_KEY_ENV.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_local_model() -> String {
    DEFAULT_LOCAL_MODEL.to_string()
}

fn default_max_input_chars() -> usize {
    8000
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_threshold")]
    pub default_threshold: f32,

    #[serde(default = "default_max_results")]
    pub default_max_results: usize,

    /// Upper bound accepted for `maxResults`
    #[serde(default = "max_results_limit")]
    pub max_results_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_threshold: default_search_threshold(),
            default_max_results: default_max_results(),
            max_results_limit: max_results_limit(),
        }
    }
}

fn default_search_threshold() -> f32 {
    DEFAULT_SEARCH_THRESHOLD
}

fn default_max_results() -> usize {
    DEFAULT_MAX_RESULTS
}

fn max_results_limit() -> usize {
    MAX_RESULTS_LIMIT
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Concurrent embedding calls per chunk
    #[serde(default = "default_batch_parallelism")]
    pub parallelism: usize,

    /// Pause between chunks, in milliseconds
    #[serde(default = "default_batch_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            parallelism: default_batch_parallelism(),
            cooldown_ms: default_batch_cooldown_ms(),
        }
    }
}

fn default_batch_parallelism() -> usize {
    DEFAULT_BATCH_PARALLELISM
}

fn default_batch_cooldown_ms() -> u64 {
    DEFAULT_BATCH_COOLDOWN_MS
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        let store = &self.store;
        if store.dimensions == 0 || store.dimensions > u16::MAX as usize {
            bail!(
                "store.dimensions must be between 1 and {}, got {}",
                u16::MAX,
                store.dimensions
            );
        }
        if !(0.0..=1.0).contains(&store.duplicate_threshold) {
            bail!(
                "store.duplicate_threshold must be between 0.0 and 1.0, got {}",
                store.duplicate_threshold
            );
        }

        let index = &store.index;
        if index.hnsw.m < 2 {
            bail!("store.index.hnsw.m must be at least 2, got {}", index.hnsw.m);
        }
        if index.hnsw.ef_construction == 0 || index.hnsw.ef_search == 0 {
            bail!("store.index.hnsw ef_construction and ef_search must be greater than 0");
        }
        if !(0.0..1.0).contains(&index.compact_tombstone_ratio) || index.compact_tombstone_ratio == 0.0 {
            bail!(
                "store.index.compact_tombstone_ratio must be in (0.0, 1.0), got {}",
                index.compact_tombstone_ratio
            );
        }
        if index.max_duplicate_candidates == 0 {
            bail!("store.index.max_duplicate_candidates must be greater than 0");
        }

        let search = &self.search;
        if !(0.0..=1.0).contains(&search.default_threshold) {
            bail!(
                "search.default_threshold must be between 0.0 and 1.0, got {}",
                search.default_threshold
            );
        }
        if search.max_results_limit == 0 {
            bail!("search.max_results_limit must be greater than 0");
        }
        if search.default_max_results == 0 || search.default_max_results > search.max_results_limit {
            bail!(
                "search.default_max_results must be between 1 and {}, got {}",
                search.max_results_limit,
                search.default_max_results
            );
        }

        if self.embedding.timeout_secs == 0 {
            bail!("embedding.timeout_secs must be greater than 0");
        }
        if self.embedding.max_input_chars < 16 {
            bail!("embedding.max_input_chars must be at least 16");
        }
        if self.embedding.retry.max_attempts == 0 {
            bail!("embedding.retry.max_attempts must be at least 1");
        }
        if self.batch.parallelism == 0 {
            bail!("batch.parallelism must be greater than 0");
        }

        for (idx, entry) in self.auth.tokens.iter().enumerate() {
            if entry.token.trim().is_empty() || entry.owner_id.trim().is_empty() {
                bail!("auth.tokens #{} needs both token and owner_id", idx + 1);
            }
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it with defaults on first run.
    pub fn load_with(base_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base_path = base_path.as_ref();
        let store = storage::BackendLocal::new(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        if !store.exists(CONFIG_FILE) {
            store.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str = String::from_utf8(store.read(CONFIG_FILE)?)
            .context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn embeddings_dir(&self) -> PathBuf {
        self.base_path.join("embeddings")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_creates_default_config() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_with(tmp.path()).unwrap();

        assert!(tmp.path().join(CONFIG_FILE).exists());
        assert_eq!(config.store.dimensions, DEFAULT_DIMENSIONS);
        assert_eq!(config.batch.parallelism, 5);
        assert_eq!(config.search.max_results_limit, 50);
        assert_eq!(config.embeddings_dir(), tmp.path().join("embeddings"));
    }

    #[test]
    fn test_partial_config_is_upgraded() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "store:\n  dimensions: 4\n").unwrap();

        let config = Config::load_with(tmp.path()).unwrap();
        assert_eq!(config.store.dimensions, 4);
        assert_eq!(config.store.index.hnsw.m, 16);

        let saved = std::fs::read_to_string(tmp.path().join(CONFIG_FILE)).unwrap();
        assert!(saved.contains("ef_construction"));
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut config = Config::default();
        config.search.default_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let mut config = Config::default();
        config.batch.parallelism = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_token_rejected() {
        let mut config = Config::default();
        config.auth.tokens.push(TokenEntry {
            token: " ".to_string(),
            owner_id: "u1".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_token_is_redacted_in_debug() {
        let entry = TokenEntry {
            token: "secret".to_string(),
            owner_id: "u1".to_string(),
        };
        assert!(!format!("{entry:?}").contains("secret"));
    }
}
