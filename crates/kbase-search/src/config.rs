use kbase_core::{KbaseError, KbaseResult};
use serde::{Deserialize, Serialize};

/// Tuning knobs for the query router.
///
/// `distance_cutoff` and `rrf_k` were chosen empirically; they are kept as
/// named, overridable settings and are candidates for tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Cosine distance (0..=2) above which semantic candidates are dropped.
    #[serde(default = "default_distance_cutoff")]
    pub distance_cutoff: f32,
    /// Reciprocal Rank Fusion constant.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    /// Semantic over-fetch factor when no filter is applied.
    #[serde(default = "default_overfetch_multiplier")]
    pub overfetch_multiplier: usize,
    /// Semantic over-fetch factor when filters must be applied after the k-NN query.
    #[serde(default = "default_filtered_overfetch_multiplier")]
    pub filtered_overfetch_multiplier: usize,
    /// Hard ceiling for `limit`; larger values are clamped.
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    /// Number of body characters that participate in ranking and embedding.
    #[serde(default = "default_body_prefix_chars")]
    pub body_prefix_chars: usize,
    /// Upper bound on a query expansion call.
    #[serde(default = "default_expansion_timeout_ms")]
    pub expansion_timeout_ms: u64,
}

fn default_distance_cutoff() -> f32 {
    1.3
}
fn default_rrf_k() -> f64 {
    60.0
}
fn default_overfetch_multiplier() -> usize {
    2
}
fn default_filtered_overfetch_multiplier() -> usize {
    3
}
fn default_max_limit() -> usize {
    500
}
fn default_body_prefix_chars() -> usize {
    1000
}
fn default_expansion_timeout_ms() -> u64 {
    2000
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            distance_cutoff: default_distance_cutoff(),
            rrf_k: default_rrf_k(),
            overfetch_multiplier: default_overfetch_multiplier(),
            filtered_overfetch_multiplier: default_filtered_overfetch_multiplier(),
            max_limit: default_max_limit(),
            body_prefix_chars: default_body_prefix_chars(),
            expansion_timeout_ms: default_expansion_timeout_ms(),
        }
    }
}

impl SearchConfig {
    /// Reject settings that would make ranking meaningless.
    pub fn validate(&self) -> KbaseResult<()> {
        if !(0.0..=2.0).contains(&self.distance_cutoff) {
            return Err(KbaseError::Config(format!(
                "distance_cutoff must be within 0..=2, got {}",
                self.distance_cutoff
            )));
        }
        if !self.rrf_k.is_finite() || self.rrf_k < 0.0 {
            return Err(KbaseError::Config(format!(
                "rrf_k must be a non-negative number, got {}",
                self.rrf_k
            )));
        }
        if self.overfetch_multiplier == 0 || self.filtered_overfetch_multiplier == 0 {
            return Err(KbaseError::Config(
                "over-fetch multipliers must be at least 1".to_string(),
            ));
        }
        if self.max_limit == 0 {
            return Err(KbaseError::Config("max_limit must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Embedding queue and worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Attempts before an item is parked as `failed`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Items claimed per worker iteration.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Sleep between polls when the queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Age after which a `processing` claim is presumed abandoned and may be
    /// reclaimed. Must exceed the time a worker needs for one batch.
    #[serde(default = "default_claim_timeout_ms")]
    pub claim_timeout_ms: u64,
    /// Backoff after the first failed attempt; doubles per further failure.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Ceiling on the retry backoff.
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_batch_size() -> usize {
    10
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_claim_timeout_ms() -> u64 {
    300_000
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_max_retry_delay_ms() -> u64 {
    60_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            claim_timeout_ms: default_claim_timeout_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
        }
    }
}

/// Which embedding model backs semantic search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Semantic search disabled; searches report `degraded`.
    #[default]
    None,
    /// In-process hashed bag-of-words embedding.
    Local,
    /// OpenAI-compatible `/v1/embeddings` endpoint (requires the `http` feature).
    Http,
}

/// Embedding model settings, resolved once at startup into a capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Which model backs semantic search.
    #[serde(default)]
    pub provider: EmbeddingProviderKind,
    /// Vector dimensionality; must match the vector index.
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    /// Remote model identifier, e.g. `text-embedding-3-small`.
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL of the OpenAI-compatible API.
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_embedding_key_env")]
    pub api_key_env: String,
}

fn default_dimension() -> usize {
    256
}
fn default_embedding_key_env() -> String {
    "KBASE_EMBEDDING_API_KEY".to_string()
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::default(),
            dimension: default_dimension(),
            model: None,
            api_base_url: None,
            api_key_env: default_embedding_key_env(),
        }
    }
}

/// Which expander backs `expand = true` searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpansionProviderKind {
    /// Expansion requests are ignored.
    #[default]
    None,
    /// Built-in synonym table.
    Rules,
    /// OpenAI-compatible chat completion endpoint (requires the `http` feature).
    Http,
}

/// Query expansion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpansionConfig {
    /// Which expander backs `expand = true` searches.
    #[serde(default)]
    pub provider: ExpansionProviderKind,
    /// Chat model identifier.
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL of the OpenAI-compatible API.
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_expansion_key_env")]
    pub api_key_env: String,
    /// Maximum number of additional terms taken from the model.
    #[serde(default = "default_max_terms")]
    pub max_terms: usize,
}

fn default_expansion_key_env() -> String {
    "KBASE_LLM_API_KEY".to_string()
}
fn default_max_terms() -> usize {
    5
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            provider: ExpansionProviderKind::default(),
            model: None,
            api_base_url: None,
            api_key_env: default_expansion_key_env(),
            max_terms: default_max_terms(),
        }
    }
}

/// Read an API key from the environment variable named in config.
pub(crate) fn api_key_from_env(var: &str) -> KbaseResult<String> {
    std::env::var(var).map_err(|_| {
        KbaseError::Config(format!("environment variable {var} is not set"))
    })
}
