use crate::chunking::ChunkingConfig;
use crate::embeddings::DEFAULT_EMBEDDING_DIMENSIONS;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const GEMINI_EMBEDDING_DIMENSIONS: usize = 768;
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub index: IndexConfig,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RerankStrategy {
    /// Blend vector similarity with query term overlap.
    LexicalBoost,
    VectorOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub max_context_chars: usize,
    pub overfetch_factor: usize,
    pub rerank: RerankStrategy,
    pub lexical_weight: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            max_context_chars: 6000,
            overfetch_factor: 3,
            rerank: RerankStrategy::LexicalBoost,
            lexical_weight: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexConfig {
    pub directory: PathBuf,
    pub collection: String,
    /// Expected vector width. When unset the embedder's width is used.
    pub dimensions: Option<usize>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data/index"),
            collection: "documents".to_string(),
            dimensions: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    Ngram,
    Gemini,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub dimensions: Option<usize>,
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Ngram,
            model: "text-embedding-004".to_string(),
            dimensions: None,
            batch_size: 32,
        }
    }
}

impl EmbeddingConfig {
    pub fn effective_dimensions(&self) -> usize {
        self.dimensions.unwrap_or(match self.provider {
            EmbeddingProvider::Ngram => DEFAULT_EMBEDDING_DIMENSIONS,
            EmbeddingProvider::Gemini => GEMINI_EMBEDDING_DIMENSIONS,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GenerationProvider {
    /// Offline answers assembled from the best matching context sentences.
    Extractive,
    Gemini,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub provider: GenerationProvider,
    pub model: String,
    /// Longest silence tolerated between two streamed events.
    #[serde(rename = "timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
    #[serde(rename = "retry_backoff_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_backoff: Duration,
    pub max_tool_rounds: usize,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub tools_enabled: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: GenerationProvider::Extractive,
            model: "gemini-1.5-flash".to_string(),
            timeout: Duration::from_secs(60),
            retry_backoff: Duration::from_millis(500),
            max_tool_rounds: 3,
            temperature: 0.2,
            max_output_tokens: 1024,
            tools_enabled: true,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
        }
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Width shared by the embedder and the index.
    pub fn dimensions(&self) -> usize {
        self.index
            .dimensions
            .unwrap_or_else(|| self.embedding.effective_dimensions())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.chunking
            .validate()
            .map_err(|error| ConfigError::Invalid(error.to_string()))?;

        let retrieval = &self.retrieval;
        if retrieval.top_k == 0 {
            return Err(invalid("retrieval.top_k must be > 0"));
        }
        if retrieval.max_context_chars == 0 {
            return Err(invalid("retrieval.max_context_chars must be > 0"));
        }
        if retrieval.overfetch_factor == 0 {
            return Err(invalid("retrieval.overfetch_factor must be >= 1"));
        }
        if !(0.0..=1.0).contains(&retrieval.lexical_weight) {
            return Err(invalid("retrieval.lexical_weight must be in [0.0, 1.0]"));
        }

        if self.index.collection.trim().is_empty() {
            return Err(invalid("index.collection must not be empty"));
        }
        if self.dimensions() == 0 {
            return Err(invalid("vector dimensions must be > 0"));
        }
        if self.embedding.batch_size == 0 {
            return Err(invalid("embedding.batch_size must be > 0"));
        }

        if self.generation.max_tool_rounds == 0 {
            return Err(invalid("generation.max_tool_rounds must be >= 1"));
        }
        if self.generation.timeout.is_zero() {
            return Err(invalid("generation.timeout_ms must be > 0"));
        }

        url::Url::parse(&self.backend.base_url)
            .map_err(|error| ConfigError::Invalid(format!("backend.base_url: {error}")))?;

        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.chunking.max_chars, 800);
        assert_eq!(config.retrieval.rerank, RerankStrategy::LexicalBoost);
        assert_eq!(config.generation.max_tool_rounds, 3);
        assert_eq!(config.dimensions(), DEFAULT_EMBEDDING_DIMENSIONS);
    }

    #[test]
    fn sections_override_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [chunking]
            max_chars = 400
            overlap_chars = 50

            [retrieval]
            rerank = "vector_only"
            overfetch_factor = 5

            [embedding]
            provider = "gemini"

            [generation]
            provider = "gemini"
            timeout_ms = 1500
            "#,
        )
        .unwrap();

        assert_eq!(config.chunking.max_chars, 400);
        assert_eq!(config.retrieval.rerank, RerankStrategy::VectorOnly);
        assert_eq!(config.retrieval.overfetch_factor, 5);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.dimensions(), GEMINI_EMBEDDING_DIMENSIONS);
        assert_eq!(config.generation.timeout, Duration::from_millis(1500));
        assert_eq!(config.generation.retry_backoff, Duration::from_millis(500));
    }

    #[test]
    fn overlap_not_below_max_is_rejected() {
        let result = AppConfig::from_toml_str("[chunking]\nmax_chars = 100\noverlap_chars = 100\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_rerank_strategy_is_a_toml_error() {
        let result = AppConfig::from_toml_str("[retrieval]\nrerank = \"bm25\"\n");
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let result = AppConfig::load(Path::new("/definitely/not/here/docqa.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn api_key_is_not_printed() {
        let backend = BackendConfig {
            api_key: Some("secret-key".to_string()),
            ..BackendConfig::default()
        };
        assert!(!format!("{backend:?}").contains("secret-key"));
    }
}
