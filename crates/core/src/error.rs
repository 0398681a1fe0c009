use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("parse error in {path}: {details}")]
    Parse { path: String, details: String },

    #[error("document has no text content after normalization: {0}")]
    EmptyContent(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("no supported documents found in {0}")]
    NoDocuments(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("index update failed: {0}")]
    Index(#[from] IndexError),
}

impl IngestError {
    pub(crate) fn parse(path: impl Into<String>, details: impl ToString) -> Self {
        Self::Parse {
            path: path.into(),
            details: details.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding backend {backend} failed: {details}")]
    Backend { backend: String, details: String },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("vector dimension mismatch: collection expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("collection {collection} is corrupt: {details}")]
    CorruptCollection { collection: String, details: String },

    #[error("background task failed: {0}")]
    Task(String),
}

impl IndexError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("query embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("index query failed: {0}")]
    Index(#[from] IndexError),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation backend {backend} failed: {details}")]
    Backend { backend: String, details: String },

    #[error("generation backend rate limited the request: {0}")]
    RateLimited(String),

    #[error("network error talking to the generation backend: {0}")]
    Network(String),

    #[error("generation timed out after {0} ms")]
    Timeout(u64),

    #[error("tool {tool} failed: {details}")]
    ToolExecution { tool: String, details: String },

    #[error("model kept calling tools after {0} round trips")]
    ToolRoundTripsExceeded(usize),

    #[error("retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("request was cancelled")]
    Cancelled,

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

impl GenerationError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Network(_) | Self::Timeout(_)
        )
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Network(format!("timeout: {error}"))
        } else if error.is_connect() || error.is_request() || error.is_body() {
            Self::Network(error.to_string())
        } else {
            Self::Backend {
                backend: "http".to_string(),
                details: error.to_string(),
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("missing argument `{0}`")]
    MissingArgument(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("evaluation failed: {0}")]
    Evaluation(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;

/// Failures while wiring an [`crate::Assistant`] together.
#[derive(Debug, Error)]
pub enum AssistantError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Index(#[from] IndexError),
}
