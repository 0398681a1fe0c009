pub mod assistant;
pub mod backends;
pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod generation;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod prompt;
pub mod retrieval;
pub mod stores;
pub mod tools;
pub mod traits;

pub use assistant::{backend_from_config, embedder_from_config, Assistant};
pub use backends::{ExtractiveBackend, GeminiClient, GeminiEmbedder, GeminiGenerator};
pub use chunking::{build_chunks, chunk_text, ChunkingConfig};
pub use config::{
    AppConfig, BackendConfig, EmbeddingConfig, EmbeddingProvider, GenerationConfig,
    GenerationProvider, IndexConfig, RerankStrategy, RetrievalConfig,
};
pub use embeddings::{CharacterNgramEmbedder, Embedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{
    AssistantError, ConfigError, EmbeddingError, GenerationError, IndexError, IngestError,
    RetrievalError, ToolError,
};
pub use generation::{GenerationTurn, ModelEvent, ModelEventStream, ToolCall, ToolSchema};
pub use ingest::{discover_files, DocumentProcessor};
pub use models::{
    AskRequest, Chunk, Citation, Document, FormatTag, GenerationMetrics, GenerationResponse,
    IndexEntry, IndexStats, IngestOutcome, IngestionReport, Locator, QueryFilters,
    RetrievalNotice, RetrievalResult, RetrievedChunk, SearchCandidate, SkippedFile,
};
pub use orchestrator::{AnswerEvent, AnswerStream, CancelHandle, FailureReason, RagEngine, RequestState};
pub use retrieval::Retriever;
pub use stores::LocalCollection;
pub use tools::{Tool, ToolRegistry};
pub use traits::{GenerationBackend, VectorIndex};
