use crate::backends::{ExtractiveBackend, GeminiClient, GeminiEmbedder, GeminiGenerator};
use crate::config::{AppConfig, EmbeddingProvider, GenerationProvider};
use crate::embeddings::{embed_all, ensure_dimensions, CharacterNgramEmbedder, Embedder};
use crate::error::{AssistantError, ConfigError, IndexError, IngestError};
use crate::ingest::{digest_bytes, discover_files, document_id_for, DocumentProcessor};
use crate::models::{
    AskRequest, Document, GenerationResponse, IndexEntry, IndexStats, IngestOutcome,
    IngestionReport, SkippedFile,
};
use crate::orchestrator::{AnswerStream, FailureReason, RagEngine};
use crate::retrieval::Retriever;
use crate::stores::LocalCollection;
use crate::tools::ToolRegistry;
use crate::traits::{GenerationBackend, VectorIndex};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

const INGEST_CONCURRENCY: usize = 4;

/// Builds the embedder named by `[embedding]`.
pub fn embedder_from_config(config: &AppConfig) -> Result<Arc<dyn Embedder>, ConfigError> {
    let dimensions = config.dimensions();
    Ok(match config.embedding.provider {
        EmbeddingProvider::Ngram => Arc::new(CharacterNgramEmbedder::new(dimensions)),
        EmbeddingProvider::Gemini => Arc::new(GeminiEmbedder::new(
            gemini_client(config)?,
            config.embedding.model.clone(),
            dimensions,
        )),
    })
}

/// Builds the generation backend named by `[generation]`.
pub fn backend_from_config(config: &AppConfig) -> Result<Arc<dyn GenerationBackend>, ConfigError> {
    Ok(match config.generation.provider {
        GenerationProvider::Extractive => Arc::new(ExtractiveBackend::new()),
        GenerationProvider::Gemini => Arc::new(GeminiGenerator::new(
            gemini_client(config)?,
            config.generation.model.clone(),
        )),
    })
}

fn gemini_client(config: &AppConfig) -> Result<GeminiClient, ConfigError> {
    let api_key = config
        .backend
        .api_key
        .as_deref()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| ConfigError::Invalid("the gemini provider needs backend.api_key".into()))?;
    GeminiClient::new(&config.backend.base_url, api_key)
        .map_err(|error| ConfigError::Invalid(format!("backend.base_url: {error}")))
}

/// The document assistant: ingestion into a local collection plus grounded
/// question answering over it.
pub struct Assistant {
    config: AppConfig,
    processor: DocumentProcessor,
    embedder: Arc<dyn Embedder>,
    index: Arc<LocalCollection>,
    engine: RagEngine,
    document_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Assistant {
    pub async fn open(
        config: AppConfig,
        embedder: Arc<dyn Embedder>,
        backend: Arc<dyn GenerationBackend>,
    ) -> Result<Self, AssistantError> {
        config.validate()?;
        let dimensions = config.dimensions();
        ensure_dimensions(embedder.as_ref(), dimensions)?;

        let processor = DocumentProcessor::new(config.chunking)?;
        let index = Arc::new(
            LocalCollection::open(&config.index.directory, &config.index.collection, dimensions)
                .await?,
        );

        let retriever = Retriever::new(
            embedder.clone(),
            index.clone() as Arc<dyn VectorIndex>,
            config.retrieval.clone(),
        );
        let tools = if config.generation.tools_enabled {
            ToolRegistry::builtin()
        } else {
            ToolRegistry::empty()
        };
        let engine = RagEngine::new(
            Arc::new(retriever),
            backend,
            tools,
            config.generation.clone(),
        );

        info!(
            collection = %config.index.collection,
            dimensions,
            embedder = embedder.name(),
            backend = engine.backend_name(),
            "assistant ready"
        );

        Ok(Self {
            config,
            processor,
            embedder,
            index,
            engine,
            document_locks: DashMap::new(),
        })
    }

    /// Opens with the providers selected in `config`.
    pub async fn from_config(config: AppConfig) -> Result<Self, AssistantError> {
        let embedder = embedder_from_config(&config)?;
        let backend = backend_from_config(&config)?;
        Self::open(config, embedder, backend).await
    }

    pub async fn close(self) -> Result<(), IndexError> {
        self.index.flush().await
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn document_lock(&self, document_id: &str) -> Arc<Mutex<()>> {
        self.document_locks
            .entry(document_id.to_string())
            .or_default()
            .clone()
    }

    fn release_lock(&self, document_id: &str) {
        self.document_locks
            .remove_if(document_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Indexes one file. Unchanged content is detected by hash and skips the
    /// embedding step; changed content replaces the previous chunk set whole.
    pub async fn ingest(&self, path: &Path) -> Result<IngestOutcome, IngestError> {
        let path = tokio::fs::canonicalize(path).await?;
        let document_id = document_id_for(&path);
        let span = info_span!("ingest", path = %path.display(), document_id = %document_id);

        let lock = self.document_lock(&document_id);
        let outcome = async {
            let _guard = lock.lock().await;
            self.ingest_locked(path, &document_id).await
        }
        .instrument(span)
        .await;

        drop(lock);
        self.release_lock(&document_id);
        outcome
    }

    async fn ingest_locked(
        &self,
        path: PathBuf,
        document_id: &str,
    ) -> Result<IngestOutcome, IngestError> {
        let bytes = tokio::fs::read(&path).await?;
        let previous = self.index.document(document_id).await;

        if let Some(document) = previous.as_ref() {
            if document.content_hash == digest_bytes(&bytes) {
                info!(chunks = document.chunk_count(), "content unchanged, skipping");
                return Ok(IngestOutcome::Unchanged {
                    document: document.clone(),
                });
            }
        }

        let modified_at = tokio::fs::metadata(&path)
            .await?
            .modified()
            .ok()
            .map(DateTime::<Utc>::from);
        let processor = self.processor;
        let processed =
            tokio::task::spawn_blocking(move || processor.process_bytes(&path, &bytes, modified_at))
                .await
                .map_err(|error| IngestError::Io(std::io::Error::other(error)))??;

        let texts = processed
            .chunks
            .iter()
            .map(|chunk| chunk.text.clone())
            .collect::<Vec<_>>();
        let vectors = embed_all(
            self.embedder.as_ref(),
            &texts,
            self.config.embedding.batch_size,
        )
        .await?;

        let document = processed.document;
        let entries = processed
            .chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexEntry::from_chunk(&document, chunk, vector))
            .collect::<Vec<_>>();

        self.index
            .replace_document(document.clone(), entries)
            .await?;

        let replaced = previous.is_some();
        info!(
            format = %document.format,
            chunks = document.chunk_count(),
            replaced,
            "document indexed"
        );
        Ok(IngestOutcome::Indexed { document, replaced })
    }

    /// Ingests every path; a failing file is recorded and the rest continue.
    pub async fn ingest_batch(&self, paths: &[PathBuf]) -> IngestionReport {
        let outcomes = futures::stream::iter(paths)
            .map(|path| async move { (path, self.ingest(path).await) })
            .buffered(INGEST_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        let mut report = IngestionReport::default();
        for (path, outcome) in outcomes {
            match outcome {
                Ok(IngestOutcome::Indexed { document, .. }) => report.indexed.push(document),
                Ok(IngestOutcome::Unchanged { document }) => report.unchanged.push(document),
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "skipping file");
                    report.skipped_files.push(SkippedFile {
                        path: path.clone(),
                        reason: error.to_string(),
                    });
                }
            }
        }

        info!(
            indexed = report.indexed.len(),
            unchanged = report.unchanged.len(),
            skipped = report.skipped_files.len(),
            chunks = report.chunk_count(),
            "batch ingest finished"
        );
        report
    }

    pub async fn ingest_folder(&self, folder: &Path) -> Result<IngestionReport, IngestError> {
        if !tokio::fs::metadata(folder).await?.is_dir() {
            return Err(IngestError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a directory", folder.display()),
            )));
        }
        let files = discover_files(folder);
        if files.is_empty() {
            return Err(IngestError::NoDocuments(folder.display().to_string()));
        }
        Ok(self.ingest_batch(&files).await)
    }

    /// A request carrying the configured retrieval defaults.
    pub fn request(&self, query: impl Into<String>) -> AskRequest {
        AskRequest::new(
            query,
            self.config.retrieval.top_k,
            self.config.retrieval.max_context_chars,
        )
    }

    pub fn ask(&self, request: AskRequest) -> AnswerStream {
        self.engine.ask(request)
    }

    pub async fn answer(&self, query: &str) -> Result<GenerationResponse, FailureReason> {
        self.engine.answer(self.request(query)).await
    }

    /// Removes a document and all of its chunks. Returns the number of chunks removed.
    pub async fn delete_document(&self, document_id: &str) -> Result<usize, IndexError> {
        let lock = self.document_lock(document_id);
        let removed = {
            let _guard = lock.lock().await;
            self.index.delete_by_document(document_id).await
        };
        drop(lock);
        self.release_lock(document_id);

        let removed = removed?;
        info!(document_id, chunks = removed, "document deleted");
        Ok(removed)
    }

    pub async fn document(&self, document_id: &str) -> Option<Document> {
        self.index.document(document_id).await
    }

    pub async fn documents(&self) -> Vec<Document> {
        self.index.documents().await
    }

    pub async fn stats(&self) -> IndexStats {
        self.index.stats().await
    }

    pub async fn clear(&self) -> Result<(), IndexError> {
        self.index.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::ChunkingConfig;
    use crate::config::IndexConfig;
    use crate::error::EmbeddingError;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::{tempdir, TempDir};

    /// N-gram embedder that can be switched into failing every call.
    #[derive(Default)]
    struct SwitchableEmbedder {
        inner: CharacterNgramEmbedder,
        failing: AtomicBool,
    }

    impl SwitchableEmbedder {
        fn fail(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Embedder for SwitchableEmbedder {
        fn name(&self) -> &str {
            "switchable"
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(EmbeddingError::Backend {
                    backend: "switchable".to_string(),
                    details: "service unavailable".to_string(),
                });
            }
            self.inner.embed_batch(texts).await
        }
    }

    fn config(root: &Path) -> AppConfig {
        AppConfig {
            chunking: ChunkingConfig {
                max_chars: 200,
                overlap_chars: 40,
            },
            index: IndexConfig {
                directory: root.join("index"),
                ..IndexConfig::default()
            },
            ..AppConfig::default()
        }
    }

    async fn assistant() -> (TempDir, Assistant) {
        let dir = tempdir().unwrap();
        let assistant = Assistant::from_config(config(dir.path())).await.unwrap();
        (dir, assistant)
    }

    #[tokio::test]
    async fn open_rejects_an_embedder_of_the_wrong_width() {
        let dir = tempdir().unwrap();
        let result = Assistant::open(
            config(dir.path()),
            Arc::new(CharacterNgramEmbedder::new(16)),
            Arc::new(ExtractiveBackend::new()),
        )
        .await;
        assert!(matches!(result, Err(AssistantError::Embedding(_))));
    }

    #[test]
    fn gemini_provider_requires_an_api_key() {
        let mut config = AppConfig::default();
        config.generation.provider = GenerationProvider::Gemini;
        assert!(matches!(backend_from_config(&config), Err(ConfigError::Invalid(_))));

        config.backend.api_key = Some("key".to_string());
        assert_eq!(backend_from_config(&config).unwrap().name(), "gemini");
    }

    #[tokio::test]
    async fn changed_content_replaces_the_previous_chunks() {
        let (dir, assistant) = assistant().await;
        let file = dir.path().join("notes.txt");
        fs::write(&file, "The launch is planned for March.").unwrap();

        let first = assistant.ingest(&file).await.unwrap();
        assert!(matches!(first, IngestOutcome::Indexed { replaced: false, .. }));

        fs::write(&file, "The launch moved to June. Marketing starts in May.").unwrap();
        let second = assistant.ingest(&file).await.unwrap();
        assert!(matches!(second, IngestOutcome::Indexed { replaced: true, .. }));
        assert_eq!(first.document().document_id, second.document().document_id);

        let stats = assistant.stats().await;
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.chunks, second.document().chunk_count());
        assert!(assistant.document_locks.is_empty());
    }

    #[tokio::test]
    async fn embedding_failures_write_nothing_and_keep_the_previous_chunks() {
        let dir = tempdir().unwrap();
        let embedder = Arc::new(SwitchableEmbedder::default());
        let assistant = Assistant::open(
            config(dir.path()),
            embedder.clone(),
            Arc::new(ExtractiveBackend::new()),
        )
        .await
        .unwrap();
        let file = dir.path().join("notes.txt");
        fs::write(&file, "The launch is planned for March.").unwrap();

        embedder.fail(true);
        let result = assistant.ingest(&file).await;
        assert!(matches!(result, Err(IngestError::Embedding(_))));
        let stats = assistant.stats().await;
        assert_eq!((stats.documents, stats.chunks), (0, 0));

        embedder.fail(false);
        let indexed = assistant.ingest(&file).await.unwrap();
        let before = assistant.stats().await;

        fs::write(&file, "The launch moved to June. Marketing starts in May.").unwrap();
        embedder.fail(true);
        let result = assistant.ingest(&file).await;
        assert!(matches!(result, Err(IngestError::Embedding(_))));

        assert_eq!(assistant.stats().await, before);
        let stored = assistant
            .document(&indexed.document().document_id)
            .await
            .unwrap();
        assert_eq!(stored.content_hash, indexed.document().content_hash);
        assert_eq!(stored.chunk_ids, indexed.document().chunk_ids);
    }

    #[tokio::test]
    async fn batch_ingest_reports_failures_per_file() {
        let (dir, assistant) = assistant().await;
        let good = dir.path().join("good.txt");
        let empty = dir.path().join("empty.txt");
        fs::write(&good, "Quarterly revenue grew.").unwrap();
        fs::write(&empty, "   \n").unwrap();

        let report = assistant
            .ingest_batch(&[good, empty.clone(), dir.path().join("missing.txt")])
            .await;
        assert_eq!(report.indexed.len(), 1);
        assert_eq!(report.skipped_files.len(), 2);
        assert_eq!(report.skipped_files[0].path, empty);
    }

    #[tokio::test]
    async fn folder_without_documents_is_an_error() {
        let (dir, assistant) = assistant().await;
        let folder = dir.path().join("empty");
        fs::create_dir(&folder).unwrap();
        fs::write(folder.join("image.bin"), [0u8, 1, 2]).unwrap();

        let result = assistant.ingest_folder(&folder).await;
        assert!(matches!(result, Err(IngestError::NoDocuments(_))));
    }

    #[tokio::test]
    async fn close_keeps_the_collection_on_disk() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, "Persisted content survives a restart.").unwrap();

        let assistant = Assistant::from_config(config(dir.path())).await.unwrap();
        assistant.ingest(&file).await.unwrap();
        assistant.close().await.unwrap();

        let reopened = Assistant::from_config(config(dir.path())).await.unwrap();
        assert_eq!(reopened.documents().await.len(), 1);
    }
}
