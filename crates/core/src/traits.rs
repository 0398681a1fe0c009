use crate::error::{GenerationError, IndexError};
use crate::generation::{GenerationTurn, ModelEventStream};
use crate::models::{Document, IndexEntry, IndexStats, QueryFilters, SearchCandidate};
use async_trait::async_trait;

/// Persistent store of chunk vectors, their payloads and the owning document records.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn dimensions(&self) -> usize;

    /// Inserts or replaces the entry with the same id.
    async fn upsert(&self, entry: IndexEntry) -> Result<(), IndexError>;

    /// Swaps a document's record and its whole entry set in one step. Readers
    /// see either the previous set or the new one, never a mix.
    async fn replace_document(
        &self,
        document: Document,
        entries: Vec<IndexEntry>,
    ) -> Result<(), IndexError>;

    /// Removes the document record and every entry whose payload references it.
    /// Returns the number of entries removed.
    async fn delete_by_document(&self, document_id: &str) -> Result<usize, IndexError>;

    /// Nearest neighbours by cosine similarity, best first. Equal scores keep insertion order.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filters: Option<&QueryFilters>,
    ) -> Result<Vec<SearchCandidate>, IndexError>;

    async fn document(&self, document_id: &str) -> Option<Document>;

    async fn documents(&self) -> Vec<Document>;

    async fn stats(&self) -> IndexStats;

    async fn clear(&self) -> Result<(), IndexError>;

    async fn flush(&self) -> Result<(), IndexError>;
}

/// A generative model that answers one turn as a stream of events.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether tool schemas in the turn are understood by the model.
    fn supports_tools(&self) -> bool {
        false
    }

    async fn generate_stream(
        &self,
        turn: &GenerationTurn,
    ) -> Result<ModelEventStream, GenerationError>;
}
