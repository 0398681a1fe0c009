use crate::error::IndexError;
use crate::models::{Document, IndexEntry, IndexStats, QueryFilters, SearchCandidate};
use crate::traits::VectorIndex;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

const STATE_FILE: &str = "collection.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    seq: u64,
    entry: IndexEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollectionState {
    name: String,
    dimensions: usize,
    next_seq: u64,
    documents: BTreeMap<String, Document>,
    /// Kept sorted by `seq`.
    entries: Vec<StoredEntry>,
}

impl CollectionState {
    fn empty(name: &str, dimensions: usize) -> Self {
        Self {
            name: name.to_string(),
            dimensions,
            next_seq: 0,
            documents: BTreeMap::new(),
            entries: Vec::new(),
        }
    }

    fn check_width(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    fn upsert(&mut self, entry: IndexEntry) -> Result<(), IndexError> {
        self.check_width(&entry.vector)?;
        if let Some(existing) = self.entries.iter_mut().find(|stored| stored.entry.id == entry.id) {
            existing.entry = entry;
            return Ok(());
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(StoredEntry { seq, entry });
        Ok(())
    }

    fn remove_document(&mut self, document_id: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|stored| stored.entry.payload.document_id != document_id);
        self.documents.remove(document_id);
        before - self.entries.len()
    }
}

/// A vector collection persisted as one JSON file inside `<root>/<name>/`.
///
/// Readers work on an immutable snapshot. Writers are serialized, build the
/// next state on a copy, persist it with an atomic rename and only then
/// publish it, so a failed write leaves both disk and memory untouched.
pub struct LocalCollection {
    dir: PathBuf,
    state: RwLock<Arc<CollectionState>>,
    writer: Mutex<()>,
}

impl LocalCollection {
    pub async fn open(
        root: impl AsRef<Path>,
        name: &str,
        dimensions: usize,
    ) -> Result<Self, IndexError> {
        let dir = root.as_ref().join(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| IndexError::io(&dir, source))?;

        let path = dir.join(STATE_FILE);
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state: CollectionState =
                    serde_json::from_slice(&bytes).map_err(|error| {
                        IndexError::CorruptCollection {
                            collection: name.to_string(),
                            details: error.to_string(),
                        }
                    })?;
                if state.dimensions != dimensions {
                    return Err(IndexError::DimensionMismatch {
                        expected: state.dimensions,
                        actual: dimensions,
                    });
                }
                info!(
                    collection = name,
                    documents = state.documents.len(),
                    chunks = state.entries.len(),
                    "opened collection"
                );
                state
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                let state = CollectionState::empty(name, dimensions);
                write_state(&dir, &state).await?;
                info!(collection = name, dimensions, "created collection");
                state
            }
            Err(error) => return Err(IndexError::io(&path, error)),
        };

        Ok(Self {
            dir,
            state: RwLock::new(Arc::new(state)),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.snapshot().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<CollectionState> {
        self.state.read().clone()
    }

    async fn mutate<T, F>(&self, apply: F) -> Result<T, IndexError>
    where
        F: FnOnce(&mut CollectionState) -> Result<T, IndexError> + Send,
        T: Send,
    {
        let _guard = self.writer.lock().await;
        let mut next = CollectionState::clone(&self.snapshot());
        let output = apply(&mut next)?;
        write_state(&self.dir, &next).await?;
        *self.state.write() = Arc::new(next);
        Ok(output)
    }
}

async fn write_state(dir: &Path, state: &CollectionState) -> Result<(), IndexError> {
    let bytes = serde_json::to_vec(state)?;
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|source| IndexError::io(&dir, source))?;
        file.write_all(&bytes)
            .and_then(|_| file.as_file().sync_all())
            .map_err(|source| IndexError::io(file.path(), source))?;
        let target = dir.join(STATE_FILE);
        file.persist(&target)
            .map_err(|error| IndexError::io(&target, error.error))?;
        Ok(())
    })
    .await
    .map_err(|error| IndexError::Task(error.to_string()))?
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorIndex for LocalCollection {
    fn dimensions(&self) -> usize {
        self.snapshot().dimensions
    }

    async fn upsert(&self, entry: IndexEntry) -> Result<(), IndexError> {
        self.mutate(move |state| state.upsert(entry)).await
    }

    async fn replace_document(
        &self,
        document: Document,
        entries: Vec<IndexEntry>,
    ) -> Result<(), IndexError> {
        let document_id = document.document_id.clone();
        let count = entries.len();
        let removed = self
            .mutate(move |state| {
                for entry in &entries {
                    state.check_width(&entry.vector)?;
                }
                let removed = state.remove_document(&document.document_id);
                for entry in entries {
                    state.upsert(entry)?;
                }
                state
                    .documents
                    .insert(document.document_id.clone(), document);
                Ok(removed)
            })
            .await?;
        debug!(document_id = %document_id, removed, inserted = count, "replaced document entries");
        Ok(())
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize, IndexError> {
        let document_id = document_id.to_string();
        self.mutate(move |state| Ok(state.remove_document(&document_id)))
            .await
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filters: Option<&QueryFilters>,
    ) -> Result<Vec<SearchCandidate>, IndexError> {
        let state = self.snapshot();
        state.check_width(vector)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut scored = state
            .entries
            .iter()
            .filter(|stored| filters.map_or(true, |filters| filters.matches(&stored.entry.payload)))
            .map(|stored| (cosine_similarity(vector, &stored.entry.vector), stored))
            .collect::<Vec<_>>();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.seq.cmp(&b.1.seq)));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(similarity, stored)| SearchCandidate {
                chunk_id: stored.entry.id.clone(),
                similarity,
                payload: stored.entry.payload.clone(),
            })
            .collect())
    }

    async fn document(&self, document_id: &str) -> Option<Document> {
        self.snapshot().documents.get(document_id).cloned()
    }

    async fn documents(&self) -> Vec<Document> {
        self.snapshot().documents.values().cloned().collect()
    }

    async fn stats(&self) -> IndexStats {
        let state = self.snapshot();
        IndexStats {
            collection: state.name.clone(),
            dimensions: state.dimensions,
            documents: state.documents.len(),
            chunks: state.entries.len(),
        }
    }

    async fn clear(&self) -> Result<(), IndexError> {
        self.mutate(|state| {
            state.documents.clear();
            state.entries.clear();
            state.next_seq = 0;
            Ok(())
        })
        .await
    }

    async fn flush(&self) -> Result<(), IndexError> {
        let _guard = self.writer.lock().await;
        write_state(&self.dir, &self.snapshot()).await
    }
}
