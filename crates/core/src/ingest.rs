use crate::chunking::{build_chunks, ChunkingConfig};
use crate::error::IngestError;
use crate::extractor::detect_format;
use crate::models::{Document, FormatTag, ProcessedDocument};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Every file below `folder` whose extension maps to a known format, sorted.
pub fn discover_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| FormatTag::is_supported_path(path))
        .collect::<Vec<_>>();

    files.sort_unstable();
    files
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Stable id derived from the source path, so re-ingesting a moved file creates a new document.
pub fn document_id_for(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Turns a file into a document record and its chunks. Holds no state besides
/// the chunking limits, nothing is written anywhere.
#[derive(Debug, Clone, Copy)]
pub struct DocumentProcessor {
    config: ChunkingConfig,
}

impl DocumentProcessor {
    pub fn new(config: ChunkingConfig) -> Result<Self, IngestError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    pub async fn process(&self, path: &Path) -> Result<ProcessedDocument, IngestError> {
        let path = tokio::fs::canonicalize(path).await?;
        let metadata = tokio::fs::metadata(&path).await?;
        let modified_at = metadata.modified().ok().map(DateTime::<Utc>::from);
        let bytes = tokio::fs::read(&path).await?;

        let processor = *self;
        tokio::task::spawn_blocking(move || processor.process_bytes(&path, &bytes, modified_at))
            .await
            .map_err(|error| IngestError::Io(std::io::Error::other(error)))?
    }

    pub fn process_bytes(
        &self,
        path: &Path,
        bytes: &[u8],
        modified_at: Option<DateTime<Utc>>,
    ) -> Result<ProcessedDocument, IngestError> {
        let label = path.display().to_string();
        let format = detect_format(path, bytes)?;
        let sections = format.extract(path, bytes)?;

        if sections.iter().all(|section| section.text.trim().is_empty()) {
            return Err(IngestError::EmptyContent(label));
        }

        let title = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| IngestError::MissingFileName(label.clone()))?;

        let mut document = Document {
            document_id: document_id_for(path),
            title: title.to_string(),
            source_path: path.to_string_lossy().to_string(),
            format,
            content_hash: digest_bytes(bytes),
            size_bytes: bytes.len() as u64,
            modified_at,
            ingested_at: Utc::now(),
            chunk_ids: Vec::new(),
        };

        let mut chunks = Vec::new();
        let mut cursor = 0u64;
        for section in &sections {
            let (section_chunks, next_cursor) =
                build_chunks(&document, section, self.config, cursor)?;
            cursor = next_cursor;
            chunks.extend(section_chunks);
        }

        if chunks.is_empty() {
            return Err(IngestError::EmptyContent(label));
        }

        document.chunk_ids = chunks.iter().map(|chunk| chunk.chunk_id.clone()).collect();
        debug!(
            path = %label,
            format = %format,
            sections = sections.len(),
            chunks = chunks.len(),
            "processed document"
        );

        Ok(ProcessedDocument { document, chunks })
    }
}
