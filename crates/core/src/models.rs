use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FormatTag {
    PlainText,
    Pdf,
    WordProcessor,
    Spreadsheet,
    Delimited,
    SlideDeck,
}

impl FormatTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlainText => "text",
            Self::Pdf => "pdf",
            Self::WordProcessor => "docx",
            Self::Spreadsheet => "spreadsheet",
            Self::Delimited => "csv",
            Self::SlideDeck => "pptx",
        }
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where inside the source file a span of text came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Locator {
    Page { number: u32 },
    Sheet { name: String, range: String },
    Rows { start: u64, end: u64 },
    Slide { number: u32 },
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Page { number } => write!(f, "page {number}"),
            Self::Sheet { name, range } => write!(f, "sheet {name}!{range}"),
            Self::Rows { start, end } => write!(f, "rows {start}-{end}"),
            Self::Slide { number } => write!(f, "slide {number}"),
        }
    }
}

/// A source file as known to the index. The chunk set listed in `chunk_ids`
/// is replaced as a whole whenever the content hash changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub document_id: String,
    pub title: String,
    pub source_path: String,
    pub format: FormatTag,
    pub content_hash: String,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub ingested_at: DateTime<Utc>,
    pub chunk_ids: Vec<String>,
}

impl Document {
    pub fn chunk_count(&self) -> usize {
        self.chunk_ids.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: u64,
    pub text: String,
    pub char_len: usize,
    pub locator: Option<Locator>,
    /// Byte range of `text` inside the normalized section it was cut from.
    pub span: (usize, usize),
}

/// Output of the document processor: nothing here is persisted yet.
#[derive(Debug, Clone)]
pub struct ProcessedDocument {
    pub document: Document,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkPayload {
    pub document_id: String,
    pub source_path: String,
    pub title: String,
    pub format: FormatTag,
    pub text: String,
    pub locator: Option<Locator>,
    pub chunk_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: ChunkPayload,
}

impl IndexEntry {
    pub fn from_chunk(document: &Document, chunk: &Chunk, vector: Vec<f32>) -> Self {
        Self {
            id: chunk.chunk_id.clone(),
            vector,
            payload: ChunkPayload {
                document_id: document.document_id.clone(),
                source_path: document.source_path.clone(),
                title: document.title.clone(),
                format: document.format,
                text: chunk.text.clone(),
                locator: chunk.locator.clone(),
                chunk_index: chunk.chunk_index,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct QueryFilters {
    pub document_ids: Vec<String>,
    pub formats: Vec<FormatTag>,
    pub path_prefix: Option<String>,
}

impl QueryFilters {
    pub fn is_empty(&self) -> bool {
        self.document_ids.is_empty() && self.formats.is_empty() && self.path_prefix.is_none()
    }

    pub fn matches(&self, payload: &ChunkPayload) -> bool {
        if !self.document_ids.is_empty() && !self.document_ids.contains(&payload.document_id) {
            return false;
        }
        if !self.formats.is_empty() && !self.formats.contains(&payload.format) {
            return false;
        }
        match &self.path_prefix {
            Some(prefix) => payload.source_path.starts_with(prefix.as_str()),
            None => true,
        }
    }
}

/// Raw nearest-neighbour hit as returned by a vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchCandidate {
    pub chunk_id: String,
    pub similarity: f32,
    pub payload: ChunkPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub payload: ChunkPayload,
    pub similarity: f32,
    pub score: f64,
    pub rank: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalNotice {
    /// Nothing is indexed yet, the answer will not be grounded.
    EmptyCorpus,
    /// Documents exist but no candidate fit the query or the budget.
    NoMatches,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub query: String,
    pub hits: Vec<RetrievedChunk>,
    pub candidates_considered: usize,
    pub skipped_for_budget: usize,
    pub notice: Option<RetrievalNotice>,
}

impl RetrievalResult {
    pub fn empty(query: &str, notice: RetrievalNotice) -> Self {
        Self {
            query: query.to_string(),
            hits: Vec::new(),
            candidates_considered: 0,
            skipped_for_budget: 0,
            notice: Some(notice),
        }
    }

    pub fn context_chars(&self) -> usize {
        self.hits
            .iter()
            .map(|hit| hit.payload.text.chars().count())
            .sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub marker: usize,
    pub chunk_id: String,
    pub document_id: String,
    pub title: String,
    pub source_path: String,
    pub locator: Option<Locator>,
    pub score: f64,
    /// False when the model cited nothing and the top context chunks were attached instead.
    pub explicit: bool,
}

impl Citation {
    pub fn format_inline(&self) -> String {
        match &self.locator {
            Some(locator) => format!("[S{}] {} ({})", self.marker, self.title, locator),
            None => format!("[S{}] {}", self.marker, self.title),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AskRequest {
    pub query: String,
    pub top_k: usize,
    pub max_context_chars: usize,
    pub filters: QueryFilters,
}

impl AskRequest {
    pub fn new(query: impl Into<String>, top_k: usize, max_context_chars: usize) -> Self {
        Self {
            query: query.into(),
            top_k,
            max_context_chars,
            filters: QueryFilters::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenerationMetrics {
    pub retrieval_ms: u64,
    pub generation_ms: u64,
    pub total_ms: u64,
    pub prompt_chars: usize,
    pub context_chars: usize,
    pub answer_chars: usize,
    pub estimated_prompt_tokens: usize,
    pub estimated_answer_tokens: usize,
    pub tool_calls: usize,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub query_id: String,
    pub query: String,
    pub answer: String,
    pub context: Vec<RetrievedChunk>,
    pub citations: Vec<Citation>,
    pub grounded: bool,
    pub backend: String,
    pub metrics: GenerationMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IngestOutcome {
    Indexed { document: Document, replaced: bool },
    Unchanged { document: Document },
}

impl IngestOutcome {
    pub fn document(&self) -> &Document {
        match self {
            Self::Indexed { document, .. } | Self::Unchanged { document } => document,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct IngestionReport {
    pub indexed: Vec<Document>,
    pub unchanged: Vec<Document>,
    pub skipped_files: Vec<SkippedFile>,
}

impl IngestionReport {
    pub fn chunk_count(&self) -> usize {
        self.indexed.iter().map(Document::chunk_count).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexStats {
    pub collection: String,
    pub dimensions: usize,
    pub documents: usize,
    pub chunks: usize,
}

/// Rough token estimate used for metrics only.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}
