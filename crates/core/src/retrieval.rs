use crate::config::{RerankStrategy, RetrievalConfig};
use crate::embeddings::Embedder;
use crate::error::RetrievalError;
use crate::models::{QueryFilters, RetrievalNotice, RetrievalResult, RetrievedChunk, SearchCandidate};
use crate::traits::VectorIndex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Questions that ask for an overview need more passages than a point lookup.
const BROAD_QUERY_WORDS: &[&str] = &["total", "overall", "summary", "all", "entire"];
const BROAD_QUERY_TOP_K: usize = 8;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "were", "what", "which", "who", "whom", "how", "why",
    "when", "where", "with", "from", "that", "this", "these", "those", "did", "does", "has",
    "have", "had", "can", "could", "would", "should", "about", "into", "than", "then", "there",
    "their", "they", "them", "its", "our", "your", "you", "not", "but", "any", "all",
];

/// Depth actually used for `query`: broad questions get at least eight passages.
pub fn effective_top_k(query: &str, top_k: usize) -> usize {
    let broad = words(query).any(|word| BROAD_QUERY_WORDS.contains(&word.as_str()));
    if broad {
        top_k.max(BROAD_QUERY_TOP_K)
    } else {
        top_k
    }
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
}

/// Content words of a query: lowercase, at least three characters, no stopwords.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    words(query)
        .filter(|word| word.chars().count() >= 3 || word.chars().any(|c| c.is_ascii_digit()))
        .filter(|word| !STOPWORDS.contains(&word.as_str()))
        .filter(|word| seen.insert(word.clone()))
        .collect()
}

/// Share of `terms` that occur in `text`, in `[0, 1]`.
pub fn lexical_overlap(terms: &[String], text: &str) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let present = words(text).collect::<HashSet<_>>();
    let hits = terms.iter().filter(|term| present.contains(*term)).count();
    hits as f64 / terms.len() as f64
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Embeds the query, overfetches, reranks and fills the context budget
    /// with whole chunks. An empty index is reported as a notice, not an error.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        max_context_chars: usize,
        filters: Option<&QueryFilters>,
    ) -> Result<RetrievalResult, RetrievalError> {
        if self.index.stats().await.chunks == 0 {
            warn!(query, "index is empty, answering without grounding");
            return Ok(RetrievalResult::empty(query, RetrievalNotice::EmptyCorpus));
        }

        let top_k = effective_top_k(query, top_k);
        if top_k == 0 {
            return Ok(RetrievalResult::empty(query, RetrievalNotice::NoMatches));
        }

        let vector = self.embedder.embed(query).await?;
        let fetch = top_k.saturating_mul(self.config.overfetch_factor.max(1));
        let filters = filters.filter(|filters| !filters.is_empty());
        let candidates = self.index.query(&vector, fetch, filters).await?;
        let considered = candidates.len();

        let ranked = self.rerank(query, candidates);
        let (hits, skipped) = fill_budget(ranked, top_k, max_context_chars);

        debug!(
            query,
            fetch,
            considered,
            accepted = hits.len(),
            skipped_for_budget = skipped,
            "retrieval finished"
        );

        let notice = hits.is_empty().then_some(RetrievalNotice::NoMatches);
        Ok(RetrievalResult {
            query: query.to_string(),
            hits,
            candidates_considered: considered,
            skipped_for_budget: skipped,
            notice,
        })
    }

    /// Orders candidates by final score. The sort is stable, so equal scores
    /// keep the index order.
    fn rerank(&self, query: &str, candidates: Vec<SearchCandidate>) -> Vec<(SearchCandidate, f64)> {
        let mut scored = match self.config.rerank {
            RerankStrategy::VectorOnly => candidates
                .into_iter()
                .map(|candidate| {
                    let score = f64::from(candidate.similarity);
                    (candidate, score)
                })
                .collect::<Vec<_>>(),
            RerankStrategy::LexicalBoost => {
                let terms = query_terms(query);
                let weight = self.config.lexical_weight;
                candidates
                    .into_iter()
                    .map(|candidate| {
                        let lexical = lexical_overlap(&terms, &candidate.payload.text);
                        let score =
                            (1.0 - weight) * f64::from(candidate.similarity) + weight * lexical;
                        (candidate, score)
                    })
                    .collect::<Vec<_>>()
            }
        };

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored
    }
}

/// Accepts candidates in rank order while they fit. A candidate that would
/// overflow is skipped whole and later, shorter ones may still fit.
fn fill_budget(
    ranked: Vec<(SearchCandidate, f64)>,
    top_k: usize,
    max_context_chars: usize,
) -> (Vec<RetrievedChunk>, usize) {
    let mut hits = Vec::with_capacity(top_k);
    let mut used = 0usize;
    let mut skipped = 0usize;

    for (candidate, score) in ranked {
        if hits.len() == top_k {
            break;
        }
        let length = candidate.payload.text.chars().count();
        if used + length > max_context_chars {
            skipped += 1;
            continue;
        }
        used += length;
        hits.push(RetrievedChunk {
            rank: hits.len() + 1,
            chunk_id: candidate.chunk_id,
            similarity: candidate.similarity,
            score,
            payload: candidate.payload,
        });
    }

    (hits, skipped)
}
