//! Grounded prompt assembly and mapping of `[S#]` markers back to sources.

use crate::generation::{GenerationTurn, SourceBlock, ToolSchema, TurnMessage};
use crate::models::{Citation, RetrievedChunk};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// How many context chunks are attached when the model cites nothing.
const IMPLICIT_CITATIONS: usize = 3;

pub const SYSTEM_INSTRUCTIONS: &str = "You are a document assistant. Answer using only the \
numbered sources provided. Cite every fact with its source marker, for example [S1] or [S1, S2]. \
If the sources do not contain the answer, say that the documents do not cover it. \
Use the available tools for arithmetic, dates and text statistics instead of computing by hand.";

pub const UNGROUNDED_INSTRUCTIONS: &str = "No documents are indexed, so there are no sources. \
Answer briefly from general knowledge and state clearly that the answer is not based on the \
user's documents. Do not emit source markers.";

fn marker_regex() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| {
        Regex::new(r"\[(S\d+(?:\s*[,;]\s*S\d+)*)\]").expect("marker pattern is valid")
    })
}

pub fn source_label(hit: &RetrievedChunk) -> String {
    match &hit.payload.locator {
        Some(locator) => format!("{} ({})", hit.payload.title, locator),
        None => hit.payload.title.clone(),
    }
}

pub fn source_blocks(hits: &[RetrievedChunk]) -> Vec<SourceBlock> {
    hits.iter()
        .enumerate()
        .map(|(position, hit)| SourceBlock {
            marker: position + 1,
            label: source_label(hit),
            text: hit.payload.text.clone(),
        })
        .collect()
}

pub fn render_prompt(question: &str, sources: &[SourceBlock]) -> String {
    let mut prompt = String::new();
    if !sources.is_empty() {
        prompt.push_str("SOURCES:\n\n");
        for source in sources {
            prompt.push_str(&format!(
                "[S{}] {}\n{}\n\n---\n\n",
                source.marker, source.label, source.text
            ));
        }
    }
    prompt.push_str("QUESTION: ");
    prompt.push_str(question);
    prompt
}

pub fn build_turn(
    question: &str,
    hits: &[RetrievedChunk],
    tools: Vec<ToolSchema>,
    temperature: f32,
    max_output_tokens: u32,
) -> GenerationTurn {
    let sources = source_blocks(hits);
    let system = if sources.is_empty() {
        UNGROUNDED_INSTRUCTIONS
    } else {
        SYSTEM_INSTRUCTIONS
    };

    GenerationTurn {
        system: system.to_string(),
        question: question.to_string(),
        messages: vec![TurnMessage::User(render_prompt(question, &sources))],
        sources,
        tools,
        temperature,
        max_output_tokens,
    }
}

/// Marker numbers in order of first appearance. `[S1, S3]` counts as two markers.
pub fn cited_markers(answer: &str) -> Vec<usize> {
    let mut seen = HashSet::new();
    marker_regex()
        .captures_iter(answer)
        .filter_map(|captures| captures.get(1))
        .flat_map(|group| {
            group
                .as_str()
                .split([',', ';'])
                .filter_map(|part| part.trim().trim_start_matches('S').parse::<usize>().ok())
                .collect::<Vec<_>>()
        })
        .filter(|marker| seen.insert(*marker))
        .collect()
}

fn citation_for(marker: usize, hit: &RetrievedChunk, explicit: bool) -> Citation {
    Citation {
        marker,
        chunk_id: hit.chunk_id.clone(),
        document_id: hit.payload.document_id.clone(),
        title: hit.payload.title.clone(),
        source_path: hit.payload.source_path.clone(),
        locator: hit.payload.locator.clone(),
        score: hit.score,
        explicit,
    }
}

/// Resolves the markers of `answer` against the context it was generated
/// from. Markers outside the context are dropped. An answer without any
/// valid marker gets the best context chunks as implicit citations.
pub fn map_citations(answer: &str, hits: &[RetrievedChunk]) -> Vec<Citation> {
    let explicit = cited_markers(answer)
        .into_iter()
        .filter_map(|marker| {
            let hit = hits.get(marker.checked_sub(1)?)?;
            Some(citation_for(marker, hit, true))
        })
        .collect::<Vec<_>>();

    if !explicit.is_empty() {
        return explicit;
    }

    hits.iter()
        .take(IMPLICIT_CITATIONS)
        .enumerate()
        .map(|(position, hit)| citation_for(position + 1, hit, false))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkPayload, FormatTag, Locator};

    fn hit(id: &str, title: &str, locator: Option<Locator>) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: id.to_string(),
            payload: ChunkPayload {
                document_id: format!("doc-{title}"),
                source_path: format!("/docs/{title}"),
                title: title.to_string(),
                format: FormatTag::Pdf,
                text: format!("text of {id}"),
                locator,
                chunk_index: 0,
            },
            similarity: 0.5,
            score: 0.5,
            rank: 1,
        }
    }

    #[test]
    fn prompt_tags_every_source() {
        let hits = vec![
            hit("a", "report.pdf", Some(Locator::Page { number: 3 })),
            hit("b", "notes.txt", None),
        ];
        let turn = build_turn("What happened?", &hits, Vec::new(), 0.2, 256);
        assert_eq!(turn.system, SYSTEM_INSTRUCTIONS);
        let TurnMessage::User(prompt) = &turn.messages[0] else {
            panic!("first message must be the user prompt");
        };
        assert!(prompt.contains("[S1] report.pdf (page 3)\ntext of a"));
        assert!(prompt.contains("[S2] notes.txt\ntext of b"));
        assert!(prompt.ends_with("QUESTION: What happened?"));
    }

    #[test]
    fn empty_context_switches_to_ungrounded_instructions() {
        let turn = build_turn("Hello?", &[], Vec::new(), 0.2, 256);
        assert_eq!(turn.system, UNGROUNDED_INSTRUCTIONS);
        assert!(turn.sources.is_empty());
    }

    #[test]
    fn markers_are_parsed_in_order_without_duplicates() {
        let answer = "Revenue grew [S2]. Costs fell [S1, S3]; see also [S2] and [S4;S1].";
        assert_eq!(cited_markers(answer), vec![2, 1, 3, 4]);
    }

    #[test]
    fn markers_map_to_their_chunks() {
        let hits = vec![hit("a", "a.pdf", None), hit("b", "b.pdf", None)];
        let citations = map_citations("It grew 23% [S2].", &hits);
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].chunk_id, "b");
        assert_eq!(citations[0].marker, 2);
        assert!(citations[0].explicit);
    }

    #[test]
    fn out_of_range_markers_are_ignored() {
        let hits = vec![hit("a", "a.pdf", None)];
        let citations = map_citations("Claim [S0] and [S7] and [S1].", &hits);
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].chunk_id, "a");
    }

    #[test]
    fn uncited_answer_falls_back_to_top_chunks() {
        let hits = (0..5)
            .map(|n| hit(&format!("c{n}"), "doc.pdf", None))
            .collect::<Vec<_>>();
        let citations = map_citations("An answer without markers.", &hits);
        assert_eq!(citations.len(), 3);
        assert!(citations.iter().all(|citation| !citation.explicit));
        assert_eq!(citations[0].chunk_id, "c0");
    }

    #[test]
    fn no_context_means_no_citations() {
        assert!(map_citations("Anything [S1].", &[]).is_empty());
    }
}
