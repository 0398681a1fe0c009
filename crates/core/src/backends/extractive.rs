use crate::error::GenerationError;
use crate::generation::{GenerationTurn, ModelEvent, ModelEventStream, ToolCall};
use crate::retrieval::{lexical_overlap, query_terms};
use crate::traits::GenerationBackend;
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use std::sync::OnceLock;
use unicode_segmentation::UnicodeSegmentation;

const MAX_SENTENCES: usize = 3;

pub const NO_DOCUMENTS_ANSWER: &str =
    "No documents are indexed yet, so this question cannot be answered from your files.";
pub const NOT_COVERED_ANSWER: &str =
    "The indexed documents do not appear to cover this question.";

fn arithmetic_regex() -> &'static Regex {
    static ARITHMETIC: OnceLock<Regex> = OnceLock::new();
    ARITHMETIC.get_or_init(|| {
        Regex::new(r"[(\d][\d\s.()]*(?:[-+*/^%][\d\s.()]*)+[\d)]")
            .expect("arithmetic pattern is valid")
    })
}

/// Arithmetic expression embedded in a question, e.g. `what is 125.7 * 0.23?`.
fn arithmetic_in(question: &str) -> Option<String> {
    let found = arithmetic_regex().find(question)?;
    let expression = found.as_str().trim();
    let iso_date = expression.len() == 10
        && expression.char_indices().all(|(index, c)| match index {
            4 | 7 => c == '-',
            _ => c.is_ascii_digit(),
        });
    if iso_date {
        return None;
    }
    expression
        .chars()
        .any(|c| matches!(c, '+' | '-' | '*' | '/' | '^' | '%'))
        .then(|| expression.to_string())
}

/// Answers offline by quoting the context sentences that share the most
/// terms with the question, each followed by its source marker.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractiveBackend;

impl ExtractiveBackend {
    pub fn new() -> Self {
        Self
    }

    fn tool_request(&self, turn: &GenerationTurn) -> Option<ToolCall> {
        let offers_calculator = turn.tools.iter().any(|tool| tool.name == "calculator");
        if !offers_calculator || turn.tool_results().next().is_some() {
            return None;
        }
        arithmetic_in(&turn.question).map(|expression| ToolCall {
            name: "calculator".to_string(),
            arguments: json!({ "expression": expression }),
        })
    }

    /// Answer pieces in the order they are streamed.
    pub fn compose(&self, turn: &GenerationTurn) -> Vec<String> {
        let mut pieces = Vec::new();

        for (name, content, is_error) in turn.tool_results() {
            if is_error {
                pieces.push(format!("The {name} tool failed: {content}\n\n"));
            } else {
                pieces.push(format!("Calculation: {content}\n\n"));
            }
        }

        if turn.sources.is_empty() {
            if pieces.is_empty() {
                pieces.push(NO_DOCUMENTS_ANSWER.to_string());
            }
            return pieces;
        }

        let terms = query_terms(&turn.question);
        let mut scored = turn
            .sources
            .iter()
            .flat_map(|source| {
                source
                    .text
                    .unicode_sentences()
                    .map(str::trim)
                    .filter(|sentence| !sentence.is_empty())
                    .map(move |sentence| (source.marker, sentence))
            })
            .enumerate()
            .map(|(order, (marker, sentence))| {
                (lexical_overlap(&terms, sentence), order, marker, sentence)
            })
            .filter(|(score, ..)| *score > 0.0)
            .collect::<Vec<_>>();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored.truncate(MAX_SENTENCES);

        if scored.is_empty() {
            if pieces.is_empty() {
                pieces.push(NOT_COVERED_ANSWER.to_string());
            }
            return pieces;
        }

        pieces.push("Based on the documents: ".to_string());
        let count = scored.len();
        for (position, (_, _, marker, sentence)) in scored.into_iter().enumerate() {
            let separator = if position + 1 < count { " " } else { "" };
            pieces.push(format!("{sentence} [S{marker}]{separator}"));
        }
        pieces
    }
}

#[async_trait]
impl GenerationBackend for ExtractiveBackend {
    fn name(&self) -> &str {
        "extractive"
    }

    fn supports_tools(&self) -> bool {
        true
    }

    async fn generate_stream(
        &self,
        turn: &GenerationTurn,
    ) -> Result<ModelEventStream, GenerationError> {
        let events = match self.tool_request(turn) {
            Some(call) => vec![Ok(ModelEvent::ToolCall(call))],
            None => self
                .compose(turn)
                .into_iter()
                .map(|piece| Ok(ModelEvent::Text(piece)))
                .collect(),
        };
        Ok(Box::pin(futures::stream::iter(events)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{SourceBlock, TurnMessage};
    use crate::tools::ToolRegistry;
    use futures::StreamExt;

    fn turn(question: &str, sources: &[&str], with_tools: bool) -> GenerationTurn {
        GenerationTurn {
            system: String::new(),
            question: question.to_string(),
            sources: sources
                .iter()
                .enumerate()
                .map(|(position, text)| SourceBlock {
                    marker: position + 1,
                    label: format!("doc{position}"),
                    text: text.to_string(),
                })
                .collect(),
            messages: vec![TurnMessage::User(question.to_string())],
            tools: if with_tools {
                ToolRegistry::builtin().schemas()
            } else {
                Vec::new()
            },
            temperature: 0.0,
            max_output_tokens: 256,
        }
    }

    async fn collect(backend: &ExtractiveBackend, turn: &GenerationTurn) -> Vec<ModelEvent> {
        backend
            .generate_stream(turn)
            .await
            .unwrap()
            .map(|event| event.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn quotes_the_best_sentence_with_its_marker() {
        let turn = turn(
            "What was the revenue growth?",
            &[
                "The office moved downtown. Parking is limited.",
                "Revenue grew 23% to $125.7 million. Costs were flat.",
            ],
            false,
        );
        let events = collect(&ExtractiveBackend, &turn).await;
        let answer = events
            .into_iter()
            .map(|event| match event {
                ModelEvent::Text(text) => text,
                ModelEvent::ToolCall(call) => panic!("unexpected tool call {call:?}"),
            })
            .collect::<String>();
        assert!(answer.contains("Revenue grew 23% to $125.7 million. [S2]"));
        assert!(!answer.contains("Parking"));
    }

    #[tokio::test]
    async fn empty_context_answers_without_markers() {
        let events = collect(&ExtractiveBackend, &turn("Anything?", &[], false)).await;
        assert_eq!(events, vec![ModelEvent::Text(NO_DOCUMENTS_ANSWER.to_string())]);
    }

    #[tokio::test]
    async fn arithmetic_questions_request_the_calculator_once() {
        let mut turn = turn("What is 125.7 * 0.23?", &["Revenue was $125.7 million."], true);
        let events = collect(&ExtractiveBackend, &turn).await;
        let [ModelEvent::ToolCall(call)] = events.as_slice() else {
            panic!("expected a single tool call, got {events:?}");
        };
        assert_eq!(call.arguments["expression"], "125.7 * 0.23");

        turn.messages.push(TurnMessage::ToolCall(call.clone()));
        turn.messages.push(TurnMessage::ToolResult {
            name: "calculator".to_string(),
            content: "Result: 28.911".to_string(),
            is_error: false,
        });
        let events = collect(&ExtractiveBackend, &turn).await;
        assert!(matches!(&events[0], ModelEvent::Text(text) if text.contains("Result: 28.911")));
        assert!(events
            .iter()
            .all(|event| matches!(event, ModelEvent::Text(_))));
    }

    #[test]
    fn plain_questions_have_no_arithmetic() {
        assert_eq!(arithmetic_in("What was the revenue growth in 2023?"), None);
        assert_eq!(arithmetic_in("What happened on 2024-01-15?"), None);
        assert_eq!(arithmetic_in("compute (2 + 3) * 4 please"), Some("(2 + 3) * 4".to_string()));
    }
}
