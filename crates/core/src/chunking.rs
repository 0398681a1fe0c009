use crate::error::IngestError;
use crate::extractor::ExtractedSection;
use crate::models::{Chunk, Document};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_segmentation::UnicodeSegmentation;

pub const DEFAULT_MAX_CHARS: usize = 800;
pub const DEFAULT_OVERLAP_CHARS: usize = 150;

/// Chunk size limits, counted in characters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: DEFAULT_MAX_CHARS,
            overlap_chars: DEFAULT_OVERLAP_CHARS,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.max_chars == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max_chars must be greater than zero".to_string(),
            ));
        }
        if self.overlap_chars >= self.max_chars {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap_chars ({}) must be smaller than max_chars ({})",
                self.overlap_chars, self.max_chars
            )));
        }
        Ok(())
    }
}

/// Byte range of one chunk inside the text it was cut from. `overlap` is the
/// number of leading bytes shared with the previous chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
    pub overlap: usize,
}

#[derive(Debug, Clone, Copy)]
struct Unit {
    start: usize,
    end: usize,
    chars: usize,
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{a0}', " ")
}

/// Collapses whitespace inside paragraphs; paragraphs (blank-line separated) end up one per line.
pub fn normalize_paragraphs(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\0', "");
    text.split("\n\n")
        .map(normalize_whitespace)
        .filter(|paragraph| !paragraph.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Keeps line structure (rows, bullet points) and collapses whitespace within each line.
pub fn normalize_lines(text: &str) -> String {
    text.replace('\0', "")
        .lines()
        .map(normalize_whitespace)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn sentence_units(text: &str) -> Vec<Unit> {
    text.split_sentence_bound_indices()
        .map(|(start, sentence)| Unit {
            start,
            end: start + sentence.len(),
            chars: sentence.chars().count(),
        })
        .collect()
}

/// Fixed windows over a span with no usable sentence boundary.
fn fixed_windows(text: &str, unit: Unit, config: ChunkingConfig) -> Vec<Unit> {
    let mut offsets = text[unit.start..unit.end]
        .char_indices()
        .map(|(offset, _)| unit.start + offset)
        .collect::<Vec<_>>();
    offsets.push(unit.end);
    let total = offsets.len() - 1;
    let step = config.max_chars - config.overlap_chars;

    let mut windows = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + config.max_chars).min(total);
        windows.push(Unit {
            start: offsets[start],
            end: offsets[end],
            chars: end - start,
        });
        if end == total {
            break;
        }
        start += step;
    }
    windows
}

/// Longest run of whole trailing units whose size stays within `limit` characters.
fn overlap_tail(units: &[Unit], limit: usize) -> Vec<Unit> {
    let mut taken = 0;
    let mut chars = 0;
    for unit in units.iter().rev() {
        if chars + unit.chars > limit {
            break;
        }
        chars += unit.chars;
        taken += 1;
    }
    units[units.len() - taken..].to_vec()
}

/// Suffix of `unit` of at most `limit` characters, moved forward to the next
/// word start when the cut lands inside a word.
fn partial_tail(text: &str, unit: Unit, limit: usize) -> Option<Unit> {
    if limit == 0 || unit.chars <= limit {
        return None;
    }
    let body = &text[unit.start..unit.end];
    let (cut, _) = body.char_indices().nth(unit.chars - limit)?;
    let start = if body[..cut].ends_with(char::is_whitespace) {
        cut
    } else {
        body[cut..]
            .char_indices()
            .skip_while(|(_, c)| !c.is_whitespace())
            .find(|(_, c)| !c.is_whitespace())
            .map_or(cut, |(offset, _)| cut + offset)
    };
    Some(Unit {
        start: unit.start + start,
        end: unit.end,
        chars: body[start..].chars().count(),
    })
}

fn push_span(spans: &mut Vec<TextSpan>, units: &[Unit]) {
    let (Some(first), Some(last)) = (units.first(), units.last()) else {
        return;
    };
    let overlap = spans
        .last()
        .map(|previous| previous.end.saturating_sub(first.start))
        .unwrap_or(0);
    spans.push(TextSpan {
        start: first.start,
        end: last.end,
        overlap,
    });
}

/// Greedily packs whole sentences into chunks of at most `max_chars`
/// characters. Each new chunk starts with the trailing sentences of the
/// previous one that fit in `overlap_chars`; when the last sentence alone is
/// longer than that, its final words within `overlap_chars` are carried
/// instead. Sentences longer than a chunk are cut into fixed windows
/// overlapping by exactly `overlap_chars`.
///
/// Reading `text[span.start + span.overlap..span.end]` for every span in order
/// reproduces `text` exactly.
pub fn chunk_text(text: &str, config: ChunkingConfig) -> Result<Vec<TextSpan>, IngestError> {
    config.validate()?;

    let mut spans = Vec::new();
    let mut current: Vec<Unit> = Vec::new();
    let mut current_chars = 0usize;

    for unit in sentence_units(text) {
        if unit.chars > config.max_chars {
            push_span(&mut spans, &current);
            let mut windows = fixed_windows(text, unit, config);
            let last = windows.pop();
            for window in windows {
                push_span(&mut spans, &[window]);
            }
            current = last.into_iter().collect();
            current_chars = current.iter().map(|unit| unit.chars).sum();
            continue;
        }

        if current_chars + unit.chars <= config.max_chars {
            current_chars += unit.chars;
            current.push(unit);
            continue;
        }

        push_span(&mut spans, &current);
        let mut tail = overlap_tail(&current, config.overlap_chars);
        if tail.is_empty() {
            let room = config.overlap_chars.min(config.max_chars - unit.chars);
            tail = current
                .last()
                .and_then(|last| partial_tail(text, *last, room))
                .into_iter()
                .collect();
        }
        let mut tail_chars: usize = tail.iter().map(|unit| unit.chars).sum();
        while !tail.is_empty() && tail_chars + unit.chars > config.max_chars {
            tail_chars -= tail.remove(0).chars;
        }
        current = tail;
        current.push(unit);
        current_chars = tail_chars + unit.chars;
    }

    push_span(&mut spans, &current);
    Ok(spans)
}

pub fn build_chunks(
    document: &Document,
    section: &ExtractedSection,
    config: ChunkingConfig,
    global_index: u64,
) -> Result<(Vec<Chunk>, u64), IngestError> {
    let mut chunks = Vec::new();
    let mut cursor = global_index;

    for span in chunk_text(&section.text, config)? {
        let text = &section.text[span.start..span.end];
        if text.trim().is_empty() {
            continue;
        }

        chunks.push(Chunk {
            chunk_id: make_chunk_id(&document.document_id, cursor, text),
            document_id: document.document_id.clone(),
            chunk_index: cursor,
            text: text.to_string(),
            char_len: text.chars().count(),
            locator: section.locator.clone(),
            span: (span.start, span.end),
        });

        cursor = cursor.saturating_add(1);
    }

    Ok((chunks, cursor))
}

fn make_chunk_id(document_id: &str, index: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
