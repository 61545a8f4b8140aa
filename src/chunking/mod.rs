
use anyhow::Result;
use tracing::debug;

use crate::config::ChunkingConfig;

/// A bounded slice of a document's text, the unit of embedding and
/// retrieval. Identity is `(document_id, offset)` where `offset` is the byte
/// position of the chunk body in the source text; chunks are never mutated
/// after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub document_id: String,
    pub offset: usize,
    pub content: String,
    pub token_count: usize,
}

impl Chunk {
    /// Stable identifier used for cache keys and diagnostics.
    pub fn chunk_id(&self) -> String {
        format!("{}@{}", self.document_id, self.offset)
    }
}

/// Rough token estimate; ~4 characters per token holds well enough for
/// sizing chunks against embedding context windows.
pub fn estimate_token_count(text: &str) -> usize {
    let chars = text.chars().count();
    let words = text.split_whitespace().count();
    words.max(chars / 4)
}

/// Split a document into embedding-ready chunks.
///
/// Paragraphs are accumulated up to the target size; an oversized paragraph
/// is split at sentence boundaries, and a trailing fragment below the
/// minimum size is merged into its predecessor. The configured overlap is
/// carried as a prefix from the previous chunk without changing the chunk's
/// own offset.
pub fn chunk_document(
    document_id: &str,
    text: &str,
    config: &ChunkingConfig,
) -> Result<Vec<Chunk>> {
    let mut pieces: Vec<(usize, String)> = Vec::new();
    let mut current = String::new();
    let mut current_offset = None;

    for (offset, paragraph) in split_paragraphs(text) {
        let paragraph_tokens = estimate_token_count(paragraph);

        if paragraph_tokens > config.max_chunk_tokens {
            if !current.is_empty() {
                pieces.push((current_offset.take().unwrap_or(offset), current.clone()));
                current.clear();
            }
            pieces.extend(split_oversized(offset, paragraph, config));
            continue;
        }

        let combined = estimate_token_count(&current) + paragraph_tokens;
        if !current.is_empty() && combined > config.target_chunk_tokens {
            pieces.push((current_offset.take().unwrap_or(offset), current.clone()));
            current.clear();
        }

        if current.is_empty() {
            current_offset = Some(offset);
        } else {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }

    if !current.is_empty() {
        pieces.push((current_offset.unwrap_or(0), current));
    }

    merge_small_pieces(&mut pieces, config);

    let chunks = apply_overlap(document_id, pieces, config);

    debug!(
        "chunked document '{}' into {} chunks",
        document_id,
        chunks.len()
    );

    Ok(chunks)
}

/// Yields `(byte_offset, paragraph)` for each non-empty paragraph.
fn split_paragraphs(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut results = Vec::new();
    let mut start = 0;

    for segment in text.split("\n\n") {
        let trimmed = segment.trim();
        if !trimmed.is_empty() {
            let lead = segment.len() - segment.trim_start().len();
            results.push((start + lead, trimmed));
        }
        start += segment.len() + 2;
    }

    results.into_iter()
}

/// Force-split a paragraph that exceeds the hard chunk size, preferring
/// sentence boundaries.
fn split_oversized(
    base_offset: usize,
    paragraph: &str,
    config: &ChunkingConfig,
) -> Vec<(usize, String)> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_offset = None;
    let mut cursor = 0;

    for sentence in split_sentences(paragraph) {
        let sentence_offset = base_offset + cursor;
        cursor += sentence.len();

        let combined = estimate_token_count(&current) + estimate_token_count(sentence);
        if !current.is_empty() && combined > config.target_chunk_tokens {
            pieces.push((
                current_offset.take().unwrap_or(sentence_offset),
                current.trim().to_string(),
            ));
            current.clear();
        }

        if current.is_empty() {
            current_offset = Some(sentence_offset);
        }
        current.push_str(sentence);
    }

    if !current.trim().is_empty() {
        pieces.push((
            current_offset.unwrap_or(base_offset),
            current.trim().to_string(),
        ));
    }

    pieces
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;

    for (idx, ch) in text.char_indices() {
        if matches!(ch, '.' | '!' | '?') {
            let end = idx + ch.len_utf8();
            let rest = &text[end..];
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                sentences.push(&text[start..end]);
                start = end;
            }
        }
    }

    if start < text.len() {
        sentences.push(&text[start..]);
    }

    sentences
}

fn merge_small_pieces(pieces: &mut Vec<(usize, String)>, config: &ChunkingConfig) {
    let mut index = 1;
    while index < pieces.len() {
        if estimate_token_count(&pieces[index].1) < config.min_chunk_tokens {
            let (_, small) = pieces.remove(index);
            let previous = &mut pieces[index - 1];
            previous.1.push_str("\n\n");
            previous.1.push_str(&small);
        } else {
            index += 1;
        }
    }
}

fn apply_overlap(
    document_id: &str,
    pieces: Vec<(usize, String)>,
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::with_capacity(pieces.len());

    for (offset, body) in pieces {
        let content = match chunks.last() {
            Some(previous) if config.overlap_tokens > 0 => {
                let tail = overlap_tail(&previous.content, config.overlap_tokens);
                if tail.is_empty() {
                    body.clone()
                } else {
                    format!("{}\n{}", tail, body)
                }
            }
            _ => body.clone(),
        };

        let token_count = estimate_token_count(&content);
        chunks.push(Chunk {
            document_id: document_id.to_string(),
            offset,
            content,
            token_count,
        });
    }

    chunks
}

/// Last `overlap_tokens` worth of words from the previous chunk.
fn overlap_tail(text: &str, overlap_tokens: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= overlap_tokens {
        return String::new();
    }
    words[words.len() - overlap_tokens..].join(" ")
}
