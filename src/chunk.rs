//! Paragraph-boundary chunker for knowledge sources.
//!
//! Splits a source version's content into [`Chunk`]s that respect a
//! configurable `max_tokens` limit. Splitting occurs on paragraph
//! boundaries (`\n\n`); a paragraph longer than the limit is cut at the
//! last newline or space before it, never inside a UTF-8 character.
//!
//! Each chunk carries a SHA-256 hash of its text and is stamped with the
//! source version it was cut from.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::models::{new_id, Chunk, KnowledgeSource};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split a source's content into chunks with contiguous indices from 0.
/// Blank content yields no chunks. Embeddings are left empty.
pub fn chunk_source(source: &KnowledgeSource, max_tokens: usize, now: DateTime<Utc>) -> Vec<Chunk> {
    split_paragraphs(&source.content, max_tokens)
        .into_iter()
        .enumerate()
        .map(|(i, text)| Chunk {
            id: new_id(),
            tenant_id: source.tenant_id.clone(),
            knowledge_source_id: source.id.clone(),
            source_version: source.version,
            chunk_index: i as i64,
            hash: content_hash(&text),
            content: text,
            embedding: Vec::new(),
            is_valid: true,
            created_at: now,
        })
        .collect()
}

/// Paragraph packing without any chunk metadata.
pub fn split_paragraphs(text: &str, max_tokens: usize) -> Vec<String> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut pieces = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current.is_empty() {
            trimmed.len()
        } else {
            current.len() + 2 + trimmed.len()
        };
        if would_be > max_chars && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }

        if trimmed.len() > max_chars {
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let cut = split_point(remaining, max_chars);
                let piece = remaining[..cut].trim();
                if !piece.is_empty() {
                    pieces.push(piece.to_string());
                }
                remaining = &remaining[cut..];
            }
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(trimmed);
        }
    }

    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Byte offset to cut `s` at: the last newline or space within
/// `max_chars`, else the last char boundary within it. Always > 0.
fn split_point(s: &str, max_chars: usize) -> usize {
    if s.len() <= max_chars {
        return s.len();
    }
    let mut limit = max_chars;
    while !s.is_char_boundary(limit) {
        limit -= 1;
    }
    if limit == 0 {
        // A single char wider than the budget.
        return s.chars().next().map_or(s.len(), char::len_utf8);
    }
    s[..limit]
        .rfind('\n')
        .or_else(|| s[..limit].rfind(' '))
        .map(|pos| pos + 1)
        .unwrap_or(limit)
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::KnowledgeSourceType;

    fn source(content: &str) -> KnowledgeSource {
        let now = Utc::now();
        KnowledgeSource {
            id: "ks1".into(),
            tenant_id: "t1".into(),
            name: "Wire transfers".into(),
            source_type: KnowledgeSourceType::Procedure,
            content: content.into(),
            category: "payments".into(),
            tags: vec![],
            author: "ops".into(),
            version: 3,
            is_active: true,
            effective_date: None,
            expiry_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_source(&source("Hello, world!"), 700, Utc::now());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].content, "Hello, world!");
        assert_eq!(chunks[0].source_version, 3);
        assert_eq!(chunks[0].tenant_id, "t1");
    }

    #[test]
    fn test_blank_text_has_no_chunks() {
        assert!(chunk_source(&source("  \n\n "), 700, Utc::now()).is_empty());
    }

    #[test]
    fn test_paragraphs_packed_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let pieces = split_paragraphs(text, 700);
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].contains("Third paragraph."));
    }

    #[test]
    fn test_paragraphs_exceed_limit() {
        // max_tokens=5 => max_chars=20
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let chunks = chunk_source(&source(text), 5, Utc::now());
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
    }

    #[test]
    fn test_multibyte_text_never_split_inside_a_char() {
        let text = "é".repeat(50);
        let pieces = split_paragraphs(&text, 1);
        assert!(pieces.len() > 1);
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = chunk_source(&source("Same text"), 700, Utc::now());
        let b = chunk_source(&source("Same text"), 700, Utc::now());
        assert_eq!(a[0].hash, b[0].hash);
        assert_ne!(a[0].id, b[0].id);
    }
}
