//! Splits normalized documents into overlapping, size-bounded passages.
//!
//! Passages break at sentence boundaries where possible, falling back to
//! hard cuts when a single sentence exceeds the token bound. Adjacent
//! passages share trailing sentence units worth up to `overlap_tokens`.
//!
//! Invariant: passages tile the normalized text in order. Concatenating
//! each passage's non-overlapping span reproduces the document text
//! exactly, which is what makes `char_span` trustworthy for citations.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::core::errors::RagError;
use crate::core::tokens::estimate_tokens;
use crate::ingest::loader::{DocMeta, Document};

/// A chunk of one document, sized for embedding and prompt inclusion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passage {
    pub id: String,
    pub document_id: String,
    /// Position within the document; adjacent ordinals are adjacent text.
    pub ordinal: usize,
    pub text: String,
    /// Byte span over the normalized document text, overlap included.
    pub char_span: (usize, usize),
    pub source_uri: String,
    pub meta: DocMeta,
}

fn sentence_end_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?]+(\s+|$)|\n").expect("static regex"))
}

/// Split `document` into passages of at most `max_tokens` estimated tokens,
/// adjacent passages sharing up to `overlap_tokens` of trailing content.
pub fn chunk(
    document: &Document,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Result<Vec<Passage>, RagError> {
    if max_tokens == 0 {
        return Err(RagError::Internal("max_tokens must be positive".into()));
    }
    if overlap_tokens >= max_tokens {
        return Err(RagError::Internal(
            "overlap_tokens must be smaller than max_tokens".into(),
        ));
    }
    let text = document.text.as_str();
    if text.trim().is_empty() {
        return Err(RagError::EmptyDocument(document.source_uri.clone()));
    }

    let units = split_units(text, max_tokens);

    let mut passages = Vec::new();
    let mut idx = 0; // next unused unit
    let mut prev_units: &[(usize, usize)] = &[];

    while idx < units.len() {
        // Overlap tail from the previous passage, trimmed so the first new
        // unit always fits within max_tokens.
        let mut tail = overlap_tail(prev_units, overlap_tokens);
        let first_new_len = units[idx].1 - units[idx].0;
        while !tail.is_empty() {
            let tail_len = units[idx].0 - tail[0].0;
            if estimate_tokens_for_len(tail_len + first_new_len) <= max_tokens {
                break;
            }
            tail = &tail[1..];
        }

        let span_start = tail.first().map(|u| u.0).unwrap_or(units[idx].0);
        let mut span_end = units[idx].1;
        idx += 1;

        while idx < units.len() {
            let candidate_end = units[idx].1;
            if estimate_tokens_for_len(candidate_end - span_start) > max_tokens {
                break;
            }
            span_end = candidate_end;
            idx += 1;
        }

        let chunk_units_start = units.partition_point(|u| u.0 < span_start);
        let chunk_units_end = units.partition_point(|u| u.1 <= span_end);
        prev_units = &units[chunk_units_start..chunk_units_end];

        passages.push(Passage {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: document.id.clone(),
            ordinal: passages.len(),
            text: text[span_start..span_end].to_string(),
            char_span: (span_start, span_end),
            source_uri: document.source_uri.clone(),
            meta: document.meta.clone(),
        });
    }

    Ok(passages)
}

fn estimate_tokens_for_len(byte_len: usize) -> usize {
    (byte_len + 3) / 4
}

/// Tile the text into sentence units; any unit longer than `max_tokens` is
/// hard-cut at character boundaries. Units concatenate back to the text.
fn split_units(text: &str, max_tokens: usize) -> Vec<(usize, usize)> {
    let mut sentence_spans = Vec::new();
    let mut start = 0;
    for m in sentence_end_re().find_iter(text) {
        sentence_spans.push((start, m.end()));
        start = m.end();
    }
    if start < text.len() {
        sentence_spans.push((start, text.len()));
    }

    let max_bytes = max_tokens * 4;
    let mut units = Vec::new();
    for (s, e) in sentence_spans {
        if estimate_tokens(&text[s..e]) <= max_tokens {
            units.push((s, e));
            continue;
        }
        // Hard cut an oversized sentence.
        let mut cut_start = s;
        while cut_start < e {
            let mut cut_end = (cut_start + max_bytes).min(e);
            while !text.is_char_boundary(cut_end) {
                cut_end -= 1;
            }
            units.push((cut_start, cut_end));
            cut_start = cut_end;
        }
    }
    units
}

/// Trailing units of the previous passage worth at most `overlap_tokens`.
fn overlap_tail(prev_units: &[(usize, usize)], overlap_tokens: usize) -> &[(usize, usize)] {
    if overlap_tokens == 0 || prev_units.is_empty() {
        return &[];
    }
    let end = prev_units.last().map(|u| u.1).unwrap_or(0);
    let mut first = prev_units.len();
    while first > 0 {
        let candidate = first - 1;
        let len = end - prev_units[candidate].0;
        if estimate_tokens_for_len(len) > overlap_tokens {
            break;
        }
        first = candidate;
    }
    &prev_units[first..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::loader::Document;

    fn doc(text: &str) -> Document {
        Document::from_text("policy.txt", text, DocMeta::default()).unwrap()
    }

    #[test]
    fn round_trip_over_non_overlapping_spans() {
        let text = "Term life insurance covers a death benefit. Premiums stay fixed for the term. \
                    Whole life builds cash value over time. Riders can extend the coverage. \
                    Claims require a certificate. Conversion is allowed before age sixty."
            .repeat(4);
        let document = doc(&text);
        let passages = chunk(&document, 32, 8).unwrap();
        assert!(passages.len() > 1);

        let mut rebuilt = String::new();
        let mut prev_end = 0;
        for passage in &passages {
            let (start, end) = passage.char_span;
            assert!(start <= prev_end, "passages must not leave gaps");
            rebuilt.push_str(&document.text[prev_end.max(start)..end]);
            prev_end = end;
        }
        assert_eq!(rebuilt, document.text);
    }

    #[test]
    fn passages_respect_token_bound_and_order() {
        let text = "One sentence here. Another sentence there. ".repeat(30);
        let document = doc(&text);
        let passages = chunk(&document, 24, 6).unwrap();

        for (i, passage) in passages.iter().enumerate() {
            assert_eq!(passage.ordinal, i);
            assert!(estimate_tokens(&passage.text) <= 24);
        }
        for pair in passages.windows(2) {
            assert!(pair[0].char_span.0 < pair[1].char_span.0);
        }
    }

    #[test]
    fn adjacent_passages_share_overlap() {
        let text = "Alpha beta gamma delta. Epsilon zeta eta theta. Iota kappa lambda mu. \
                    Nu xi omicron pi. Rho sigma tau upsilon.";
        let document = doc(text);
        let passages = chunk(&document, 16, 8).unwrap();
        assert!(passages.len() > 1);

        for pair in passages.windows(2) {
            // Next passage starts at or before the previous one ends.
            assert!(pair[1].char_span.0 <= pair[0].char_span.1);
        }
    }

    #[test]
    fn oversized_sentence_is_hard_cut() {
        let text = "x".repeat(400);
        let document = doc(&text);
        let passages = chunk(&document, 10, 0).unwrap();
        assert!(passages.len() >= 10);
        for passage in &passages {
            assert!(estimate_tokens(&passage.text) <= 10);
        }
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let document = doc("Some text.");
        assert!(chunk(&document, 0, 0).is_err());
        assert!(chunk(&document, 8, 8).is_err());
    }

    #[test]
    fn passages_inherit_document_metadata() {
        let meta = DocMeta {
            title: "term-life".into(),
            product_category: "life".into(),
            effective_date: Some("2026-01-01".into()),
        };
        let document = Document::from_text("term.txt", "Coverage lasts 20 years.", meta).unwrap();
        let passages = chunk(&document, 64, 8).unwrap();
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].meta.product_category, "life");
        assert_eq!(passages[0].document_id, document.id);
    }
}
