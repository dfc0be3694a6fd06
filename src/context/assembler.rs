//! Orders retrieved passages into a prompt-ready context block.
//!
//! Passages from the same document with adjacent ordinals are merged into
//! one section first (their shared overlap appears once), then sections are
//! included greedily in descending score order until the next one would
//! exceed the token budget. A passage is never split mid-text.

use crate::core::tokens::estimate_tokens;
use crate::index::PassageSnapshot;

/// A passage with the score the retriever gave it.
#[derive(Debug, Clone)]
pub struct ScoredPassage {
    pub snapshot: PassageSnapshot,
    pub score: f32,
}

/// Citation identifier for one included section.
#[derive(Debug, Clone, PartialEq)]
pub struct Citation {
    pub source_uri: String,
    /// First ordinal of the merged run.
    pub ordinal: usize,
    pub score: f32,
}

impl Citation {
    pub fn label(&self) -> String {
        format!("{}#{}", self.source_uri, self.ordinal)
    }
}

#[derive(Debug, Clone)]
pub struct ContextSection {
    pub text: String,
    pub citation: Citation,
    pub tokens: usize,
}

/// The assembled context, ready for prompt injection.
#[derive(Debug, Clone, Default)]
pub struct ContextBlock {
    pub sections: Vec<ContextSection>,
    pub tokens: usize,
}

impl ContextBlock {
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn citations(&self) -> Vec<Citation> {
        self.sections.iter().map(|s| s.citation.clone()).collect()
    }

    /// Render sections with numbered citation tags.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, section) in self.sections.iter().enumerate() {
            out.push_str(&format!(
                "[{}] (source: {})\n{}\n\n",
                i + 1,
                section.citation.label(),
                section.text
            ));
        }
        out.trim_end().to_string()
    }
}

/// A run of adjacent passages from one document being merged.
struct Run {
    document_id: String,
    source_uri: String,
    first_ordinal: usize,
    last_ordinal: usize,
    last_span_end: usize,
    text: String,
    score: f32,
}

impl Run {
    fn start(passage: ScoredPassage) -> Self {
        Self {
            document_id: passage.snapshot.document_id,
            source_uri: passage.snapshot.source_uri,
            first_ordinal: passage.snapshot.ordinal,
            last_ordinal: passage.snapshot.ordinal,
            last_span_end: passage.snapshot.char_span.1,
            text: passage.snapshot.text,
            score: passage.score,
        }
    }

    fn can_absorb(&self, passage: &ScoredPassage) -> bool {
        self.document_id == passage.snapshot.document_id
            && passage.snapshot.ordinal == self.last_ordinal + 1
    }

    /// Append the next passage, emitting its overlap with this run once.
    fn absorb(&mut self, passage: ScoredPassage) {
        let overlap = self
            .last_span_end
            .saturating_sub(passage.snapshot.char_span.0)
            .min(passage.snapshot.text.len());
        self.text.push_str(&passage.snapshot.text[overlap..]);
        self.last_ordinal = passage.snapshot.ordinal;
        self.last_span_end = passage.snapshot.char_span.1;
        if passage.score > self.score {
            self.score = passage.score;
        }
    }

    fn into_section(self) -> ContextSection {
        let tokens = estimate_tokens(&self.text);
        ContextSection {
            citation: Citation {
                source_uri: self.source_uri,
                ordinal: self.first_ordinal,
                score: self.score,
            },
            text: self.text,
            tokens,
        }
    }
}

pub struct ContextAssembler;

impl ContextAssembler {
    /// Assemble retrieved passages into a context block of at most
    /// `token_budget` estimated tokens.
    pub fn assemble(mut scored: Vec<ScoredPassage>, token_budget: usize) -> ContextBlock {
        if scored.is_empty() || token_budget == 0 {
            return ContextBlock::default();
        }

        // Merge adjacent ordinals per document before budgeting.
        scored.sort_by(|a, b| {
            a.snapshot
                .document_id
                .cmp(&b.snapshot.document_id)
                .then(a.snapshot.ordinal.cmp(&b.snapshot.ordinal))
        });

        let mut runs: Vec<Run> = Vec::new();
        for passage in scored {
            match runs.last_mut() {
                Some(run) if run.can_absorb(&passage) => run.absorb(passage),
                _ => runs.push(Run::start(passage)),
            }
        }

        let mut sections: Vec<ContextSection> =
            runs.into_iter().map(Run::into_section).collect();
        sections.sort_by(|a, b| {
            b.citation
                .score
                .partial_cmp(&a.citation.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut block = ContextBlock::default();
        for section in sections {
            if block.tokens + section.tokens > token_budget {
                break;
            }
            block.tokens += section.tokens;
            block.sections.push(section);
        }
        block
    }
}
