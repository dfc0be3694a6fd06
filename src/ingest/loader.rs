//! Document loading and normalization.
//!
//! Reads raw source files into normalized text with source metadata.
//! Format detection is by extension; HTML is stripped of tags and of
//! script/style bodies, PDF goes through text extraction. Downstream
//! components only ever see clean text.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::errors::RagError;

/// Source-level metadata, inherited by every passage of the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocMeta {
    pub title: String,
    pub product_category: String,
    pub effective_date: Option<String>,
}

/// A loaded source document. Immutable once loaded; re-ingestion replaces
/// it wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Content-derived identifier (hex SHA-256 of source_uri + text).
    pub id: String,
    pub source_uri: String,
    /// Normalized text (whitespace collapsed, markup stripped).
    pub text: String,
    pub meta: DocMeta,
}

impl Document {
    /// Build a document from already-loaded text, normalizing it.
    pub fn from_text(source_uri: &str, raw_text: &str, meta: DocMeta) -> Result<Self, RagError> {
        let text = normalize_whitespace(raw_text);
        if text.is_empty() {
            return Err(RagError::EmptyDocument(source_uri.to_string()));
        }
        Ok(Self {
            id: content_id(source_uri, &text),
            source_uri: source_uri.to_string(),
            text,
            meta,
        })
    }
}

pub struct DocumentLoader;

impl DocumentLoader {
    /// Load a single file into a document.
    pub fn load_file(path: &Path) -> Result<Document, RagError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        let raw = match ext.as_str() {
            "txt" | "md" => read_lossy(path)?,
            "html" | "htm" => strip_html_tags(&read_lossy(path)?),
            "pdf" => extract_pdf_text(path)?,
            other => {
                return Err(RagError::UnsupportedFormat(format!(
                    "{} ({})",
                    path.display(),
                    if other.is_empty() { "no extension" } else { other }
                )))
            }
        };

        let meta = DocMeta {
            title: path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string(),
            product_category: path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string(),
            effective_date: None,
        };

        Document::from_text(&path.display().to_string(), &raw, meta)
    }

    /// Load every recognized file directly under a directory.
    ///
    /// Unsupported extensions are skipped with a log entry; an unreadable
    /// directory is a `SourceUnavailable` error.
    pub fn load_dir(dir: &Path) -> Result<Vec<Document>, RagError> {
        let entries = fs::read_dir(dir)
            .map_err(|e| RagError::SourceUnavailable(format!("{}: {}", dir.display(), e)))?;

        let mut documents = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| RagError::SourceUnavailable(format!("{}: {}", dir.display(), e)))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match Self::load_file(&path) {
                Ok(doc) => documents.push(doc),
                Err(RagError::UnsupportedFormat(msg)) => {
                    tracing::debug!("skipping unsupported file: {}", msg);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(documents)
    }
}

fn read_lossy(path: &Path) -> Result<String, RagError> {
    let bytes = fs::read(path)
        .map_err(|e| RagError::SourceUnavailable(format!("{}: {}", path.display(), e)))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// A PDF that cannot be read or parsed is an unavailable source, not an
/// unsupported format: the extension is recognized, the content is broken.
fn extract_pdf_text(path: &Path) -> Result<String, RagError> {
    pdf_extract::extract_text(path)
        .map_err(|e| RagError::SourceUnavailable(format!("{}: {}", path.display(), e)))
}

fn content_id(source_uri: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_uri.as_bytes());
    hasher.update(b"\0");
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Collapse whitespace: runs of blanks within a line become one space,
/// blank lines are dropped, lines join with a single newline.
pub fn normalize_whitespace(text: &str) -> String {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Case-insensitive match of an ASCII tag at position `i`. Non-ASCII
/// characters never equal a tag character, so multi-char case folds
/// (e.g. 'İ') cannot shift the comparison window.
fn tag_at(chars: &[char], i: usize, tag: &str) -> bool {
    chars.len() - i >= tag.len()
        && chars[i..i + tag.len()]
            .iter()
            .zip(tag.chars())
            .all(|(c, t)| c.to_ascii_lowercase() == t)
}

/// Simple HTML tag stripper. Drops tags plus script and style bodies.
pub fn strip_html_tags(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    let mut in_script = false;
    let mut in_style = false;

    let chars: Vec<char> = html.chars().collect();

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];

        if tag_at(&chars, i, "<script") {
            in_script = true;
        } else if tag_at(&chars, i, "<style") {
            in_style = true;
        }

        if in_script && tag_at(&chars, i, "</script>") {
            in_script = false;
            i += 9;
            continue;
        }
        if in_style && tag_at(&chars, i, "</style>") {
            in_style = false;
            i += 8;
            continue;
        }

        if in_script || in_style {
            i += 1;
            continue;
        }

        if c == '<' {
            in_tag = true;
        } else if c == '>' {
            in_tag = false;
        } else if !in_tag {
            result.push(c);
        }

        i += 1;
    }

    result
}
