//! Build-time ingestion: document loading and chunking.

pub mod chunker;
pub mod loader;

pub use chunker::{chunk, Passage};
pub use loader::{DocMeta, Document, DocumentLoader};
