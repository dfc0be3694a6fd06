//! Retrieval-augmented answering over bank assurance product documents.
//!
//! The crate indexes product documentation (chunked and embedded into an
//! in-process vector index with SQLite persistence) and answers customer
//! questions grounded in the retrieved passages, with per-session
//! conversation history and citations back to the source documents.
//!
//! [`engine::ChatEngine`] is the front door; the modules underneath are the
//! pipeline stages it composes.

pub mod context;
pub mod core;
pub mod embed;
pub mod engine;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod retrieve;
pub mod session;

pub use crate::core::config::{AppPaths, RagConfig};
pub use crate::core::errors::RagError;
pub use engine::{Answer, ChatEngine};
