//! Context assembly and prompt composition.

pub mod assembler;
pub mod prompt;

pub use assembler::{Citation, ContextAssembler, ContextBlock, ScoredPassage};
