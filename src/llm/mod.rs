//! Embedding/completion endpoint abstraction and HTTP implementation.

pub mod openai;
pub mod provider;
pub mod retry;

pub use openai::OpenAiCompatProvider;
pub use provider::{ChatMessage, ChatRequest, LlmProvider};
pub use retry::with_retry;
