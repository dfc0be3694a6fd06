//! Prompt composition: context block + conversation history + question.

use crate::context::assembler::ContextBlock;
use crate::core::tokens::estimate_tokens;
use crate::llm::ChatMessage;
use crate::session::Turn;

const SYSTEM_PROMPT: &str = "You are an assistant for bank assurance products. \
Answer using ONLY the numbered context passages below. Cite the passage \
numbers you used, like [1]. If the context does not contain the answer, \
say that you cannot answer from the available product documents. Never \
invent product terms, coverage periods, or premiums.";

const NO_CONTEXT_NOTICE: &str = "No relevant product documents were found for \
this question. Tell the user you cannot answer it from the available \
documentation, and do not guess.";

/// Build the full message list for a generation call.
///
/// When the retriever found nothing above threshold, the model is told so
/// explicitly rather than being left to fill the gap itself.
pub fn compose_messages(
    context: &ContextBlock,
    history: &[Turn],
    query_text: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);

    let system = if context.is_empty() {
        format!("{}\n\n{}", SYSTEM_PROMPT, NO_CONTEXT_NOTICE)
    } else {
        format!("{}\n\nContext:\n{}", SYSTEM_PROMPT, context.render())
    };
    messages.push(ChatMessage::new("system", system));

    for turn in history {
        messages.push(ChatMessage::new(turn.role.as_str(), turn.text.clone()));
    }

    messages.push(ChatMessage::new("user", query_text));
    messages
}

/// Estimated token count of a composed message list, the figure checked
/// against the model input limit before any generation call.
pub fn total_tokens(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .map(|m| estimate_tokens(&m.content) + estimate_tokens(&m.role))
        .sum()
}
