//! Token estimation shared by the chunker, assembler and engine budgeting.

/// Estimate token count from text.
///
/// Rough approximation at ~4 characters per token; good enough for
/// budgeting as long as every budget in the pipeline uses the same
/// estimator.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimation_is_monotonic() {
        assert_eq!(estimate_tokens(""), 0);
        assert!(estimate_tokens("Hello world") > 0);
        assert!(estimate_tokens("This is a longer sentence.") > estimate_tokens("Hi"));
    }
}
