//! Token counting.
//!
//! The default counter uses a character-based heuristic: ~4 characters per
//! token, rounded up. Close enough for BPE tokenizers on English text and
//! fully deterministic, which keeps budgets reproducible. Callers with a real
//! tokenizer plug it in through [`TokenCounter`].

/// Counts tokens for segment content.
pub trait TokenCounter: Send + Sync {
    /// Name used in logs and audit details.
    fn name(&self) -> &str;

    /// Token cost of `text`.
    fn count(&self, text: &str) -> usize;
}

/// Character-based heuristic counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharCounter;

impl TokenCounter for CharCounter {
    fn name(&self) -> &str {
        "chars_div_4"
    }

    fn count(&self, text: &str) -> usize {
        estimate_tokens(text)
    }
}

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up. Counts Unicode scalar
/// values, not bytes, so non-ASCII text is not overcharged.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.chars().count().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn four_chars_is_one_token() {
        assert_eq!(estimate_tokens("test"), 1);
    }

    #[test]
    fn five_chars_rounds_up() {
        assert_eq!(estimate_tokens("hello"), 2);
    }

    #[test]
    fn multibyte_counts_characters() {
        // 4 chars, 12 bytes
        assert_eq!(estimate_tokens("日本語だ"), 1);
    }

    #[test]
    fn counter_delegates_to_heuristic() {
        let counter = CharCounter;
        assert_eq!(counter.count(&"a".repeat(100)), 25);
        assert_eq!(counter.name(), "chars_div_4");
    }
}
