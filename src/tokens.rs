//! Token length estimation.

/// Counts model tokens in a text.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Byte-length heuristic: one token is roughly four bytes of English text.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.len().div_ceil(4)
    }
}

/// Sums token counts over many texts.
pub fn total_tokens<'a>(counter: &dyn TokenCounter, texts: impl IntoIterator<Item = &'a str>) -> usize {
    texts.into_iter().map(|t| counter.count(t)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heuristic_counter() {
        let counter = HeuristicTokenCounter;
        assert_eq!(counter.count(""), 0);
        assert_eq!(counter.count("abc"), 1);
        assert_eq!(counter.count("abcd"), 1);
        assert_eq!(counter.count("abcde"), 2);
        assert_eq!(counter.count(&"x".repeat(2000)), 500);
    }

    #[test]
    fn test_total_tokens() {
        let counter = HeuristicTokenCounter;
        assert_eq!(total_tokens(&counter, ["abcd", "abcdefgh"]), 3);
    }
}
