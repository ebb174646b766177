//! Deterministic token counting.
//!
//! No BPE vocabulary is vendored here (the corpus pulls in no tokenizer
//! crate compatible with `cl100k_base`-style encoders). Instead this
//! approximates one: text is split into word/punctuation/whitespace runs,
//! each run is further chunked at a 4-characters-per-token rate, which is
//! close to `cl100k_base`'s average for English prose. The result is
//! deterministic across runs for the same build and is what every budget
//! check in Core Memory is measured against.

const CHARS_PER_TOKEN: usize = 4;

pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApproxBpeCounter;

impl ApproxBpeCounter {
    pub fn new() -> Self {
        Self
    }

    fn run_len_to_tokens(len: usize) -> usize {
        if len == 0 {
            0
        } else {
            len.div_ceil(CHARS_PER_TOKEN).max(1)
        }
    }
}

impl TokenCounter for ApproxBpeCounter {
    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        let mut total = 0usize;
        let mut run_len = 0usize;
        let mut run_kind: Option<CharKind> = None;

        for ch in text.chars() {
            let kind = CharKind::of(ch);
            match (run_kind, kind) {
                (Some(prev), cur) if prev == cur && cur == CharKind::Word => {
                    run_len += 1;
                }
                (Some(CharKind::Whitespace), CharKind::Whitespace) => {
                    run_len += 1;
                }
                _ => {
                    if run_len > 0 {
                        total += Self::run_len_to_tokens(run_len);
                    }
                    run_kind = Some(kind);
                    run_len = 1;
                }
            }
        }
        if run_len > 0 {
            total += Self::run_len_to_tokens(run_len);
        }
        total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharKind {
    Word,
    Whitespace,
    Punct,
}

impl CharKind {
    fn of(ch: char) -> Self {
        if ch.is_whitespace() {
            CharKind::Whitespace
        } else if ch.is_alphanumeric() || ch == '_' {
            CharKind::Word
        } else {
            CharKind::Punct
        }
    }
}

/// Convenience free function used throughout the memory crate; equivalent
/// to `ApproxBpeCounter::new().count(text)`.
pub fn count(text: &str) -> usize {
    ApproxBpeCounter::new().count(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_counts_zero() {
        assert_eq!(count(""), 0);
    }

    #[test]
    fn nonempty_input_counts_positive() {
        assert!(count("hello") > 0);
    }

    #[test]
    fn is_deterministic() {
        let text = "The quick brown fox jumps over the lazy dog!";
        assert_eq!(count(text), count(text));
    }

    #[test]
    fn longer_text_counts_more_tokens() {
        let short = "hello";
        let long = "hello there, this is a much longer sentence with many more words in it";
        assert!(count(long) > count(short));
    }

    #[test]
    fn punctuation_contributes_its_own_tokens() {
        let bare = count("hello world");
        let punctuated = count("hello, world!");
        assert!(punctuated >= bare);
    }
}
