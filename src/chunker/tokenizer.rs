//! Token-count approximations used to size chunk windows.
//!
//! Counts are independent of any embedding model's tokenizer so chunk
//! boundaries stay stable when the model changes.

use crate::config::TokenizerKind;

pub trait Tokenizer: Send + Sync {
    /// Byte offsets where tokens start. The first token always starts at 0,
    /// so tokens tile the whole text.
    fn token_starts(&self, text: &str) -> Vec<usize>;

    fn count(&self, text: &str) -> usize {
        self.token_starts(text).len()
    }
}

/// A token is a run of non-whitespace plus the whitespace that follows it.
/// Leading whitespace belongs to the first token.
#[derive(Debug, Default, Clone, Copy)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn token_starts(&self, text: &str) -> Vec<usize> {
        let mut starts = Vec::with_capacity(text.len() / 5 + 1);
        if text.is_empty() {
            return starts;
        }
        starts.push(0);

        let mut seen_word = false;
        let mut previous_was_space = false;
        for (offset, c) in text.char_indices() {
            let is_space = c.is_whitespace();
            if !is_space {
                if seen_word && previous_was_space {
                    starts.push(offset);
                }
                seen_word = true;
            }
            previous_was_space = is_space;
        }
        starts
    }
}

/// One token per Unicode scalar value.
#[derive(Debug, Default, Clone, Copy)]
pub struct CodepointTokenizer;

impl Tokenizer for CodepointTokenizer {
    fn token_starts(&self, text: &str) -> Vec<usize> {
        text.char_indices().map(|(offset, _)| offset).collect()
    }

    fn count(&self, text: &str) -> usize {
        text.chars().count()
    }
}

pub fn tokenizer_for(kind: TokenizerKind) -> Box<dyn Tokenizer> {
    match kind {
        TokenizerKind::Whitespace => Box::new(WhitespaceTokenizer),
        TokenizerKind::Codepoint => Box::new(CodepointTokenizer),
    }
}
