//! Splitting normalized text into overlapping, token-bounded windows.
//!
//! Algorithm:
//! 1. Tokenize once into token start offsets (whitespace or codepoint)
//! 2. Take up to `window_size` tokens from the current start
//! 3. If the window end would cut a table or code block that fits in a
//!    window, pull the end back to the start of that unit
//! 4. Start the next window `overlap` tokens before the previous end,
//!    moving forward out of any unit the start would land inside
//!
//! Spans are produced lazily by [`ChunkCursor`]. A cursor can be rebuilt
//! from the last span a caller persisted and continues with identical spans.

mod tokenizer;

pub use tokenizer::{CodepointTokenizer, Tokenizer, WhitespaceTokenizer, tokenizer_for};

use serde::{Deserialize, Serialize};

use crate::config::ChunkingConfig;
use crate::error::RagResult;
use crate::loader::StructuralMap;
use crate::types::TextSpan;

/// One chunk window over the normalized text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpan {
    pub seq: u32,
    pub start: usize,
    pub end: usize,
    /// Offset where text not already covered by the previous span begins.
    /// Equals `start` for the first span.
    pub overlap_start: usize,
}

impl ChunkSpan {
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }

    /// The part of this span that the previous span did not cover.
    pub fn fresh_text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.overlap_start..self.end]
    }

    pub fn as_text_span(&self) -> TextSpan {
        TextSpan::new(self.start, self.end)
    }
}

pub struct Chunker {
    config: ChunkingConfig,
    tokenizer: Box<dyn Tokenizer>,
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Chunker {
    /// Fails with `InvalidChunking` unless `0 <= overlap < window_size`.
    pub fn new(config: ChunkingConfig) -> RagResult<Self> {
        config.validate()?;
        let tokenizer = tokenizer_for(config.tokenizer);
        Ok(Self { config, tokenizer })
    }

    pub fn with_tokenizer(config: ChunkingConfig, tokenizer: Box<dyn Tokenizer>) -> RagResult<Self> {
        config.validate()?;
        Ok(Self { config, tokenizer })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.tokenizer.count(text)
    }

    /// Lazily iterate chunk spans of `text`.
    pub fn spans<'a>(&self, text: &'a str, structure: &StructuralMap) -> ChunkCursor<'a> {
        let starts = self.tokenizer.token_starts(text);
        let units = structure
            .atomic_units()
            .into_iter()
            .filter(|unit| unit.end <= text.len())
            .collect();
        ChunkCursor {
            text,
            starts,
            units,
            window: self.config.window_size,
            overlap: self.config.overlap,
            next_token: 0,
            previous_end: None,
            seq: 0,
            done: text.is_empty(),
        }
    }

    /// Collect every span. Convenience for small documents and tests.
    pub fn split(&self, text: &str, structure: &StructuralMap) -> Vec<ChunkSpan> {
        self.spans(text, structure).collect()
    }
}

/// Restartable iterator over chunk spans.
#[derive(Debug, Clone)]
pub struct ChunkCursor<'a> {
    text: &'a str,
    starts: Vec<usize>,
    units: Vec<TextSpan>,
    window: usize,
    overlap: usize,
    next_token: usize,
    /// Token index where the previous span ended
    previous_end: Option<usize>,
    seq: u32,
    done: bool,
}

impl ChunkCursor<'_> {
    /// Skip ahead so the next span is the one following `last`.
    ///
    /// `last` must have been produced for the same text and configuration.
    pub fn resume_after(mut self, last: &ChunkSpan) -> Self {
        let start = self.token_at(last.start);
        let end = self.token_boundary(last.end);
        self.seq = last.seq + 1;
        self.previous_end = Some(end);
        if end >= self.starts.len() {
            self.done = true;
        } else {
            self.next_token = self.next_start(start, end);
        }
        self
    }

    /// Number of tokens in the whole text.
    pub fn token_count(&self) -> usize {
        self.starts.len()
    }

    fn byte_of(&self, token: usize) -> usize {
        self.starts.get(token).copied().unwrap_or(self.text.len())
    }

    /// Token containing byte `offset`.
    fn token_at(&self, offset: usize) -> usize {
        self.starts
            .partition_point(|&s| s <= offset)
            .saturating_sub(1)
    }

    /// First token starting at or after `offset`.
    fn token_boundary(&self, offset: usize) -> usize {
        self.starts.partition_point(|&s| s < offset)
    }

    fn unit_tokens(&self, unit: &TextSpan) -> usize {
        self.token_at(unit.end.saturating_sub(1)) + 1 - self.token_at(unit.start)
    }

    /// Pull `end` back so it does not cut any unit that fits in one window.
    fn pull_back(&self, start: usize, mut end: usize) -> usize {
        loop {
            let end_byte = self.byte_of(end);
            let cut = self.units.iter().find(|unit| {
                unit.start < end_byte
                    && end_byte < unit.end
                    && self.unit_tokens(unit) <= self.window
                    && self.token_at(unit.start) > start
            });
            match cut {
                Some(unit) => end = self.token_at(unit.start),
                None => return end,
            }
        }
    }

    /// Start token of the window after `[start, end)`.
    fn next_start(&self, start: usize, end: usize) -> usize {
        let mut next = end.saturating_sub(self.overlap).max(start + 1).min(end);
        let next_byte = self.byte_of(next);
        if let Some(unit) = self
            .units
            .iter()
            .find(|unit| unit.start < next_byte && next_byte < unit.end)
        {
            next = self.token_boundary(unit.end).min(end);
        }
        next
    }
}

impl Iterator for ChunkCursor<'_> {
    type Item = ChunkSpan;

    fn next(&mut self) -> Option<ChunkSpan> {
        if self.done || self.starts.is_empty() {
            return None;
        }
        let total = self.starts.len();

        let mut start = self.next_token;
        let mut end = (start + self.window).min(total);
        if end < total {
            end = self.pull_back(start, end);
            if let Some(previous_end) = self.previous_end {
                if end <= previous_end {
                    // The overlap pushed a unit past the window; drop the overlap
                    start = previous_end;
                    end = self.pull_back(start, (start + self.window).min(total));
                }
            }
        }

        let start_byte = self.byte_of(start);
        let span = ChunkSpan {
            seq: self.seq,
            start: start_byte,
            end: self.byte_of(end),
            overlap_start: self
                .previous_end
                .map_or(start_byte, |previous| self.byte_of(previous)),
        };

        self.seq += 1;
        self.previous_end = Some(end);
        if end >= total {
            self.done = true;
        } else {
            self.next_token = self.next_start(start, end);
        }
        Some(span)
    }
}
