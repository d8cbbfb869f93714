//! Local lexical scoring for backends without native hybrid search.

use std::collections::BTreeSet;

use crate::embed::terms;

/// Fraction of distinct query terms that occur in a candidate text.
#[derive(Debug, Clone)]
pub struct LexicalScorer {
    terms: BTreeSet<String>,
}

impl LexicalScorer {
    pub fn new(query: &str) -> Self {
        Self {
            terms: terms(query).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Score in `[0, 1]`; an empty query scores every text 0.
    pub fn score(&self, text: &str) -> f32 {
        if self.terms.is_empty() {
            return 0.0;
        }
        let present: BTreeSet<String> = terms(text).collect();
        let hits = self.terms.intersection(&present).count();
        hits as f32 / self.terms.len() as f32
    }
}

/// `(1 - weight) * vector + weight * lexical`
pub fn blend(vector: f32, lexical: f32, weight: f32) -> f32 {
    (1.0 - weight) * vector + weight * lexical
}
