//! Merging per-collection result lists into one ranking.
//!
//! Scores from different collections are not comparable in magnitude, so
//! each list is re-scaled to `[0, 1]` by its own min and max after the
//! relevance cutoff. The final order is total:
//! 1. normalized score, descending
//! 2. document recency (`ingested_at`), newest first
//! 3. chunk sequence, ascending
//! 4. document id, then collection name
//!
//! The result is therefore independent of the order collections were queried in.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;

use super::RetrievedMatch;
use crate::store::ScoredChunk;
use crate::types::{CollectionId, Metadata, meta_keys};

/// Raw backend hits of one collection.
#[derive(Debug, Clone)]
pub struct CollectionHits {
    pub collection: CollectionId,
    pub hits: Vec<ScoredChunk>,
}

impl CollectionHits {
    pub fn new(collection: CollectionId, hits: Vec<ScoredChunk>) -> Self {
        Self { collection, hits }
    }
}

pub fn recency(metadata: &Metadata) -> Option<DateTime<Utc>> {
    let value = metadata.get(meta_keys::INGESTED_AT)?.as_str()?;
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Drop hits below `cutoff`, normalize each list, and sort the union.
pub fn merge_ranked(lists: &[CollectionHits], cutoff: f32) -> Vec<RetrievedMatch> {
    let mut merged: Vec<(RetrievedMatch, Option<DateTime<Utc>>)> = Vec::new();

    for list in lists {
        let kept: Vec<&ScoredChunk> = list
            .hits
            .iter()
            .filter(|hit| hit.score >= cutoff)
            .collect();
        let Some(min) = kept.iter().map(|h| h.score).reduce(f32::min) else {
            continue;
        };
        let max = kept.iter().map(|h| h.score).fold(min, f32::max);
        let range = max - min;

        for hit in kept {
            let normalized = if range <= f32::EPSILON {
                1.0
            } else {
                (hit.score - min) / range
            };
            let entry = RetrievedMatch::from_hit(&list.collection, hit, normalized);
            let when = recency(&hit.metadata);
            merged.push((entry, when));
        }
    }

    merged.sort_by(|(a, a_when), (b, b_when)| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b_when.cmp(a_when))
            .then_with(|| compare_position(a, b))
    });
    merged.into_iter().map(|(entry, _)| entry).collect()
}

fn compare_position(a: &RetrievedMatch, b: &RetrievedMatch) -> Ordering {
    a.identity
        .seq
        .cmp(&b.identity.seq)
        .then_with(|| a.identity.document_id.cmp(&b.identity.document_id))
        .then_with(|| a.collection.cmp(&b.collection))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkIdentity, DocumentId, TextSpan};

    fn hit(doc: &str, seq: u32, score: f32, ingested_at: &str) -> ScoredChunk {
        let mut metadata = Metadata::new();
        metadata.insert(meta_keys::INGESTED_AT.into(), ingested_at.into());
        ScoredChunk {
            identity: ChunkIdentity::new(DocumentId::new(doc), seq),
            span: TextSpan::new(0, 4),
            text: format!("{doc}-{seq}"),
            metadata,
            score,
        }
    }

    const OLD: &str = "2026-01-01T00:00:00+00:00";
    const NEW: &str = "2026-06-01T00:00:00+00:00";

    fn keys(matches: &[RetrievedMatch]) -> Vec<String> {
        matches.iter().map(|m| m.identity.key()).collect()
    }

    #[test]
    fn test_scores_normalize_per_collection() {
        // Inner-product scale in one list, cosine scale in the other
        let lists = vec![
            CollectionHits::new("a".into(), vec![hit("a1", 0, 40.0, OLD), hit("a2", 0, 20.0, OLD)]),
            CollectionHits::new("b".into(), vec![hit("b1", 0, 0.9, OLD), hit("b2", 0, 0.5, OLD)]),
        ];
        let merged = merge_ranked(&lists, 0.0);
        assert_eq!(merged.len(), 4);
        assert_eq!(merged[0].score, 1.0);
        assert_eq!(merged[1].score, 1.0);
        assert_eq!(merged[2].score, 0.0);
        // Equal scores and recency fall back to seq, then document id
        assert_eq!(keys(&merged), vec!["a1:0", "b1:0", "a2:0", "b2:0"]);
        assert_eq!(merged[0].raw_score, 40.0);
    }

    #[test]
    fn test_cutoff_applies_to_raw_scores() {
        let lists = vec![CollectionHits::new(
            "a".into(),
            vec![hit("d", 0, 0.9, OLD), hit("d", 1, 0.3, OLD), hit("d", 2, 0.1, OLD)],
        )];
        let merged = merge_ranked(&lists, 0.25);
        assert_eq!(keys(&merged), vec!["d:0", "d:1"]);
        assert_eq!(merged[1].score, 0.0);
    }

    #[test]
    fn test_equal_scores_normalize_to_one() {
        let lists = vec![CollectionHits::new(
            "a".into(),
            vec![hit("d", 0, 0.4, OLD), hit("d", 1, 0.4, OLD)],
        )];
        let merged = merge_ranked(&lists, 0.0);
        assert!(merged.iter().all(|m| m.score == 1.0));
    }

    #[test]
    fn test_recency_breaks_ties_before_sequence() {
        let lists = vec![CollectionHits::new(
            "a".into(),
            vec![hit("old", 0, 0.5, OLD), hit("new", 3, 0.5, NEW)],
        )];
        let merged = merge_ranked(&lists, 0.0);
        assert_eq!(keys(&merged), vec!["new:3", "old:0"]);
    }

    #[test]
    fn test_merge_is_independent_of_collection_order() {
        let a = CollectionHits::new(
            "a".into(),
            vec![hit("x", 0, 0.8, OLD), hit("x", 1, 0.6, NEW), hit("x", 2, 0.2, OLD)],
        );
        let b = CollectionHits::new(
            "b".into(),
            vec![hit("y", 0, 0.7, NEW), hit("y", 1, 0.7, OLD), hit("y", 2, 0.1, NEW)],
        );
        let c = CollectionHits::new("c".into(), vec![hit("z", 0, 0.5, OLD)]);

        let forward = merge_ranked(&[a.clone(), b.clone(), c.clone()], 0.15);
        let reverse = merge_ranked(&[c.clone(), b.clone(), a.clone()], 0.15);
        let shuffled = merge_ranked(&[b, c, a], 0.15);
        assert_eq!(keys(&forward), keys(&reverse));
        assert_eq!(keys(&forward), keys(&shuffled));
    }

    #[test]
    fn test_empty_lists() {
        assert!(merge_ranked(&[], 0.0).is_empty());
        let lists = vec![CollectionHits::new("a".into(), vec![hit("d", 0, 0.1, OLD)])];
        assert!(merge_ranked(&lists, 0.5).is_empty());
    }
}
