//! Optional second-stage scoring of the merged top-N.
//!
//! A reranker only sees matches that already passed the relevance cutoff,
//! so it can reorder them but never bring a dropped match back.

use async_trait::async_trait;
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

use super::RetrievedMatch;
use super::lexical::LexicalScorer;
use crate::config::{RerankKind, RetrievalConfig};
use crate::embed::default_cache_dir;
use crate::error::{RagError, RagResult};

#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    /// One score per match, in input order. Higher is better.
    async fn rerank(&self, query: &str, matches: &[RetrievedMatch]) -> RagResult<Vec<f32>>;
}

/// Term coverage plus a bonus when the whole query appears verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalReranker;

const PHRASE_BONUS: f32 = 0.5;

#[async_trait]
impl Reranker for LexicalReranker {
    fn name(&self) -> &str {
        "lexical"
    }

    async fn rerank(&self, query: &str, matches: &[RetrievedMatch]) -> RagResult<Vec<f32>> {
        let scorer = LexicalScorer::new(query);
        let phrase = query.trim().to_lowercase();
        Ok(matches
            .iter()
            .map(|m| {
                let mut score = scorer.score(&m.text);
                if !phrase.is_empty() && m.text.to_lowercase().contains(&phrase) {
                    score += PHRASE_BONUS;
                }
                score
            })
            .collect())
    }
}

pub fn parse_reranker_model(name: &str) -> RagResult<RerankerModel> {
    let model = match name {
        "BGERerankerBase" => RerankerModel::BGERerankerBase,
        "BGERerankerV2M3" => RerankerModel::BGERerankerV2M3,
        "JINARerankerV1TurboEn" => RerankerModel::JINARerankerV1TurboEn,
        "JINARerankerV2BaseMultiligual" => RerankerModel::JINARerankerV2BaseMultiligual,
        other => {
            return Err(RagError::InvalidConfig(format!(
                "unknown reranker model '{other}'"
            )));
        }
    };
    Ok(model)
}

/// Cross-encoder reranking with a local fastembed model.
pub struct CrossEncoderReranker {
    model: Arc<Mutex<TextRerank>>,
    model_name: String,
}

impl CrossEncoderReranker {
    /// Blocking; downloads the model on first use.
    pub fn new(model_name: &str, cache_dir: Option<PathBuf>) -> RagResult<Self> {
        let model = parse_reranker_model(model_name)?;
        let cache_dir = cache_dir.unwrap_or_else(default_cache_dir);
        tracing::info!(target: "retrieve", "loading reranker {model_name}");
        let reranker = TextRerank::try_new(
            RerankInitOptions::new(model)
                .with_cache_dir(cache_dir)
                .with_show_download_progress(true),
        )
        .map_err(|e| RagError::InvalidConfig(format!("reranker {model_name}: {e}")))?;
        Ok(Self {
            model: Arc::new(Mutex::new(reranker)),
            model_name: model_name.to_string(),
        })
    }
}

#[async_trait]
impl Reranker for CrossEncoderReranker {
    fn name(&self) -> &str {
        &self.model_name
    }

    async fn rerank(&self, query: &str, matches: &[RetrievedMatch]) -> RagResult<Vec<f32>> {
        if matches.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.model.clone();
        let query = query.to_string();
        let documents: Vec<String> = matches.iter().map(|m| m.text.clone()).collect();
        let count = documents.len();

        let results = tokio::task::spawn_blocking(move || {
            let documents: Vec<&str> = documents.iter().map(String::as_str).collect();
            model.lock().rerank(query.as_str(), documents, false, None)
        })
        .await
        .map_err(|e| RagError::RetrievalUnavailable(format!("rerank task: {e}")))?
        .map_err(|e| RagError::RetrievalUnavailable(format!("rerank: {e}")))?;

        // Results come back sorted by score; put them back in input order
        let mut scores = vec![f32::MIN; count];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = result.score;
            }
        }
        Ok(scores)
    }
}

/// Reranker selected by configuration, if any.
pub async fn build_reranker(
    config: &RetrievalConfig,
    cache_dir: Option<PathBuf>,
) -> RagResult<Option<Arc<dyn Reranker>>> {
    let reranker: Arc<dyn Reranker> = match config.rerank {
        RerankKind::None => return Ok(None),
        RerankKind::Lexical => Arc::new(LexicalReranker),
        RerankKind::CrossEncoder => {
            let name = config.rerank_model.clone();
            let reranker =
                tokio::task::spawn_blocking(move || CrossEncoderReranker::new(&name, cache_dir))
                    .await
                    .map_err(|e| RagError::InvalidConfig(format!("reranker init task: {e}")))??;
            Arc::new(reranker)
        }
    };
    Ok(Some(reranker))
}

/// Reorder `matches[..top_n]` by `scores`, keeping the merged order among
/// equal scores. Matches past `top_n` keep their place after the head.
pub fn apply_scores(matches: &mut [RetrievedMatch], top_n: usize, scores: &[f32]) {
    let head = top_n.min(matches.len()).min(scores.len());
    for (m, score) in matches[..head].iter_mut().zip(scores) {
        m.rerank_score = Some(*score);
    }
    matches[..head].sort_by(|a, b| {
        let a = a.rerank_score.unwrap_or(f32::MIN);
        let b = b.rerank_score.unwrap_or(f32::MIN);
        b.total_cmp(&a)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkIdentity, Citation, DocumentId, Metadata, TextSpan};

    fn retrieved(seq: u32, text: &str) -> RetrievedMatch {
        let identity = ChunkIdentity::new(DocumentId::new("doc"), seq);
        let span = TextSpan::new(0, text.len());
        RetrievedMatch {
            collection: "kb".into(),
            citation: Citation::from_metadata(&identity, span, &Metadata::new()),
            identity,
            span,
            text: text.to_string(),
            metadata: Metadata::new(),
            score: 1.0,
            raw_score: 1.0,
            rerank_score: None,
        }
    }

    #[tokio::test]
    async fn test_lexical_reranker_prefers_phrase() {
        let matches = vec![
            retrieved(0, "checker of borrow rules"),
            retrieved(1, "the borrow checker explained"),
            retrieved(2, "unrelated text"),
        ];
        let scores = LexicalReranker.rerank("borrow checker", &matches).await.unwrap();
        assert_eq!(scores.len(), 3);
        assert!(scores[1] > scores[0]);
        assert_eq!(scores[2], 0.0);
    }

    #[test]
    fn test_apply_scores_only_touches_head() {
        let mut matches = vec![
            retrieved(0, "a"),
            retrieved(1, "b"),
            retrieved(2, "c"),
            retrieved(3, "d"),
        ];
        apply_scores(&mut matches, 3, &[0.1, 0.9, 0.1]);
        let seqs: Vec<u32> = matches.iter().map(|m| m.identity.seq).collect();
        assert_eq!(seqs, vec![1, 0, 2, 3]);
        assert_eq!(matches[3].rerank_score, None);
    }

    #[test]
    fn test_parse_reranker_model() {
        assert!(parse_reranker_model("BGERerankerBase").is_ok());
        assert!(matches!(
            parse_reranker_model("nope"),
            Err(RagError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    #[ignore = "Downloads reranker model (~280MB)"]
    async fn test_cross_encoder_orders_relevant_first() {
        let reranker = CrossEncoderReranker::new("BGERerankerBase", None).unwrap();
        let matches = vec![
            retrieved(0, "Paris is known for its bakeries."),
            retrieved(1, "The capital of France is Paris."),
        ];
        let scores = reranker
            .rerank("What is the capital of France?", &matches)
            .await
            .unwrap();
        assert!(scores[1] > scores[0]);
    }
}
