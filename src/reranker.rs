use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use candle_core::Tensor;
use rayon::prelude::*;
use serde::Serialize;

use crate::{
    embedding::tokenize,
    error::{Error, Result},
    hybrid::RetrievalCandidate,
    model_manager::ModelManager,
    source::Chunk,
};

/// Documents encoded per model call when scoring candidates.
const SCORE_BATCH_SIZE: usize = 32;

/// Jointly scores a query and a passage.
///
/// Scores are in `[0, 1]`, higher meaning more relevant.
pub trait PairScorer: Send + Sync {
    fn score_pair(&self, query: &str, passage: &str) -> Result<f32>;

    /// Score many passages against one query. Must return exactly one score
    /// per passage, in order.
    fn score_pairs(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>> {
        passages
            .par_iter()
            .map(|p| self.score_pair(query, p))
            .collect()
    }
}

/// A reranked chunk with its relevance score.
#[derive(Debug, Clone, Serialize)]
pub struct RankedChunk {
    pub chunk: Chunk,
    pub score: f32,
    /// 1-based position in the hybrid candidate list.
    pub hybrid_rank: usize,
}

/// Score every candidate against the query and keep the best `final_k`.
///
/// Output is ordered by descending score. Equal scores keep their hybrid
/// order. Only the candidate set is ever scored, never the whole corpus.
pub fn rerank(
    scorer: &dyn PairScorer,
    query: &str,
    candidates: Vec<RetrievalCandidate>,
    final_k: usize,
) -> Result<Vec<RankedChunk>> {
    if candidates.is_empty() || final_k == 0 {
        return Ok(Vec::new());
    }

    let passages: Vec<&str> =
        candidates.iter().map(|c| c.chunk.text()).collect();
    let scores = scorer.score_pairs(query, &passages)?;
    if scores.len() != candidates.len() {
        return Err(Error::RerankService(format!(
            "scored {} of {} candidates",
            scores.len(),
            candidates.len()
        )));
    }
    if let Some(i) = scores.iter().position(|s| !s.is_finite()) {
        return Err(Error::RerankService(format!(
            "non-finite score for {}",
            candidates[i].chunk.key()
        )));
    }

    let mut ranked: Vec<RankedChunk> = candidates
        .into_iter()
        .zip(scores)
        .enumerate()
        .map(|(i, (candidate, score))| RankedChunk {
            chunk: candidate.chunk,
            score,
            hybrid_rank: i + 1,
        })
        .collect();

    // Stable: equal scores stay in hybrid order.
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked.truncate(final_k);
    Ok(ranked)
}

/// ColBERT late-interaction scorer.
///
/// The query and each passage are encoded to token matrices; the MaxSim
/// score is averaged over query tokens and mapped from `[-1, 1]` to `[0, 1]`.
pub struct ColbertScorer {
    model: Arc<Mutex<ModelManager>>,
}

impl ColbertScorer {
    pub fn new(model: Arc<Mutex<ModelManager>>) -> Self {
        Self { model }
    }
}

impl PairScorer for ColbertScorer {
    fn score_pair(&self, query: &str, passage: &str) -> Result<f32> {
        self.score_pairs(query, &[passage])?
            .pop()
            .ok_or_else(|| Error::RerankService("no score returned".into()))
    }

    fn score_pairs(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let mut model = self
            .model
            .lock()
            .map_err(|_| Error::Worker("model lock poisoned".into()))?;
        let q = model.encode_query(query).map_err(as_rerank_err)?;
        let query_tokens = q.dim(0).map_err(map_candle_err)?.max(1) as f32;

        let mut scores = Vec::with_capacity(passages.len());
        for batch in passages.chunks(SCORE_BATCH_SIZE) {
            let texts: Vec<String> =
                batch.iter().map(|p| p.to_string()).collect();
            let docs = model.encode_documents(&texts).map_err(as_rerank_err)?;
            for i in 0..batch.len() {
                let doc = docs.get(i).map_err(map_candle_err)?;
                let raw = maxsim(&q, &doc)?;
                scores.push(((raw / query_tokens + 1.0) / 2.0).clamp(0.0, 1.0));
            }
        }
        Ok(scores)
    }
}

fn as_rerank_err(e: Error) -> Error {
    match e {
        Error::EmbeddingService(msg) => Error::RerankService(msg),
        other => other,
    }
}

/// Compute the MaxSim score between a query embedding and a document embedding.
///
/// query_embedding: [Q, D] where Q = query tokens, D = embedding dimension
/// doc_embedding: [T, D] where T = document tokens, D = embedding dimension
///
/// MaxSim = sum over query tokens of max(query_token . doc_token for all doc tokens)
fn maxsim(query_embedding: &Tensor, doc_embedding: &Tensor) -> Result<f32> {
    // Compute similarity matrix [Q, T] = query_emb @ doc_emb^T
    let sim_matrix = query_embedding
        .matmul(&doc_embedding.t().map_err(map_candle_err)?)
        .map_err(map_candle_err)?;

    // Take max along dimension 1 (best document token per query token)
    let row_maxes = sim_matrix.max(1).map_err(map_candle_err)?;

    let score = row_maxes
        .sum_all()
        .map_err(map_candle_err)?
        .to_scalar::<f32>()
        .map_err(map_candle_err)?;

    Ok(score)
}

fn map_candle_err(e: candle_core::Error) -> Error {
    Error::RerankService(format!("tensor computation error: {e}"))
}

/// Fraction of distinct query terms that occur in the passage.
///
/// Deterministic and model-free; used offline and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TermOverlapScorer;

impl PairScorer for TermOverlapScorer {
    fn score_pair(&self, query: &str, passage: &str) -> Result<f32> {
        let query_terms: HashSet<String> =
            tokenize(query).into_iter().collect();
        if query_terms.is_empty() {
            return Ok(0.0);
        }
        let passage_terms: HashSet<String> =
            tokenize(passage).into_iter().collect();
        let hits = query_terms
            .iter()
            .filter(|t| passage_terms.contains(*t))
            .count();
        Ok(hits as f32 / query_terms.len() as f32)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::source::SourceType;

    fn make_tensor(data: &[f32], shape: (usize, usize)) -> Tensor {
        Tensor::from_vec(data.to_vec(), shape, &Device::Cpu).unwrap()
    }

    fn candidates(texts: &[&str]) -> Vec<RetrievalCandidate> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| RetrievalCandidate {
                chunk: Chunk::new(*t, SourceType::TextFile, "c.txt", i)
                    .unwrap(),
                lexical_rank: Some(i + 1),
                semantic_rank: None,
                fused_score: 1.0 / (61.0 + i as f32),
            })
            .collect()
    }

    /// Returns a fixed score per passage, looked up by text.
    struct Scripted(Vec<(&'static str, f32)>);

    impl PairScorer for Scripted {
        fn score_pair(&self, _query: &str, passage: &str) -> Result<f32> {
            self.0
                .iter()
                .find(|(t, _)| *t == passage)
                .map(|(_, s)| *s)
                .ok_or_else(|| Error::RerankService("unknown passage".into()))
        }
    }

    struct Unavailable;

    impl PairScorer for Unavailable {
        fn score_pair(&self, _query: &str, _passage: &str) -> Result<f32> {
            Err(Error::RerankService("connection refused".into()))
        }
    }

    #[test]
    fn maxsim_identical_vectors() {
        let q = make_tensor(&[1.0, 0.0, 0.0], (1, 3));
        let d = make_tensor(&[1.0, 0.0, 0.0], (1, 3));
        assert!((maxsim(&q, &d).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn maxsim_multiple_query_tokens() {
        // 2 query tokens, 3 doc tokens, dim=2
        let q = make_tensor(&[1.0, 0.0, 0.0, 1.0], (2, 2));
        let d = make_tensor(&[1.0, 0.0, 0.0, 1.0, 0.5, 0.5], (3, 2));
        // row maxes: [1.0, 1.0], sum = 2.0
        assert!((maxsim(&q, &d).unwrap() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn orders_by_score_and_truncates() {
        let scorer =
            Scripted(vec![("a", 0.2), ("b", 0.9), ("c", 0.5), ("d", 0.1)]);
        let out = rerank(&scorer, "q", candidates(&["a", "b", "c", "d"]), 2)
            .unwrap();
        let texts: Vec<_> = out.iter().map(|r| r.chunk.text()).collect();
        assert_eq!(texts, vec!["b", "c"]);
        assert_eq!(out[0].hybrid_rank, 2);
    }

    #[test]
    fn output_is_permutation_of_input() {
        let scorer = Scripted(vec![("a", 0.3), ("b", 0.1), ("c", 0.7)]);
        let out = rerank(&scorer, "q", candidates(&["a", "b", "c"]), 10)
            .unwrap();
        let mut ranks: Vec<_> = out.iter().map(|r| r.hybrid_rank).collect();
        ranks.sort();
        assert_eq!(ranks, vec![1, 2, 3]);
        for w in out.windows(2) {
            assert!(w[0].score >= w[1].score);
        }
    }

    #[test]
    fn equal_scores_keep_hybrid_order() {
        let scorer =
            Scripted(vec![("x", 0.5), ("y", 0.5), ("z", 0.5), ("w", 0.9)]);
        let out = rerank(&scorer, "q", candidates(&["x", "y", "z", "w"]), 4)
            .unwrap();
        let ranks: Vec<_> = out.iter().map(|r| r.hybrid_rank).collect();
        assert_eq!(ranks, vec![4, 1, 2, 3]);
    }

    #[test]
    fn scorer_failure_is_rerank_service_error() {
        let err = rerank(&Unavailable, "q", candidates(&["a"]), 5).unwrap_err();
        assert!(matches!(err, Error::RerankService(_)));
        assert!(err.is_service_failure());
    }

    #[test]
    fn empty_candidates_skip_the_scorer() {
        let out = rerank(&Unavailable, "q", Vec::new(), 5).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn term_overlap_scores_in_unit_range() {
        let s = TermOverlapScorer;
        let full = s.score_pair("rust cargo", "cargo builds rust").unwrap();
        assert_eq!(full, 1.0);
        assert_eq!(s.score_pair("rust cargo", "cargo only").unwrap(), 0.5);
        assert_eq!(s.score_pair("rust", "nothing here").unwrap(), 0.0);
        assert_eq!(s.score_pair("", "anything").unwrap(), 0.0);
    }
}
