//! Hybrid retrieval: one corpus snapshot, two indexes, one fused ranking.
//!
//! Both ranked lists are combined with weighted reciprocal-rank fusion:
//!
//! ```text
//! fused(c) = Σ_i  w_i / (rrf_k + rank_i(c))
//! ```
//!
//! with 1-based ranks and the weights normalised to sum to one. A chunk that
//! is missing from one list simply gets no contribution from it. A list with
//! zero weight is not consulted at all, so `w_keyword = 0` reproduces the
//! semantic order exactly and vice versa.

use std::{
    collections::{HashMap, HashSet},
    time::Instant,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    embedding::Embedder,
    error::{Error, Result},
    lexical::{LexicalIndex, ScoredChunk},
    registry::Corpus,
    semantic::SemanticIndex,
    source::{Chunk, ChunkKey},
    vector_db::VectorDb,
};

pub const DEFAULT_TOP_N_PER_INDEX: usize = 60;
pub const DEFAULT_CANDIDATE_POOL: usize = 60;
pub const DEFAULT_FINAL_K: usize = 5;
pub const DEFAULT_RRF_K: f32 = 60.0;
pub const DEFAULT_SEMANTIC_WEIGHT: f32 = 0.5;
pub const DEFAULT_KEYWORD_WEIGHT: f32 = 0.5;

/// Knobs for one hybrid search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalParams {
    pub w_semantic: f32,
    pub w_keyword: f32,
    /// Candidates taken from each index before fusion.
    pub top_n_per_index: usize,
    /// Fused candidates handed to the reranker.
    pub candidate_pool: usize,
    /// Results kept after reranking.
    pub final_k: usize,
    pub rrf_k: f32,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            w_semantic: DEFAULT_SEMANTIC_WEIGHT,
            w_keyword: DEFAULT_KEYWORD_WEIGHT,
            top_n_per_index: DEFAULT_TOP_N_PER_INDEX,
            candidate_pool: DEFAULT_CANDIDATE_POOL,
            final_k: DEFAULT_FINAL_K,
            rrf_k: DEFAULT_RRF_K,
        }
    }
}

impl RetrievalParams {
    /// Weights scaled to sum to one.
    ///
    /// # Examples
    ///
    /// ```
    /// use fusionrag::RetrievalParams;
    ///
    /// let p = RetrievalParams {
    ///     w_semantic: 3.0,
    ///     w_keyword: 1.0,
    ///     ..Default::default()
    /// };
    /// assert_eq!(p.normalized_weights().unwrap(), (0.75, 0.25));
    ///
    /// let zero = RetrievalParams {
    ///     w_semantic: 0.0,
    ///     w_keyword: 0.0,
    ///     ..Default::default()
    /// };
    /// assert!(zero.normalized_weights().is_err());
    /// ```
    pub fn normalized_weights(&self) -> Result<(f32, f32)> {
        let (s, k) = (self.w_semantic, self.w_keyword);
        let valid = s.is_finite() && k.is_finite() && s >= 0.0 && k >= 0.0;
        let sum = s + k;
        if !valid || sum <= 0.0 {
            return Err(Error::InvalidWeight {
                semantic: s,
                keyword: k,
            });
        }
        Ok((s / sum, k / sum))
    }
}

/// One fused hit, before reranking.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalCandidate {
    pub chunk: Chunk,
    /// 1-based rank in the lexical list, if the chunk appeared there.
    pub lexical_rank: Option<usize>,
    pub semantic_rank: Option<usize>,
    pub fused_score: f32,
}

/// Weighted reciprocal-rank fusion of two ranked lists of corpus positions.
///
/// Returns `(position, lexical_rank, semantic_rank, fused_score)` ordered by
/// fused score descending, then corpus position ascending.
fn fuse(
    lexical: &[ScoredChunk],
    semantic: &[ScoredChunk],
    w_keyword: f32,
    w_semantic: f32,
    rrf_k: f32,
) -> Vec<(usize, Option<usize>, Option<usize>, f32)> {
    let mut acc: HashMap<usize, (Option<usize>, Option<usize>, f32)> =
        HashMap::new();

    for (i, hit) in lexical.iter().enumerate() {
        let rank = i + 1;
        let entry = acc.entry(hit.position).or_insert((None, None, 0.0));
        if entry.0.is_none() {
            entry.0 = Some(rank);
            entry.2 += w_keyword / (rrf_k + rank as f32);
        }
    }
    for (i, hit) in semantic.iter().enumerate() {
        let rank = i + 1;
        let entry = acc.entry(hit.position).or_insert((None, None, 0.0));
        if entry.1.is_none() {
            entry.1 = Some(rank);
            entry.2 += w_semantic / (rrf_k + rank as f32);
        }
    }

    let mut fused: Vec<_> = acc
        .into_iter()
        .map(|(pos, (lex, sem, score))| (pos, lex, sem, score))
        .collect();
    fused.sort_by(|a, b| b.3.total_cmp(&a.3).then(a.0.cmp(&b.0)));
    fused
}

/// Lexical and semantic indexes built from the same corpus snapshot.
///
/// Immutable once built. A rebuild produces a new pair that replaces the old
/// one wholesale; queries holding the old pair finish against it.
#[derive(Debug)]
pub struct IndexPair {
    generation: u64,
    corpus: Corpus,
    lexical: LexicalIndex,
    semantic: SemanticIndex,
}

impl IndexPair {
    /// Build both indexes over `corpus`. Either failing fails the build.
    pub fn build(
        generation: u64,
        corpus: Corpus,
        embedder: &dyn Embedder,
        embed_batch_size: usize,
        store: Option<&VectorDb>,
    ) -> Result<Self> {
        let start = Instant::now();
        let lexical = LexicalIndex::build(&corpus)?;
        let semantic =
            SemanticIndex::build(&corpus, embedder, embed_batch_size, store)?;
        debug!(
            generation,
            chunks = corpus.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "index pair built"
        );
        Ok(Self {
            generation,
            corpus,
            lexical,
            semantic,
        })
    }

    /// Registry generation this pair was built from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn len(&self) -> usize {
        self.corpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.corpus.is_empty()
    }

    pub fn lexical(&self) -> &LexicalIndex {
        &self.lexical
    }

    pub fn semantic(&self) -> &SemanticIndex {
        &self.semantic
    }

    /// Query both indexes, fuse, deduplicate by chunk identity, and keep the
    /// best `candidate_pool` candidates.
    ///
    /// The two lookups run concurrently. A list whose weight is zero is
    /// skipped entirely.
    pub fn search(
        &self,
        embedder: &dyn Embedder,
        query: &str,
        params: &RetrievalParams,
    ) -> Result<Vec<RetrievalCandidate>> {
        let (w_semantic, w_keyword) = params.normalized_weights()?;
        let top_n = params.top_n_per_index;

        let (lexical, semantic) = rayon::join(
            || {
                if w_keyword > 0.0 {
                    self.lexical.query(query, top_n)
                } else {
                    Ok(Vec::new())
                }
            },
            || {
                if w_semantic > 0.0 {
                    self.semantic.query(embedder, query, top_n)
                } else {
                    Ok(Vec::new())
                }
            },
        );
        let (lexical, semantic) = (lexical?, semantic?);

        let fused =
            fuse(&lexical, &semantic, w_keyword, w_semantic, params.rrf_k);

        // Positions are unique within one snapshot, but identity is the
        // chunk key.
        let mut seen: HashSet<ChunkKey> = HashSet::with_capacity(fused.len());
        let mut candidates = Vec::with_capacity(params.candidate_pool);
        for (position, lexical_rank, semantic_rank, fused_score) in fused {
            if candidates.len() >= params.candidate_pool {
                break;
            }
            let Some(chunk) = self.corpus.get(position) else {
                continue;
            };
            if !seen.insert(chunk.key()) {
                continue;
            }
            candidates.push(RetrievalCandidate {
                chunk: chunk.clone(),
                lexical_rank,
                semantic_rank,
                fused_score,
            });
        }

        debug!(
            lexical = lexical.len(),
            semantic = semantic.len(),
            candidates = candidates.len(),
            "hybrid search"
        );
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{embedding::HashingEmbedder, source::SourceType};

    fn hits(positions: &[usize]) -> Vec<ScoredChunk> {
        positions
            .iter()
            .enumerate()
            .map(|(i, &position)| ScoredChunk {
                position,
                score: 10.0 - i as f32,
            })
            .collect()
    }

    fn corpus(texts: &[&str]) -> Corpus {
        Arc::new(
            texts
                .iter()
                .enumerate()
                .map(|(i, t)| {
                    Chunk::new(*t, SourceType::ManualText, "notes", i).unwrap()
                })
                .collect(),
        )
    }

    fn pair(texts: &[&str]) -> (IndexPair, HashingEmbedder) {
        let e = HashingEmbedder::default();
        let p = IndexPair::build(1, corpus(texts), &e, 8, None).unwrap();
        (p, e)
    }

    fn params(w_semantic: f32, w_keyword: f32) -> RetrievalParams {
        RetrievalParams {
            w_semantic,
            w_keyword,
            ..Default::default()
        }
    }

    const TEXTS: &[&str] = &[
        "install the package with cargo",
        "cargo builds rust crates",
        "the weather is sunny today",
        "rust ownership and borrowing rules",
        "borrowing checker errors explained",
    ];

    #[test]
    fn chunk_in_both_lists_outranks_single_list_hits() {
        let fused = fuse(&hits(&[1, 2]), &hits(&[3, 1]), 0.5, 0.5, 60.0);
        assert_eq!(fused[0].0, 1);
        assert_eq!(fused[0].1, Some(1));
        assert_eq!(fused[0].2, Some(2));
        let expected = 0.5 / 61.0 + 0.5 / 62.0;
        assert!((fused[0].3 - expected).abs() < 1e-7);
    }

    #[test]
    fn single_list_hit_is_not_penalized() {
        let fused = fuse(&hits(&[4]), &[], 1.0, 0.0, 60.0);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].3 - 1.0 / 61.0).abs() < 1e-7);
        assert_eq!(fused[0].2, None);
    }

    #[test]
    fn fused_ties_break_by_position() {
        // Position 7 is rank 1 lexically, position 2 is rank 1 semantically.
        let fused = fuse(&hits(&[7]), &hits(&[2]), 0.5, 0.5, 60.0);
        assert_eq!(fused[0].0, 2);
        assert_eq!(fused[1].0, 7);
    }

    #[test]
    fn invalid_weights_rejected() {
        let (p, e) = pair(TEXTS);
        for (s, k) in [(0.0, 0.0), (-1.0, 1.0), (1.0, f32::NAN)] {
            let err = p.search(&e, "rust", &params(s, k)).unwrap_err();
            assert!(matches!(err, Error::InvalidWeight { .. }));
        }
    }

    #[test]
    fn weights_need_not_sum_to_one() {
        let (p, e) = pair(TEXTS);
        let a = p.search(&e, "rust borrowing", &params(2.0, 2.0)).unwrap();
        let b = p.search(&e, "rust borrowing", &params(0.5, 0.5)).unwrap();
        let keys = |c: &[RetrievalCandidate]| {
            c.iter().map(|c| c.chunk.key()).collect::<Vec<_>>()
        };
        assert_eq!(keys(&a), keys(&b));
    }

    #[test]
    fn pure_keyword_matches_lexical_order() {
        let (p, e) = pair(TEXTS);
        let lexical = p.lexical().query("cargo rust", 60).unwrap();
        let fused = p.search(&e, "cargo rust", &params(0.0, 1.0)).unwrap();

        let expected: Vec<_> = lexical.iter().map(|h| h.position).collect();
        let got: Vec<_> = fused.iter().map(|c| c.chunk.chunk_id()).collect();
        assert_eq!(got, expected);
        assert!(fused.iter().all(|c| c.semantic_rank.is_none()));
    }

    #[test]
    fn pure_semantic_matches_semantic_order() {
        let (p, e) = pair(TEXTS);
        let semantic = p.semantic().query(&e, "borrowing rules", 60).unwrap();
        let fused = p.search(&e, "borrowing rules", &params(1.0, 0.0)).unwrap();

        let expected: Vec<_> = semantic.iter().map(|h| h.position).collect();
        let got: Vec<_> = fused.iter().map(|c| c.chunk.chunk_id()).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn candidates_are_unique_and_capped() {
        let (p, e) = pair(TEXTS);
        let mut ps = params(0.5, 0.5);
        ps.candidate_pool = 3;
        let c = p.search(&e, "rust cargo borrowing", &ps).unwrap();
        assert_eq!(c.len(), 3);

        let mut keys: Vec<_> = c.iter().map(|c| c.chunk.key()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 3);
        for w in c.windows(2) {
            assert!(w[0].fused_score >= w[1].fused_score);
        }
    }

    #[test]
    fn empty_pair_returns_no_candidates() {
        let (p, e) = pair(&[]);
        assert!(p.is_empty());
        let hits = p.search(&e, "anything", &params(0.5, 0.5)).unwrap();
        assert!(hits.is_empty());
    }
}
