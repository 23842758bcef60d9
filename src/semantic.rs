use candle_core::{Device, Tensor};
use tracing::{debug, info};

use crate::{
    embedding::{Embedder, l2_normalize},
    error::{Error, Result},
    lexical::{ScoredChunk, rank_and_truncate},
    source::Chunk,
    vector_db::VectorDb,
};

/// Cosine-similarity index over one corpus snapshot.
///
/// Vectors are L2-normalised at build time and held as a single `[N, D]`
/// matrix, so a query is one matrix-vector product. Row `i` belongs to the
/// chunk at corpus position `i`.
pub struct SemanticIndex {
    matrix: Option<Tensor>,
    dimension: usize,
    len: usize,
}

/// Identifies a corpus as seen by one embedder. Stored vectors are only
/// reused when this matches exactly.
///
/// BLAKE3 over length-prefixed fields, so the value is stable across builds
/// and toolchains.
pub fn corpus_fingerprint(model_id: &str, corpus: &[Chunk]) -> u64 {
    fn field(hasher: &mut blake3::Hasher, value: &str) {
        hasher.update(&(value.len() as u64).to_le_bytes());
        hasher.update(value.as_bytes());
    }

    let mut hasher = blake3::Hasher::new();
    field(&mut hasher, model_id);
    hasher.update(&(corpus.len() as u64).to_le_bytes());
    for chunk in corpus {
        field(&mut hasher, chunk.source_type().as_str());
        field(&mut hasher, chunk.source_name());
        hasher.update(&(chunk.chunk_id() as u64).to_le_bytes());
        field(&mut hasher, chunk.text());
    }

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

impl SemanticIndex {
    /// Embed the whole corpus and build the index.
    ///
    /// With a [`VectorDb`], vectors stored under the same fingerprint are
    /// reused and freshly computed ones replace whatever was stored before.
    pub fn build(
        corpus: &[Chunk],
        embedder: &dyn Embedder,
        batch_size: usize,
        store: Option<&VectorDb>,
    ) -> Result<Self> {
        if corpus.is_empty() {
            return Ok(Self {
                matrix: None,
                dimension: 0,
                len: 0,
            });
        }

        let fingerprint = corpus_fingerprint(embedder.model_id(), corpus);
        let cached = match store {
            Some(db) => db.load(fingerprint)?,
            None => None,
        };

        let vectors = match cached {
            Some(vectors) if vectors.len() == corpus.len() => {
                debug!(chunks = vectors.len(), "reusing stored vectors");
                vectors
            }
            _ => {
                let vectors = embed_corpus(corpus, embedder, batch_size)?;
                if let Some(db) = store {
                    let dimension = vectors.first().map_or(0, Vec::len);
                    db.replace_all(fingerprint, dimension, &vectors)?;
                }
                vectors
            }
        };

        Self::from_vectors(vectors)
    }

    /// Build from precomputed vectors, one per corpus position.
    pub fn from_vectors(mut vectors: Vec<Vec<f32>>) -> Result<Self> {
        let len = vectors.len();
        let Some(dimension) = vectors.first().map(Vec::len) else {
            return Ok(Self {
                matrix: None,
                dimension: 0,
                len: 0,
            });
        };
        if dimension == 0 {
            return Err(Error::EmbeddingService(
                "embedder returned zero-dimension vectors".into(),
            ));
        }

        let mut flat = Vec::with_capacity(len * dimension);
        for (position, v) in vectors.iter_mut().enumerate() {
            if v.len() != dimension {
                return Err(Error::EmbeddingService(format!(
                    "vector for chunk {position} has dimension {}, expected {dimension}",
                    v.len()
                )));
            }
            l2_normalize(v);
            flat.extend_from_slice(v);
        }

        let matrix = Tensor::from_vec(flat, (len, dimension), &Device::Cpu)?;
        Ok(Self {
            matrix: Some(matrix),
            dimension,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed the query with the build-time embedder and return the `top_n`
    /// most similar chunks. Ties keep corpus order.
    pub fn query(
        &self,
        embedder: &dyn Embedder,
        text: &str,
        top_n: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let Some(matrix) = &self.matrix else {
            return Ok(Vec::new());
        };
        if top_n == 0 {
            return Ok(Vec::new());
        }

        let mut q = embedder.embed_one(text)?;
        if q.len() != self.dimension {
            return Err(Error::EmbeddingService(format!(
                "query vector has dimension {}, index has {}",
                q.len(),
                self.dimension
            )));
        }
        l2_normalize(&mut q);
        self.query_vector(matrix, q, top_n)
    }

    fn query_vector(
        &self,
        matrix: &Tensor,
        q: Vec<f32>,
        top_n: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let q = Tensor::from_vec(q, (self.dimension, 1), &Device::Cpu)?;
        // [N, D] x [D, 1] -> [N]
        let scores = matrix.matmul(&q)?.squeeze(1)?.to_vec1::<f32>()?;

        let hits = scores
            .into_iter()
            .enumerate()
            .map(|(position, score)| ScoredChunk { position, score })
            .collect();
        Ok(rank_and_truncate(hits, top_n))
    }
}

impl std::fmt::Debug for SemanticIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticIndex")
            .field("len", &self.len)
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

fn embed_corpus(
    corpus: &[Chunk],
    embedder: &dyn Embedder,
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let batch_size = batch_size.max(1);
    let mut vectors = Vec::with_capacity(corpus.len());

    for batch in corpus.chunks(batch_size) {
        let texts: Vec<String> =
            batch.iter().map(|c| c.text().to_string()).collect();
        let embedded = embedder.embed(&texts)?;
        if embedded.len() != texts.len() {
            return Err(Error::EmbeddingService(format!(
                "asked for {} embeddings, got {}",
                texts.len(),
                embedded.len()
            )));
        }
        vectors.extend(embedded);
    }

    info!(
        chunks = vectors.len(),
        model = embedder.model_id(),
        "embedded corpus"
    );
    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{embedding::HashingEmbedder, source::SourceType};

    fn corpus(texts: &[&str]) -> Vec<Chunk> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                Chunk::new(*t, SourceType::TextFile, "s.txt", i).unwrap()
            })
            .collect()
    }

    /// Counts how many texts went through `embed`.
    struct CountingEmbedder {
        inner: HashingEmbedder,
        calls: AtomicUsize,
    }

    impl Embedder for CountingEmbedder {
        fn model_id(&self) -> &str {
            self.inner.model_id()
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed(texts)
        }
    }

    struct FailingEmbedder;

    impl Embedder for FailingEmbedder {
        fn model_id(&self) -> &str {
            "failing"
        }

        fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(Error::EmbeddingService("service unavailable".into()))
        }
    }

    #[test]
    fn nearest_chunk_ranks_first() {
        let e = HashingEmbedder::default();
        let chunks = corpus(&[
            "the kernel schedules threads",
            "bake bread with flour and yeast",
            "threads share the kernel scheduler",
        ]);
        let idx = SemanticIndex::build(&chunks, &e, 2, None).unwrap();
        assert_eq!(idx.len(), 3);

        let hits = idx.query(&e, "flour yeast bread", 3).unwrap();
        assert_eq!(hits[0].position, 1);
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn empty_corpus_returns_empty() {
        let e = HashingEmbedder::default();
        let idx = SemanticIndex::build(&[], &e, 8, None).unwrap();
        assert!(idx.is_empty());
        assert!(idx.query(&e, "anything", 10).unwrap().is_empty());
    }

    #[test]
    fn ties_keep_corpus_order() {
        let idx = SemanticIndex::from_vectors(vec![
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![1.0, 0.0],
        ])
        .unwrap();
        let matrix = idx.matrix.as_ref().unwrap();
        let hits = idx.query_vector(matrix, vec![1.0, 0.0], 3).unwrap();
        let positions: Vec<_> = hits.iter().map(|h| h.position).collect();
        assert_eq!(positions, vec![0, 2, 1]);
    }

    #[test]
    fn mismatched_dimensions_rejected() {
        let err =
            SemanticIndex::from_vectors(vec![vec![1.0, 0.0], vec![1.0]])
                .unwrap_err();
        assert!(matches!(err, Error::EmbeddingService(_)));
    }

    #[test]
    fn embedder_failure_aborts_build() {
        let err =
            SemanticIndex::build(&corpus(&["a"]), &FailingEmbedder, 4, None)
                .unwrap_err();
        assert!(err.is_service_failure());
    }

    #[test]
    fn stored_vectors_are_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let db = VectorDb::open(&tmp.path().join("vectors.redb")).unwrap();
        let e = CountingEmbedder {
            inner: HashingEmbedder::new(32),
            calls: AtomicUsize::new(0),
        };
        let chunks = corpus(&["alpha", "beta", "gamma"]);

        SemanticIndex::build(&chunks, &e, 2, Some(&db)).unwrap();
        assert_eq!(e.calls.load(Ordering::SeqCst), 3);

        let again = SemanticIndex::build(&chunks, &e, 2, Some(&db)).unwrap();
        assert_eq!(e.calls.load(Ordering::SeqCst), 3);
        assert_eq!(again.len(), 3);

        let changed = corpus(&["alpha", "beta", "delta"]);
        SemanticIndex::build(&changed, &e, 2, Some(&db)).unwrap();
        assert_eq!(e.calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn fingerprint_depends_on_model_and_text() {
        let chunks = corpus(&["one", "two"]);
        let base = corpus_fingerprint("m", &chunks);
        assert_eq!(base, corpus_fingerprint("m", &chunks));
        assert_ne!(base, corpus_fingerprint("other", &chunks));
        assert_ne!(base, corpus_fingerprint("m", &corpus(&["one", "three"])));
    }

    #[test]
    fn fingerprint_is_pinned() {
        // Persisted in vectors.redb; a change here invalidates every cache.
        let chunks = corpus(&["one", "two"]);
        assert_eq!(corpus_fingerprint("m", &chunks), 0xf6c2_ddc9_47a4_70a1);
    }

    #[test]
    fn fingerprint_separates_field_boundaries() {
        let a = vec![Chunk::new("c", SourceType::ManualText, "ab", 0).unwrap()];
        let b = vec![Chunk::new("bc", SourceType::ManualText, "a", 0).unwrap()];
        assert_ne!(corpus_fingerprint("m", &a), corpus_fingerprint("m", &b));
    }
}
