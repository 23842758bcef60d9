//! Text embedding collaborators.
//!
//! The semantic index only needs `embed(texts) -> fixed-dimension vectors`.
//! [`ColbertEmbedder`] derives one vector per text from the ColBERT token
//! embeddings; [`HashingEmbedder`] is a deterministic offline stand-in.

use std::sync::{Arc, Mutex};

use crate::{
    error::{Error, Result},
    model_manager::ModelManager,
};

/// Produces one vector of a fixed dimension per input text.
///
/// The same embedder (same [`model_id`](Embedder::model_id)) must be used at
/// build time and query time.
pub trait Embedder: Send + Sync {
    /// Identifies the model and its version. Persisted vectors are only
    /// reused when this matches.
    fn model_id(&self) -> &str;

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Get ready to serve queries. Index builds call this even when every
    /// vector comes from the store, so the first query pays no load cost.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }

    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])?
            .pop()
            .ok_or_else(|| {
                Error::EmbeddingService("embedder returned no vector".into())
            })
    }
}

/// Scale a vector to unit length in place. Zero vectors are left alone.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Mean-pooled, L2-normalised ColBERT document embeddings.
pub struct ColbertEmbedder {
    model: Arc<Mutex<ModelManager>>,
    model_id: String,
}

impl ColbertEmbedder {
    pub fn new(model: Arc<Mutex<ModelManager>>) -> Result<Self> {
        let model_id = model
            .lock()
            .map_err(|_| Error::Worker("model lock poisoned".into()))?
            .model_id()
            .to_string();
        Ok(Self { model, model_id })
    }
}

impl Embedder for ColbertEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn warm_up(&self) -> Result<()> {
        self.model
            .lock()
            .map_err(|_| Error::Worker("model lock poisoned".into()))?
            .preload()
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let tokens = {
            let mut model = self
                .model
                .lock()
                .map_err(|_| Error::Worker("model lock poisoned".into()))?;
            model.encode_documents(texts)?
        };

        // [batch, tokens, dim] -> [batch, dim]. Padding tokens are zero
        // vectors, so they shrink the sum but not its direction.
        let pooled = tokens.sum(1).map_err(map_candle_err)?;
        let mut vectors = pooled.to_vec2::<f32>().map_err(map_candle_err)?;
        if vectors.len() != texts.len() {
            return Err(Error::EmbeddingService(format!(
                "expected {} vectors, model returned {}",
                texts.len(),
                vectors.len()
            )));
        }
        for v in &mut vectors {
            l2_normalize(v);
        }
        Ok(vectors)
    }
}

fn map_candle_err(e: candle_core::Error) -> Error {
    Error::EmbeddingService(format!("tensor computation error: {e}"))
}

/// Feature-hashing bag-of-words embedder.
///
/// Lowercased alphanumeric tokens (and individual CJK characters) are hashed
/// into `dim` buckets with a sign bit, then the vector is L2-normalised.
/// Buckets come from BLAKE3, so vectors are identical on every platform
/// and toolchain. Needs no model download.
pub struct HashingEmbedder {
    dim: usize,
    model_id: String,
}

impl HashingEmbedder {
    pub const DEFAULT_DIM: usize = 256;

    pub fn new(dim: usize) -> Self {
        let dim = dim.max(1);
        Self {
            dim,
            model_id: format!("hashing-{dim}"),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        for token in tokenize(text) {
            let mut prefix = [0u8; 8];
            let digest = blake3::hash(token.as_bytes());
            prefix.copy_from_slice(&digest.as_bytes()[..8]);
            let h = u64::from_le_bytes(prefix);
            let bucket = (h % self.dim as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        l2_normalize(&mut v);
        v
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIM)
    }
}

impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Lowercased word tokens. CJK ideographs and kana become one token per
/// character since those scripts have no spaces.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if is_cjk(c) {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            tokens.push(c.to_string());
        } else if c.is_alphanumeric() {
            current.extend(c.to_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{3040}'..='\u{30ff}'
        | '\u{3400}'..='\u{4dbf}'
        | '\u{4e00}'..='\u{9fff}'
        | '\u{f900}'..='\u{faff}'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn hashing_vectors_have_fixed_dimension_and_unit_norm() {
        let e = HashingEmbedder::new(64);
        let vs = e
            .embed(&["hello world".into(), "another text here".into()])
            .unwrap();
        assert_eq!(vs.len(), 2);
        for v in &vs {
            assert_eq!(v.len(), 64);
            assert!((dot(v, v) - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn hashing_is_deterministic() {
        let e = HashingEmbedder::default();
        assert_eq!(
            e.embed_one("stable output").unwrap(),
            e.embed_one("stable output").unwrap()
        );
    }

    #[test]
    fn hashing_buckets_are_pinned() {
        // Stored vectors depend on these buckets staying put.
        let v = HashingEmbedder::new(8).embed_one("Rust").unwrap();
        assert_eq!(v, vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn warm_up_is_a_no_op_by_default() {
        assert!(HashingEmbedder::default().warm_up().is_ok());
    }

    #[test]
    fn similar_texts_score_higher() {
        let e = HashingEmbedder::default();
        let q = e.embed_one("boil the pasta").unwrap();
        let near = e.embed_one("pasta should boil for ten minutes").unwrap();
        let far = e.embed_one("kernel scheduler latency").unwrap();
        assert!(dot(&q, &near) > dot(&q, &far));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let v = HashingEmbedder::new(8).embed_one("  ").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn tokenize_splits_cjk_per_character() {
        assert_eq!(tokenize("Rust言語 v2"), vec!["rust", "言", "語", "v2"]);
    }

    #[test]
    fn model_id_names_dimension() {
        assert_eq!(HashingEmbedder::new(32).model_id(), "hashing-32");
    }
}
