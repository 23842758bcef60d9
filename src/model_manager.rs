use candle_core::{Device, Tensor};
use pylate_rs::ColBERT;

use crate::error::{Error, Result};

pub const DEFAULT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";
pub const MODEL_ENV_VAR: &str = "FUSIONRAG_MODEL";

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

/// Resolve the model id: the `FUSIONRAG_MODEL` environment variable wins,
/// then the stored setting, then [`DEFAULT_MODEL_ID`].
pub fn resolve_model_id(setting: Option<String>) -> String {
    std::env::var(MODEL_ENV_VAR)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or(setting)
        .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string())
}

/// Owns the ColBERT model and loads it on first use.
///
/// Shared between the embedder and the pair scorer behind one mutex so the
/// weights are only held in memory once.
pub struct ModelManager {
    model: Option<ColBERT>,
    model_id: String,
}

impl ModelManager {
    /// The model is not loaded until the first encode call.
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model: None,
            model_id: model_id.into(),
        }
    }

    /// Returns the model ID that will be (or has been) loaded.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Load the model now instead of on the first encode.
    pub fn preload(&mut self) -> Result<()> {
        self.ensure_loaded().map(|_| ())
    }

    /// Ensures the model is loaded, downloading from HuggingFace Hub if needed.
    fn ensure_loaded(&mut self) -> Result<&mut ColBERT> {
        if self.model.is_none() {
            tracing::info!(model = %self.model_id, "loading ColBERT model");
            let colbert: ColBERT = ColBERT::from(&self.model_id)
                .with_device(default_device())
                .try_into()
                .map_err(|e| {
                    Error::EmbeddingService(format!(
                        "failed to load model '{}': {e}",
                        self.model_id
                    ))
                })?;
            self.model = Some(colbert);
        }

        self.model.as_mut().ok_or_else(|| {
            Error::EmbeddingService("model failed to load".to_string())
        })
    }

    /// Encode document texts into token-level embeddings of shape
    /// `[batch, tokens, dim]`.
    pub fn encode_documents(&mut self, texts: &[String]) -> Result<Tensor> {
        let model = self.ensure_loaded()?;
        model.encode(texts, false).map_err(|e| {
            Error::EmbeddingService(format!("document encoding failed: {e}"))
        })
    }

    /// Encode a query into a `[Q, D]` token embedding matrix.
    pub fn encode_query(&mut self, query: &str) -> Result<Tensor> {
        let model = self.ensure_loaded()?;
        let embeddings =
            model.encode(&[query.to_string()], true).map_err(|e| {
                Error::EmbeddingService(format!("query encoding failed: {e}"))
            })?;
        // [1, Q, D] -> [Q, D]
        Ok(embeddings.squeeze(0)?)
    }
}
