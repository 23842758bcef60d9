//! Engine configuration: compiled-in defaults overlaid with the settings
//! stored in [`ConfigDb`].

use std::{str::FromStr, time::Duration};

use crate::{
    chunking::ChunkingConfig,
    config_db::ConfigDb,
    error::{Error, Result},
    hybrid::RetrievalParams,
    model_manager::{DEFAULT_MODEL_ID, resolve_model_id},
    ollama::{DEFAULT_OLLAMA_MODEL, DEFAULT_OLLAMA_URL},
};

pub const DEFAULT_EMBED_BATCH_SIZE: usize = 32;
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(120);

/// Setting keys understood by [`EngineConfig::resolve`].
pub mod keys {
    pub const CHUNK_SIZE: &str = "chunk_size";
    pub const CHUNK_OVERLAP: &str = "chunk_overlap";
    pub const TOP_N: &str = "top_n";
    pub const CANDIDATE_POOL: &str = "candidate_pool";
    pub const FINAL_K: &str = "final_k";
    pub const SEMANTIC_WEIGHT: &str = "semantic_weight";
    pub const KEYWORD_WEIGHT: &str = "keyword_weight";
    pub const MODEL_NAME: &str = "model_name";
    pub const OLLAMA_URL: &str = "ollama_url";
    pub const OLLAMA_MODEL: &str = "ollama_model";

    pub const ALL: &[&str] = &[
        CHUNK_SIZE,
        CHUNK_OVERLAP,
        TOP_N,
        CANDIDATE_POOL,
        FINAL_K,
        SEMANTIC_WEIGHT,
        KEYWORD_WEIGHT,
        MODEL_NAME,
        OLLAMA_URL,
        OLLAMA_MODEL,
    ];
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalParams,
    pub embed_batch_size: usize,
    /// Bound on each embedding or rerank stage.
    pub model_timeout: Duration,
    /// Bound on the completion call.
    pub completion_timeout: Duration,
    pub model_name: String,
    pub ollama_url: String,
    pub ollama_model: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalParams::default(),
            embed_batch_size: DEFAULT_EMBED_BATCH_SIZE,
            model_timeout: DEFAULT_MODEL_TIMEOUT,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            model_name: DEFAULT_MODEL_ID.to_string(),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            ollama_model: DEFAULT_OLLAMA_MODEL.to_string(),
        }
    }
}

impl EngineConfig {
    /// Overlay stored settings on the defaults and validate the result.
    pub fn resolve(db: &ConfigDb) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = parsed(db, keys::CHUNK_SIZE)? {
            config.chunking.chunk_size = v;
        }
        if let Some(v) = parsed(db, keys::CHUNK_OVERLAP)? {
            config.chunking.overlap = v;
        }
        if let Some(v) = parsed(db, keys::TOP_N)? {
            config.retrieval.top_n_per_index = v;
        }
        if let Some(v) = parsed(db, keys::CANDIDATE_POOL)? {
            config.retrieval.candidate_pool = v;
        }
        if let Some(v) = parsed(db, keys::FINAL_K)? {
            config.retrieval.final_k = v;
        }
        if let Some(v) = parsed(db, keys::SEMANTIC_WEIGHT)? {
            config.retrieval.w_semantic = v;
        }
        if let Some(v) = parsed(db, keys::KEYWORD_WEIGHT)? {
            config.retrieval.w_keyword = v;
        }

        config.model_name = resolve_model_id(db.get_setting(keys::MODEL_NAME)?);
        config.ollama_url =
            db.get_setting_or(keys::OLLAMA_URL, DEFAULT_OLLAMA_URL)?;
        config.ollama_model =
            db.get_setting_or(keys::OLLAMA_MODEL, DEFAULT_OLLAMA_MODEL)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        validate_retrieval(&self.retrieval)?;
        if self.embed_batch_size == 0 {
            return Err(Error::Config(
                "embed_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Range checks shared by stored settings and per-query overrides.
pub fn validate_retrieval(params: &RetrievalParams) -> Result<()> {
    for (name, value) in [
        (keys::TOP_N, params.top_n_per_index),
        (keys::CANDIDATE_POOL, params.candidate_pool),
        (keys::FINAL_K, params.final_k),
    ] {
        if value == 0 {
            return Err(Error::Config(format!("{name} must be positive")));
        }
    }
    if !(params.rrf_k.is_finite() && params.rrf_k >= 0.0) {
        return Err(Error::Config(format!(
            "rrf_k must be a non-negative number, got {}",
            params.rrf_k
        )));
    }
    params.normalized_weights().map(|_| ())
}

/// Reject unknown keys and values that would not parse at resolve time.
pub fn validate_setting(key: &str, value: &str) -> Result<()> {
    match key {
        keys::CHUNK_SIZE
        | keys::CHUNK_OVERLAP
        | keys::TOP_N
        | keys::CANDIDATE_POOL
        | keys::FINAL_K => parse_value::<usize>(key, value).map(|_| ()),
        keys::SEMANTIC_WEIGHT | keys::KEYWORD_WEIGHT => {
            let w = parse_value::<f32>(key, value)?;
            if !(w.is_finite() && w >= 0.0) {
                return Err(Error::Config(format!(
                    "{key} must be a non-negative number"
                )));
            }
            Ok(())
        }
        keys::MODEL_NAME | keys::OLLAMA_URL | keys::OLLAMA_MODEL => {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{key} must not be empty")));
            }
            Ok(())
        }
        _ => Err(Error::NotFound {
            kind: "setting",
            name: key.to_string(),
        }),
    }
}

fn parsed<T: FromStr>(db: &ConfigDb, key: &str) -> Result<Option<T>> {
    db.get_setting(key)?
        .map(|raw| parse_value(key, &raw))
        .transpose()
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        Error::Config(format!("invalid value for {key}: '{raw}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, ConfigDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = ConfigDb::open(&tmp.path().join("config.redb")).unwrap();
        (tmp, db)
    }

    #[test]
    fn defaults_without_settings() {
        let (_tmp, db) = test_db();
        let config = EngineConfig::resolve(&db).unwrap();
        assert_eq!(config.chunking, ChunkingConfig::default());
        assert_eq!(config.retrieval, RetrievalParams::default());
        assert_eq!(config.retrieval.final_k, 5);
        assert_eq!(config.retrieval.top_n_per_index, 60);
        assert_eq!(config.ollama_model, DEFAULT_OLLAMA_MODEL);
    }

    #[test]
    fn stored_settings_override_defaults() {
        let (_tmp, db) = test_db();
        db.set_setting(keys::CHUNK_SIZE, "1200").unwrap();
        db.set_setting(keys::CHUNK_OVERLAP, "200").unwrap();
        db.set_setting(keys::KEYWORD_WEIGHT, "1").unwrap();
        db.set_setting(keys::SEMANTIC_WEIGHT, "0").unwrap();
        db.set_setting(keys::FINAL_K, "3").unwrap();

        let config = EngineConfig::resolve(&db).unwrap();
        assert_eq!(config.chunking.chunk_size, 1200);
        assert_eq!(config.chunking.overlap, 200);
        assert_eq!(config.retrieval.w_keyword, 1.0);
        assert_eq!(config.retrieval.w_semantic, 0.0);
        assert_eq!(config.retrieval.final_k, 3);
    }

    #[test]
    fn unparsable_setting_is_config_error() {
        let (_tmp, db) = test_db();
        db.set_setting(keys::TOP_N, "many").unwrap();
        let err = EngineConfig::resolve(&db).unwrap_err();
        assert!(err.to_string().contains("top_n"));
    }

    #[test]
    fn invalid_combinations_rejected() {
        let (_tmp, db) = test_db();
        db.set_setting(keys::CHUNK_SIZE, "100").unwrap();
        db.set_setting(keys::CHUNK_OVERLAP, "100").unwrap();
        assert!(EngineConfig::resolve(&db).is_err());

        let (_tmp, db) = test_db();
        db.set_setting(keys::SEMANTIC_WEIGHT, "0").unwrap();
        db.set_setting(keys::KEYWORD_WEIGHT, "0").unwrap();
        assert!(matches!(
            EngineConfig::resolve(&db).unwrap_err(),
            Error::InvalidWeight { .. }
        ));
    }

    #[test]
    fn validate_setting_checks_keys_and_values() {
        assert!(validate_setting(keys::FINAL_K, "7").is_ok());
        assert!(validate_setting(keys::FINAL_K, "-1").is_err());
        assert!(validate_setting(keys::SEMANTIC_WEIGHT, "0.25").is_ok());
        assert!(validate_setting(keys::SEMANTIC_WEIGHT, "-0.5").is_err());
        assert!(validate_setting(keys::OLLAMA_URL, " ").is_err());
        assert!(matches!(
            validate_setting("colour", "blue").unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[test]
    fn zero_final_k_rejected() {
        let params = RetrievalParams {
            final_k: 0,
            ..Default::default()
        };
        assert!(validate_retrieval(&params).is_err());
    }
}
