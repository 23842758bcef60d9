//! The retrieval engine.
//!
//! [`Engine`] owns the source registry and the active [`IndexPair`]. All
//! mutation goes through [`add_source`](Engine::add_source),
//! [`build_index`](Engine::build_index) and [`reset`](Engine::reset):
//!
//! - A build snapshots the corpus while holding the registry for reading, so
//!   no source can be added halfway through. Only one build runs at a time.
//! - The new pair replaces the active one in a single pointer swap. Queries
//!   that already hold the previous pair finish against it.
//! - Any change to the sources makes the active pair stale; searching it
//!   then fails with [`Error::IndexNotBuilt`] until the next build.
//!
//! The async methods run each blocking stage on tokio's blocking pool and
//! bound every external-model stage with a timeout.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::{Duration, Instant},
};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    chunking::chunk_source,
    composer::{Answer, AnswerComposer, Completer},
    config::{EngineConfig, validate_retrieval},
    embedding::{ColbertEmbedder, Embedder, HashingEmbedder},
    error::{Error, Result},
    hybrid::{IndexPair, RetrievalCandidate, RetrievalParams},
    loader::load_file,
    model_manager::ModelManager,
    registry::SourceRegistry,
    reranker::{
        ColbertScorer,
        PairScorer,
        RankedChunk,
        TermOverlapScorer,
        rerank,
    },
    source::{Chunk, SourceEntry, SourceInput, SourceType},
    vector_db::VectorDb,
};

/// Summary of a finished index build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub generation: u64,
    pub sources: usize,
    pub chunks: usize,
    pub elapsed_ms: u64,
}

/// Outcome of loading one path in [`Engine::add_files`].
#[derive(Debug)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub result: Result<SourceEntry>,
}

pub struct Engine {
    config: EngineConfig,
    composer: AnswerComposer,
    registry: RwLock<SourceRegistry>,
    active: RwLock<Option<Arc<IndexPair>>>,
    build_lock: Mutex<()>,
    embedder: Arc<dyn Embedder>,
    scorer: Arc<dyn PairScorer>,
    vector_db: Option<Arc<VectorDb>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        embedder: Arc<dyn Embedder>,
        scorer: Arc<dyn PairScorer>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            composer: AnswerComposer::default(),
            registry: RwLock::new(SourceRegistry::new()),
            active: RwLock::new(None),
            build_lock: Mutex::new(()),
            embedder,
            scorer,
            vector_db: None,
        })
    }

    /// Engine backed by one shared ColBERT model for both embedding and
    /// reranking. The model is loaded on first use.
    pub fn with_colbert(config: EngineConfig) -> Result<Self> {
        let model = Arc::new(Mutex::new(ModelManager::new(
            config.model_name.clone(),
        )));
        let embedder = Arc::new(ColbertEmbedder::new(Arc::clone(&model))?);
        let scorer = Arc::new(ColbertScorer::new(model));
        Self::new(config, embedder, scorer)
    }

    /// Engine with the deterministic model-free collaborators.
    pub fn offline(config: EngineConfig) -> Result<Self> {
        Self::new(
            config,
            Arc::new(HashingEmbedder::default()),
            Arc::new(TermOverlapScorer),
        )
    }

    /// Persist the semantic index so unchanged corpora skip re-embedding.
    pub fn with_vector_db(mut self, db: VectorDb) -> Self {
        self.vector_db = Some(Arc::new(db));
        self
    }

    pub fn with_composer(mut self, composer: AnswerComposer) -> Self {
        self.composer = composer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Retrieval parameters from the configuration.
    pub fn params(&self) -> RetrievalParams {
        self.config.retrieval
    }

    pub fn embedder_id(&self) -> &str {
        self.embedder.model_id()
    }

    // -- Ingestion --

    /// Chunk a source and append it to the corpus.
    ///
    /// Duplicate names are rejected within one source type. On any error the
    /// corpus is unchanged.
    pub fn add_source(&self, input: SourceInput) -> Result<SourceEntry> {
        let chunks = chunk_source(&input, &self.config.chunking)?;
        self.register(&input, chunks)
    }

    /// Add user-entered text under a label.
    pub fn add_manual_text(
        &self,
        label: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<SourceEntry> {
        self.add_source(SourceInput::new(SourceType::ManualText, label, text))
    }

    /// Load a PDF or text file and add it.
    pub fn add_file(&self, path: &Path) -> Result<SourceEntry> {
        self.add_source(load_file(path)?)
    }

    /// Load and chunk many files in parallel, then register them in the
    /// given order. A failing path does not stop the others.
    pub fn add_files(&self, paths: &[PathBuf]) -> Vec<FileOutcome> {
        let prepared: Vec<Result<(SourceInput, Vec<Chunk>)>> = paths
            .par_iter()
            .map(|path| {
                let input = load_file(path)?;
                let chunks = chunk_source(&input, &self.config.chunking)?;
                Ok((input, chunks))
            })
            .collect();

        paths
            .iter()
            .zip(prepared)
            .map(|(path, prepared)| {
                let result = prepared
                    .and_then(|(input, chunks)| self.register(&input, chunks));
                if let Err(e) = &result {
                    warn!(path = %path.display(), error = %e, "source skipped");
                }
                FileOutcome {
                    path: path.clone(),
                    result,
                }
            })
            .collect()
    }

    fn register(
        &self,
        input: &SourceInput,
        chunks: Vec<Chunk>,
    ) -> Result<SourceEntry> {
        let entry = self.write_registry()?.add_source(
            input.source_type,
            &input.source_name,
            chunks,
        )?;
        info!(
            source_type = %entry.source_type,
            source_name = %entry.source_name,
            chunks = entry.chunk_count,
            "source added"
        );
        Ok(entry)
    }

    // -- State --

    /// Source entries in insertion order.
    pub fn sources(&self) -> Result<Vec<SourceEntry>> {
        Ok(self.read_registry()?.entries().to_vec())
    }

    pub fn corpus_len(&self) -> Result<usize> {
        Ok(self.read_registry()?.corpus_len())
    }

    /// Drop every source, the active index, and any persisted vectors.
    pub fn reset(&self) -> Result<()> {
        let mut registry = self.write_registry()?;
        registry.reset();
        *self.write_active()? = None;
        if let Some(db) = &self.vector_db {
            db.clear()?;
        }
        info!("engine reset");
        Ok(())
    }

    /// Build a fresh index pair from the current corpus and make it active.
    ///
    /// On failure nothing is published and the previous pair stays active
    /// (though still stale if sources changed).
    pub fn build_index(&self) -> Result<BuildReport> {
        let _build = self
            .build_lock
            .lock()
            .map_err(|_| poisoned("index build lock"))?;
        let registry = self.read_registry()?;

        let start = Instant::now();
        let generation = registry.generation();
        if registry.corpus_len() > 0 {
            self.embedder.warm_up()?;
        }
        let pair = IndexPair::build(
            generation,
            registry.all_chunks(),
            self.embedder.as_ref(),
            self.config.embed_batch_size,
            self.vector_db.as_deref(),
        )?;

        let report = BuildReport {
            generation,
            sources: registry.entries().len(),
            chunks: pair.len(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        };
        *self.write_active()? = Some(Arc::new(pair));
        drop(registry);

        info!(
            generation = report.generation,
            sources = report.sources,
            chunks = report.chunks,
            elapsed_ms = report.elapsed_ms,
            "index built"
        );
        Ok(report)
    }

    /// True when an index exists and no source changed since it was built.
    pub fn is_index_current(&self) -> Result<bool> {
        Ok(self.current_index().is_ok())
    }

    /// The active pair, provided it matches the current sources.
    pub fn current_index(&self) -> Result<Arc<IndexPair>> {
        let registry = self.read_registry()?;
        let active = self.read_active()?;
        match active.as_ref() {
            Some(pair) if pair.generation() == registry.generation() => {
                Ok(Arc::clone(pair))
            }
            _ => Err(Error::IndexNotBuilt),
        }
    }

    // -- Query --

    /// Hybrid search: the fused, deduplicated candidate pool.
    pub fn search(
        &self,
        query: &str,
        params: &RetrievalParams,
    ) -> Result<Vec<RetrievalCandidate>> {
        validate_retrieval(params)?;
        let pair = self.current_index()?;
        pair.search(self.embedder.as_ref(), query, params)
    }

    /// Hybrid search followed by reranking to `final_k`.
    pub fn retrieve(
        &self,
        query: &str,
        params: &RetrievalParams,
    ) -> Result<Vec<RankedChunk>> {
        let candidates = self.search(query, params)?;
        rerank(self.scorer.as_ref(), query, candidates, params.final_k)
    }

    // -- Async surface --

    /// [`build_index`](Self::build_index) on the blocking pool.
    pub async fn build_index_task(self: &Arc<Self>) -> Result<BuildReport> {
        let engine = Arc::clone(self);
        tokio::task::spawn_blocking(move || engine.build_index())
            .await
            .map_err(|e| Error::Worker(format!("index build task: {e}")))?
    }

    /// [`retrieve`](Self::retrieve) with each model stage bounded by
    /// `model_timeout`.
    ///
    /// Dropping the future abandons the query; the engine is not modified.
    pub async fn retrieve_async(
        self: &Arc<Self>,
        query: &str,
        params: RetrievalParams,
    ) -> Result<Vec<RankedChunk>> {
        validate_retrieval(&params)?;
        let timeout = self.config.model_timeout;

        let engine = Arc::clone(self);
        let q = query.to_string();
        let candidates = run_stage("hybrid search", timeout, move || {
            engine.search(&q, &params)
        })
        .await?;

        let scorer = Arc::clone(&self.scorer);
        let q = query.to_string();
        let final_k = params.final_k;
        run_stage("rerank", timeout, move || {
            rerank(scorer.as_ref(), &q, candidates, final_k)
        })
        .await
    }

    /// Retrieve, then call the completer once with the composed prompt.
    pub async fn answer(
        self: &Arc<Self>,
        question: &str,
        completer: Arc<dyn Completer>,
        params: RetrievalParams,
    ) -> Result<Answer> {
        let ranked = self.retrieve_async(question, params).await?;

        let composer = self.composer.clone();
        let q = question.to_string();
        run_stage("completion", self.config.completion_timeout, move || {
            composer.compose(&q, &ranked, completer.as_ref())
        })
        .await
    }

    // -- Locks --

    fn read_registry(&self) -> Result<RwLockReadGuard<'_, SourceRegistry>> {
        self.registry.read().map_err(|_| poisoned("source registry"))
    }

    fn write_registry(&self) -> Result<RwLockWriteGuard<'_, SourceRegistry>> {
        self.registry.write().map_err(|_| poisoned("source registry"))
    }

    fn read_active(
        &self,
    ) -> Result<RwLockReadGuard<'_, Option<Arc<IndexPair>>>> {
        self.active.read().map_err(|_| poisoned("active index"))
    }

    fn write_active(
        &self,
    ) -> Result<RwLockWriteGuard<'_, Option<Arc<IndexPair>>>> {
        self.active.write().map_err(|_| poisoned("active index"))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("embedder", &self.embedder.model_id())
            .field("persistent", &self.vector_db.is_some())
            .finish_non_exhaustive()
    }
}

fn poisoned(what: &str) -> Error {
    Error::Worker(format!("{what} lock poisoned by a panicked task"))
}

/// Run blocking work on the blocking pool, failing with
/// [`Error::RetrievalTimeout`] if it does not finish in time.
async fn run_stage<T, F>(
    stage: &'static str,
    timeout: Duration,
    work: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(work);
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(Error::Worker(format!("{stage} task: {e}"))),
        Err(_) => {
            warn!(stage, ?timeout, "stage timed out");
            Err(Error::RetrievalTimeout { stage, timeout })
        }
    }
}
