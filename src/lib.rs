//! fusionrag - question answering over PDFs, text files and notes.
//!
//! Sources are normalised into provenance-tagged chunks, indexed twice
//! (BM25 via [Tantivy](https://github.com/quickwit-oss/tantivy) and dense
//! vectors), searched with weighted reciprocal-rank fusion, and reranked
//! with a pairwise relevance model before the best passages are handed to a
//! language model.
//!
//! # Quick start
//!
//! ```
//! use fusionrag::{Engine, EngineConfig, RetrievalParams};
//!
//! let engine = Engine::offline(EngineConfig::default()).unwrap();
//! engine
//!     .add_manual_text("memo", "Cargo is the Rust package manager.")
//!     .unwrap();
//! engine.build_index().unwrap();
//!
//! let params = RetrievalParams {
//!     w_semantic: 0.0,
//!     w_keyword: 1.0,
//!     ..Default::default()
//! };
//! let results = engine.retrieve("package manager", &params).unwrap();
//! assert_eq!(results[0].chunk.source_name(), "memo");
//! ```

pub mod chunking;
pub mod composer;
pub mod config;
pub mod config_db;
pub mod data_dir;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod hybrid;
pub mod lexical;
pub mod loader;
pub mod model_manager;
pub mod ollama;
pub mod registry;
pub mod reranker;
pub mod semantic;
pub mod source;
pub mod vector_db;

pub use chunking::{ChunkingConfig, chunk};
pub use composer::{Answer, AnswerComposer, Completer};
pub use config::EngineConfig;
pub use config_db::ConfigDb;
pub use data_dir::DataDir;
pub use embedding::{ColbertEmbedder, Embedder, HashingEmbedder};
pub use engine::{BuildReport, Engine};
pub use error::{Error, Result};
pub use hybrid::{IndexPair, RetrievalCandidate, RetrievalParams};
pub use lexical::LexicalIndex;
pub use model_manager::ModelManager;
pub use ollama::OllamaCompleter;
pub use registry::SourceRegistry;
pub use reranker::{
    ColbertScorer,
    PairScorer,
    RankedChunk,
    TermOverlapScorer,
    rerank,
};
pub use semantic::SemanticIndex;
pub use source::{Chunk, ChunkKey, SourceEntry, SourceInput, SourceType};
pub use vector_db::VectorDb;
