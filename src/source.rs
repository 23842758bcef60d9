//! Provenance-tagged chunks and source entries.
//!
//! A [`Chunk`] is the atomic unit of retrieval. Its provenance (source type,
//! source name, chunk id) is fixed at construction and validated there, so
//! nothing downstream ever sees a chunk without a known origin.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Where a source's text came from.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Pdf,
    TextFile,
    ManualText,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Pdf => "pdf",
            SourceType::TextFile => "text_file",
            SourceType::ManualText => "manual_text",
        }
    }

    /// Short human-readable label used in provenance tags.
    pub fn label(self) -> &'static str {
        match self {
            SourceType::Pdf => "PDF",
            SourceType::TextFile => "TXT",
            SourceType::ManualText => "MANUAL",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of a chunk across index builds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChunkKey {
    pub source_type: SourceType,
    pub source_name: String,
    pub chunk_id: usize,
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.source_type, self.source_name, self.chunk_id)
    }
}

/// An immutable span of source text tagged with its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    text: String,
    source_type: SourceType,
    source_name: String,
    chunk_id: usize,
}

impl Chunk {
    /// Build a chunk, rejecting empty text or a missing source name.
    pub fn new(
        text: impl Into<String>,
        source_type: SourceType,
        source_name: impl Into<String>,
        chunk_id: usize,
    ) -> Result<Self> {
        let text = text.into();
        let source_name = source_name.into();

        if source_name.trim().is_empty() {
            return Err(Error::InvalidChunk {
                source_name,
                reason: "source name is empty".to_string(),
            });
        }
        if text.trim().is_empty() {
            return Err(Error::InvalidChunk {
                source_name,
                reason: format!("chunk {chunk_id} has no text"),
            });
        }

        Ok(Self {
            text,
            source_type,
            source_name,
            chunk_id,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn chunk_id(&self) -> usize {
        self.chunk_id
    }

    pub fn key(&self) -> ChunkKey {
        ChunkKey {
            source_type: self.source_type,
            source_name: self.source_name.clone(),
            chunk_id: self.chunk_id,
        }
    }

    /// The `[TYPE: name]` tag placed in front of the chunk's text when it is
    /// handed to the answer composer.
    pub fn provenance_tag(&self) -> String {
        format!("[{}: {}]", self.source_type.label(), self.source_name)
    }
}

/// One ingested document or text blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceEntry {
    pub source_type: SourceType,
    pub source_name: String,
    pub chunk_count: usize,
}

/// Raw text plus declared provenance, as produced by the loaders.
#[derive(Debug, Clone)]
pub struct SourceInput {
    pub source_type: SourceType,
    pub source_name: String,
    pub text: String,
}

impl SourceInput {
    pub fn new(
        source_type: SourceType,
        source_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            source_type,
            source_name: source_name.into(),
            text: text.into(),
        }
    }
}
