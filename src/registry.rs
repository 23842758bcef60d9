use std::sync::Arc;

use tracing::debug;

use crate::{
    error::{Error, Result},
    source::{Chunk, SourceEntry, SourceType},
};

/// Snapshot of every chunk in insertion order.
///
/// Snapshots are cheap to take and never change underneath their holder;
/// adding a source after a snapshot was taken copies the chunk list instead
/// of mutating the shared one.
pub type Corpus = Arc<Vec<Chunk>>;

/// In-memory collection of ingested chunks plus the source manifest.
///
/// Duplicate `source_name`s are rejected within one [`SourceType`]. The same
/// name may appear once per type; chunk identity includes the type, so the
/// two never collide.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    corpus: Corpus,
    entries: Vec<SourceEntry>,
    generation: u64,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a source's chunks to the corpus and record its entry.
    ///
    /// The corpus is left untouched when validation fails.
    pub fn add_source(
        &mut self,
        source_type: SourceType,
        source_name: &str,
        chunks: Vec<Chunk>,
    ) -> Result<SourceEntry> {
        if self.contains(source_type, source_name) {
            return Err(Error::DuplicateSource {
                source_type,
                source_name: source_name.to_string(),
            });
        }
        if chunks.is_empty() {
            return Err(Error::EmptyInput {
                source_name: source_name.to_string(),
            });
        }
        for (expected_id, chunk) in chunks.iter().enumerate() {
            validate_provenance(chunk, source_type, source_name, expected_id)?;
        }

        let entry = SourceEntry {
            source_type,
            source_name: source_name.to_string(),
            chunk_count: chunks.len(),
        };

        Arc::make_mut(&mut self.corpus).extend(chunks);
        self.entries.push(entry.clone());
        self.generation += 1;

        debug!(
            source_type = %source_type,
            source_name,
            chunks = entry.chunk_count,
            corpus = self.corpus.len(),
            "source added"
        );
        Ok(entry)
    }

    pub fn contains(&self, source_type: SourceType, source_name: &str) -> bool {
        self.entries.iter().any(|e| {
            e.source_type == source_type && e.source_name == source_name
        })
    }

    /// Current corpus snapshot.
    pub fn all_chunks(&self) -> Corpus {
        Arc::clone(&self.corpus)
    }

    /// Source entries in insertion order.
    pub fn entries(&self) -> &[SourceEntry] {
        &self.entries
    }

    pub fn corpus_len(&self) -> usize {
        self.corpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.corpus.is_empty()
    }

    /// Bumped on every change to the source composition. Indexes remember
    /// the generation they were built from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Drop every source and chunk.
    pub fn reset(&mut self) {
        self.corpus = Corpus::default();
        self.entries.clear();
        self.generation += 1;
    }
}

fn validate_provenance(
    chunk: &Chunk,
    source_type: SourceType,
    source_name: &str,
    expected_id: usize,
) -> Result<()> {
    let reason = if chunk.source_type() != source_type {
        format!(
            "chunk {} is tagged {} but the source is {source_type}",
            chunk.chunk_id(),
            chunk.source_type()
        )
    } else if chunk.source_name() != source_name {
        format!(
            "chunk {} is tagged '{}'",
            chunk.chunk_id(),
            chunk.source_name()
        )
    } else if chunk.chunk_id() != expected_id {
        format!(
            "chunk ids must be contiguous from 0, found {} at position {expected_id}",
            chunk.chunk_id()
        )
    } else {
        return Ok(());
    };

    Err(Error::InvalidChunk {
        source_name: source_name.to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(source_type: SourceType, name: &str, n: usize) -> Vec<Chunk> {
        (0..n)
            .map(|i| Chunk::new(format!("text {i}"), source_type, name, i))
            .collect::<Result<_>>()
            .unwrap()
    }

    fn pdf(name: &str, n: usize) -> Vec<Chunk> {
        chunks(SourceType::Pdf, name, n)
    }

    #[test]
    fn corpus_size_is_sum_of_sources() {
        let mut reg = SourceRegistry::new();
        reg.add_source(SourceType::Pdf, "a.pdf", pdf("a.pdf", 3))
            .unwrap();
        reg.add_source(
            SourceType::TextFile,
            "b.txt",
            chunks(SourceType::TextFile, "b.txt", 2),
        )
        .unwrap();
        reg.add_source(
            SourceType::ManualText,
            "memo",
            chunks(SourceType::ManualText, "memo", 4),
        )
        .unwrap();

        assert_eq!(reg.corpus_len(), 9);
        let total: usize = reg.entries().iter().map(|e| e.chunk_count).sum();
        assert_eq!(total, reg.corpus_len());
        assert_eq!(reg.entries()[1].source_name, "b.txt");
    }

    #[test]
    fn duplicate_within_type_rejected() {
        let mut reg = SourceRegistry::new();
        reg.add_source(SourceType::Pdf, "a.pdf", pdf("a.pdf", 1))
            .unwrap();
        let before = reg.generation();

        let err = reg
            .add_source(SourceType::Pdf, "a.pdf", pdf("a.pdf", 2))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateSource { .. }));
        assert_eq!(reg.corpus_len(), 1);
        assert_eq!(reg.generation(), before);
    }

    #[test]
    fn same_name_allowed_across_types() {
        let mut reg = SourceRegistry::new();
        reg.add_source(SourceType::Pdf, "report", pdf("report", 1))
            .unwrap();
        reg.add_source(
            SourceType::ManualText,
            "report",
            chunks(SourceType::ManualText, "report", 1),
        )
        .unwrap();
        assert_eq!(reg.entries().len(), 2);
    }

    #[test]
    fn mismatched_provenance_rejected() {
        let mut reg = SourceRegistry::new();
        let err = reg
            .add_source(SourceType::Pdf, "a.pdf", pdf("other.pdf", 1))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidChunk { .. }));

        let mut gap = pdf("a.pdf", 3);
        gap.remove(1);
        let err = reg.add_source(SourceType::Pdf, "a.pdf", gap).unwrap_err();
        assert!(matches!(err, Error::InvalidChunk { .. }));
        assert!(reg.is_empty());
    }

    #[test]
    fn empty_source_rejected() {
        let mut reg = SourceRegistry::new();
        let err = reg
            .add_source(SourceType::ManualText, "memo", Vec::new())
            .unwrap_err();
        assert!(matches!(err, Error::EmptyInput { .. }));
        assert_eq!(reg.corpus_len(), 0);
    }

    #[test]
    fn snapshots_are_isolated_from_later_adds() {
        let mut reg = SourceRegistry::new();
        reg.add_source(SourceType::Pdf, "a.pdf", pdf("a.pdf", 2))
            .unwrap();
        let snapshot = reg.all_chunks();

        reg.add_source(
            SourceType::TextFile,
            "b.txt",
            chunks(SourceType::TextFile, "b.txt", 2),
        )
        .unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(reg.all_chunks().len(), 4);
    }

    #[test]
    fn reset_clears_everything_and_bumps_generation() {
        let mut reg = SourceRegistry::new();
        reg.add_source(SourceType::Pdf, "a.pdf", pdf("a.pdf", 2))
            .unwrap();
        let before = reg.generation();

        reg.reset();
        assert_eq!(reg.corpus_len(), 0);
        assert!(reg.entries().is_empty());
        assert!(reg.generation() > before);

        // The name is free again after a reset.
        reg.add_source(SourceType::Pdf, "a.pdf", pdf("a.pdf", 1))
            .unwrap();
    }
}
