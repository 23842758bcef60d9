use std::collections::BTreeSet;

use tantivy::{
    Index,
    IndexReader,
    TantivyDocument,
    Term,
    collector::TopDocs,
    doc,
    query::{BooleanQuery, Occur, Query, TermQuery},
    schema::*,
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
        TokenStream,
    },
};

use crate::{
    error::{Error, Result},
    source::Chunk,
};

/// Writer memory budget used for every build.
const WRITER_MEMORY_BUDGET: usize = 15_000_000;

const TOKENIZER: &str = "en_stem";

/// Field names used in the schema.
pub mod fields {
    pub const POSITION: &str = "position";
    pub const BODY: &str = "body";
}

/// A chunk reference (its corpus position) with the score an index gave it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredChunk {
    pub position: usize,
    pub score: f32,
}

/// Order by score descending, then corpus position ascending.
pub(crate) fn rank_and_truncate(
    mut hits: Vec<ScoredChunk>,
    top_n: usize,
) -> Vec<ScoredChunk> {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.position.cmp(&b.position))
    });
    hits.truncate(top_n);
    hits
}

/// BM25 keyword index over one corpus snapshot.
///
/// Built in RAM in one shot; there is no incremental update. Documents are
/// keyed by their position in the corpus the index was built from.
pub struct LexicalIndex {
    index: Index,
    reader: IndexReader,
    position: Field,
    body: Field,
    len: usize,
}

fn build_schema() -> (Schema, Field, Field) {
    let mut builder = Schema::builder();

    let position = builder.add_u64_field(fields::POSITION, STORED | FAST);

    let body_opts = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(TOKENIZER)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    );
    let body = builder.add_text_field(fields::BODY, body_opts);

    (builder.build(), position, body)
}

fn register_tokenizers(index: &Index) {
    let en_stem = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build();
    index.tokenizers().register(TOKENIZER, en_stem);
}

impl LexicalIndex {
    /// Index every chunk of the corpus. The index becomes visible only after
    /// the single commit at the end.
    pub fn build(corpus: &[Chunk]) -> Result<Self> {
        let (schema, position, body) = build_schema();
        let index = Index::create_in_ram(schema);
        register_tokenizers(&index);

        if !corpus.is_empty() {
            let mut writer: tantivy::IndexWriter =
                index.writer(WRITER_MEMORY_BUDGET)?;
            for (pos, chunk) in corpus.iter().enumerate() {
                writer.add_document(doc!(
                    position => pos as u64,
                    body => chunk.text(),
                ))?;
            }
            writer.commit()?;
        }

        let reader = index.reader()?;
        reader.reload()?;

        Ok(Self {
            index,
            reader,
            position,
            body,
            len: corpus.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Score the query against every chunk and return the `top_n` best.
    ///
    /// The query is free text, not query syntax: it goes through the same
    /// analyzer as the chunks and any chunk sharing a term matches. Ties keep
    /// corpus order. An empty corpus yields an empty result.
    pub fn query(&self, text: &str, top_n: usize) -> Result<Vec<ScoredChunk>> {
        if self.len == 0 || top_n == 0 {
            return Ok(Vec::new());
        }

        let terms = self.analyze(text)?;
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let clauses: Vec<(Occur, Box<dyn Query>)> = terms
            .into_iter()
            .map(|t| {
                let term = Term::from_field_text(self.body, &t);
                let query = TermQuery::new(term, IndexRecordOption::WithFreqs);
                (Occur::Should, Box::new(query) as Box<dyn Query>)
            })
            .collect();
        let query = BooleanQuery::new(clauses);

        // Collect every match so equal scores can be ordered by position
        // rather than by segment layout.
        let searcher = self.reader.searcher();
        let top_docs =
            searcher.search(&query, &TopDocs::with_limit(self.len))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher.doc(doc_address)?;
            let Some(pos) =
                doc.get_first(self.position).and_then(|v| v.as_u64())
            else {
                continue;
            };
            hits.push(ScoredChunk {
                position: pos as usize,
                score,
            });
        }

        Ok(rank_and_truncate(hits, top_n))
    }

    /// Distinct analyzed terms of `text`.
    fn analyze(&self, text: &str) -> Result<BTreeSet<String>> {
        let mut analyzer =
            self.index.tokenizers().get(TOKENIZER).ok_or_else(|| {
                Error::Config(format!("tokenizer {TOKENIZER} is not registered"))
            })?;
        let mut terms = BTreeSet::new();
        let mut stream = analyzer.token_stream(text);
        while stream.advance() {
            terms.insert(stream.token().text.clone());
        }
        Ok(terms)
    }
}

impl std::fmt::Debug for LexicalIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LexicalIndex")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}
