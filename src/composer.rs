//! Turning reranked chunks and a question into an answer.
//!
//! The composer builds one context block from the top-K chunks, each
//! prefixed with its provenance tag, fills the prompt template, and makes a
//! single call to a [`Completer`].

use serde::Serialize;
use tracing::debug;

use crate::{
    error::{Error, Result},
    reranker::RankedChunk,
    source::SourceType,
};

/// Placeholder replaced by the context block.
pub const CONTEXT_PLACEHOLDER: &str = "{context}";
/// Placeholder replaced by the user's question.
pub const QUESTION_PLACEHOLDER: &str = "{question}";

pub const DEFAULT_TEMPLATE: &str = "\
You are a question answering system. Answer the question using the context below.

[Context]
{context}

[Question]
{question}

[Rules]
- Use only facts stated in the context.
- Do not mix in guesses or general knowledge.
- If the context does not contain the answer, say so plainly.

[Answer]";

/// Returned when retrieval found nothing, without calling the model.
pub const NO_INFORMATION_ANSWER: &str =
    "No relevant information was found in the loaded sources.";

/// A text-completion service. Called at most once per question.
pub trait Completer: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String>;
}

/// How many of the context chunks came from one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceUsage {
    pub source_type: SourceType,
    pub source_name: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    /// Sources in order of their first appearance in the context.
    pub sources_used: Vec<SourceUsage>,
    /// The context block that was sent to the model.
    pub context: String,
}

#[derive(Debug, Clone)]
pub struct AnswerComposer {
    template: String,
    conclusion_marker: Option<String>,
}

impl Default for AnswerComposer {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
            conclusion_marker: None,
        }
    }
}

impl AnswerComposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom prompt template. It must contain both `{context}` and
    /// `{question}`.
    pub fn with_template(
        mut self,
        template: impl Into<String>,
    ) -> Result<Self> {
        let template = template.into();
        for placeholder in [CONTEXT_PLACEHOLDER, QUESTION_PLACEHOLDER] {
            if !template.contains(placeholder) {
                return Err(Error::Config(format!(
                    "prompt template is missing {placeholder}"
                )));
            }
        }
        self.template = template;
        Ok(self)
    }

    /// Reduce the model's reply to the first line starting with `marker`.
    pub fn with_conclusion_marker(mut self, marker: impl Into<String>) -> Self {
        self.conclusion_marker = Some(marker.into());
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Fill the template in one pass, so text inside the context that looks
    /// like a placeholder is left alone.
    ///
    /// # Examples
    ///
    /// ```
    /// use fusionrag::AnswerComposer;
    ///
    /// let c = AnswerComposer::new()
    ///     .with_template("C={context} Q={question}")
    ///     .unwrap();
    /// assert_eq!(c.render("{question}", "why?"), "C={question} Q=why?");
    /// ```
    pub fn render(&self, context: &str, question: &str) -> String {
        self.template
            .split(CONTEXT_PLACEHOLDER)
            .map(|part| part.replace(QUESTION_PLACEHOLDER, question))
            .collect::<Vec<_>>()
            .join(context)
    }

    /// Ask the completer and package the answer. An empty `ranked` list
    /// short-circuits to [`NO_INFORMATION_ANSWER`].
    pub fn compose(
        &self,
        question: &str,
        ranked: &[RankedChunk],
        completer: &dyn Completer,
    ) -> Result<Answer> {
        if ranked.is_empty() {
            return Ok(Answer {
                text: NO_INFORMATION_ANSWER.to_string(),
                sources_used: Vec::new(),
                context: String::new(),
            });
        }

        let context = context_block(ranked);
        let prompt = self.render(&context, question);
        debug!(
            chunks = ranked.len(),
            prompt_chars = prompt.chars().count(),
            "calling completion service"
        );

        let raw = completer.complete(&prompt)?;
        let text = match &self.conclusion_marker {
            Some(marker) => extract_conclusion(&raw, marker),
            None => raw.trim().to_string(),
        };

        Ok(Answer {
            text,
            sources_used: sources_used(ranked),
            context,
        })
    }
}

/// Each chunk prefixed with its provenance tag, joined by blank lines.
pub fn context_block(ranked: &[RankedChunk]) -> String {
    ranked
        .iter()
        .map(|r| format!("{}\n{}", r.chunk.provenance_tag(), r.chunk.text()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn sources_used(ranked: &[RankedChunk]) -> Vec<SourceUsage> {
    let mut usage: Vec<SourceUsage> = Vec::new();
    for r in ranked {
        let (source_type, source_name) =
            (r.chunk.source_type(), r.chunk.source_name());
        match usage.iter_mut().find(|u| {
            u.source_type == source_type && u.source_name == source_name
        }) {
            Some(u) => u.count += 1,
            None => usage.push(SourceUsage {
                source_type,
                source_name: source_name.to_string(),
                count: 1,
            }),
        }
    }
    usage
}

/// First line of `raw` that starts with `marker`, or the first line when
/// none does.
///
/// # Examples
///
/// ```
/// use fusionrag::composer::extract_conclusion;
///
/// let raw = "Thinking...\n  Conclusion: use rust\nmore";
/// assert_eq!(extract_conclusion(raw, "Conclusion"), "Conclusion: use rust");
/// assert_eq!(extract_conclusion("only line\nnext", "Conclusion"), "only line");
/// ```
pub fn extract_conclusion(raw: &str, marker: &str) -> String {
    raw.lines()
        .map(str::trim)
        .find(|line| line.starts_with(marker))
        .or_else(|| raw.lines().next().map(str::trim))
        .unwrap_or_default()
        .to_string()
}
