use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use fusionrag::RetrievalParams;

#[derive(Debug, Parser)]
#[command(
    name = "fusionrag",
    about = "Ask questions over PDFs, text files and notes with hybrid retrieval"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Override the ColBERT model ID or local model path
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load sources and answer a question (or one per stdin line)
    Ask(AskArgs),
    /// Load sources and print the reranked passages for a query
    Search(SearchArgs),
    /// Read and write stored settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show resolved configuration and persisted index state
    Status(StatusArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Sources --

#[derive(Debug, Clone, Default, Args)]
pub struct SourceArgs {
    /// PDF file to load (repeatable)
    #[arg(long = "pdf", value_name = "PATH")]
    pub pdfs: Vec<PathBuf>,

    /// Text file to load, UTF-8 or Shift_JIS (repeatable)
    #[arg(long = "text", value_name = "PATH")]
    pub texts: Vec<PathBuf>,

    /// Inline note as NAME=TEXT (repeatable)
    #[arg(long = "note", value_name = "NAME=TEXT", value_parser = parse_note)]
    pub notes: Vec<(String, String)>,
}

impl SourceArgs {
    pub fn is_empty(&self) -> bool {
        self.pdfs.is_empty() && self.texts.is_empty() && self.notes.is_empty()
    }

    /// Every file path, PDFs first.
    pub fn files(&self) -> Vec<PathBuf> {
        self.pdfs.iter().chain(&self.texts).cloned().collect()
    }
}

fn parse_note(raw: &str) -> Result<(String, String), String> {
    let (name, text) = raw
        .split_once('=')
        .ok_or_else(|| "expected NAME=TEXT".to_string())?;
    let name = name.trim();
    if name.is_empty() {
        return Err("note name must not be empty".to_string());
    }
    Ok((name.to_string(), text.to_string()))
}

// -- Retrieval --

#[derive(Debug, Clone, Default, Args)]
pub struct RetrievalArgs {
    /// Weight of the semantic (vector) ranking
    #[arg(long)]
    pub semantic_weight: Option<f32>,

    /// Weight of the keyword (BM25) ranking
    #[arg(long)]
    pub keyword_weight: Option<f32>,

    /// Candidates taken from each index before fusion
    #[arg(long)]
    pub top_n: Option<usize>,

    /// Fused candidates passed to the reranker
    #[arg(long)]
    pub pool: Option<usize>,

    /// Passages kept after reranking
    #[arg(short = 'k', long)]
    pub final_k: Option<usize>,

    /// Use the built-in hashing embedder and term-overlap scorer instead
    /// of downloading a model
    #[arg(long)]
    pub offline: bool,
}

impl RetrievalArgs {
    /// Apply command-line overrides on top of the configured parameters.
    pub fn apply(&self, mut params: RetrievalParams) -> RetrievalParams {
        if let Some(w) = self.semantic_weight {
            params.w_semantic = w;
        }
        if let Some(w) = self.keyword_weight {
            params.w_keyword = w;
        }
        if let Some(n) = self.top_n {
            params.top_n_per_index = n;
        }
        if let Some(n) = self.pool {
            params.candidate_pool = n;
        }
        if let Some(k) = self.final_k {
            params.final_k = k;
        }
        params
    }
}

// -- Ask --

#[derive(Debug, Parser)]
pub struct AskArgs {
    /// The question; read one per line from stdin when omitted
    pub question: Option<String>,

    #[command(flatten)]
    pub sources: SourceArgs,

    #[command(flatten)]
    pub retrieval: RetrievalArgs,

    /// Prompt template file containing {context} and {question}
    #[arg(long, value_name = "FILE")]
    pub template: Option<PathBuf>,

    /// Keep only the first answer line starting with this marker
    #[arg(long, value_name = "MARKER")]
    pub conclusion: Option<String>,

    /// Print the retrieved context before each answer
    #[arg(long)]
    pub show_context: bool,

    /// Output answers as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    #[command(flatten)]
    pub sources: SourceArgs,

    #[command(flatten)]
    pub retrieval: RetrievalArgs,

    /// Print the fused candidates instead of reranking them
    #[arg(long)]
    pub no_rerank: bool,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print a stored setting
    Get {
        key: String,
    },
    /// Store a setting
    Set {
        key: String,
        value: String,
    },
    /// Remove a stored setting (revert to default)
    Unset {
        key: String,
    },
    /// List every known setting
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "fusionrag",
            &mut std::io::stdout(),
        );
    }
}
