use std::sync::Arc;

use clap::Parser;
use fusionrag::{
    AnswerComposer,
    Completer,
    ConfigDb,
    DataDir,
    Engine,
    EngineConfig,
    Error,
    OllamaCompleter,
    RankedChunk,
    RetrievalCandidate,
    RetrievalParams,
    Result,
    VectorDb,
    config::{keys, validate_setting},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{
    AskArgs,
    Cli,
    Command,
    ConfigAction,
    RetrievalArgs,
    SearchArgs,
    SourceArgs,
};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("FUSIONRAG_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    init_tracing(cli.verbose, cli.quiet);

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config_db = ConfigDb::open(&data_dir.config_db())?;

    match cli.command {
        Command::Ask(args) => {
            cmd_ask(&data_dir, &config_db, cli.model, args).await?;
        }
        Command::Search(args) => {
            cmd_search(&data_dir, &config_db, cli.model, args).await?;
        }
        Command::Config { action } => {
            cmd_config(&config_db, action)?;
        }
        Command::Status(args) => {
            cmd_status(&data_dir, &config_db, args.json)?;
        }
        Command::Completions(_) => {}
    }

    Ok(())
}

/// Resolve configuration, pick the model collaborators, and attach the
/// persistent vector store.
fn open_engine(
    data_dir: &DataDir,
    config_db: &ConfigDb,
    model: Option<String>,
    retrieval: &RetrievalArgs,
) -> Result<Engine> {
    let mut config = EngineConfig::resolve(config_db)?;
    if let Some(model) = model {
        config.model_name = model;
    }

    let engine = if retrieval.offline {
        Engine::offline(config)?
    } else {
        Engine::with_colbert(config)?
    };
    let vectors = VectorDb::open(&data_dir.vectors_db())?;
    Ok(engine.with_vector_db(vectors))
}

/// Load every requested source, then build the index.
///
/// Individual sources may fail; the command only fails when none loaded.
async fn ingest_and_build(
    engine: &Arc<Engine>,
    sources: &SourceArgs,
) -> Result<()> {
    if sources.is_empty() {
        return Err(Error::Config(
            "no sources given; pass --pdf, --text or --note".to_string(),
        ));
    }

    let mut loaded = 0;
    for outcome in engine.add_files(&sources.files()) {
        match outcome.result {
            Ok(entry) => {
                loaded += 1;
                eprintln!(
                    "Loaded [{}] {} ({} chunks)",
                    entry.source_type.label(),
                    entry.source_name,
                    entry.chunk_count
                );
            }
            Err(e) => eprintln!("Skipped {}: {e}", outcome.path.display()),
        }
    }
    for (name, text) in &sources.notes {
        match engine.add_manual_text(name.as_str(), text.as_str()) {
            Ok(entry) => {
                loaded += 1;
                eprintln!(
                    "Loaded [MANUAL] {} ({} chunks)",
                    entry.source_name, entry.chunk_count
                );
            }
            Err(e) => eprintln!("Skipped note '{name}': {e}"),
        }
    }

    if loaded == 0 {
        return Err(Error::Config("none of the sources could be loaded".into()));
    }

    let report = engine.build_index_task().await?;
    info!(
        sources = report.sources,
        chunks = report.chunks,
        elapsed_ms = report.elapsed_ms,
        "ready"
    );
    Ok(())
}

async fn cmd_ask(
    data_dir: &DataDir,
    config_db: &ConfigDb,
    model: Option<String>,
    args: AskArgs,
) -> Result<()> {
    let mut composer = AnswerComposer::new();
    if let Some(path) = &args.template {
        composer = composer.with_template(std::fs::read_to_string(path)?)?;
    }
    if let Some(marker) = &args.conclusion {
        composer = composer.with_conclusion_marker(marker.clone());
    }

    let engine = Arc::new(
        open_engine(data_dir, config_db, model, &args.retrieval)?
            .with_composer(composer),
    );
    let config = engine.config();
    let completer: Arc<dyn Completer> = Arc::new(OllamaCompleter::new(
        config.ollama_url.clone(),
        config.ollama_model.clone(),
        config.completion_timeout,
    ));

    ingest_and_build(&engine, &args.sources).await?;
    let params = args.retrieval.apply(engine.params());

    if let Some(question) = &args.question {
        return ask_one(&engine, &completer, question, params, &args).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        // One failed question does not end the session.
        let outcome =
            ask_one(&engine, &completer, question, params, &args).await;
        if let Err(e) = outcome {
            warn!(error = %e, "question failed");
            eprintln!("Error: {e}");
        }
    }
    Ok(())
}

async fn ask_one(
    engine: &Arc<Engine>,
    completer: &Arc<dyn Completer>,
    question: &str,
    params: RetrievalParams,
    args: &AskArgs,
) -> Result<()> {
    let answer = engine
        .answer(question, Arc::clone(completer), params)
        .await?;

    if args.json {
        let value = serde_json::json!({
            "question": question,
            "answer": answer,
        });
        println!("{}", to_json(&value)?);
        return Ok(());
    }

    if args.show_context && !answer.context.is_empty() {
        println!("{}\n", answer.context);
    }
    if !answer.sources_used.is_empty() {
        let used: Vec<String> = answer
            .sources_used
            .iter()
            .map(|u| format!("{} ({})", u.source_name, u.count))
            .collect();
        eprintln!("Sources: {}", used.join(", "));
    }
    println!("{}", answer.text);
    Ok(())
}

async fn cmd_search(
    data_dir: &DataDir,
    config_db: &ConfigDb,
    model: Option<String>,
    args: SearchArgs,
) -> Result<()> {
    let engine =
        Arc::new(open_engine(data_dir, config_db, model, &args.retrieval)?);
    ingest_and_build(&engine, &args.sources).await?;
    let params = args.retrieval.apply(engine.params());

    if args.no_rerank {
        let candidates = engine.search(&args.query, &params)?;
        if args.json {
            let value = serde_json::json!({
                "query": args.query,
                "candidates": candidates,
            });
            println!("{}", to_json(&value)?);
        } else {
            print_candidates(&candidates);
        }
        return Ok(());
    }

    let ranked = engine.retrieve_async(&args.query, params).await?;
    if args.json {
        let value = serde_json::json!({
            "query": args.query,
            "results": ranked,
        });
        println!("{}", to_json(&value)?);
    } else {
        print_ranked(&ranked);
    }
    Ok(())
}

fn print_ranked(results: &[RankedChunk]) {
    if results.is_empty() {
        println!("No results.");
        return;
    }
    for (i, r) in results.iter().enumerate() {
        println!(
            "{:>3}. {} #{}  score {:.4}  (hybrid rank {})",
            i + 1,
            r.chunk.provenance_tag(),
            r.chunk.chunk_id(),
            r.score,
            r.hybrid_rank
        );
        println!("     {}", preview(r.chunk.text()));
    }
}

fn print_candidates(candidates: &[RetrievalCandidate]) {
    if candidates.is_empty() {
        println!("No results.");
        return;
    }
    let rank = |r: Option<usize>| r.map_or("-".to_string(), |r| r.to_string());
    for (i, c) in candidates.iter().enumerate() {
        println!(
            "{:>3}. {} #{}  fused {:.5}  (keyword {}, semantic {})",
            i + 1,
            c.chunk.provenance_tag(),
            c.chunk.chunk_id(),
            c.fused_score,
            rank(c.lexical_rank),
            rank(c.semantic_rank)
        );
        println!("     {}", preview(c.chunk.text()));
    }
}

/// First 120 characters on one line.
fn preview(text: &str) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .collect();
    let mut out: String = flat.chars().take(120).collect();
    if flat.chars().count() > 120 {
        out.push('…');
    }
    out
}

fn cmd_config(config_db: &ConfigDb, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Get { key } => match config_db.get_setting(&key)? {
            Some(value) => println!("{value}"),
            None => {
                return Err(Error::NotFound {
                    kind: "setting",
                    name: key,
                });
            }
        },
        ConfigAction::Set { key, value } => {
            validate_setting(&key, &value)?;
            config_db.set_setting(&key, &value)?;
            // Catch combinations that are only invalid together.
            if let Err(e) = EngineConfig::resolve(config_db) {
                warn!(error = %e, "stored configuration is now invalid");
            }
            println!("{key} = {value}");
        }
        ConfigAction::Unset { key } => {
            if !config_db.remove_setting(&key)? {
                return Err(Error::NotFound {
                    kind: "setting",
                    name: key,
                });
            }
            println!("Removed {key}");
        }
        ConfigAction::List { json } => {
            let stored = config_db.list_settings()?;
            let lookup = |key: &str| {
                stored
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.clone())
            };
            if json {
                let map: serde_json::Map<String, serde_json::Value> = keys::ALL
                    .iter()
                    .map(|key| {
                        let value = lookup(*key).map_or(
                            serde_json::Value::Null,
                            serde_json::Value::String,
                        );
                        (key.to_string(), value)
                    })
                    .collect();
                println!("{}", to_json(&serde_json::Value::Object(map))?);
            } else {
                for key in keys::ALL {
                    match lookup(*key) {
                        Some(value) => println!("{key} = {value}"),
                        None => println!("{key} (default)"),
                    }
                }
            }
        }
    }
    Ok(())
}

fn cmd_status(
    data_dir: &DataDir,
    config_db: &ConfigDb,
    json: bool,
) -> Result<()> {
    let config = EngineConfig::resolve(config_db)?;
    let vectors = VectorDb::open(&data_dir.vectors_db())?;
    let stored_vectors = vectors.len()?;
    let fingerprint = vectors.fingerprint()?;

    if json {
        let value = serde_json::json!({
            "data_dir": data_dir.root().display().to_string(),
            "model": config.model_name,
            "ollama_url": config.ollama_url,
            "ollama_model": config.ollama_model,
            "chunk_size": config.chunking.chunk_size,
            "chunk_overlap": config.chunking.overlap,
            "retrieval": config.retrieval,
            "stored_vectors": stored_vectors,
            "fingerprint": fingerprint.map(|f| format!("{f:016x}")),
        });
        println!("{}", to_json(&value)?);
        return Ok(());
    }

    let r = &config.retrieval;
    println!("Data directory: {}", data_dir.root().display());
    println!("Model:          {}", config.model_name);
    println!("Completion:     {} @ {}", config.ollama_model, config.ollama_url);
    println!(
        "Chunking:       {} chars, {} overlap",
        config.chunking.chunk_size, config.chunking.overlap
    );
    println!(
        "Weights:        semantic {} / keyword {}",
        r.w_semantic, r.w_keyword
    );
    println!(
        "Retrieval:      top {} per index, pool {}, final {}",
        r.top_n_per_index, r.candidate_pool, r.final_k
    );
    match fingerprint {
        Some(f) => {
            println!("Stored vectors: {stored_vectors} (corpus {f:016x})")
        }
        None => println!("Stored vectors: none"),
    }
    Ok(())
}

fn to_json(value: &serde_json::Value) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| Error::Config(format!("JSON encoding failed: {e}")))
}
