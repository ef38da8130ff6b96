//! # MarkdownKeeper
//!
//! A background indexing and hybrid semantic/lexical retrieval service for a
//! tree of Markdown files. Keeps a queryable representation of those files
//! continuously synchronized with the filesystem and answers hybrid
//! retrieval requests from LLM agents over a JSON-RPC HTTP API and a CLI.
//!
//! ## Architecture
//!
//! ```text
//! Watcher → Event Queue → Ingestor → (Parser, Embedder, Store) → Retriever → CLI / HTTP API
//! ```
//!
//! ## Modules
//!
//! - [`config`] — TOML configuration parsing and validation
//! - [`db`] — SQLite connection management
//! - [`migrate`] — Database schema migrations
//! - [`sqlite_store`] — SQLite-backed implementation of the core `Store` trait
//! - [`event_queue`] — durable, coalescing, crash-safe filesystem event queue
//! - [`watcher`] — OS-event (notify) and polling event producers
//! - [`ingestor`] — applies a leased event to the Store
//! - [`embedder`] — hash and local-model embedding backends
//! - [`vector_index`] — brute-force cosine similarity index
//! - [`retriever`] — hybrid scoring, query cache, progressive delivery
//! - [`link_checker`] — local/external link validation
//! - [`build_index`] — static by-category/by-concept Markdown index generation
//! - [`stats`] — `stats`/`report` command data collection
//! - [`embeddings_cmd`] — `embeddings-generate`/`embeddings-status`
//! - [`eval`] — `embeddings-eval`/`semantic-benchmark`
//! - [`api`] — JSON-RPC HTTP server
//! - [`progress`] — stderr progress reporting for long-running commands

mod api;
mod build_index;
mod config;
mod db;
mod embedder;
mod embeddings_cmd;
mod eval;
mod event_queue;
mod ingestor;
mod link_checker;
mod migrate;
mod progress;
mod retriever;
mod sqlite_store;
mod stats;
mod vector_index;
mod watcher;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use markdownkeeper_core::embedding::EmbeddingProvider;
use markdownkeeper_core::search::SearchMode;
use markdownkeeper_core::store::{GetDocumentOptions, Store};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use crate::config::Config;
use crate::event_queue::EventQueue;
use crate::link_checker::LinkChecker;
use crate::sqlite_store::SqliteStore;
use crate::watcher::{WatchBudget, WatchMode};

#[derive(Parser)]
#[command(
    name = "mdk",
    about = "MarkdownKeeper — background indexing and hybrid retrieval for a tree of Markdown files",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/mdk.toml")]
    config: PathBuf,

    /// Override the database path from the config file
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Output format for command results
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and its schema
    InitDb,

    /// Parse and index a single Markdown file
    ScanFile { path: PathBuf },

    /// Run a hybrid semantic/lexical query
    Query {
        text: String,

        #[arg(long, default_value = "semantic")]
        mode: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,

        #[arg(long)]
        include_content: bool,

        #[arg(long)]
        max_tokens: Option<usize>,

        #[arg(long)]
        section: Option<String>,
    },

    /// Retrieve a document by id
    GetDoc {
        id: i64,

        #[arg(long)]
        include_content: bool,

        #[arg(long)]
        max_tokens: Option<usize>,

        #[arg(long)]
        section: Option<String>,
    },

    /// List documents tagged with a derived concept
    FindConcept { concept: String },

    /// Validate every link in the Store
    CheckLinks {
        #[arg(long)]
        check_external: bool,
    },

    /// Generate static by-category/by-concept Markdown indexes
    BuildIndex {
        #[arg(long)]
        output_dir: PathBuf,
    },

    /// Watch the configured roots and continuously index changes
    Watch {
        #[arg(long, default_value = "auto")]
        mode: String,

        #[arg(long, default_value_t = 2)]
        interval: u64,

        #[arg(long)]
        iterations: Option<u64>,

        #[arg(long)]
        duration: Option<u64>,
    },

    /// Start the JSON-RPC HTTP API
    ServeApi {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,
    },

    /// Print database/index summary statistics
    Stats,

    /// Print a fuller health report (stats, embedding coverage, event queue)
    Report,

    /// Re-embed every document whose stored backend differs from the active one
    EmbeddingsGenerate,

    /// Report how many documents need re-embedding under the active backend
    EmbeddingsStatus,

    /// Evaluate recall@k / MRR of the active embedder against labeled cases
    EmbeddingsEval {
        cases: PathBuf,

        #[arg(long, default_value_t = 10)]
        k: usize,
    },

    /// Measure query latency and recall@k over labeled cases
    SemanticBenchmark {
        cases: PathBuf,

        #[arg(long, default_value_t = 10)]
        k: usize,

        #[arg(long, default_value_t = 1)]
        iterations: usize,
    },
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    match run().await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();
    let mut config = config::load_config(&cli.config)?;
    if let Some(db_path) = &cli.db_path {
        config.storage.database_path = db_path.clone();
    }
    let format = cli.format;

    match cli.command {
        Commands::InitDb => {
            migrate::run_migrations(&config).await?;
            match format {
                OutputFormat::Text => println!("database initialized at {}", config.storage.database_path.display()),
                OutputFormat::Json => println!("{}", serde_json::json!({"status": "ok", "database_path": config.storage.database_path})),
            }
            Ok(0)
        }

        Commands::ScanFile { path } => {
            let store = open_store(&config).await?;
            let embedder = embedder::create_embedder(&config.embeddings);
            let text = tokio::fs::read_to_string(&path).await?;
            let parsed = markdownkeeper_core::parser::parse(&text);
            let path_str = path.display().to_string();
            let id = store.upsert_document(&path_str, &parsed, embedder.as_ref()).await?;
            match format {
                OutputFormat::Text => println!("indexed {path_str} as document {id}"),
                OutputFormat::Json => println!("{}", serde_json::json!({"document_id": id, "path": path_str})),
            }
            Ok(0)
        }

        Commands::Query { text, mode, limit, include_content, max_tokens, section } => {
            let store = open_store(&config).await?;
            let embedder = embedder::create_embedder(&config.embeddings);
            let search_mode = SearchMode::parse(&mode)
                .ok_or_else(|| anyhow::anyhow!("unknown search mode '{mode}', expected semantic or lexical"))?;
            let vector_index = load_vector_index(&store, embedder.dimension()).await.ok();

            let request = retriever::SearchRequest {
                query: text,
                limit,
                mode: search_mode,
                include_content,
                max_tokens,
                section,
            };
            let result = retriever::search(
                &store,
                embedder.as_ref(),
                vector_index.as_ref(),
                &config.cache,
                &config.retrieval,
                request,
            )
            .await?;

            print_documents(&result.documents, result.cache_hit, format);
            Ok(0)
        }

        Commands::GetDoc { id, include_content, max_tokens, section } => {
            let store = open_store(&config).await?;
            let options = GetDocumentOptions { include_content, max_tokens, section };
            match store.get_document(id, options).await? {
                Some(view) => {
                    print_documents(&[view], false, format);
                    Ok(0)
                }
                None => {
                    eprintln!("document {id} not found");
                    Ok(1)
                }
            }
        }

        Commands::FindConcept { concept } => {
            let store = open_store(&config).await?;
            let docs = store.list_by_concept(&concept, 50).await?;
            match format {
                OutputFormat::Text => {
                    for doc in &docs {
                        println!("{}\t{}\t{}", doc.id, doc.path, doc.title);
                    }
                }
                OutputFormat::Json => println!("{}", serde_json::to_string(&docs)?),
            }
            Ok(0)
        }

        Commands::CheckLinks { check_external } => {
            let store = open_store(&config).await?;
            let checker = LinkChecker::new()?;
            let broken = link_checker::check_links(&store, &checker, check_external).await?;
            match format {
                OutputFormat::Text => println!("{broken} broken link(s)"),
                OutputFormat::Json => println!("{}", serde_json::json!({"broken_links": broken})),
            }
            Ok(if broken > 0 { 1 } else { 0 })
        }

        Commands::BuildIndex { output_dir } => {
            let store = open_store(&config).await?;
            let embedder = embedder::create_embedder(&config.embeddings);
            let summary = build_index::build_index(&store, embedder.dimension(), &output_dir).await?;
            match format {
                OutputFormat::Text => println!(
                    "wrote {} categories, {} concepts, {} vector index entries to {}",
                    summary.categories_written,
                    summary.concepts_written,
                    summary.vector_index_entries,
                    output_dir.display()
                ),
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({
                        "categories_written": summary.categories_written,
                        "concepts_written": summary.concepts_written,
                        "vector_index_entries": summary.vector_index_entries,
                    })
                ),
            }
            Ok(0)
        }

        Commands::Watch { mode, interval, iterations, duration } => {
            let watch_mode = WatchMode::parse(&mode)
                .ok_or_else(|| anyhow::anyhow!("unknown watch mode '{mode}', expected auto, notify, or polling"))?;
            let budget = WatchBudget {
                interval: Duration::from_secs(interval),
                iterations,
                duration: duration.map(Duration::from_secs),
            };
            run_watch(config, cli.config, watch_mode, budget).await?;
            Ok(0)
        }

        Commands::ServeApi { host, port } => {
            let mut config = config;
            if let Some(host) = host {
                config.api.host = host;
            }
            if let Some(port) = port {
                config.api.port = port;
            }
            let config = Arc::new(config);
            let store = Arc::new(open_store(&config).await?);
            let embedder: Arc<dyn EmbeddingProvider> = Arc::from(embedder::create_embedder(&config.embeddings));
            let vector_index = load_vector_index(&store, embedder.dimension()).await.ok().map(Arc::new);
            api::run_server(config, store, embedder, vector_index).await?;
            Ok(0)
        }

        Commands::Stats => {
            let store = open_store(&config).await?;
            let summary = stats::collect_stats(&store).await?;
            match format {
                OutputFormat::Text => stats::print_stats_text(&summary),
                OutputFormat::Json => println!("{}", serde_json::to_string(&summary)?),
            }
            Ok(0)
        }

        Commands::Report => {
            let store = open_store(&config).await?;
            let report = stats::collect_report(&store).await?;
            match format {
                OutputFormat::Text => stats::print_report_text(&report),
                OutputFormat::Json => println!("{}", serde_json::to_string(&report)?),
            }
            Ok(0)
        }

        Commands::EmbeddingsGenerate => {
            let store = open_store(&config).await?;
            let embedder = embedder::create_embedder(&config.embeddings);
            let progress_mode = match format {
                OutputFormat::Json => progress::ProgressMode::Json,
                OutputFormat::Text => progress::ProgressMode::default_for_tty(),
            };
            let progress = progress_mode.reporter();
            let regenerated =
                embeddings_cmd::embeddings_generate(&store, embedder.as_ref(), progress.as_ref()).await?;
            match format {
                OutputFormat::Text => println!("regenerated embeddings for {regenerated} document(s)"),
                OutputFormat::Json => println!("{}", serde_json::json!({"regenerated": regenerated})),
            }
            Ok(0)
        }

        Commands::EmbeddingsStatus => {
            let store = open_store(&config).await?;
            let embedder = embedder::create_embedder(&config.embeddings);
            let status = embeddings_cmd::embeddings_status(&store, embedder.as_ref()).await?;
            match format {
                OutputFormat::Text => embeddings_cmd::print_embeddings_status_text(&status),
                OutputFormat::Json => println!("{}", serde_json::to_string(&status)?),
            }
            Ok(0)
        }

        Commands::EmbeddingsEval { cases, k } => {
            let store = open_store(&config).await?;
            let embedder = embedder::create_embedder(&config.embeddings);
            let vector_index = load_vector_index(&store, embedder.dimension()).await.ok();
            let cases = eval::load_cases(&cases)?;
            let summary = eval::run_eval(
                &store,
                embedder.as_ref(),
                vector_index.as_ref(),
                &config.cache,
                &config.retrieval,
                &cases,
                k,
            )
            .await?;
            match format {
                OutputFormat::Text => eval::print_eval_summary_text(&summary),
                OutputFormat::Json => println!("{}", serde_json::to_string(&summary)?),
            }
            Ok(0)
        }

        Commands::SemanticBenchmark { cases, k, iterations } => {
            let store = open_store(&config).await?;
            let embedder = embedder::create_embedder(&config.embeddings);
            let vector_index = load_vector_index(&store, embedder.dimension()).await.ok();
            let cases = eval::load_cases(&cases)?;
            let summary = eval::run_benchmark(
                &store,
                embedder.as_ref(),
                vector_index.as_ref(),
                &config.cache,
                &config.retrieval,
                &cases,
                k,
                iterations,
            )
            .await?;
            match format {
                OutputFormat::Text => eval::print_benchmark_summary_text(&summary),
                OutputFormat::Json => println!("{}", serde_json::to_string(&summary)?),
            }
            Ok(0)
        }
    }
}

async fn open_store(config: &Config) -> anyhow::Result<SqliteStore> {
    let pool = db::connect(config).await?;
    Ok(SqliteStore::new(pool, config.storage.database_path.display().to_string()))
}

/// Rebuilds the vector index from the Store's current embeddings. There is
/// no on-disk cache of the index outside `build-index`'s output directory,
/// so every command that needs semantic narrowing rebuilds it fresh; for the
/// document counts this system targets, a brute-force rebuild is cheap
/// relative to the I/O already spent reading documents.
async fn load_vector_index(
    store: &SqliteStore,
    embedder_dimension: usize,
) -> anyhow::Result<vector_index::BruteForceIndex> {
    Ok(retriever::rebuild_vector_index(store, embedder_dimension).await?)
}

fn print_documents(
    views: &[markdownkeeper_core::store::DocumentView],
    cache_hit: bool,
    format: OutputFormat,
) {
    match format {
        OutputFormat::Text => {
            for view in views {
                println!(
                    "{}\t{}\t{}\t{}",
                    view.document.id, view.document.path, view.document.title, view.document.summary
                );
                if let Some(chunks) = &view.chunks {
                    for chunk in chunks {
                        println!("  [{}]\n{}", chunk.heading_path, chunk.content);
                    }
                }
            }
        }
        OutputFormat::Json => {
            let documents: Vec<_> = views.iter().map(api::document_view_json).collect();
            println!("{}", serde_json::json!({"cache_hit": cache_hit, "documents": documents}));
        }
    }
}

/// Runs the watcher and its ingest consumer until a `WatchBudget` deadline
/// is reached or SIGTERM arrives. SIGHUP reloads `[watch]` from disk without
/// restarting the consumer; SIGTERM stops the watcher and drains whatever is
/// already queued before returning, per the graceful-shutdown contract.
async fn run_watch(
    config: Config,
    config_path: PathBuf,
    mode: WatchMode,
    budget: WatchBudget,
) -> anyhow::Result<()> {
    let pool = db::connect(&config).await?;
    let queue = Arc::new(EventQueue::new(pool.clone(), config.watch.debounce_ms));
    let replayed = queue.replay_orphaned().await?;
    if replayed > 0 {
        tracing::info!("replayed {replayed} in-flight event(s) from a previous run");
    }

    let store = Arc::new(SqliteStore::new(pool, config.storage.database_path.display().to_string()));
    let embedder: Arc<dyn EmbeddingProvider> = Arc::from(embedder::create_embedder(&config.embeddings));

    let (stop_tx, stop_rx) = watch::channel(false);
    let consumer = tokio::spawn(consume_loop(queue.clone(), stop_rx, store, embedder));

    let mut watch_config = config.watch.clone();
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            res = watcher::run(mode, &watch_config, budget, &queue) => {
                res?;
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received, stopping watcher and draining the event queue");
                break;
            }
            _ = sighup.recv() => {
                tracing::info!("SIGHUP received, reloading configuration");
                match config::load_config(&config_path) {
                    Ok(reloaded) => watch_config = reloaded.watch,
                    Err(e) => tracing::warn!("failed to reload config: {e}"),
                }
            }
        }
    }

    let _ = stop_tx.send(true);
    consumer.await??;
    Ok(())
}

async fn consume_loop(
    queue: Arc<EventQueue>,
    mut stop_rx: watch::Receiver<bool>,
    store: Arc<SqliteStore>,
    embedder: Arc<dyn EmbeddingProvider>,
) -> anyhow::Result<()> {
    loop {
        match queue.lease_next().await {
            Ok(Some(event)) => {
                let id = event.id;
                match ingestor::ingest_event(store.as_ref(), embedder.as_ref(), &event).await {
                    Ok(()) => queue.mark_done(id).await?,
                    Err(e) => {
                        tracing::warn!(path = %event.path, "ingest failed: {e}");
                        queue.mark_retry(id, &e.to_string()).await?;
                    }
                }
            }
            Ok(None) => {
                if *stop_rx.borrow() {
                    return Ok(());
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                    _ = stop_rx.changed() => {}
                }
            }
            Err(e) => {
                tracing::warn!("event queue lease failed: {e}");
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }
    }
}
