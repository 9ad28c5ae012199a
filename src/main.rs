//! # EchoGarden CLI (`eg`)
//!
//! | Command | Description |
//! |---------|-------------|
//! | `eg init` | Create the SQLite database and run schema migrations |
//! | `eg serve` | Start watcher + job workers + HTTP server |
//! | `eg scan` | Run one watcher pass (optionally process the queue) |
//! | `eg search "<query>"` | Hybrid retrieval from the CLI |
//! | `eg chat "<message>"` | One grounded Q&A turn |
//! | `eg card <id>` | Print one memory card |
//!
//! ```bash
//! eg --config ./eg.toml init
//! eg --config ./eg.toml serve
//! eg --config ./eg.toml search "deployment notes"
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use echo_garden::chat::{chat, ChatRequest};
use echo_garden::config::load_config;
use echo_garden::retrieve::{hybrid_retrieve, RetrieveRequest};
use echo_garden::store::cards;
use echo_garden::tools::ToolContext;
use echo_garden::{db, migrate, queue, server, watcher};

#[derive(Parser)]
#[command(name = "eg", about = "EchoGarden — local-first personal knowledge garden")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "eg.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent —
    /// running it multiple times is safe.
    Init,

    /// Start the full service: watcher, job workers, and HTTP server.
    Serve,

    /// Run one watcher pass over the watch root.
    Scan {
        /// Also process every queued job before exiting.
        #[arg(long)]
        process: bool,
    },

    /// Hybrid search over memory cards.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Ask one grounded question.
    Chat {
        /// The message to answer from your memories.
        message: String,
    },

    /// Print one memory card by id.
    Card {
        /// Memory card id.
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Arc::new(load_config(&cli.config)?);

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("initialized {}", config.db.path.display());
        }
        Commands::Serve => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            let ctx = ToolContext::new(pool, config.clone());
            let status = Arc::new(watcher::WatcherStatus::default());

            tokio::spawn(watcher::watch_loop(ctx.clone(), status.clone()));
            for i in 0..config.queue.workers {
                tokio::spawn(queue::worker_loop(ctx.clone(), format!("worker-{}", i)));
            }
            server::run_server(ctx, status).await?;
        }
        Commands::Scan { process } => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            let ctx = ToolContext::new(pool, config);
            let stats = watcher::scan_once(&ctx).await?;
            println!(
                "scan: {} files seen, {} changed, {} jobs enqueued",
                stats.files_seen, stats.files_changed, stats.jobs_enqueued
            );
            if process {
                let processed = queue::drain(&ctx, "cli").await?;
                println!("processed {} jobs", processed);
            }
        }
        Commands::Search { query, top_k } => {
            let pool = db::connect(&config).await?;
            let ctx = ToolContext::new(pool, config);
            let outcome = hybrid_retrieve(
                &ctx,
                &RetrieveRequest {
                    query,
                    top_k: top_k.unwrap_or(0),
                    filters: None,
                    use_graph: true,
                },
                None,
            )
            .await?;

            if outcome.results.is_empty() {
                println!("No results.");
                return Ok(());
            }
            if outcome.degraded {
                println!("(vector index unavailable — FTS-only results)");
            }
            for (i, hit) in outcome.results.iter().enumerate() {
                println!("{}. [{:.2}] {}", i + 1, hit.final_score, hit.title);
                println!("    reasons: {}", hit.reasons.join(", "));
                println!("    summary: {}", hit.summary.replace('\n', " "));
                println!("    id: {}", hit.memory_id);
                println!();
            }
        }
        Commands::Chat { message } => {
            let pool = db::connect(&config).await?;
            let ctx = ToolContext::new(pool, config);
            let outcome = chat(
                &ctx,
                &ChatRequest {
                    message,
                    top_k: 0,
                    use_graph: true,
                    hops: 1,
                    conversation_id: None,
                },
            )
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

            println!("verdict: {}", outcome.verdict);
            println!();
            println!("{}", outcome.answer);
            if !outcome.citations.is_empty() {
                println!();
                println!("citations:");
                for citation in &outcome.citations {
                    println!("  [{}] {}", citation.title, citation.memory_id);
                }
            }
            println!();
            println!("trace: {}", outcome.trace_id);
        }
        Commands::Card { id } => {
            let pool = db::connect(&config).await?;
            let card = cards::get(&pool, &id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("card not found: {}", id))?;
            println!("{}", serde_json::to_string_pretty(&card)?);
        }
    }

    Ok(())
}
