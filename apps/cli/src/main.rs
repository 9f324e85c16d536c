//! uridx CLI - search, ingest and serve a local hybrid knowledge index.
//!
//! Usage:
//!   uridx search <query>   - Hybrid search across the index
//!   uridx ingest           - Read JSONL ingestion records from stdin
//!   uridx stats            - Show store statistics as JSON
//!   uridx serve            - Start the MCP server on stdio
//!
//! Extractors are external processes: anything that writes the JSONL record
//! format to stdout can be piped into `uridx ingest`.

use std::io::{BufRead, Read};

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use uridx_core::{
    add_item, get_stats, hybrid_search, Config, Database, EmbeddingProvider, IngestRecord,
};

/// uridx - local hybrid (vector + keyword) knowledge index
#[derive(Parser)]
#[command(name = "uridx")]
#[command(about = "Index and search local knowledge with hybrid retrieval", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Search the index (vector + keyword, fused)
    Search {
        /// Search query text
        query: String,

        /// Require a tag (repeatable; results must carry all of them)
        #[arg(short = 't', long = "tag")]
        tag: Vec<String>,

        /// Filter by source type (e.g., "note", "markdown", "pdf")
        #[arg(long = "type")]
        source_type: Option<String>,

        /// Maximum number of results
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,

        /// Emit results as JSON
        #[arg(short = 'j', long)]
        json: bool,

        /// Keyword-only search (skip the vector pass)
        #[arg(long)]
        no_semantic: bool,
    },

    /// Ingest records from stdin
    Ingest {
        /// Treat stdin as JSONL ingestion records (the default)
        #[arg(long)]
        jsonl: bool,

        /// Treat stdin as the text of a single chunk for this source URI
        #[arg(long)]
        text: Option<String>,

        /// Replace existing items instead of merging by chunk key
        #[arg(long)]
        replace: bool,
    },

    /// Show store statistics
    Stats,

    /// Start the MCP (Model Context Protocol) server on stdio
    Serve,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Log to stderr only; stdout carries results (and MCP protocol data).
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("uridx={}", log_level).parse().unwrap())
                .add_directive(format!("uridx_core={}", log_level).parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Search {
            query,
            tag,
            source_type,
            limit,
            json,
            no_semantic,
        } => cmd_search(&query, &tag, source_type.as_deref(), limit, json, !no_semantic),
        Commands::Ingest {
            jsonl: _,
            text,
            replace,
        } => cmd_ingest(text.as_deref(), replace),
        Commands::Stats => cmd_stats(),
        Commands::Serve => cmd_serve(),
    }
}

// ============ SEARCH COMMAND ============

fn cmd_search(
    query: &str,
    tags: &[String],
    source_type: Option<&str>,
    limit: usize,
    json: bool,
    semantic: bool,
) -> Result<()> {
    let config = Config::load_default()?;
    let embedder = EmbeddingProvider::new(&config.embedding);
    let db = Database::open(&config.db_path, &embedder)?;

    let results = hybrid_search(&db, &embedder, query, limit, source_type, tags, semantic)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    if results.is_empty() {
        eprintln!("{}", "No results.".yellow());
        return Ok(());
    }

    for r in &results {
        println!(
            "{} {}",
            format!("[{:.3}]", r.score).dimmed(),
            r.source_uri.green()
        );
        if let Some(title) = &r.title {
            println!("  Title: {title}");
        }
        if let Some(source_type) = &r.source_type {
            println!("  Type: {source_type}");
        }
        if !r.tags.is_empty() {
            println!("  Tags: {}", r.tags.join(", "));
        }
        let snippet: String = r.chunk_text.chars().take(200).collect();
        println!("  {}", snippet.dimmed());
        println!();
    }

    Ok(())
}

// ============ INGEST COMMAND ============

fn cmd_ingest(text_uri: Option<&str>, replace: bool) -> Result<()> {
    let config = Config::load_default()?;
    let embedder = EmbeddingProvider::new(&config.embedding);
    let db = Database::open(&config.db_path, &embedder)?;

    let report = db.repair(&embedder)?;
    if report.expired_items + report.orphan_embeddings + report.reembedded_chunks > 0 {
        tracing::info!(
            "Startup repair: {} expired items, {} orphan embeddings, {} chunks re-embedded",
            report.expired_items,
            report.orphan_embeddings,
            report.reembedded_chunks
        );
    }

    // Single-chunk mode: the whole of stdin is one chunk's text.
    if let Some(source_uri) = text_uri {
        let mut content = String::new();
        std::io::stdin().read_to_string(&mut content)?;

        eprintln!("Ingesting text for {}...", source_uri.cyan());
        let mut record = IngestRecord::single_chunk(source_uri, &content);
        record.replace = replace;

        let item = add_item(&db, &embedder, &record)?;
        println!(
            "{}",
            serde_json::json!({
                "source_uri": item.source_uri,
                "chunks": item.chunks.len(),
            })
        );
        return Ok(());
    }

    // JSONL mode: one record per line; bad lines are skipped, fatal
    // configuration errors abort the batch.
    let stdin = std::io::stdin();
    let mut ingested = 0usize;
    let mut skipped = 0usize;

    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut record: IngestRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Skipping malformed record: {e}");
                skipped += 1;
                continue;
            }
        };
        record.replace = record.replace || replace;

        eprintln!("Ingesting {}...", record.source_uri.cyan());
        match add_item(&db, &embedder, &record) {
            Ok(_) => ingested += 1,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                tracing::warn!("Skipping {}: {e}", record.source_uri);
                skipped += 1;
            }
        }
    }

    println!(
        "{}",
        serde_json::json!({ "ingested": ingested, "skipped": skipped })
    );
    Ok(())
}

// ============ STATS COMMAND ============

fn cmd_stats() -> Result<()> {
    let config = Config::load_default()?;
    let embedder = EmbeddingProvider::new(&config.embedding);
    let db = Database::open(&config.db_path, &embedder)?;

    let stats = get_stats(&db)?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

// ============ SERVE COMMAND ============

fn cmd_serve() -> Result<()> {
    let config = Config::load_default()?;

    // MCP runs on stdio - protocol data on stdout, logs on stderr only.
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async { uridx_core::mcp::run_server(&config).await })?;
    Ok(())
}
