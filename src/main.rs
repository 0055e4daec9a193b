//! # Agent Memory CLI (`amem`)
//!
//! Thin command-line shell over [`agent_memory::memory::Memory`].
//!
//! ## Usage
//!
//! ```bash
//! amem --config ./config/amem.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `amem init` | Create category directories, `main.md`, and the JSON index |
//! | `amem sync [path]` | Index one document, or reconcile every document |
//! | `amem search "<query>"` | Search segments (fulltext, vector, or hybrid) |
//! | `amem list` | List indexed documents |
//! | `amem get <path>` | Print a document with its metadata |
//! | `amem tags add/remove` | Edit a document's tags |
//! | `amem goal add/complete` | Manage goals in `main.md` |
//! | `amem plan add/complete` | Manage plans in `main.md` |
//! | `amem task "<text>"` | Record a completed task |
//! | `amem note "<text>"` | Append a note to a `main.md` section |
//!
//! Logs go to stderr (`RUST_LOG` overrides `[logging] level`); command
//! output goes to stdout.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use agent_memory::config::{self, Config, MissingEmbeddings};
use agent_memory::memory::Memory;
use agent_memory::mirror::main_doc::RECENT_NOTES;
use agent_memory::models::{Category, SearchFilters, SearchMode};
use agent_memory::search::SearchRequest;
use agent_memory::sync::CancelHandle;

/// Agent Memory CLI: segment, sync, and search a markdown memory corpus.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "amem",
    about = "Agent Memory: hybrid search over a markdown memory corpus",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/amem.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Create the memory layout.
    ///
    /// Creates the category directories, the root `main.md` document, and
    /// an empty JSON index. Existing files are left untouched, so running
    /// it again is safe.
    Init,

    /// Bring the index in step with the files.
    ///
    /// With a path, re-indexes that document. Without one, indexes every
    /// document under the root and removes records whose file is gone.
    /// Ctrl-C stops the pass after the documents already in flight.
    Sync {
        /// Document path relative to the memory root.
        path: Option<String>,
    },

    /// Search indexed segments.
    Search {
        /// The search query. Bare terms are AND-ed; supports "phrases",
        /// `or`, and `-exclusions`.
        query: String,

        /// Search mode: `fulltext`, `vector`, or `hybrid`.
        #[arg(long, default_value = "hybrid")]
        mode: String,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,

        /// Only documents in this category.
        #[arg(long)]
        category: Option<String>,

        /// Only this document.
        #[arg(long)]
        path: Option<String>,

        /// Only documents carrying this tag. Repeat to require several.
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Fail instead of falling back to fulltext when no embedding
        /// provider is configured.
        #[arg(long)]
        strict: bool,
    },

    /// List indexed documents.
    List {
        /// Only documents in this category.
        #[arg(long)]
        category: Option<String>,
    },

    /// Print a document and its metadata.
    Get {
        /// Document path relative to the memory root.
        path: String,
    },

    /// Edit document tags.
    Tags {
        #[command(subcommand)]
        action: TagAction,
    },

    /// Manage goals in the root document.
    Goal {
        #[command(subcommand)]
        action: ItemAction,
    },

    /// Manage plans in the root document.
    Plan {
        #[command(subcommand)]
        action: ItemAction,
    },

    /// Record a completed task in the root document.
    Task {
        text: String,
    },

    /// Append a note to a section of the root document.
    Note {
        text: String,

        /// Target section.
        #[arg(long, default_value = RECENT_NOTES)]
        section: String,
    },
}

#[derive(Subcommand)]
enum TagAction {
    /// Add tags to a document.
    Add { path: String, tags: Vec<String> },
    /// Remove tags from a document.
    Remove { path: String, tags: Vec<String> },
}

#[derive(Subcommand)]
enum ItemAction {
    /// Add an open item.
    Add { text: String },
    /// Mark an open item completed.
    Complete { text: String },
}

fn init_tracing(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_category(value: Option<String>) -> anyhow::Result<Option<Category>> {
    value
        .map(|c| c.parse::<Category>())
        .transpose()
        .map_err(Into::into)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg);

    let default_limit = cfg.retrieval.default_limit;
    let memory = Memory::open(cfg)
        .await
        .context("Failed to open memory")?;

    let result = run(&memory, cli.command, default_limit).await;
    memory.shutdown().await;
    result
}

async fn run(memory: &Memory, command: Commands, default_limit: usize) -> anyhow::Result<()> {
    match command {
        Commands::Init => {
            let created = memory.initialize().await?;
            if created {
                println!("Memory initialized at {}.", memory.files().root().display());
            } else {
                println!("Memory already initialized.");
            }
        }
        Commands::Sync { path: Some(path) } => {
            let entry = memory.reindex(&path).await?;
            println!("synced {} ({} words)", entry.path, entry.word_count);
        }
        Commands::Sync { path: None } => {
            let cancel = CancelHandle::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("Interrupted, finishing documents in flight...");
                    on_interrupt.cancel();
                }
            });

            let report = memory.reconcile(&cancel).await?;
            println!("sync");
            println!("  documents: {}", report.total());
            println!("  synced: {}", report.synced.len());
            println!("  unchanged: {}", report.unchanged.len());
            println!("  removed: {}", report.orphans.len());
            if !report.skipped.is_empty() {
                println!("  skipped: {}", report.skipped.len());
            }
            for (path, error) in &report.failed {
                println!("  failed: {}: {}", path, error);
            }
            println!("{}", if report.cancelled { "cancelled" } else { "ok" });
        }
        Commands::Search {
            query,
            mode,
            limit,
            category,
            path,
            tags,
            strict,
        } => {
            let mode: SearchMode = mode.parse()?;
            let filters = SearchFilters {
                category: parse_category(category)?,
                path,
                tags: tags.into_iter().collect(),
            };
            let mut req = SearchRequest::new(query, mode, limit.unwrap_or(default_limit))
                .with_filters(filters);
            if strict {
                req.on_missing_embeddings = Some(MissingEmbeddings::Error);
            }

            let hits = memory.search(&req).await?;
            if hits.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for (i, hit) in hits.iter().enumerate() {
                let heading = if hit.header_path.is_empty() {
                    String::new()
                } else {
                    format!(" > {}", hit.header_path.join(" > "))
                };
                println!("{}. [{:.4}] {}{}", i + 1, hit.score, hit.path, heading);
                println!("    category: {}  mode: {}", hit.category, hit.mode);
                println!(
                    "    excerpt: \"{}\"",
                    excerpt(&hit.content, 200).replace('\n', " ").trim()
                );
                println!();
            }
        }
        Commands::List { category } => {
            let entries = memory.list(parse_category(category)?).await?;
            if entries.is_empty() {
                println!("No documents.");
                return Ok(());
            }
            for entry in entries {
                let tags = entry.tags.iter().cloned().collect::<Vec<_>>().join(", ");
                println!(
                    "{:<40} {:<13} {:>6} words  [{}]",
                    entry.path,
                    entry.category.as_str(),
                    entry.word_count,
                    tags
                );
            }
        }
        Commands::Get { path } => {
            let doc = memory.read(&path).await?;
            println!("--- Document ---");
            println!("path:        {}", doc.path);
            if let Some(entry) = &doc.entry {
                println!("title:       {}", entry.title);
                println!("category:    {}", entry.category);
                println!("tags:        {}", entry.tags.iter().cloned().collect::<Vec<_>>().join(", "));
                println!("words:       {}", entry.word_count);
                println!("created_at:  {}", entry.created_at.to_rfc3339());
                println!("updated_at:  {}", entry.updated_at.to_rfc3339());
                if !entry.description.is_empty() {
                    println!("description: {}", entry.description);
                }
            } else {
                println!("(not indexed)");
            }
            println!();
            println!("--- Content ---");
            println!("{}", doc.content);
        }
        Commands::Tags { action } => {
            let entry = match action {
                TagAction::Add { path, tags } => {
                    memory.add_tags(&path, to_set(tags)).await?
                }
                TagAction::Remove { path, tags } => {
                    memory.remove_tags(&path, to_set(tags)).await?
                }
            };
            let tags = entry.tags.into_iter().collect::<Vec<_>>().join(", ");
            println!("{}: [{}]", entry.path, tags);
        }
        Commands::Goal { action } => match action {
            ItemAction::Add { text } => {
                memory.add_goal(&text).await?;
                println!("Goal added.");
            }
            ItemAction::Complete { text } => {
                memory.complete_goal(&text).await?;
                println!("Goal completed.");
            }
        },
        Commands::Plan { action } => match action {
            ItemAction::Add { text } => {
                memory.add_plan(&text).await?;
                println!("Plan added.");
            }
            ItemAction::Complete { text } => {
                memory.complete_plan(&text).await?;
                println!("Plan completed.");
            }
        },
        Commands::Task { text } => {
            memory.add_task(&text).await?;
            println!("Task recorded.");
        }
        Commands::Note { text, section } => {
            memory.append_note(&section, &text).await?;
            println!("Note added to {}.", section);
        }
    }
    Ok(())
}

fn to_set(tags: Vec<String>) -> BTreeSet<String> {
    tags.into_iter().collect()
}

fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}
