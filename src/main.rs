//! # ragline CLI
//!
//! ## Usage
//!
//! ```bash
//! ragline --config ./config/ragline.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragline init` | Create the SQLite database and schema |
//! | `ragline ingest <path-or-url>...` | Load, chunk, embed and store documents |
//! | `ragline search "<query>"` | Vector, keyword or hybrid search, JSON output |
//! | `ragline documents` | List ingested documents |
//! | `ragline show <id>` | Print one document record as JSON |
//! | `ragline delete <id>` | Remove a document's chunks and flag it deleted |
//! | `ragline stats` | Collection and document counts, JSON output |
//! | `ragline chat <conversation> "<message>"` | One chat turn, optionally with retrieval |
//! | `ragline history <conversation>` | Token-bounded history, JSON output |
//!
//! ## Examples
//!
//! ```bash
//! ragline init
//! ragline ingest ./handbook --strategy sentence --chunk-size 800
//! ragline ingest https://example.com/visa-faq.html --title "Visa FAQ"
//! ragline search "visa processing time" -k 3 --document 2f1c...
//! ragline search "form DS-160" --mode hybrid
//! ragline chat support-42 "How long does a visa take?" --rag --stream
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use ragline::chat::{run_chat, run_history, RagConfig};
use ragline::config;
use ragline::documents::{run_delete, run_documents, run_show};
use ragline::ingest::{run_ingest, IngestOptions};
use ragline::logging;
use ragline::migrate;
use ragline::registry::Components;
use ragline::search::run_search;
use ragline::stats::run_stats;
use ragline_core::retrieval::RetrievalMode;

/// ragline: document ingestion, vector retrieval and token-bounded chat
/// memory for retrieval-augmented assistants.
#[derive(Parser)]
#[command(name = "ragline", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and schema. Safe to run repeatedly.
    Init,

    /// Ingest files, directories or URLs.
    ///
    /// Directories are walked using `[ingest] include_globs` and
    /// `exclude_globs`. Each document is processed to completion before
    /// the next one starts.
    Ingest {
        /// Files, directories, or `http(s)://` URLs.
        #[arg(required = true)]
        inputs: Vec<String>,

        /// Chunking strategy: fixed, recursive, sentence, paragraph, semantic.
        #[arg(long)]
        strategy: Option<String>,

        /// Maximum chunk size in characters.
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Characters shared by adjacent chunks.
        #[arg(long)]
        chunk_overlap: Option<usize>,

        /// Document title (single input only).
        #[arg(long)]
        title: Option<String>,

        /// Owner recorded on the document.
        #[arg(long)]
        owner: Option<String>,
    },

    /// Search ingested chunks.
    Search {
        query: String,

        /// Only return chunks of this document.
        #[arg(long)]
        document: Option<String>,

        /// Maximum number of results. Defaults to `[retrieval] top_k`.
        #[arg(short)]
        k: Option<usize>,

        /// vector, keyword or hybrid. Defaults to `[retrieval] mode`.
        #[arg(long)]
        mode: Option<RetrievalMode>,
    },

    /// List documents.
    Documents {
        #[arg(long)]
        owner: Option<String>,

        /// Include documents flagged deleted.
        #[arg(long)]
        all: bool,
    },

    /// Print a document record.
    Show { id: String },

    /// Delete a document's chunks and flag the record deleted.
    Delete { id: String },

    /// Show index statistics.
    Stats,

    /// Send one chat message and print the assistant's reply.
    Chat {
        conversation: String,
        message: String,

        /// Retrieve context from ingested documents.
        #[arg(long)]
        rag: bool,

        /// Restrict retrieval to one document.
        #[arg(long)]
        document: Option<String>,

        /// Chunks to retrieve.
        #[arg(short)]
        k: Option<usize>,

        /// vector, keyword or hybrid.
        #[arg(long)]
        mode: Option<RetrievalMode>,

        /// Print the reply as it arrives. Ctrl-C stops it early.
        #[arg(long)]
        stream: bool,
    },

    /// Print a conversation's token-bounded history.
    History {
        conversation: String,

        #[arg(long)]
        include_system: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized at {}.", cfg.db.path.display());
        return Ok(());
    }

    let components = Components::from_config(&cfg).await?;
    let result = match cli.command {
        Commands::Init => Ok(()),
        Commands::Ingest {
            inputs,
            strategy,
            chunk_size,
            chunk_overlap,
            title,
            owner,
        } => {
            let options = IngestOptions {
                strategy,
                chunk_size,
                chunk_overlap,
                title,
                owner,
            };
            run_ingest(&components.processor, &cfg, &inputs, options).await
        }
        Commands::Search {
            query,
            document,
            k,
            mode,
        } => {
            run_search(
                &components.processor,
                &query,
                document.as_deref(),
                k.unwrap_or(cfg.retrieval.top_k),
                mode,
            )
            .await
        }
        Commands::Documents { owner, all } => {
            run_documents(&components.processor, owner.as_deref(), all).await
        }
        Commands::Show { id } => run_show(&components.processor, &id).await,
        Commands::Delete { id } => run_delete(&components.processor, &id).await,
        Commands::Stats => run_stats(&components, &cfg).await,
        Commands::Chat {
            conversation,
            message,
            rag,
            document,
            k,
            mode,
            stream,
        } => {
            let rag_config = RagConfig {
                k,
                document_id: document,
                mode,
            };
            run_chat(
                &components.chat,
                &conversation,
                &message,
                rag,
                rag_config,
                stream,
            )
            .await
        }
        Commands::History {
            conversation,
            include_system,
        } => run_history(&components.memory, &conversation, include_system).await,
    };

    components.shutdown().await;
    result
}
