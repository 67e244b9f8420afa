//! # ragline
//!
//! Document ingestion, vector retrieval and token-bounded chat memory for
//! retrieval-augmented assistants.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────────┐   ┌──────────────┐
//! │ Loaders  │──▶│ DocumentProcessor        │──▶│ VectorStore  │
//! │ text/    │   │ chunk → embed → upsert   │   │ SQLite / mem │
//! │ file/url │   │ (sync or background task)│   └──────┬───────┘
//! └──────────┘   └──────────────────────────┘          │ retrieve_similar
//!                                                      ▼
//!                ┌──────────────────┐         ┌──────────────┐
//!                │ ChatMemoryManager│◀────────│ ChatService  │──▶ CompletionModel
//!                │ token-bounded    │         └──────────────┘
//!                └──────────────────┘
//! ```
//!
//! Pure logic (models, chunkers, traits, token budgeting) lives in the
//! `ragline-core` crate; this crate adds the runtime, network providers,
//! SQLite backends and the CLI.
//!
//! ## Quick Start
//!
//! ```bash
//! ragline init
//! ragline ingest ./docs --strategy recursive
//! ragline search "visa processing time" -k 3
//! ragline chat support-42 "How long does a visa take?" --rag
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | tracing subscriber setup |
//! | [`retry`] | bounded exponential backoff |
//! | [`db`] | SQLite pool |
//! | [`migrate`] | schema |
//! | [`embedding`] | embedding providers and the batching client |
//! | [`sqlite_store`] | SQLite vector store |
//! | [`sqlite_records`] | SQLite document and message repositories |
//! | [`extract`] | PDF and HTML text extraction |
//! | [`loader`] | document sources and loaders |
//! | [`tasks`] | background task registry |
//! | [`processor`] | ingestion and retrieval orchestrator |
//! | [`tokenizer`] | token counters |
//! | [`memory`] | chat memory |
//! | [`completion`] | chat completion models |
//! | [`chat`] | retrieval-augmented chat turns |
//! | [`registry`] | startup wiring |
//! | [`ingest`], [`search`], [`documents`], [`stats`] | CLI commands |

pub mod chat;
pub mod completion;
pub mod config;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod extract;
pub mod ingest;
pub mod loader;
pub mod logging;
pub mod memory;
pub mod migrate;
pub mod processor;
pub mod registry;
pub mod retry;
pub mod search;
pub mod sqlite_records;
pub mod sqlite_store;
pub mod stats;
pub mod tasks;
pub mod tokenizer;
