//! # ragline core
//!
//! Runtime-agnostic logic shared by the `ragline` application: the error
//! taxonomy, data models, chunking strategies, the embedding and vector-store
//! traits with an in-memory backend, repository traits for document and
//! message records, and token-bounded chat history selection.
//!
//! This crate contains no tokio, sqlx, network or filesystem I/O. Everything
//! that talks to the outside world lives in the application crate and plugs
//! in through the traits defined here.
//!
//! ```text
//!   text ──▶ chunk ──▶ embedding ──▶ store
//!                                     ▲
//!   query ──────────▶ embedding ──────┘ similarity_search
//!   query ──────────────────────────────┘ keyword_search (BM25)
//!
//!   messages ──▶ tokens::select_token_bounded ──▶ bounded history
//! ```

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod models;
pub mod retrieval;
pub mod store;
pub mod tokens;
