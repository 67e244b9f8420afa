//! `ragline search`: vector, keyword or hybrid retrieval from the command line.
//!
//! Prints the `search` response as pretty JSON:
//!
//! ```json
//! {
//!   "results": [{"document_id": "...", "chunk_id": "...", "content": "...", "score": 0.82}],
//!   "total": 1,
//!   "query": "visa processing time"
//! }
//! ```

use anyhow::{bail, Result};
use ragline_core::retrieval::RetrievalMode;

use crate::processor::DocumentProcessor;

pub async fn run_search(
    processor: &DocumentProcessor,
    query: &str,
    document_id: Option<&str>,
    k: usize,
    mode: Option<RetrievalMode>,
) -> Result<()> {
    if query.trim().is_empty() {
        bail!("search query must not be empty");
    }
    let response = processor.search(query, document_id, k, mode).await?;
    tracing::debug!(query, total = response.total, "search finished");
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
