//! `ragline ingest`: expand inputs and push each through the processor.
//!
//! Inputs are URLs, files or directories. Directories are walked with the
//! `[ingest]` include/exclude globs. Each document runs synchronously; a
//! failed document is reported and the batch continues.

use anyhow::{bail, Result};
use ragline_core::chunk::{ChunkParams, ChunkStrategy};
use ragline_core::models::DocumentStatus;

use crate::config::Config;
use crate::loader::{detect_source, scan_directory, DocumentSource};
use crate::processor::{DocumentProcessor, IngestOutcome, ProcessRequest};

/// Per-run overrides from the command line.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub strategy: Option<String>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    /// Only honoured when a single document is ingested.
    pub title: Option<String>,
    pub owner: Option<String>,
}

impl IngestOptions {
    pub fn params(&self, defaults: ChunkParams) -> Result<ChunkParams> {
        let mut params = defaults;
        if let Some(strategy) = &self.strategy {
            params.strategy = strategy.parse::<ChunkStrategy>()?;
        }
        if let Some(size) = self.chunk_size {
            params.chunk_size = size;
        }
        if let Some(overlap) = self.chunk_overlap {
            params.chunk_overlap = overlap;
        }
        params.validate()?;
        Ok(params)
    }
}

/// Resolve command-line inputs to document sources.
pub fn expand_inputs(inputs: &[String], config: &Config) -> Result<Vec<DocumentSource>> {
    let mut sources = Vec::new();
    for input in inputs {
        match detect_source(input) {
            DocumentSource::File { path } if path.is_dir() => {
                let files = scan_directory(&path, &config.ingest)?;
                tracing::info!(dir = %path.display(), files = files.len(), "directory scanned");
                sources.extend(files.into_iter().map(|path| DocumentSource::File { path }));
            }
            DocumentSource::File { path } if !path.exists() => {
                bail!("No such file or directory: {}", path.display());
            }
            source => sources.push(source),
        }
    }
    Ok(sources)
}

pub async fn ingest_sources(
    processor: &DocumentProcessor,
    sources: Vec<DocumentSource>,
    params: ChunkParams,
    options: &IngestOptions,
) -> Vec<(DocumentSource, ragline_core::error::Result<IngestOutcome>)> {
    let single = sources.len() == 1;
    let mut results = Vec::with_capacity(sources.len());
    for source in sources {
        let request = ProcessRequest {
            params: Some(params),
            title: if single { options.title.clone() } else { None },
            owner_id: options.owner.clone(),
            ..ProcessRequest::default()
        };
        let outcome = processor.process_document(source.clone(), request).await;
        results.push((source, outcome));
    }
    results
}

pub async fn run_ingest(
    processor: &DocumentProcessor,
    config: &Config,
    inputs: &[String],
    options: IngestOptions,
) -> Result<()> {
    let params = options.params(config.chunking.params())?;
    let sources = expand_inputs(inputs, config)?;
    if sources.is_empty() {
        println!("Nothing to ingest.");
        return Ok(());
    }

    println!(
        "Ingesting {} document(s) (strategy: {:?}, size: {}, overlap: {})",
        sources.len(),
        params.strategy,
        params.chunk_size,
        params.chunk_overlap
    );

    let mut completed = 0usize;
    let mut failed = 0usize;
    let mut chunks = 0usize;
    for (source, outcome) in ingest_sources(processor, sources, params, &options).await {
        match outcome {
            Ok(o) if o.status == DocumentStatus::Completed => {
                completed += 1;
                chunks += o.chunk_count;
                println!("  ok      {}  {} ({} chunks)", o.document_id, source.describe(), o.chunk_count);
            }
            Ok(o) => {
                failed += 1;
                println!(
                    "  failed  {}  {}: {}",
                    o.document_id,
                    source.describe(),
                    o.error.as_deref().unwrap_or("unknown error")
                );
            }
            Err(e) => {
                failed += 1;
                println!("  error   {}: {}", source.describe(), e);
            }
        }
    }

    println!();
    println!("Completed: {completed}  Failed: {failed}  Chunks: {chunks}");
    if failed > 0 && completed == 0 {
        bail!("all {failed} document(s) failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use tempfile::TempDir;

    fn config() -> Config {
        parse_config("[db]\npath = \"/tmp/unused.sqlite\"\n").unwrap()
    }

    #[test]
    fn test_options_override_defaults() {
        let options = IngestOptions {
            strategy: Some("fixed".into()),
            chunk_size: Some(1000),
            chunk_overlap: Some(100),
            ..IngestOptions::default()
        };
        let params = options.params(config().chunking.params()).unwrap();
        assert_eq!(params.strategy, ChunkStrategy::Fixed);
        assert_eq!(params.chunk_size, 1000);
        assert_eq!(params.chunk_overlap, 100);
    }

    #[test]
    fn test_options_reject_bad_overlap() {
        let options = IngestOptions {
            chunk_size: Some(100),
            chunk_overlap: Some(100),
            ..IngestOptions::default()
        };
        assert!(options.params(config().chunking.params()).is_err());
    }

    #[test]
    fn test_options_reject_unknown_strategy() {
        let options = IngestOptions {
            strategy: Some("bogus".into()),
            ..IngestOptions::default()
        };
        assert!(options.params(config().chunking.params()).is_err());
    }

    #[test]
    fn test_expand_directory_and_url() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.md"), "# A").unwrap();
        std::fs::write(tmp.path().join("b.bin"), [0u8, 1]).unwrap();
        let inputs = vec![
            tmp.path().to_string_lossy().to_string(),
            "https://example.com/page".to_string(),
        ];
        let sources = expand_inputs(&inputs, &config()).unwrap();
        assert_eq!(sources.len(), 2);
        assert!(matches!(&sources[0], DocumentSource::File { path } if path.ends_with("a.md")));
        assert!(matches!(&sources[1], DocumentSource::Url { .. }));
    }

    #[test]
    fn test_expand_missing_path() {
        let inputs = vec!["/definitely/not/here.txt".to_string()];
        assert!(expand_inputs(&inputs, &config()).is_err());
    }
}
