//! The ingestion and retrieval orchestrator.
//!
//! [`DocumentProcessor`] drives one document through the pipeline:
//!
//! ```text
//! load ──▶ chunk ──▶ embed (batched, ≤ N in flight) ──▶ upsert per batch
//!   │        │              │                               │
//!   └────────┴──── cancellation checkpoints ────────────────┘
//! ```
//!
//! Runs are synchronous (the caller awaits the terminal state) or
//! background tasks tracked by the [`TaskRegistry`]. Every run works on
//! one document generation; vector record ids embed the generation, so a
//! failed or cancelled run can delete exactly what it wrote with the
//! filter `{document_id, generation}` before the document is marked
//! failed.
//!
//! # Document state
//!
//! `pending → processing → completed | failed`. A cancelled run lands in
//! `failed` with error `"cancelled"`. Re-ingesting an existing id starts a
//! new generation; with `replace_previous` the older generations are
//! deleted once the new one is stored.

use std::sync::Arc;
use std::time::Instant;

use futures_util::{StreamExt, TryStreamExt};
use ragline_core::chunk::{
    build_chunker, cap_spans, chunks_from_spans, ChunkParams, ChunkStrategy, Chunker,
    SemanticChunker,
};
use ragline_core::embedding::EmbeddingModel;
use ragline_core::error::{RagError, Result};
use ragline_core::models::{
    Chunk, Document, DocumentStatus, IngestStage, ScoredChunk, SourceType, TaskStatus,
};
use ragline_core::retrieval::{merge_hybrid, RetrievalMode};
use ragline_core::store::{CollectionStats, DocumentRepository, RecordFilter, VectorRecord, VectorStore};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::loader::{DocumentSource, LoaderRegistry};
use crate::tasks::{TaskInfo, TaskProgress, TaskRegistry, TaskStatusReport};

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub collection: String,
    pub default_params: ChunkParams,
    pub replace_previous: bool,
    /// Used when a query does not pick a mode.
    pub retrieval_mode: RetrievalMode,
    /// Vector weight in hybrid mode.
    pub hybrid_alpha: f32,
}

impl ProcessorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            collection: config.vector_store.collection.clone(),
            default_params: config.chunking.params(),
            replace_previous: config.ingest.replace_previous,
            retrieval_mode: config.retrieval.mode,
            hybrid_alpha: config.retrieval.hybrid_alpha,
        }
    }
}

/// Candidates fetched from each retriever per requested hybrid result.
const HYBRID_CANDIDATE_FACTOR: usize = 4;

/// Per-call ingestion options.
#[derive(Debug, Clone, Default)]
pub struct ProcessRequest {
    /// Overrides the configured chunking parameters.
    pub params: Option<ChunkParams>,
    pub run_async: bool,
    pub title: Option<String>,
    pub owner_id: Option<String>,
    /// Re-ingest this document as a new generation, or create it with
    /// this id.
    pub document_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// The `submit-document` response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestOutcome {
    pub document_id: String,
    pub task_id: Option<String>,
    pub status: DocumentStatus,
    pub generation: u32,
    pub chunk_count: usize,
    pub error: Option<String>,
}

impl IngestOutcome {
    fn from_document(doc: &Document, task_id: Option<String>) -> Self {
        Self {
            document_id: doc.id.clone(),
            task_id,
            status: doc.status,
            generation: doc.generation,
            chunk_count: doc.chunk_count,
            error: doc.error.clone(),
        }
    }
}

/// The `search` response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub results: Vec<ScoredChunk>,
    pub total: usize,
    pub query: String,
}

/// Vector record id for one chunk of one generation.
/// A collection that does not exist yet means nothing has been ingested.
fn empty_if_missing(found: Result<Vec<ScoredChunk>>) -> Result<Vec<ScoredChunk>> {
    match found {
        Err(RagError::NotFound {
            kind: "collection", ..
        }) => Ok(Vec::new()),
        other => other,
    }
}

pub fn record_id(document_id: &str, generation: u32, chunk_index: i64) -> String {
    format!("{document_id}:{generation}:{chunk_index}")
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(RagError::Cancelled)
    } else {
        Ok(())
    }
}

fn advance(progress: Option<&TaskProgress>, stage: IngestStage) {
    if let Some(p) = progress {
        p.stage(stage);
    }
}

fn guess_source_type(source: &DocumentSource) -> SourceType {
    match source {
        DocumentSource::Text { .. } => SourceType::Text,
        DocumentSource::Url { .. } => SourceType::Url,
        DocumentSource::File { path } => {
            let is_pdf = path
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
            if is_pdf {
                SourceType::Pdf
            } else {
                SourceType::Text
            }
        }
    }
}

/// Copy keys from `extra` that `target` does not already have.
fn merge_metadata(target: &mut serde_json::Value, extra: serde_json::Value) {
    if target.is_null() {
        *target = extra;
        return;
    }
    if let (Some(map), serde_json::Value::Object(extra)) = (target.as_object_mut(), extra) {
        for (k, v) in extra {
            map.entry(k).or_insert(v);
        }
    }
}

struct Inner {
    loaders: LoaderRegistry,
    embedder: Arc<EmbeddingClient>,
    store: Arc<dyn VectorStore>,
    documents: Arc<dyn DocumentRepository>,
    tasks: Arc<TaskRegistry>,
    settings: ProcessorSettings,
    /// Serializes document admission so two requests cannot both start a
    /// new generation of the same document.
    admission: Mutex<()>,
}

/// Cheap to clone; clones share the same task registry.
#[derive(Clone)]
pub struct DocumentProcessor {
    inner: Arc<Inner>,
}

impl DocumentProcessor {
    pub fn new(
        loaders: LoaderRegistry,
        embedder: Arc<EmbeddingClient>,
        store: Arc<dyn VectorStore>,
        documents: Arc<dyn DocumentRepository>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                loaders,
                embedder,
                store,
                documents,
                tasks: Arc::new(TaskRegistry::new()),
                settings,
                admission: Mutex::new(()),
            }),
        }
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.inner.settings
    }

    /// Ingest one document.
    ///
    /// Invalid chunking parameters are rejected before any record is
    /// created. Otherwise a synchronous call returns the terminal state
    /// (a failed run is reported through `status`/`error`, not as `Err`),
    /// and a background call returns `pending` with a task id.
    pub async fn process_document(
        &self,
        source: DocumentSource,
        request: ProcessRequest,
    ) -> Result<IngestOutcome> {
        let params = request.params.unwrap_or(self.inner.settings.default_params);
        params.validate()?;

        let doc = {
            let _admission = self.inner.admission.lock().await;
            self.admit(&source, &request).await?
        };
        let keep_title = request.title.is_some();

        tracing::info!(
            document_id = %doc.id,
            generation = doc.generation,
            source = %source.describe(),
            strategy = %params.strategy,
            run_async = request.run_async,
            "ingestion requested"
        );

        if request.run_async {
            let progress = self.inner.tasks.register(&doc.id);
            let outcome = IngestOutcome::from_document(&doc, Some(progress.task_id().to_string()));
            let this = self.clone();
            let run_progress = progress.clone();
            let handle = tokio::spawn(async move {
                let cancel = run_progress.token();
                this.run(doc, source, params, keep_title, cancel, Some(run_progress))
                    .await;
            });
            progress.attach(handle);
            Ok(outcome)
        } else {
            let cancel = self.inner.tasks.child_token();
            let doc = self
                .run(doc, source, params, keep_title, cancel, None)
                .await;
            Ok(IngestOutcome::from_document(&doc, None))
        }
    }

    /// Create the document record, or start a new generation of an
    /// existing one.
    async fn admit(&self, source: &DocumentSource, request: &ProcessRequest) -> Result<Document> {
        let documents = &self.inner.documents;
        if let Some(id) = &request.document_id {
            if let Some(mut doc) = documents.get(id).await? {
                doc.begin_generation()?;
                doc.source_type = guess_source_type(source);
                if let Some(title) = &request.title {
                    doc.title = title.clone();
                }
                if request.owner_id.is_some() {
                    doc.owner_id = request.owner_id.clone();
                }
                if let Some(metadata) = &request.metadata {
                    doc.metadata = metadata.clone();
                }
                documents.update(&doc).await?;
                return Ok(doc);
            }
        }

        let id = request
            .document_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let title = request.title.clone().unwrap_or_else(|| source.describe());
        let mut doc = Document::new(id, title, guess_source_type(source));
        doc.owner_id = request.owner_id.clone();
        if let Some(metadata) = &request.metadata {
            doc.metadata = metadata.clone();
        }
        documents.create(&doc).await?;
        Ok(doc)
    }

    async fn run(
        &self,
        mut doc: Document,
        source: DocumentSource,
        params: ChunkParams,
        keep_title: bool,
        cancel: CancellationToken,
        progress: Option<TaskProgress>,
    ) -> Document {
        let started = Instant::now();
        let progress = progress.as_ref();

        let result = match doc.start_processing() {
            Ok(()) => {
                self.save(&doc).await;
                if let Some(p) = progress {
                    p.status(TaskStatus::Processing);
                }
                match self
                    .pipeline(&mut doc, &source, &params, keep_title, &cancel, progress)
                    .await
                {
                    Ok(count) => doc.complete(count),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                if self.inner.settings.replace_previous && doc.generation > 1 {
                    self.drop_older_generations(&doc).await;
                }
                self.save(&doc).await;
                if let Some(p) = progress {
                    p.finish(TaskStatus::Completed, None);
                }
                tracing::info!(
                    document_id = %doc.id,
                    generation = doc.generation,
                    chunks = doc.chunk_count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "ingestion completed"
                );
            }
            Err(e) => self.fail_run(&mut doc, e, progress).await,
        }
        doc
    }

    async fn pipeline(
        &self,
        doc: &mut Document,
        source: &DocumentSource,
        params: &ChunkParams,
        keep_title: bool,
        cancel: &CancellationToken,
        progress: Option<&TaskProgress>,
    ) -> Result<usize> {
        let inner = &self.inner;

        let loaded = inner.loaders.load(source).await?;
        checkpoint(cancel)?;
        advance(progress, IngestStage::Loaded);
        if !keep_title {
            doc.title = loaded.title.clone();
        }
        doc.source_type = loaded.source_type;
        merge_metadata(&mut doc.metadata, loaded.metadata);
        tracing::debug!(document_id = %doc.id, bytes = loaded.text.len(), "loaded");
        if loaded.text.trim().is_empty() {
            return Err(RagError::processing("document produced no chunks: text is blank"));
        }

        let chunks = self.chunk(&doc.id, &loaded.text, params, cancel).await?;
        if chunks.is_empty() {
            return Err(RagError::processing("document produced no chunks"));
        }
        checkpoint(cancel)?;
        advance(progress, IngestStage::Chunked);
        tracing::debug!(document_id = %doc.id, chunks = chunks.len(), "chunked");

        let collection = &inner.settings.collection;
        inner
            .store
            .ensure_collection(collection, inner.embedder.dims())
            .await?;

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let mut batches = std::pin::pin!(inner.embedder.embed_batches(&texts, Some(cancel)));
        let mut stored = 0usize;
        while let Some(batch) = batches.next().await {
            let vectors = batch?;
            checkpoint(cancel)?;

            let end = stored + vectors.len();
            let slice = chunks.get(stored..end).ok_or_else(|| {
                RagError::processing("embedding client returned more vectors than chunks")
            })?;
            let records: Vec<VectorRecord> = slice
                .iter()
                .zip(vectors)
                .map(|(chunk, embedding)| VectorRecord {
                    id: record_id(&doc.id, doc.generation, chunk.chunk_index),
                    document_id: doc.id.clone(),
                    chunk_id: chunk.id.clone(),
                    chunk_index: chunk.chunk_index,
                    generation: doc.generation,
                    content: chunk.text.clone(),
                    embedding,
                })
                .collect();
            inner.store.upsert(collection, &records).await?;
            stored = end;
            tracing::debug!(document_id = %doc.id, stored, total = chunks.len(), "batch stored");
            checkpoint(cancel)?;
        }
        advance(progress, IngestStage::Embedded);

        if stored != chunks.len() {
            return Err(RagError::processing(format!(
                "stored {stored} of {} chunks",
                chunks.len()
            )));
        }
        advance(progress, IngestStage::Stored);
        Ok(stored)
    }

    async fn chunk(
        &self,
        document_id: &str,
        text: &str,
        params: &ChunkParams,
        cancel: &CancellationToken,
    ) -> Result<Vec<Chunk>> {
        let limit = self.inner.store.max_content_chars();
        if params.strategy != ChunkStrategy::Semantic {
            let chunker = build_chunker(params)?;
            let spans = cap_spans(text, chunker.split(text), limit);
            return Ok(chunks_from_spans(document_id, text, &spans));
        }

        let chunker = SemanticChunker::new(params)?;
        let sentences: Vec<String> = chunker
            .sentences(text)
            .into_iter()
            .map(str::to_string)
            .collect();
        if sentences.is_empty() {
            return Ok(Vec::new());
        }
        let batches: Vec<Vec<Vec<f32>>> = self
            .inner
            .embedder
            .embed_batches(&sentences, Some(cancel))
            .try_collect()
            .await?;
        let vectors: Vec<Vec<f32>> = batches.into_iter().flatten().collect();
        let spans = cap_spans(text, chunker.split_with_vectors(text, &vectors)?, limit);
        Ok(chunks_from_spans(document_id, text, &spans))
    }

    /// Remove this generation's records, then mark the document failed.
    async fn fail_run(&self, doc: &mut Document, err: RagError, progress: Option<&TaskProgress>) {
        let cancelled = matches!(err, RagError::Cancelled);
        let message = if cancelled {
            "cancelled".to_string()
        } else {
            err.to_string()
        };

        let filter = RecordFilter::document(&doc.id).with("generation", doc.generation);
        match self
            .inner
            .store
            .delete(&self.inner.settings.collection, None, Some(&filter))
            .await
        {
            Ok(removed) if removed > 0 => {
                tracing::debug!(document_id = %doc.id, removed, "removed partial chunks");
            }
            Ok(_) | Err(RagError::NotFound { .. }) => {}
            Err(e) => {
                tracing::error!(document_id = %doc.id, error = %e, "failed to remove partial chunks");
            }
        }

        if let Err(e) = doc.fail(message.clone()) {
            tracing::error!(document_id = %doc.id, error = %e, "could not mark document failed");
        }
        self.save(doc).await;

        if let Some(p) = progress {
            let status = if cancelled {
                TaskStatus::Cancelled
            } else {
                TaskStatus::Failed
            };
            p.finish(status, Some(message.clone()));
        }

        if cancelled {
            tracing::warn!(document_id = %doc.id, generation = doc.generation, "ingestion cancelled");
        } else {
            tracing::error!(
                document_id = %doc.id,
                generation = doc.generation,
                kind = err.kind(),
                error = %message,
                "ingestion failed"
            );
        }
    }

    async fn drop_older_generations(&self, doc: &Document) {
        let mut removed = 0;
        for generation in 1..doc.generation {
            let filter = RecordFilter::document(&doc.id).with("generation", generation);
            match self
                .inner
                .store
                .delete(&self.inner.settings.collection, None, Some(&filter))
                .await
            {
                Ok(n) => removed += n,
                Err(e) => {
                    tracing::warn!(document_id = %doc.id, generation, error = %e, "failed to drop old generation");
                }
            }
        }
        tracing::debug!(document_id = %doc.id, removed, "dropped previous generations");
    }

    async fn save(&self, doc: &Document) {
        if let Err(e) = self.inner.documents.update(doc).await {
            tracing::error!(document_id = %doc.id, status = doc.status.as_str(), error = %e, "failed to persist document");
        }
    }

    /// Progress of a background run. The entry is discarded once a
    /// terminal status has been returned.
    pub fn get_status(&self, task_id: &str) -> Result<TaskStatusReport> {
        self.inner.tasks.get_status(task_id)
    }

    pub fn cancel(&self, task_id: &str) -> Result<()> {
        self.inner.tasks.cancel(task_id)
    }

    pub fn list_tasks(&self) -> Vec<TaskInfo> {
        self.inner.tasks.list()
    }

    /// The `k` chunks most relevant to `query` under the configured
    /// retrieval mode.
    pub async fn retrieve_similar(
        &self,
        query: &str,
        k: usize,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<ScoredChunk>> {
        self.retrieve(query, k, filter, self.inner.settings.retrieval_mode)
            .await
    }

    /// The `k` chunks most relevant to `query` under `mode`.
    ///
    /// Vector scores are raw cosine similarities. Keyword and hybrid scores
    /// are normalised to `[0, 1]`; see [`merge_hybrid`].
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: Option<&RecordFilter>,
        mode: RetrievalMode,
    ) -> Result<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        if let Some(f) = filter {
            f.validate()?;
        }
        let store = &self.inner.store;
        let collection = self.inner.settings.collection.as_str();
        let candidates = match mode {
            RetrievalMode::Vector => k,
            _ => k.saturating_mul(HYBRID_CANDIDATE_FACTOR),
        };

        let vector_hits = if mode.uses_vectors() {
            let vector = self.inner.embedder.embed_query(query).await?;
            empty_if_missing(
                store
                    .similarity_search(collection, &vector, candidates, filter)
                    .await,
            )?
        } else {
            Vec::new()
        };
        if mode == RetrievalMode::Vector {
            return Ok(vector_hits);
        }

        let keyword_hits = empty_if_missing(
            store
                .keyword_search(collection, query, candidates, filter)
                .await,
        )?;
        let alpha = match mode {
            RetrievalMode::Keyword => 0.0,
            _ => self.inner.settings.hybrid_alpha,
        };
        tracing::debug!(
            mode = %mode,
            vector = vector_hits.len(),
            keyword = keyword_hits.len(),
            "merging retrieval candidates"
        );
        Ok(merge_hybrid(keyword_hits, vector_hits, alpha, k))
    }

    pub async fn search(
        &self,
        query: &str,
        document_id: Option<&str>,
        max_results: usize,
        mode: Option<RetrievalMode>,
    ) -> Result<SearchResponse> {
        let filter = document_id.map(RecordFilter::document);
        let mode = mode.unwrap_or(self.inner.settings.retrieval_mode);
        let results = self
            .retrieve(query, max_results, filter.as_ref(), mode)
            .await?;
        Ok(SearchResponse {
            total: results.len(),
            results,
            query: query.to_string(),
        })
    }

    /// Remove the document's chunks and flag the record deleted. Returns the
    /// number of vector records removed.
    pub async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let _admission = self.inner.admission.lock().await;
        let mut doc = self
            .inner
            .documents
            .get(document_id)
            .await?
            .ok_or_else(|| RagError::not_found("document", document_id))?;
        if !doc.status.is_terminal() {
            return Err(RagError::Conflict(format!(
                "document {document_id} is still {}",
                doc.status.as_str()
            )));
        }

        let removed = match self
            .inner
            .store
            .delete(
                &self.inner.settings.collection,
                None,
                Some(&RecordFilter::document(document_id)),
            )
            .await
        {
            Err(RagError::NotFound { .. }) => 0,
            other => other?,
        };

        doc.deleted = true;
        doc.updated_at = chrono::Utc::now();
        self.inner.documents.update(&doc).await?;
        tracing::info!(document_id, removed, "document deleted");
        Ok(removed)
    }

    pub async fn get_document(&self, document_id: &str) -> Result<Document> {
        self.inner
            .documents
            .get(document_id)
            .await?
            .ok_or_else(|| RagError::not_found("document", document_id))
    }

    pub async fn list_documents(&self, owner_id: Option<&str>) -> Result<Vec<Document>> {
        self.inner.documents.list(owner_id).await
    }

    pub async fn collection_stats(&self) -> Result<CollectionStats> {
        let collection = &self.inner.settings.collection;
        match self.inner.store.stats(collection).await {
            Err(RagError::NotFound { .. }) => Ok(CollectionStats {
                collection: collection.clone(),
                count: 0,
                dimension: self.inner.embedder.dims(),
            }),
            other => other,
        }
    }

    /// Cancel all background runs and wait for their cleanup.
    pub async fn shutdown(&self) {
        self.inner.tasks.shutdown().await;
    }
}
