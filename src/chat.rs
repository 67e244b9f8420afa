//! Retrieval-augmented chat turns.
//!
//! One call to [`ChatService::append_message`] is one turn:
//!
//! 1. record the user message (`metadata.rag_enabled`)
//! 2. optionally retrieve `k` chunks and fold them into a system prompt
//! 3. send system prompt + bounded history to the completion model
//! 4. record the assistant reply with `metadata.sources` and `metadata.tokens`
//!
//! A failure in step 2 or 3 is recorded as an `[ERROR]: ...` assistant
//! message so the conversation log shows what happened, then returned.
//!
//! [`ChatService::stream_message`] runs the same turn against
//! [`CompletionModel::stream`] and can be cancelled part-way through.

use std::io::Write;
use std::sync::Arc;

use ragline_core::error::{RagError, Result};
use ragline_core::models::{ChatMessage, LlmMessage, ScoredChunk};
use ragline_core::retrieval::RetrievalMode;
use ragline_core::store::RecordFilter;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::completion::{Completion, CompletionModel, TokenUsage};
use crate::memory::{ChatMemoryManager, ChatSession};
use crate::processor::DocumentProcessor;

const CONTEXT_PREAMBLE: &str = "Use the following information to answer the user's question:";

/// Retrieval options for one turn.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RagConfig {
    /// Chunks to retrieve. Falls back to `retrieval.top_k`.
    pub k: Option<usize>,
    /// Restrict retrieval to one document.
    pub document_id: Option<String>,
    /// Falls back to `retrieval.mode`.
    pub mode: Option<RetrievalMode>,
}

pub struct ChatService {
    memory: ChatMemoryManager,
    processor: DocumentProcessor,
    completion: Arc<dyn CompletionModel>,
    default_k: usize,
}

impl ChatService {
    pub fn new(
        memory: ChatMemoryManager,
        processor: DocumentProcessor,
        completion: Arc<dyn CompletionModel>,
        default_k: usize,
    ) -> Self {
        Self {
            memory,
            processor,
            completion,
            default_k,
        }
    }

    pub fn memory(&self) -> &ChatMemoryManager {
        &self.memory
    }

    /// Run one turn and return the recorded assistant message.
    pub async fn append_message(
        &self,
        conversation_id: &str,
        content: &str,
        use_rag: bool,
        rag_config: Option<RagConfig>,
    ) -> Result<ChatMessage> {
        let session = self.memory.session(conversation_id);
        session
            .add_user_message(content, Some(serde_json::json!({ "rag_enabled": use_rag })))
            .await?;

        match self.respond(&session, content, use_rag, rag_config).await {
            Ok(message) => Ok(message),
            Err(e) => self.record_failure(&session, e).await,
        }
    }

    /// Run one turn, passing reply fragments to `on_fragment` as they
    /// arrive, and return the recorded assistant message.
    ///
    /// When `cancel` fires mid-reply, whatever text arrived so far is
    /// recorded with `metadata.cancelled = true` and returned. Cancelling
    /// before the reply starts yields [`RagError::Cancelled`]; that and other
    /// failures are recorded as in [`append_message`](Self::append_message).
    pub async fn stream_message<F>(
        &self,
        conversation_id: &str,
        content: &str,
        use_rag: bool,
        rag_config: Option<RagConfig>,
        cancel: &CancellationToken,
        on_fragment: F,
    ) -> Result<ChatMessage>
    where
        F: FnMut(&str) + Send,
    {
        let session = self.memory.session(conversation_id);
        session
            .add_user_message(content, Some(serde_json::json!({ "rag_enabled": use_rag })))
            .await?;

        let result = self
            .respond_streaming(&session, content, use_rag, rag_config, cancel, on_fragment)
            .await;
        match result {
            Ok(message) => Ok(message),
            Err(e) => self.record_failure(&session, e).await,
        }
    }

    async fn record_failure(&self, session: &ChatSession, e: RagError) -> Result<ChatMessage> {
        tracing::error!(
            conversation_id = session.conversation_id(),
            error = %e,
            "chat turn failed"
        );
        session
            .add_assistant_message(
                format!("[ERROR]: {e}"),
                Some(serde_json::json!({ "error": e.kind() })),
            )
            .await?;
        Err(e)
    }

    /// Retrieve sources and assemble the prompt for one turn.
    async fn prepare(
        &self,
        session: &ChatSession,
        query: &str,
        use_rag: bool,
        rag_config: Option<RagConfig>,
    ) -> Result<(Vec<ScoredChunk>, Vec<LlmMessage>)> {
        let sources = if use_rag {
            let rag = rag_config.unwrap_or_default();
            let filter = rag.document_id.map(RecordFilter::document);
            let k = rag.k.unwrap_or(self.default_k);
            match rag.mode {
                Some(mode) => self.processor.retrieve(query, k, filter.as_ref(), mode).await?,
                None => self.processor.retrieve_similar(query, k, filter.as_ref()).await?,
            }
        } else {
            Vec::new()
        };

        let system_prompt = build_system_prompt(&sources);
        let messages = session.get_messages_for_llm(system_prompt.as_deref()).await?;
        Ok((sources, messages))
    }

    async fn respond(
        &self,
        session: &ChatSession,
        query: &str,
        use_rag: bool,
        rag_config: Option<RagConfig>,
    ) -> Result<ChatMessage> {
        let (sources, messages) = self.prepare(session, query, use_rag, rag_config).await?;
        let completion = self.completion.complete(&messages).await?;
        self.record_reply(session, &sources, &messages, completion, false)
            .await
    }

    async fn respond_streaming<F>(
        &self,
        session: &ChatSession,
        query: &str,
        use_rag: bool,
        rag_config: Option<RagConfig>,
        cancel: &CancellationToken,
        mut on_fragment: F,
    ) -> Result<ChatMessage>
    where
        F: FnMut(&str) + Send,
    {
        let (sources, messages) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RagError::Cancelled),
            prepared = self.prepare(session, query, use_rag, rag_config) => prepared?,
        };
        let mut fragments = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RagError::Cancelled),
            stream = self.completion.stream(&messages) => stream?,
        };

        let mut reply = String::new();
        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                next = fragments.recv() => match next {
                    Some(fragment) => {
                        let fragment = fragment?;
                        on_fragment(fragment.as_str());
                        reply.push_str(&fragment);
                    }
                    None => break,
                },
            }
        }
        if cancelled {
            tracing::info!(
                conversation_id = session.conversation_id(),
                received_chars = reply.len(),
                "streamed reply cancelled"
            );
        }

        let completion = Completion {
            content: reply,
            usage: None,
        };
        self.record_reply(session, &sources, &messages, completion, cancelled)
            .await
    }

    async fn record_reply(
        &self,
        session: &ChatSession,
        sources: &[ScoredChunk],
        messages: &[LlmMessage],
        completion: Completion,
        cancelled: bool,
    ) -> Result<ChatMessage> {
        let usage = completion
            .usage
            .unwrap_or_else(|| self.estimate_usage(messages, &completion.content));
        tracing::info!(
            conversation_id = session.conversation_id(),
            model = self.completion.model_name(),
            sources = sources.len(),
            prompt_tokens = usage.prompt,
            completion_tokens = usage.completion,
            "assistant replied"
        );

        let mut metadata = serde_json::json!({
            "sources": sources
                .iter()
                .map(|s| serde_json::json!({
                    "document_id": s.document_id,
                    "chunk_id": s.chunk_id,
                    "content": s.content,
                    "score": s.score,
                }))
                .collect::<Vec<_>>(),
            "tokens": usage,
        });
        if cancelled {
            metadata["cancelled"] = serde_json::Value::Bool(true);
        }
        session
            .add_assistant_message(completion.content, Some(metadata))
            .await
    }

    fn estimate_usage(&self, messages: &[LlmMessage], reply: &str) -> TokenUsage {
        let counter = self.memory.token_counter();
        let prompt = messages.iter().map(|m| counter.count(&m.content)).sum();
        let completion = counter.count(reply);
        TokenUsage {
            prompt,
            completion,
            total: prompt + completion,
        }
    }
}

/// `ragline chat`: one turn, reply printed as plain text. With `stream`
/// the reply is printed as it arrives and Ctrl-C stops it early.
pub async fn run_chat(
    chat: &ChatService,
    conversation_id: &str,
    message: &str,
    use_rag: bool,
    rag_config: RagConfig,
    stream: bool,
) -> anyhow::Result<()> {
    let reply = if stream {
        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_interrupt.cancel();
            }
        });
        let reply = chat
            .stream_message(
                conversation_id,
                message,
                use_rag,
                Some(rag_config),
                &cancel,
                |fragment| {
                    print!("{fragment}");
                    let _ = std::io::stdout().flush();
                },
            )
            .await;
        watcher.abort();
        println!();
        reply?
    } else {
        let reply = chat
            .append_message(conversation_id, message, use_rag, Some(rag_config))
            .await?;
        println!("{}", reply.content);
        reply
    };
    if let Some(sources) = reply.metadata.get("sources").and_then(|s| s.as_array()) {
        if !sources.is_empty() {
            println!();
            for (i, source) in sources.iter().enumerate() {
                println!(
                    "[{}] {} (score {:.3})",
                    i + 1,
                    source["chunk_id"].as_str().unwrap_or_default(),
                    source["score"].as_f64().unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

/// `ragline history`: the token-bounded history as JSON.
pub async fn run_history(
    memory: &ChatMemoryManager,
    conversation_id: &str,
    include_system: bool,
) -> anyhow::Result<()> {
    let history = memory
        .session(conversation_id)
        .bounded_history(!include_system)
        .await?;
    let out = serde_json::json!({
        "conversation_id": conversation_id,
        "messages": history.messages,
        "total_tokens": history.total_tokens,
        "max_token_limit": memory.max_token_limit(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn build_system_prompt(sources: &[ScoredChunk]) -> Option<String> {
    if sources.is_empty() {
        return None;
    }
    let context = sources
        .iter()
        .enumerate()
        .map(|(i, s)| format!("[{}] ({}) {}", i + 1, s.document_id, s.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    Some(format!("{CONTEXT_PREAMBLE}\n\n{context}"))
}
