//! Chat completion models.
//!
//! The chat service hands a [`CompletionModel`] the role-tagged message
//! sequence built by chat memory and records whatever text comes back.
//! [`OpenAICompletion`] speaks `POST {url}/v1/chat/completions`, which also
//! covers LM Studio, vLLM and Ollama's OpenAI-compatible endpoint.
//!
//! Streaming replies arrive as server-sent events; each `data:` line carries
//! one `choices[0].delta.content` fragment and `data: [DONE]` ends the reply.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use ragline_core::error::{RagError, Result};
use ragline_core::models::LlmMessage;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::CompletionConfig;
use crate::embedding::http_client;
use crate::retry::{classify_reqwest, classify_status, with_retry, RetryPolicy};

const DEFAULT_URL: &str = "https://api.openai.com";

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: usize,
    pub completion: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    /// `None` when the provider did not report usage.
    pub usage: Option<TokenUsage>,
}

/// Reply text fragments in arrival order. The channel closes once the
/// reply is complete; an `Err` item ends the reply early.
pub type CompletionStream = mpsc::Receiver<Result<String>>;

#[async_trait]
pub trait CompletionModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, messages: &[LlmMessage]) -> Result<Completion>;

    /// Stream the reply. Models without native streaming deliver the whole
    /// [`complete`](Self::complete) reply as a single fragment.
    async fn stream(&self, messages: &[LlmMessage]) -> Result<CompletionStream> {
        let completion = self.complete(messages).await?;
        let (tx, rx) = mpsc::channel(1);
        // Capacity 1 and a fresh receiver: this send cannot wait.
        let _ = tx.send(Ok(completion.content)).await;
        Ok(rx)
    }
}

/// Stand-in used when `[completion] provider = "disabled"`.
pub struct DisabledCompletion;

#[async_trait]
impl CompletionModel for DisabledCompletion {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _messages: &[LlmMessage]) -> Result<Completion> {
        Err(RagError::validation(
            "no completion provider configured (set [completion] provider)",
        ))
    }
}

pub struct OpenAICompletion {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
    retry: RetryPolicy,
}

impl OpenAICompletion {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() && url == DEFAULT_URL {
            return Err(RagError::validation(format!(
                "{} environment variable not set",
                config.api_key_env
            )));
        }
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url,
            model: config.model.clone(),
            api_key,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            retry: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.retry_base_ms),
            ),
        })
    }

    fn body(&self, messages: &[LlmMessage], stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| serde_json::json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": stream,
        })
    }

    /// POST the body and return the response once it has a success status.
    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(format!("{}/v1/chat/completions", self.url))
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| classify_reqwest("completion", e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status("completion", status, &text));
        }
        Ok(response)
    }

    async fn request(&self, body: &serde_json::Value) -> Result<Completion> {
        let response = self.send(body).await?;
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| classify_reqwest("completion", e))?;
        parse_chat_response(&json)
    }
}

#[async_trait]
impl CompletionModel for OpenAICompletion {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[LlmMessage]) -> Result<Completion> {
        let body = self.body(messages, false);
        let started = std::time::Instant::now();
        let completion = with_retry(&self.retry, "completion", None, || self.request(&body)).await?;
        tracing::debug!(
            model = %self.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "completion received"
        );
        Ok(completion)
    }

    async fn stream(&self, messages: &[LlmMessage]) -> Result<CompletionStream> {
        let body = self.body(messages, true);
        // Only connecting is retried; a reply cut off mid-stream is not.
        let response = with_retry(&self.retry, "completion", None, || self.send(&body)).await?;

        let (tx, rx) = mpsc::channel(32);
        let mut bytes = response.bytes_stream();
        tokio::spawn(async move {
            let mut pending: Vec<u8> = Vec::new();
            while let Some(item) = bytes.next().await {
                match item {
                    Ok(chunk) => pending.extend_from_slice(&chunk),
                    Err(e) => {
                        let _ = tx.send(Err(classify_reqwest("completion", e))).await;
                        return;
                    }
                }
                // Events may be split across network chunks; only act on
                // complete lines.
                while let Some(end) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=end).collect();
                    let event = parse_sse_line(&String::from_utf8_lossy(&line));
                    let fragment = match event {
                        Ok(SseEvent::Delta(text)) => Ok(text),
                        Ok(SseEvent::Done) => return,
                        Ok(SseEvent::Skip) => continue,
                        Err(e) => Err(e),
                    };
                    let failed = fragment.is_err();
                    if tx.send(fragment).await.is_err() || failed {
                        // Receiver gone or the provider sent garbage.
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Delta(String),
    Done,
    Skip,
}

/// Interpret one line of an OpenAI-style event stream.
fn parse_sse_line(line: &str) -> Result<SseEvent> {
    let Some(data) = line.trim().strip_prefix("data:") else {
        // Blank separators, comments and `event:` lines.
        return Ok(SseEvent::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }
    let json: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| RagError::processing(format!("invalid completion stream event: {e}")))?;
    if let Some(err) = json.get("error") {
        return Err(RagError::processing(format!("completion stream error: {err}")));
    }
    match json
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
    {
        Some(text) if !text.is_empty() => Ok(SseEvent::Delta(text.to_string())),
        _ => Ok(SseEvent::Skip),
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<Completion> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| RagError::processing("invalid completion response: missing choices[0].message.content"))?
        .to_string();

    let usage = json.get("usage").and_then(|u| {
        let prompt = u.get("prompt_tokens")?.as_u64()? as usize;
        let completion = u.get("completion_tokens")?.as_u64()? as usize;
        let total = u
            .get("total_tokens")
            .and_then(|t| t.as_u64())
            .map(|t| t as usize)
            .unwrap_or(prompt + completion);
        Some(TokenUsage {
            prompt,
            completion,
            total,
        })
    });

    Ok(Completion { content, usage })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_usage() {
        let json = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "Hello"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        });
        let c = parse_chat_response(&json).unwrap();
        assert_eq!(c.content, "Hello");
        assert_eq!(
            c.usage,
            Some(TokenUsage {
                prompt: 12,
                completion: 3,
                total: 15
            })
        );
    }

    #[test]
    fn test_parse_without_usage() {
        let json = serde_json::json!({"choices": [{"message": {"content": "Hi"}}]});
        let c = parse_chat_response(&json).unwrap();
        assert!(c.usage.is_none());
    }

    #[test]
    fn test_parse_missing_choices() {
        let err = parse_chat_response(&serde_json::json!({"error": "quota"})).unwrap_err();
        assert_eq!(err.kind(), "processing");
    }

    #[test]
    fn test_sse_lines() {
        assert_eq!(
            parse_sse_line("data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n").unwrap(),
            SseEvent::Delta("Hel".into())
        );
        assert_eq!(
            parse_sse_line("data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}").unwrap(),
            SseEvent::Skip
        );
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SseEvent::Done);
        assert_eq!(parse_sse_line("").unwrap(), SseEvent::Skip);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseEvent::Skip);
        assert_eq!(parse_sse_line("data: {oops").unwrap_err().kind(), "processing");
        assert_eq!(
            parse_sse_line("data: {\"error\":{\"message\":\"quota\"}}").unwrap_err().kind(),
            "processing"
        );
    }

    #[tokio::test]
    async fn test_default_stream_is_one_fragment() {
        struct Fixed;

        #[async_trait]
        impl CompletionModel for Fixed {
            fn model_name(&self) -> &str {
                "fixed"
            }
            async fn complete(&self, _messages: &[LlmMessage]) -> Result<Completion> {
                Ok(Completion {
                    content: "whole reply".into(),
                    usage: None,
                })
            }
        }

        let mut rx = Fixed.stream(&[]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap(), "whole reply");
        assert!(rx.recv().await.is_none());
        assert_eq!(DisabledCompletion.stream(&[]).await.unwrap_err().kind(), "validation");
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = CompletionConfig {
            url: Some("http://localhost:1234".into()),
            max_retries: 0,
            retry_base_ms: 10,
            ..CompletionConfig::default()
        };
        let model = OpenAICompletion::new(&config).unwrap();
        assert_eq!(model.retry.attempts(), 1);
        assert_eq!(model.body(&[], true)["stream"], true);
    }

    #[tokio::test]
    async fn test_disabled_rejects() {
        let err = DisabledCompletion.complete(&[]).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_default_url_requires_key() {
        let config = CompletionConfig {
            api_key_env: "RAGLINE_TEST_UNSET_COMPLETION_KEY".into(),
            ..CompletionConfig::default()
        };
        assert!(OpenAICompletion::new(&config).is_err());

        let local = CompletionConfig {
            url: Some("http://localhost:1234/".into()),
            ..config
        };
        let model = OpenAICompletion::new(&local).unwrap();
        assert_eq!(model.url, "http://localhost:1234");
    }
}
