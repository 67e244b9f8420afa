//! Token-bounded conversation memory.
//!
//! [`ChatMemoryManager`] is shared process-wide; [`ChatMemoryManager::session`]
//! hands out a [`ChatSession`] for one conversation. Messages are persisted
//! through a [`MessageRepository`]; the manager only owns ordering and
//! token accounting.
//!
//! Appends and reads of one conversation are serialized by a per-session
//! async mutex, so a reader never observes a half-written message and
//! timestamps are strictly increasing within a session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use ragline_core::error::{RagError, Result};
use ragline_core::models::{ChatMessage, LlmMessage, Role};
use ragline_core::store::MessageRepository;
use ragline_core::tokens::{select_token_bounded, BoundedHistory, TokenCounter};
use tokio::sync::Mutex;

#[derive(Default)]
struct SessionState {
    /// Timestamp of the newest message, once loaded.
    last: Option<DateTime<Utc>>,
    loaded: bool,
}

struct Shared {
    messages: Arc<dyn MessageRepository>,
    counter: Arc<dyn TokenCounter>,
    max_token_limit: usize,
    sessions: StdMutex<HashMap<String, Arc<Mutex<SessionState>>>>,
}

#[derive(Clone)]
pub struct ChatMemoryManager {
    shared: Arc<Shared>,
}

impl ChatMemoryManager {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        counter: Arc<dyn TokenCounter>,
        max_token_limit: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                messages,
                counter,
                max_token_limit,
                sessions: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn max_token_limit(&self) -> usize {
        self.shared.max_token_limit
    }

    pub fn token_counter(&self) -> &dyn TokenCounter {
        self.shared.counter.as_ref()
    }

    pub fn session(&self, conversation_id: impl Into<String>) -> ChatSession {
        let conversation_id = conversation_id.into();
        let state = self
            .shared
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(conversation_id.clone())
            .or_default()
            .clone();
        ChatSession {
            shared: Arc::clone(&self.shared),
            conversation_id,
            state,
        }
    }
}

/// Memory of one conversation.
#[derive(Clone)]
pub struct ChatSession {
    shared: Arc<Shared>,
    conversation_id: String,
    state: Arc<Mutex<SessionState>>,
}

impl ChatSession {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub async fn add_user_message(
        &self,
        content: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<ChatMessage> {
        self.append(Role::User, content.into(), metadata).await
    }

    pub async fn add_assistant_message(
        &self,
        content: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<ChatMessage> {
        self.append(Role::Assistant, content.into(), metadata).await
    }

    pub async fn add_system_message(
        &self,
        content: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<ChatMessage> {
        self.append(Role::System, content.into(), metadata).await
    }

    async fn append(
        &self,
        role: Role,
        content: String,
        metadata: Option<serde_json::Value>,
    ) -> Result<ChatMessage> {
        if self.conversation_id.trim().is_empty() {
            return Err(RagError::validation("conversation id must not be empty"));
        }
        let mut state = self.state.lock().await;
        if !state.loaded {
            let log = self.shared.messages.list(&self.conversation_id).await?;
            state.last = log.last().map(|m| m.timestamp);
            state.loaded = true;
        }

        // Stored timestamps have millisecond resolution.
        let mut timestamp = Utc::now();
        if let Some(last) = state.last {
            if timestamp <= last + Duration::milliseconds(1) {
                timestamp = last + Duration::milliseconds(1);
            }
        }

        let message = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: self.conversation_id.clone(),
            role,
            content,
            timestamp,
            metadata: metadata.unwrap_or_else(|| serde_json::json!({})),
        };
        self.shared.messages.append(&message).await?;
        state.last = Some(timestamp);

        tracing::debug!(
            conversation_id = %self.conversation_id,
            role = role.as_str(),
            tokens = self.shared.counter.count(&message.content),
            "message appended"
        );
        Ok(message)
    }

    /// Every stored message, oldest first.
    pub async fn all_messages(&self) -> Result<Vec<ChatMessage>> {
        let _state = self.state.lock().await;
        self.shared.messages.list(&self.conversation_id).await
    }

    /// The longest suffix of the conversation within the token budget,
    /// with its token total.
    pub async fn bounded_history(&self, exclude_system: bool) -> Result<BoundedHistory> {
        let log = {
            let _state = self.state.lock().await;
            self.shared.messages.list(&self.conversation_id).await?
        };
        let candidates: Vec<ChatMessage> = if exclude_system {
            log.into_iter().filter(|m| m.role != Role::System).collect()
        } else {
            log
        };
        Ok(select_token_bounded(
            &candidates,
            self.shared.counter.as_ref(),
            self.shared.max_token_limit,
        ))
    }

    pub async fn get_chat_history(&self, exclude_system: bool) -> Result<Vec<ChatMessage>> {
        Ok(self.bounded_history(exclude_system).await?.messages)
    }

    /// `system_prompt` (if any) followed by the bounded history, stored
    /// system messages included. The prompt does not count against the
    /// budget.
    pub async fn get_messages_for_llm(&self, system_prompt: Option<&str>) -> Result<Vec<LlmMessage>> {
        let history = self.bounded_history(false).await?;
        let mut out = Vec::with_capacity(history.messages.len() + 1);
        if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
            out.push(LlmMessage {
                role: Role::System,
                content: prompt.to_string(),
            });
        }
        out.extend(history.messages.iter().map(LlmMessage::from));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragline_core::store::memory::InMemoryMessageRepository;
    use ragline_core::tokens::WordCountTokenizer;

    fn manager(limit: usize) -> ChatMemoryManager {
        ChatMemoryManager::new(
            Arc::new(InMemoryMessageRepository::new()),
            Arc::new(WordCountTokenizer),
            limit,
        )
    }

    fn words(n: usize, tag: usize) -> String {
        (0..n).map(|i| format!("w{tag}_{i}")).collect::<Vec<_>>().join(" ")
    }

    #[tokio::test]
    async fn test_budget_keeps_two_most_recent() {
        let session = manager(50).session("c1");
        let mut ids = Vec::new();
        for i in 0..5 {
            let m = if i % 2 == 0 {
                session.add_user_message(words(20, i), None).await.unwrap()
            } else {
                session.add_assistant_message(words(20, i), None).await.unwrap()
            };
            ids.push(m.id);
        }
        let history = session.get_chat_history(true).await.unwrap();
        let got: Vec<&str> = history.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(got, vec![ids[3].as_str(), ids[4].as_str()]);
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let session = manager(100).session("c1");
        let a = session.add_user_message("one", None).await.unwrap();
        let b = session.add_user_message("two", None).await.unwrap();
        let c = session.add_user_message("three", None).await.unwrap();
        assert!(a.timestamp < b.timestamp && b.timestamp < c.timestamp);
    }

    #[tokio::test]
    async fn test_system_messages_excluded_by_default() {
        let session = manager(100).session("c1");
        session.add_system_message("be brief", None).await.unwrap();
        session.add_user_message("hi", None).await.unwrap();

        let history = session.get_chat_history(true).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(session.get_chat_history(false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_messages_for_llm_prompt_outside_budget() {
        let session = manager(3).session("c1");
        session.add_user_message("one two three", None).await.unwrap();

        let messages = session
            .get_messages_for_llm(Some("a long system prompt well over the budget"))
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "one two three");
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let memory = manager(100);
        memory.session("a").add_user_message("for a", None).await.unwrap();
        memory.session("b").add_user_message("for b", None).await.unwrap();
        let a = memory.session("a").get_chat_history(true).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].content, "for a");
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_ordered() {
        let memory = manager(10_000);
        let mut handles = Vec::new();
        for i in 0..20 {
            let session = memory.session("c1");
            handles.push(tokio::spawn(async move {
                session.add_user_message(format!("m{i}"), None).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let log = memory.session("c1").all_messages().await.unwrap();
        assert_eq!(log.len(), 20);
        assert!(log.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_empty_conversation_id_rejected() {
        let err = manager(10)
            .session(" ")
            .add_user_message("x", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
