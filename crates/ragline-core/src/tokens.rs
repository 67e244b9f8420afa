//! Token accounting for chat history.
//!
//! [`select_token_bounded`] picks the longest chronological suffix of a
//! conversation that fits a token budget:
//!
//! 1. Walk messages from newest to oldest, summing token counts.
//! 2. Stop before the first message that would push the sum over the limit.
//! 3. Reverse to restore chronological order.
//!
//! The newest message is always kept, even when it alone exceeds the budget.

use crate::models::ChatMessage;

/// Deterministic token counting for one tokenizer configuration.
pub trait TokenCounter: Send + Sync {
    fn name(&self) -> &str;
    fn count(&self, text: &str) -> usize;
}

/// Whitespace word count. Used whenever the model's own tokenizer is not
/// available.
#[derive(Debug, Default, Clone, Copy)]
pub struct WordCountTokenizer;

impl TokenCounter for WordCountTokenizer {
    fn name(&self) -> &str {
        "words"
    }

    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

/// Result of [`select_token_bounded`].
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedHistory {
    /// Selected messages, oldest first.
    pub messages: Vec<ChatMessage>,
    pub total_tokens: usize,
    /// A single message larger than the budget was returned alone.
    pub over_budget: bool,
}

pub fn select_token_bounded(
    messages: &[ChatMessage],
    counter: &dyn TokenCounter,
    max_tokens: usize,
) -> BoundedHistory {
    let mut selected = Vec::new();
    let mut total = 0usize;

    for message in messages.iter().rev() {
        let tokens = counter.count(&message.content);
        if total + tokens > max_tokens {
            if selected.is_empty() {
                tracing::warn!(
                    message_id = %message.id,
                    tokens,
                    max_tokens,
                    "newest message alone exceeds the token budget, returning it anyway"
                );
                return BoundedHistory {
                    messages: vec![message.clone()],
                    total_tokens: tokens,
                    over_budget: true,
                };
            }
            break;
        }
        total += tokens;
        selected.push(message.clone());
    }

    selected.reverse();
    BoundedHistory {
        messages: selected,
        total_tokens: total,
        over_budget: false,
    }
}
