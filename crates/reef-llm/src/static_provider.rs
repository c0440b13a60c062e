//! A provider that answers from a script.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::LlmError;
use crate::provider::{ChatMessage, Generation, LlmProvider, Role, ToolSpec};

/// Returns queued replies in order, then echoes the last user message.
///
/// Token counts are whitespace word counts. Useful offline and in tests.
#[derive(Debug)]
pub struct StaticProvider {
    name: String,
    model: String,
    replies: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
    last_tools: Mutex<Vec<String>>,
}

impl StaticProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: "static".to_string(),
            replies: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            last_tools: Mutex::new(Vec::new()),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Queues replies returned by the next calls.
    pub fn with_replies<I, S>(self, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(replies.into_iter().map(Into::into));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Tool names offered on the most recent call.
    pub fn last_tools(&self) -> Vec<String> {
        self.last_tools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn words(text: &str) -> u32 {
    u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX)
}

#[async_trait]
impl LlmProvider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSpec]>,
    ) -> Result<Generation, LlmError> {
        if messages.is_empty() {
            return Err(LlmError::InvalidInput("no messages".into()));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .last_tools
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = tools
            .unwrap_or_default()
            .iter()
            .map(|t| t.name.clone())
            .collect();

        let scripted = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let content = scripted.unwrap_or_else(|| {
            messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.clone())
                .unwrap_or_default()
        });

        Ok(Generation {
            prompt_tokens: messages.iter().map(|m| words(&m.content)).sum(),
            completion_tokens: words(&content),
            content,
            provider: self.name.clone(),
            model: self.model.clone(),
            tool_calls: Vec::new(),
        })
    }
}
