//! Deterministic provider for tests and offline runs.
//!
//! [`ScriptedProvider`] replays a queue of canned replies in order, one per
//! provider call, and records every prompt it receives so tests can assert
//! on what the runtime actually sent. An exhausted script yields
//! [`ProviderError::Unavailable`], which doubles as the standard way to
//! exercise the degraded paths (templated apologies, direct-answer
//! fallbacks).

use crate::careerllm::llm_provider::{
    LLMProvider, Message, ProviderError, ReplyChunk, ReplyStream, StructuredReply, TokenUsage,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Returned whole from `complete_structured`; streamed as a single
    /// chunk from `complete_stream`.
    Structured(String),
    /// Streamed chunk by chunk; joined when consumed via
    /// `complete_structured`.
    Stream(Vec<String>),
    /// The call fails with the given error.
    Fail(ProviderError),
}

/// A provider that replays canned replies in FIFO order.
///
/// # Example
///
/// ```rust
/// use careerllm::providers::ScriptedProvider;
/// use careerllm::llm_provider::{LLMProvider, Message};
///
/// # tokio_test::block_on(async {
/// let provider = ScriptedProvider::new();
/// provider.push_structured("{\"ok\": true}");
///
/// let reply = provider
///     .complete_structured(&[Message::user("ping")])
///     .await
///     .unwrap();
/// assert_eq!(reply.text, "{\"ok\": true}");
/// assert_eq!(provider.prompts().len(), 1);
/// # });
/// ```
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    prompts: Mutex<Vec<String>>,
    model: String,
}

impl ScriptedProvider {
    /// Create a provider with an empty script.
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            model: "scripted".to_string(),
        }
    }

    /// Queue a structured reply.
    pub fn push_structured(&self, text: impl Into<String>) {
        self.replies
            .lock()
            .expect("script lock")
            .push_back(ScriptedReply::Structured(text.into()));
    }

    /// Queue a streamed reply made of the given chunks.
    pub fn push_stream(&self, chunks: &[&str]) {
        self.replies
            .lock()
            .expect("script lock")
            .push_back(ScriptedReply::Stream(
                chunks.iter().map(|c| c.to_string()).collect(),
            ));
    }

    /// Queue a failure.
    pub fn push_failure(&self, error: ProviderError) {
        self.replies
            .lock()
            .expect("script lock")
            .push_back(ScriptedReply::Fail(error));
    }

    /// Every prompt the provider has received, flattened to text in call
    /// order. The last message of each request is recorded.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompt lock").clone()
    }

    /// Number of replies still queued.
    pub fn remaining(&self) -> usize {
        self.replies.lock().expect("script lock").len()
    }

    fn record(&self, messages: &[Message]) {
        let last = messages
            .last()
            .map(|m| m.content.to_string())
            .unwrap_or_default();
        self.prompts.lock().expect("prompt lock").push(last);
    }

    fn pop(&self) -> Result<ScriptedReply, ProviderError> {
        self.replies
            .lock()
            .expect("script lock")
            .pop_front()
            .ok_or_else(|| ProviderError::Unavailable("script exhausted".to_string()))
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete_structured(
        &self,
        messages: &[Message],
    ) -> Result<StructuredReply, ProviderError> {
        self.record(messages);
        match self.pop()? {
            ScriptedReply::Structured(text) => Ok(StructuredReply {
                usage: Some(TokenUsage {
                    input_tokens: messages.len(),
                    output_tokens: text.len() / 4,
                    total_tokens: messages.len() + text.len() / 4,
                }),
                text,
            }),
            ScriptedReply::Stream(chunks) => Ok(StructuredReply {
                text: chunks.join(""),
                usage: None,
            }),
            ScriptedReply::Fail(error) => Err(error),
        }
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<ReplyStream, ProviderError> {
        self.record(messages);
        let chunks: Vec<String> = match self.pop()? {
            ScriptedReply::Structured(text) => vec![text],
            ScriptedReply::Stream(chunks) => chunks,
            ScriptedReply::Fail(error) => return Err(error),
        };
        let stream = futures_util::stream::iter(
            chunks
                .into_iter()
                .map(|content| Ok::<ReplyChunk, ProviderError>(ReplyChunk { content })),
        );
        Ok(Box::pin(stream))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
