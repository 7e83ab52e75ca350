//! Provider-agnostic LLM capability interface.
//!
//! The runtime never talks to a vendor SDK directly. Everything that needs
//! a model (the agent runtime, the router, the evaluator, the negotiator,
//! the planners, and turn synthesis) goes through [`LLMProvider`], which is
//! injected at construction and swappable per deployment.
//!
//! Two operations cover every call site:
//!
//! - [`complete_structured`](LLMProvider::complete_structured): one
//!   request/response round trip whose reply is expected to carry a JSON
//!   payload. Parsing happens in the caller so that repair prompts can see
//!   the raw text.
//! - [`complete_stream`](LLMProvider::complete_stream): an incremental
//!   token stream used for user-facing prose (direct answers and turn
//!   synthesis).
//!
//! # Example
//!
//! ```rust,no_run
//! use careerllm::llm_provider::{LLMProvider, Message, Role};
//! use careerllm::providers::ScriptedProvider;
//!
//! # async {
//! let provider = ScriptedProvider::new();
//! provider.push_structured(r#"{"answer": 4}"#);
//!
//! let reply = provider
//!     .complete_structured(&[Message::user("What is 2+2? Reply as JSON.")])
//!     .await
//!     .unwrap();
//! assert!(reply.text.contains("4"));
//! # };
//! ```

use async_trait::async_trait;
use futures_util::stream::Stream;
use std::error::Error;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

/// The role attached to a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// A system message that primes or constrains model behaviour.
    System,
    /// A user-authored message.
    User,
    /// A model-authored message.
    Assistant,
}

/// One chat message in a provider request.
///
/// Content is stored as `Arc<str>` so histories can be cloned cheaply when
/// they are re-assembled for every agent in a pipeline.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: Arc<str>,
}

impl Message {
    /// Build a system message.
    pub fn system(content: impl AsRef<str>) -> Self {
        Self {
            role: Role::System,
            content: Arc::from(content.as_ref()),
        }
    }

    /// Build a user message.
    pub fn user(content: impl AsRef<str>) -> Self {
        Self {
            role: Role::User,
            content: Arc::from(content.as_ref()),
        }
    }

    /// Build an assistant message.
    pub fn assistant(content: impl AsRef<str>) -> Self {
        Self {
            role: Role::Assistant,
            content: Arc::from(content.as_ref()),
        }
    }
}

/// Prompt and completion token counts for one provider call.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

impl TokenUsage {
    /// Fold another usage record into this one.
    pub fn absorb(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// The reply to a [`complete_structured`](LLMProvider::complete_structured)
/// call. The text is expected, not guaranteed, to contain a JSON object;
/// callers own the parse and any repair round.
#[derive(Debug, Clone)]
pub struct StructuredReply {
    /// Raw model output.
    pub text: String,
    /// Token accounting if the provider reports it.
    pub usage: Option<TokenUsage>,
}

/// An incremental piece of a streamed reply.
///
/// Chunks with empty content are legal (some providers emit bookkeeping
/// frames) and are skipped by consumers.
#[derive(Debug, Clone)]
pub struct ReplyChunk {
    pub content: String,
}

/// Boxed chunk stream returned by [`LLMProvider::complete_stream`].
pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<ReplyChunk, ProviderError>> + Send>>;

/// Failures surfaced by a provider implementation.
#[derive(Debug, Clone)]
pub enum ProviderError {
    /// The provider could not be reached or refused the request.
    Unavailable(String),
    /// The stream ended abnormally mid-reply.
    Interrupted(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Unavailable(msg) => write!(f, "provider unavailable: {}", msg),
            ProviderError::Interrupted(msg) => write!(f, "stream interrupted: {}", msg),
        }
    }
}

impl Error for ProviderError {}

/// Capability interface implemented by concrete model backends.
///
/// Implementations must be `Send + Sync`; a single provider instance is
/// shared across concurrent turns and negotiation rounds.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// One request/response round trip whose reply should carry JSON.
    async fn complete_structured(
        &self,
        messages: &[Message],
    ) -> Result<StructuredReply, ProviderError>;

    /// Stream an answer token by token. Used for user-facing prose.
    async fn complete_stream(&self, messages: &[Message]) -> Result<ReplyStream, ProviderError>;

    /// Identifier of the backing model, for logging and traces.
    fn model_name(&self) -> &str;
}
