//! Intent router.
//!
//! Classifies the latest user message into a recognized intent and the
//! ordered agent pipeline configured for it. The intent table is data
//! ([`RouterConfig`](crate::config::RouterConfig)); the router offers it to
//! the classifier and then validates whatever comes back:
//!
//! - agent names that do not resolve in the registry are dropped,
//! - duplicates are removed preserving first occurrence,
//! - below the confidence threshold (or on an empty pipeline) the turn is
//!   answered directly without any agent step.
//!
//! The router never fails a turn: a classifier outage degrades to the
//! direct-answer path and is logged.

use serde::Deserialize;
use std::sync::Arc;

use crate::careerllm::agent::AgentRegistry;
use crate::careerllm::config::RouterConfig;
use crate::careerllm::llm_provider::{LLMProvider, Message};
use crate::careerllm::parse;
use crate::careerllm::store::{MessageRole, StoredMessage};

/// Outcome of classifying one user message.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// Recognized intent, or `"general"` when classification fell through.
    pub intent: String,
    /// Ordered, validated, deduplicated agent pipeline. Empty means the
    /// turn is answered directly.
    pub agents: Vec<String>,
    /// Classifier confidence in [0, 1].
    pub confidence: f32,
    /// Whether the turn should be answered without agents.
    pub direct_response: bool,
}

impl RoutingDecision {
    fn direct(intent: impl Into<String>, confidence: f32) -> Self {
        Self {
            intent: intent.into(),
            agents: Vec::new(),
            confidence,
            direct_response: true,
        }
    }
}

#[derive(Deserialize)]
struct RawRouting {
    intent: Option<String>,
    #[serde(default)]
    agents: Vec<String>,
    confidence: Option<f32>,
    #[serde(default)]
    direct_response: bool,
}

/// LLM-backed message classifier with config-driven intents.
pub struct IntentRouter {
    provider: Arc<dyn LLMProvider>,
    registry: Arc<AgentRegistry>,
    config: RouterConfig,
}

impl IntentRouter {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        registry: Arc<AgentRegistry>,
        config: RouterConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            config,
        }
    }

    /// Classify one user message given the trailing conversation history
    /// and an optional profile hint.
    pub async fn route(
        &self,
        history: &[StoredMessage],
        user_text: &str,
        profile_hint: Option<&str>,
    ) -> RoutingDecision {
        let messages = self.build_messages(history, user_text, profile_hint);
        let reply = match self.provider.complete_structured(&messages).await {
            Ok(reply) => reply,
            Err(err) => {
                log::warn!("intent classification failed, answering directly: {}", err);
                return RoutingDecision::direct("general", 0.0);
            }
        };

        let raw: RawRouting = match parse::parse_reply(&reply.text) {
            Ok(raw) => raw,
            Err(err) => {
                log::warn!("unparseable routing reply, answering directly: {}", err);
                return RoutingDecision::direct("general", 0.0);
            }
        };

        let intent = raw.intent.unwrap_or_else(|| "general".to_string());
        let confidence = raw.confidence.unwrap_or(0.0).clamp(0.0, 1.0);

        let mut agents: Vec<String> = Vec::new();
        for agent in raw.agents {
            if !self.registry.contains(&agent) {
                log::warn!("router proposed unknown agent {}, dropping", agent);
                continue;
            }
            if !agents.contains(&agent) {
                agents.push(agent);
            }
        }

        if raw.direct_response
            || agents.is_empty()
            || confidence < self.config.confidence_threshold
        {
            return RoutingDecision::direct(intent, confidence);
        }

        RoutingDecision {
            intent,
            agents,
            confidence,
            direct_response: false,
        }
    }

    fn build_messages(
        &self,
        history: &[StoredMessage],
        user_text: &str,
        profile_hint: Option<&str>,
    ) -> Vec<Message> {
        let mut table = String::new();
        for rule in &self.config.intents {
            table.push_str(&format!(
                "- {} -> agents [{}]\n",
                rule.intent,
                rule.agents.join(", ")
            ));
        }

        let mut system = format!(
            "You route requests in a career-assistance product to specialist \
             agents. Recognized intents and their default pipelines:\n{}\n\
             Known agents: {}.\n\
             Reply with a single JSON object: {{\"intent\": string, \
             \"agents\": [string], \"confidence\": number between 0 and 1, \
             \"direct_response\": boolean}}. Use direct_response true (with an \
             empty agent list) for small talk or anything no agent helps with.",
            table,
            self.registry.names().join(", ")
        );
        if let Some(hint) = profile_hint {
            if !hint.is_empty() {
                system.push_str(&format!("\n\nAbout this user:\n{}", hint));
            }
        }

        let mut messages = vec![Message::system(&system)];
        let window = history
            .len()
            .saturating_sub(self.config.history_window);
        for stored in &history[window..] {
            messages.push(match stored.role {
                MessageRole::User => Message::user(&stored.content),
                MessageRole::Assistant => Message::assistant(&stored.content),
            });
        }
        messages.push(Message::user(user_text));
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::careerllm::providers::ScriptedProvider;

    fn router(provider: Arc<ScriptedProvider>) -> IntentRouter {
        IntentRouter::new(
            provider,
            Arc::new(AgentRegistry::default_catalog()),
            RouterConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_valid_pipeline_passes_through() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_structured(
            "{\"intent\": \"application_help\", \"agents\": [\"match\", \"forge\"], \
             \"confidence\": 0.9}",
        );
        let decision = router(provider).route(&[], "help with my application", None).await;
        assert_eq!(decision.intent, "application_help");
        assert_eq!(decision.agents, vec!["match".to_string(), "forge".to_string()]);
        assert!(!decision.direct_response);
    }

    #[tokio::test]
    async fn test_unknown_agents_are_dropped_and_duplicates_deduped() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_structured(
            "{\"intent\": \"job_search\", \
             \"agents\": [\"scout\", \"phantom\", \"scout\", \"match\"], \
             \"confidence\": 0.8}",
        );
        let decision = router(provider).route(&[], "find me a job", None).await;
        assert_eq!(decision.agents, vec!["scout".to_string(), "match".to_string()]);
    }

    #[tokio::test]
    async fn test_low_confidence_goes_direct() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_structured(
            "{\"intent\": \"job_search\", \"agents\": [\"scout\"], \"confidence\": 0.3}",
        );
        let decision = router(provider).route(&[], "hmm", None).await;
        assert!(decision.direct_response);
        assert!(decision.agents.is_empty());
    }

    #[tokio::test]
    async fn test_classifier_outage_degrades_to_direct() {
        let provider = Arc::new(ScriptedProvider::new());
        let decision = router(provider).route(&[], "hello", None).await;
        assert!(decision.direct_response);
        assert_eq!(decision.intent, "general");
    }

    #[tokio::test]
    async fn test_empty_pipeline_with_high_confidence_is_direct() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_structured(
            "{\"intent\": \"small_talk\", \"agents\": [], \"confidence\": 0.95, \
             \"direct_response\": true}",
        );
        let decision = router(provider).route(&[], "hello", None).await;
        assert!(decision.direct_response);
        assert!((decision.confidence - 0.95).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_history_window_limits_context() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_structured(
            "{\"intent\": \"job_search\", \"agents\": [\"scout\"], \"confidence\": 0.9}",
        );
        let history: Vec<StoredMessage> = (0..10)
            .map(|i| StoredMessage {
                id: format!("m{}", i),
                conversation_id: "c1".to_string(),
                role: MessageRole::User,
                content: format!("message {}", i),
                ordinal: i + 1,
                created_at: chrono::Utc::now(),
            })
            .collect();
        let r = router(provider.clone());
        let _ = r.route(&history, "find jobs", None).await;
        // System prompt + windowed history (6) + current message were sent;
        // the recorded prompt is the last message.
        assert_eq!(provider.prompts(), vec!["find jobs".to_string()]);
    }
}
