//! Evaluator: pipeline control flow between steps.
//!
//! After every agent step the orchestrator asks the evaluator what to do
//! next. The verdict is one of five decisions; anything else, and any
//! decision that violates the safety bounds, degrades to `continue` and is
//! logged rather than failing the turn.
//!
//! | decision    | meaning                                            |
//! |-------------|----------------------------------------------------|
//! | `continue`  | proceed to the next planned agent                  |
//! | `skip_next` | drop the next agent                                |
//! | `loop_back` | re-run a named earlier agent with updated context  |
//! | `stop`      | terminate early and synthesize with what exists    |
//! | `add_agent` | splice a new agent immediately after the current   |
//!
//! Safety bounds: `loop_back` on a single target is allowed at most twice
//! per turn (the [`DecisionLedger`] counts), and `add_agent` may not name
//! an agent already pending in the remaining plan.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::careerllm::agent::{AgentRegistry, AgentReport, PipelineContext};
use crate::careerllm::config::EvaluatorConfig;
use crate::careerllm::llm_provider::{LLMProvider, Message};
use crate::careerllm::parse;

/// What the pipeline should do after a step.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluatorDecision {
    Continue,
    SkipNext { reason: String },
    LoopBack { target: String, reason: String },
    Stop { reason: String },
    AddAgent { target: String, reason: String },
}

impl EvaluatorDecision {
    /// The snake_case decision name used in events.
    pub fn name(&self) -> &'static str {
        match self {
            EvaluatorDecision::Continue => "continue",
            EvaluatorDecision::SkipNext { .. } => "skip_next",
            EvaluatorDecision::LoopBack { .. } => "loop_back",
            EvaluatorDecision::Stop { .. } => "stop",
            EvaluatorDecision::AddAgent { .. } => "add_agent",
        }
    }

    /// The reason attached to the decision, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            EvaluatorDecision::Continue => None,
            EvaluatorDecision::SkipNext { reason }
            | EvaluatorDecision::LoopBack { reason, .. }
            | EvaluatorDecision::Stop { reason }
            | EvaluatorDecision::AddAgent { reason, .. } => Some(reason),
        }
    }

    /// The agent the decision targets, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            EvaluatorDecision::LoopBack { target, .. }
            | EvaluatorDecision::AddAgent { target, .. } => Some(target),
            _ => None,
        }
    }
}

/// Per-turn bookkeeping that enforces the evaluator's bounds.
#[derive(Debug, Default)]
pub struct DecisionLedger {
    loop_backs: HashMap<String, u32>,
}

impl DecisionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Times `target` has been re-run via loop_back this turn.
    pub fn loop_backs_for(&self, target: &str) -> u32 {
        self.loop_backs.get(target).copied().unwrap_or(0)
    }

    fn note_loop_back(&mut self, target: &str) {
        *self.loop_backs.entry(target.to_string()).or_insert(0) += 1;
    }
}

#[derive(Deserialize)]
struct RawDecision {
    decision: Option<String>,
    reason: Option<String>,
    target_agent: Option<String>,
}

/// LLM-backed step reviewer with bound enforcement.
pub struct Evaluator {
    provider: Arc<dyn LLMProvider>,
    config: EvaluatorConfig,
}

impl Evaluator {
    pub fn new(provider: Arc<dyn LLMProvider>, config: EvaluatorConfig) -> Self {
        Self { provider, config }
    }

    /// Review the step that just finished. Never fails: every invalid or
    /// out-of-bounds verdict degrades to [`EvaluatorDecision::Continue`].
    pub async fn review(
        &self,
        report: &AgentReport,
        executed: &[String],
        remaining: &[String],
        context: &PipelineContext,
        registry: &AgentRegistry,
        ledger: &mut DecisionLedger,
    ) -> EvaluatorDecision {
        let messages = self.build_messages(report, remaining, context);
        let reply = match self.provider.complete_structured(&messages).await {
            Ok(reply) => reply,
            Err(err) => {
                log::warn!("evaluator call failed, continuing: {}", err);
                return EvaluatorDecision::Continue;
            }
        };

        let raw: RawDecision = match parse::parse_reply(&reply.text) {
            Ok(raw) => raw,
            Err(err) => {
                log::warn!("unparseable evaluator reply, continuing: {}", err);
                return EvaluatorDecision::Continue;
            }
        };

        self.validate(raw, executed, remaining, registry, ledger)
    }

    fn validate(
        &self,
        raw: RawDecision,
        executed: &[String],
        remaining: &[String],
        registry: &AgentRegistry,
        ledger: &mut DecisionLedger,
    ) -> EvaluatorDecision {
        let decision = raw.decision.unwrap_or_default();
        let reason = raw.reason.unwrap_or_default();
        match decision.as_str() {
            "continue" | "" => EvaluatorDecision::Continue,
            "skip_next" => {
                if remaining.is_empty() {
                    log::warn!("skip_next with nothing pending, continuing");
                    return EvaluatorDecision::Continue;
                }
                EvaluatorDecision::SkipNext { reason }
            }
            "stop" => EvaluatorDecision::Stop { reason },
            "loop_back" => {
                let target = match raw.target_agent {
                    Some(target) => target,
                    None => {
                        log::warn!("loop_back without target, continuing");
                        return EvaluatorDecision::Continue;
                    }
                };
                if !executed.iter().any(|a| a == &target) {
                    log::warn!("loop_back targets {} which has not run, continuing", target);
                    return EvaluatorDecision::Continue;
                }
                if ledger.loop_backs_for(&target) >= self.config.max_loop_backs_per_target {
                    log::warn!("loop_back budget for {} exhausted, continuing", target);
                    return EvaluatorDecision::Continue;
                }
                ledger.note_loop_back(&target);
                EvaluatorDecision::LoopBack { target, reason }
            }
            "add_agent" => {
                let target = match raw.target_agent {
                    Some(target) => target,
                    None => {
                        log::warn!("add_agent without target, continuing");
                        return EvaluatorDecision::Continue;
                    }
                };
                if !registry.contains(&target) {
                    log::warn!("add_agent targets unknown agent {}, continuing", target);
                    return EvaluatorDecision::Continue;
                }
                if remaining.iter().any(|a| a == &target) {
                    log::warn!("add_agent targets already-pending {}, continuing", target);
                    return EvaluatorDecision::Continue;
                }
                EvaluatorDecision::AddAgent { target, reason }
            }
            other => {
                log::warn!("unknown evaluator decision {:?}, continuing", other);
                EvaluatorDecision::Continue
            }
        }
    }

    fn build_messages(
        &self,
        report: &AgentReport,
        remaining: &[String],
        context: &PipelineContext,
    ) -> Vec<Message> {
        let system = "You supervise a pipeline of specialist agents. Given the \
                      step that just finished, decide how the pipeline should \
                      proceed. Reply with a single JSON object: \
                      {\"decision\": one of \"continue\", \"skip_next\", \
                      \"loop_back\", \"stop\", \"add_agent\", \
                      \"reason\": string, \"target_agent\": string when the \
                      decision names an agent}. Prefer \"continue\" unless the \
                      finished step clearly changes the plan. Use \"stop\" when \
                      further steps cannot add value, for example when the \
                      finished step reported very low confidence.";

        let user = format!(
            "Finished step: {} (confidence {:.2})\nSummary: {}\nRationale: {}\n\
             Structured content: {}\n\nRemaining plan: [{}]\n\nEarlier steps:\n{}",
            report.agent,
            report.confidence,
            report.summary,
            report.rationale,
            report.content,
            remaining.join(", "),
            context.render()
        );

        vec![Message::system(system), Message::user(&user)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::careerllm::providers::ScriptedProvider;
    use serde_json::json;

    fn report(confidence: f32) -> AgentReport {
        AgentReport {
            agent: "match".to_string(),
            display_name: "Fit Analyst".to_string(),
            summary: "weak fit".to_string(),
            content: json!({ "fit_score": 0.2 }),
            confidence,
            rationale: "missing skills".to_string(),
            usage: None,
        }
    }

    fn evaluator(provider: Arc<ScriptedProvider>) -> Evaluator {
        Evaluator::new(provider, EvaluatorConfig::default())
    }

    async fn run_with_reply(
        reply: &str,
        executed: &[&str],
        remaining: &[&str],
        ledger: &mut DecisionLedger,
    ) -> EvaluatorDecision {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_structured(reply);
        let executed: Vec<String> = executed.iter().map(|s| s.to_string()).collect();
        let remaining: Vec<String> = remaining.iter().map(|s| s.to_string()).collect();
        evaluator(provider)
            .review(
                &report(0.2),
                &executed,
                &remaining,
                &PipelineContext::default(),
                &AgentRegistry::default_catalog(),
                ledger,
            )
            .await
    }

    #[tokio::test]
    async fn test_stop_passes_through() {
        let mut ledger = DecisionLedger::new();
        let decision = run_with_reply(
            "{\"decision\": \"stop\", \"reason\": \"confidence too low\"}",
            &["match"],
            &["forge"],
            &mut ledger,
        )
        .await;
        assert_eq!(decision.name(), "stop");
        assert_eq!(decision.reason(), Some("confidence too low"));
    }

    #[tokio::test]
    async fn test_loop_back_bounded_per_target() {
        let provider = Arc::new(ScriptedProvider::new());
        for _ in 0..3 {
            provider.push_structured(
                "{\"decision\": \"loop_back\", \"target_agent\": \"scout\", \
                 \"reason\": \"stale listings\"}",
            );
        }
        let evaluator = evaluator(provider);
        let executed = vec!["scout".to_string(), "match".to_string()];
        let remaining = vec!["forge".to_string()];
        let registry = AgentRegistry::default_catalog();
        let context = PipelineContext::default();
        let mut ledger = DecisionLedger::new();

        let mut names = Vec::new();
        for _ in 0..3 {
            let decision = evaluator
                .review(&report(0.4), &executed, &remaining, &context, &registry, &mut ledger)
                .await;
            names.push(decision.name());
        }
        assert_eq!(names, vec!["loop_back", "loop_back", "continue"]);
        assert_eq!(ledger.loop_backs_for("scout"), 2);
    }

    #[tokio::test]
    async fn test_loop_back_requires_an_executed_target() {
        let mut ledger = DecisionLedger::new();
        let decision = run_with_reply(
            "{\"decision\": \"loop_back\", \"target_agent\": \"coach\", \"reason\": \"r\"}",
            &["match"],
            &[],
            &mut ledger,
        )
        .await;
        assert_eq!(decision, EvaluatorDecision::Continue);
    }

    #[tokio::test]
    async fn test_add_agent_rejects_pending_duplicates() {
        let mut ledger = DecisionLedger::new();
        let decision = run_with_reply(
            "{\"decision\": \"add_agent\", \"target_agent\": \"forge\", \"reason\": \"r\"}",
            &["match"],
            &["forge"],
            &mut ledger,
        )
        .await;
        assert_eq!(decision, EvaluatorDecision::Continue);

        let mut ledger = DecisionLedger::new();
        let decision = run_with_reply(
            "{\"decision\": \"add_agent\", \"target_agent\": \"insight\", \"reason\": \"r\"}",
            &["match"],
            &["forge"],
            &mut ledger,
        )
        .await;
        assert_eq!(decision.name(), "add_agent");
        assert_eq!(decision.target(), Some("insight"));
    }

    #[tokio::test]
    async fn test_garbage_degrades_to_continue() {
        let mut ledger = DecisionLedger::new();
        let decision = run_with_reply(
            "{\"decision\": \"explode\"}",
            &["match"],
            &["forge"],
            &mut ledger,
        )
        .await;
        assert_eq!(decision, EvaluatorDecision::Continue);

        let mut ledger = DecisionLedger::new();
        let decision =
            run_with_reply("not json at all", &["match"], &["forge"], &mut ledger).await;
        assert_eq!(decision, EvaluatorDecision::Continue);
    }

    #[tokio::test]
    async fn test_provider_outage_degrades_to_continue() {
        let provider = Arc::new(ScriptedProvider::new());
        let mut ledger = DecisionLedger::new();
        let decision = evaluator(provider)
            .review(
                &report(0.2),
                &["match".to_string()],
                &["forge".to_string()],
                &PipelineContext::default(),
                &AgentRegistry::default_catalog(),
                &mut ledger,
            )
            .await;
        assert_eq!(decision, EvaluatorDecision::Continue);
    }
}
