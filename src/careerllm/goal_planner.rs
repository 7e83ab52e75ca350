//! Goal planner.
//!
//! Turns a free-text objective into an ordered plan of agent steps, and
//! reviews a running plan when a finished step may have invalidated the
//! remaining ones. Every assigned agent is validated against the registry;
//! the planner never emits an unknown agent. An underspecified objective
//! yields a single clarifying-question step that the executor surfaces to
//! the user instead of guessing.

use serde::Deserialize;
use std::sync::Arc;

use crate::careerllm::agent::AgentRegistry;
use crate::careerllm::goal::{Goal, StepRecord, StepSpec};
use crate::careerllm::llm_provider::{LLMProvider, Message, ProviderError};
use crate::careerllm::parse;
use crate::careerllm::store::UserProfile;

/// Planner failures surfaced to the request caller.
#[derive(Debug)]
pub enum PlanError {
    /// The provider failed and no plan could be produced.
    Provider(ProviderError),
    /// The reply was unusable even after validation.
    Unplannable(String),
}

impl std::fmt::Display for PlanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanError::Provider(err) => write!(f, "{}", err),
            PlanError::Unplannable(msg) => write!(f, "objective could not be planned: {}", msg),
        }
    }
}

impl std::error::Error for PlanError {}

/// The verdict of a mid-run plan review.
#[derive(Debug, Clone)]
pub enum PlanReview {
    /// The remaining steps still make sense.
    Keep,
    /// Replace the remaining steps with a new tail.
    Revise {
        tail: Vec<StepSpec>,
        reason: String,
    },
}

#[derive(Deserialize)]
struct RawStep {
    title: String,
    #[serde(default)]
    rationale: String,
    agent: String,
}

#[derive(Deserialize)]
struct RawPlan {
    #[serde(default)]
    steps: Vec<RawStep>,
    clarifying_question: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Deserialize)]
struct RawReview {
    #[serde(default)]
    revise: bool,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    steps: Vec<RawStep>,
}

/// LLM-backed plan builder and reviewer.
pub struct GoalPlanner {
    provider: Arc<dyn LLMProvider>,
    registry: Arc<AgentRegistry>,
}

impl GoalPlanner {
    pub fn new(provider: Arc<dyn LLMProvider>, registry: Arc<AgentRegistry>) -> Self {
        Self { provider, registry }
    }

    /// Plan an objective into a goal plus its ordered steps.
    pub async fn plan(
        &self,
        user_id: &str,
        objective: &str,
        profile: Option<&UserProfile>,
    ) -> Result<(Goal, Vec<StepRecord>), PlanError> {
        let mut system = format!(
            "You plan career goals as an ordered list of steps, each handled \
             by one of these agents: {}. Reply with a single JSON object: \
             {{\"title\": string, \"steps\": [{{\"title\": string, \
             \"rationale\": string, \"agent\": string}}]}}. Keep plans short \
             (3 to 6 steps). If the objective is too vague to plan, reply \
             instead with {{\"clarifying_question\": string}}.",
            self.registry.names().join(", ")
        );
        if let Some(profile) = profile {
            let hint = profile.as_hint();
            if !hint.is_empty() {
                system.push_str(&format!("\n\nAbout this user:\n{}", hint));
            }
        }

        let reply = self
            .provider
            .complete_structured(&[Message::system(&system), Message::user(objective)])
            .await
            .map_err(PlanError::Provider)?;

        let raw: RawPlan = parse::parse_reply(&reply.text)
            .map_err(PlanError::Unplannable)?;

        if let Some(question) = raw.clarifying_question {
            // A one-step plan that surfaces the question to the user.
            let goal = Goal::new(user_id, objective, objective);
            let spec = StepSpec {
                title: question,
                rationale: "The objective needs more detail before it can be planned."
                    .to_string(),
                agent: self.fallback_agent(),
            };
            let steps = vec![StepRecord::from_spec(&goal.id, 1, &spec)];
            return Ok((goal, steps));
        }

        let specs = self.validate_steps(raw.steps);
        if specs.is_empty() {
            return Err(PlanError::Unplannable(
                "the plan contained no usable steps".to_string(),
            ));
        }

        let title = raw.title.unwrap_or_else(|| objective.to_string());
        let goal = Goal::new(user_id, &title, objective);
        let steps = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| StepRecord::from_spec(&goal.id, i as u32 + 1, spec))
            .collect();
        Ok((goal, steps))
    }

    /// Review the remaining plan after a step finished. Degrades to
    /// [`PlanReview::Keep`] on any provider or parse trouble.
    pub async fn review(
        &self,
        goal: &Goal,
        finished: &StepRecord,
        remaining: &[StepRecord],
    ) -> PlanReview {
        if remaining.is_empty() {
            return PlanReview::Keep;
        }

        let system = format!(
            "You review a running plan after one step finished. Decide \
             whether the remaining steps still make sense given the step's \
             output. Reply with a single JSON object: {{\"revise\": boolean, \
             \"reason\": string, \"steps\": [{{\"title\": string, \
             \"rationale\": string, \"agent\": string}}]}} where steps is the \
             replacement tail (only when revise is true). Agents must be \
             among: {}. Revise only when the output contradicts an assumption \
             a later step depends on.",
            self.registry.names().join(", ")
        );
        let user = format!(
            "Goal: {}\n\nFinished step {} ({}): {}\nOutput:\n{}\n\nRemaining steps:\n{}",
            goal.title,
            finished.ordinal,
            finished.agent,
            finished.title,
            finished.output.as_deref().unwrap_or("(no output captured)"),
            remaining
                .iter()
                .map(|s| format!("{}. {} ({})", s.ordinal, s.title, s.agent))
                .collect::<Vec<_>>()
                .join("\n")
        );

        let reply = match self
            .provider
            .complete_structured(&[Message::system(&system), Message::user(&user)])
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                log::warn!("plan review failed, keeping plan: {}", err);
                return PlanReview::Keep;
            }
        };
        let raw: RawReview = match parse::parse_reply(&reply.text) {
            Ok(raw) => raw,
            Err(err) => {
                log::warn!("unparseable plan review, keeping plan: {}", err);
                return PlanReview::Keep;
            }
        };

        if !raw.revise {
            return PlanReview::Keep;
        }
        let tail = self.validate_steps(raw.steps);
        if tail.is_empty() {
            log::warn!("plan revision had no usable steps, keeping plan");
            return PlanReview::Keep;
        }
        PlanReview::Revise {
            tail,
            reason: raw.reason,
        }
    }

    /// Drop steps naming unknown agents.
    fn validate_steps(&self, raw: Vec<RawStep>) -> Vec<StepSpec> {
        raw.into_iter()
            .filter_map(|step| {
                if self.registry.contains(&step.agent) {
                    Some(StepSpec {
                        title: step.title,
                        rationale: step.rationale,
                        agent: step.agent,
                    })
                } else {
                    log::warn!("planner proposed unknown agent {}, dropping step", step.agent);
                    None
                }
            })
            .collect()
    }

    /// Agent assigned to clarifying-question steps.
    fn fallback_agent(&self) -> String {
        self.registry
            .names()
            .first()
            .map(|n| n.to_string())
            .unwrap_or_else(|| "coach".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::careerllm::providers::ScriptedProvider;

    fn planner(provider: Arc<ScriptedProvider>) -> GoalPlanner {
        GoalPlanner::new(provider, Arc::new(AgentRegistry::default_catalog()))
    }

    #[tokio::test]
    async fn test_plan_produces_ordered_validated_steps() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_structured(
            "{\"title\": \"Land a Rust role\", \"steps\": [\
             {\"title\": \"Survey the market\", \"rationale\": \"baseline\", \"agent\": \"scout\"}, \
             {\"title\": \"Ask the oracle\", \"rationale\": \"nope\", \"agent\": \"oracle\"}, \
             {\"title\": \"Assess fit\", \"rationale\": \"focus\", \"agent\": \"match\"}]}",
        );
        let (goal, steps) = planner(provider)
            .plan("u1", "I want a Rust backend job", None)
            .await
            .unwrap();

        assert_eq!(goal.title, "Land a Rust role");
        let view: Vec<(u32, &str)> = steps.iter().map(|s| (s.ordinal, s.agent.as_str())).collect();
        // The unknown agent's step was dropped and ordinals stay dense.
        assert_eq!(view, vec![(1, "scout"), (2, "match")]);
    }

    #[tokio::test]
    async fn test_vague_objective_becomes_clarifying_question() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_structured(
            "{\"clarifying_question\": \"What kind of role are you looking for?\"}",
        );
        let (_, steps) = planner(provider)
            .plan("u1", "help me", None)
            .await
            .unwrap();
        assert_eq!(steps.len(), 1);
        assert!(steps[0].title.contains("What kind of role"));
    }

    #[tokio::test]
    async fn test_plan_with_no_usable_steps_is_an_error() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_structured(
            "{\"steps\": [{\"title\": \"x\", \"agent\": \"nobody\"}]}",
        );
        let result = planner(provider).plan("u1", "objective", None).await;
        assert!(matches!(result, Err(PlanError::Unplannable(_))));
    }

    #[tokio::test]
    async fn test_review_keeps_plan_on_garbage() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_structured("not json");
        let planner = planner(provider);
        let goal = Goal::new("u1", "t", "d");
        let finished = StepRecord::from_spec(
            &goal.id,
            1,
            &StepSpec {
                title: "a".to_string(),
                rationale: String::new(),
                agent: "scout".to_string(),
            },
        );
        let remaining = vec![StepRecord::from_spec(
            &goal.id,
            2,
            &StepSpec {
                title: "b".to_string(),
                rationale: String::new(),
                agent: "match".to_string(),
            },
        )];
        assert!(matches!(
            planner.review(&goal, &finished, &remaining).await,
            PlanReview::Keep
        ));
    }

    #[tokio::test]
    async fn test_review_revises_with_validated_tail() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_structured(
            "{\"revise\": true, \"reason\": \"market shifted\", \"steps\": [\
             {\"title\": \"Research companies\", \"rationale\": \"r\", \"agent\": \"insight\"}]}",
        );
        let planner = planner(provider);
        let goal = Goal::new("u1", "t", "d");
        let finished = StepRecord::from_spec(
            &goal.id,
            1,
            &StepSpec {
                title: "a".to_string(),
                rationale: String::new(),
                agent: "scout".to_string(),
            },
        );
        let remaining = vec![StepRecord::from_spec(
            &goal.id,
            2,
            &StepSpec {
                title: "b".to_string(),
                rationale: String::new(),
                agent: "match".to_string(),
            },
        )];
        match planner.review(&goal, &finished, &remaining).await {
            PlanReview::Revise { tail, reason } => {
                assert_eq!(tail.len(), 1);
                assert_eq!(tail[0].agent, "insight");
                assert_eq!(reason, "market shifted");
            }
            PlanReview::Keep => panic!("expected revision"),
        }
    }
}
