//! Runtime configuration.
//!
//! All tunables live in [`RuntimeConfig`], grouped per component. The struct
//! is constructed in code and handed to the orchestrator at build time; no
//! TOML, YAML, or other config-file parsing dependencies are introduced.
//! Users start from [`RuntimeConfig::default`] and override fields.
//!
//! # Example
//!
//! ```rust
//! use careerllm::config::RuntimeConfig;
//! use std::time::Duration;
//!
//! let mut config = RuntimeConfig::default();
//! config.agent.max_tool_rounds = 5;
//! config.turn.wall_clock_budget = Duration::from_secs(60);
//! ```

use std::time::Duration;

/// One recognized intent and the agent pipeline it maps to.
///
/// The intent table is configuration, not behaviour: the router offers the
/// table to the classifier and validates whatever comes back against it.
#[derive(Debug, Clone)]
pub struct IntentRule {
    /// Stable intent name (e.g. `"job_search"`).
    pub intent: String,
    /// Ordered agent names executed for this intent.
    pub agents: Vec<String>,
}

impl IntentRule {
    /// Define an intent mapping to the given agent sequence.
    pub fn new(intent: impl Into<String>, agents: &[&str]) -> Self {
        Self {
            intent: intent.into(),
            agents: agents.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Intent router tunables.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How many trailing conversation messages the classifier sees.
    pub history_window: usize,
    /// Below this confidence the router answers directly without agents.
    pub confidence_threshold: f32,
    /// Recognized intents and their default agent sequences.
    pub intents: Vec<IntentRule>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            history_window: 6,
            confidence_threshold: 0.5,
            intents: vec![
                IntentRule::new("job_search", &["scout"]),
                IntentRule::new("application_help", &["match", "forge"]),
                IntentRule::new("interview_prep", &["coach"]),
                IntentRule::new("company_research", &["insight"]),
                IntentRule::new("career_planning", &["scout", "match", "coach"]),
            ],
        }
    }
}

/// Agent runtime tunables.
#[derive(Debug, Clone)]
pub struct AgentRuntimeConfig {
    /// Maximum tool rounds per agent before a final answer is forced.
    pub max_tool_rounds: usize,
    /// Per-tool invocation timeout. A timed-out read-only tool is retried
    /// once with identical arguments; external-effect tools are not.
    pub tool_timeout: Duration,
}

impl Default for AgentRuntimeConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 3,
            tool_timeout: Duration::from_secs(30),
        }
    }
}

/// Evaluator tunables.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// How many times a single agent may be re-run via loop_back per turn.
    pub max_loop_backs_per_target: u32,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            max_loop_backs_per_target: 2,
        }
    }
}

/// Negotiation tunables.
#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    /// Whether divergent reports trigger a negotiation phase at all.
    pub enabled: bool,
    /// Upper bound on debate rounds.
    pub max_rounds: usize,
    /// Mean confidence required for a consensus to hold.
    pub consensus_threshold: f32,
    /// Confidence spread across reports that counts as divergence.
    pub spread_threshold: f32,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_rounds: 3,
            consensus_threshold: 0.7,
            spread_threshold: 0.25,
        }
    }
}

/// Per-turn orchestration tunables.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Wall-clock budget for one turn; on expiry remaining agents are
    /// cancelled and synthesis runs on whatever context exists.
    pub wall_clock_budget: Duration,
    /// Fraction of failed agents at which synthesis switches to an apology.
    pub failure_apology_ratio: f32,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            wall_clock_budget: Duration::from_secs(120),
            failure_apology_ratio: 0.5,
        }
    }
}

/// Goal planning and execution tunables.
#[derive(Debug, Clone)]
pub struct GoalConfig {
    /// Retries granted to a failing step before the goal pauses.
    pub step_retry_budget: u32,
    /// Whether autonomous runs re-invoke the planner between steps.
    pub replan_enabled: bool,
}

impl Default for GoalConfig {
    fn default() -> Self {
        Self {
            step_retry_budget: 1,
            replan_enabled: true,
        }
    }
}

/// Push fabric tunables.
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// Pending events tolerated per subscription before disconnection.
    pub queue_capacity: usize,
    /// Expected client heartbeat interval. A subscription idle for more
    /// than twice this is closed.
    pub heartbeat_interval: Duration,
    /// How long an unauthenticated connection may linger after connect.
    pub auth_grace: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            auth_grace: Duration::from_secs(5),
        }
    }
}

/// Background task runner tunables.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Default interval for periodic task schedules.
    pub default_interval: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_secs(3600),
        }
    }
}

/// Top-level configuration consumed by the orchestrator and its parts.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub router: RouterConfig,
    pub agent: AgentRuntimeConfig,
    pub evaluator: EvaluatorConfig,
    pub negotiation: NegotiationConfig,
    pub turn: TurnConfig,
    pub goals: GoalConfig,
    pub push: PushConfig,
    pub tasks: TaskConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.router.history_window, 6);
        assert!((config.router.confidence_threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.agent.max_tool_rounds, 3);
        assert_eq!(config.agent.tool_timeout, Duration::from_secs(30));
        assert_eq!(config.evaluator.max_loop_backs_per_target, 2);
        assert_eq!(config.negotiation.max_rounds, 3);
        assert_eq!(config.turn.wall_clock_budget, Duration::from_secs(120));
        assert_eq!(config.goals.step_retry_budget, 1);
        assert_eq!(config.push.queue_capacity, 256);
    }

    #[test]
    fn test_default_intent_table_is_replaceable() {
        let mut config = RuntimeConfig::default();
        config.router.intents = vec![IntentRule::new("custom", &["scout"])];
        assert_eq!(config.router.intents.len(), 1);
        assert_eq!(config.router.intents[0].agents, vec!["scout".to_string()]);
    }
}
