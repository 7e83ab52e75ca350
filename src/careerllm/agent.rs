//! Agent profiles, the agent registry, and agent reports.
//!
//! An agent here is declarative: a named worker with a display name, a task
//! brief that primes its reasoning, a tool allowlist, and the report fields
//! the negotiator tracks for consensus. The behaviour lives in the agent
//! runtime; profiles are data, registered once at startup and read-only
//! afterwards.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use crate::careerllm::llm_provider::TokenUsage;

/// Declarative definition of one agent.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    /// Stable identifier used in routing decisions and events.
    pub name: String,
    /// Human-readable display name for user-facing text.
    pub display_name: String,
    /// Task brief injected into the agent's system prompt.
    pub brief: String,
    /// Names of the tools this agent may invoke. Empty means none.
    pub tools: Vec<String>,
    /// Report fields compared when agents disagree.
    pub tracked_fields: Vec<String>,
}

impl AgentProfile {
    /// Create a profile with no tools and no tracked fields.
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        brief: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            brief: brief.into(),
            tools: Vec::new(),
            tracked_fields: Vec::new(),
        }
    }

    /// Allow the agent to call the given tools.
    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Track the given report fields for divergence detection.
    pub fn with_tracked_fields(mut self, fields: &[&str]) -> Self {
        self.tracked_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }
}

/// Errors raised while building the registry.
#[derive(Debug, Clone)]
pub enum AgentRegistryError {
    /// An agent with the same name was already registered.
    Duplicate(String),
}

impl fmt::Display for AgentRegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentRegistryError::Duplicate(name) => {
                write!(f, "agent already registered: {}", name)
            }
        }
    }
}

impl Error for AgentRegistryError {}

/// Read-only set of known agents, keyed by name, iterated in registration
/// order.
pub struct AgentRegistry {
    profiles: HashMap<String, AgentProfile>,
    order: Vec<String>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            profiles: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a profile. Duplicate names are a construction error.
    pub fn register(&mut self, profile: AgentProfile) -> Result<(), AgentRegistryError> {
        let name = profile.name.clone();
        if self.profiles.contains_key(&name) {
            return Err(AgentRegistryError::Duplicate(name));
        }
        self.order.push(name.clone());
        self.profiles.insert(name, profile);
        Ok(())
    }

    /// Whether an agent name resolves.
    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    /// Borrow a profile by name.
    pub fn get(&self, name: &str) -> Option<&AgentProfile> {
        self.profiles.get(name)
    }

    /// Agent names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(|n| n.as_str()).collect()
    }

    /// Display name for an agent, falling back to its identifier.
    pub fn display_name(&self, name: &str) -> String {
        self.profiles
            .get(name)
            .map(|p| p.display_name.clone())
            .unwrap_or_else(|| name.to_string())
    }

    /// The built-in career catalog: scout (job search), match (fit
    /// analysis), forge (application materials), coach (interview prep),
    /// and insight (company research).
    pub fn default_catalog() -> Self {
        let mut registry = Self::new();
        let profiles = vec![
            AgentProfile::new(
                "scout",
                "Job Scout",
                "You find open roles that fit the user. Search broadly, then \
                 narrow by the user's skills and locations. Report the most \
                 promising listings with a one-line reason each.",
            )
            .with_tools(&["search_jobs"])
            .with_tracked_fields(&["top_job_id"]),
            AgentProfile::new(
                "match",
                "Fit Analyst",
                "You judge how well the user matches a role or a set of \
                 roles. Weigh required skills against the user's profile and \
                 call out gaps honestly.",
            )
            .with_tools(&["search_jobs", "company_lookup"])
            .with_tracked_fields(&["fit_score"]),
            AgentProfile::new(
                "forge",
                "Application Forge",
                "You draft application materials: resume bullets, cover \
                 letter paragraphs, and outreach messages tailored to a \
                 specific role.",
            )
            .with_tools(&["company_lookup", "list_applications"]),
            AgentProfile::new(
                "coach",
                "Interview Coach",
                "You prepare the user for interviews: likely questions, \
                 strong answer structures, and topics to research before the \
                 conversation.",
            )
            .with_tools(&["company_lookup"]),
            AgentProfile::new(
                "insight",
                "Company Insight",
                "You research companies: what they do, how they hire, and \
                 what the user should know before applying or interviewing.",
            )
            .with_tools(&["company_lookup", "search_jobs"]),
        ];
        for profile in profiles {
            // Names are distinct by construction.
            let _ = registry.register(profile);
        }
        registry
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The structured output of one agent execution.
#[derive(Debug, Clone, Serialize)]
pub struct AgentReport {
    /// Agent identifier.
    pub agent: String,
    /// Display name at the time of execution.
    pub display_name: String,
    /// One-paragraph summary addressed to the user.
    pub summary: String,
    /// Role-specific structured content.
    pub content: Value,
    /// Self-assessed confidence in [0, 1].
    pub confidence: f32,
    /// Free-form rationale for downstream consumers.
    pub rationale: String,
    /// Token accounting across the agent's rounds, when reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl AgentReport {
    /// Value of a tracked field inside the structured content.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.content.get(name)
    }
}

/// An agent that failed during the pipeline, declared to downstream agents
/// and to synthesis.
#[derive(Debug, Clone)]
pub struct AgentFailure {
    pub agent: String,
    pub display_name: String,
    pub message: String,
}

/// Immutable snapshot of the pipeline so far, passed to each agent, the
/// evaluator, and the negotiator. The orchestrator appends to a fresh copy
/// after every step instead of sharing anything mutable.
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    pub reports: Vec<AgentReport>,
    pub failures: Vec<AgentFailure>,
}

impl PipelineContext {
    /// Snapshot with one more report.
    pub fn with_report(&self, report: AgentReport) -> Self {
        let mut next = self.clone();
        next.reports.push(report);
        next
    }

    /// Snapshot with one more failure.
    pub fn with_failure(&self, failure: AgentFailure) -> Self {
        let mut next = self.clone();
        next.failures.push(failure);
        next
    }

    /// Render prior reports and declared failures for a prompt.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for report in &self.reports {
            out.push_str(&format!(
                "[{}, confidence {:.2}]\n{}\n",
                report.display_name, report.confidence, report.summary
            ));
            if !report.content.is_null() {
                out.push_str(&format!("Details: {}\n", report.content));
            }
            out.push('\n');
        }
        for failure in &self.failures {
            out.push_str(&format!(
                "[{} did not complete: {}]\n\n",
                failure.display_name, failure.message
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_agents_resolve() {
        let registry = AgentRegistry::default_catalog();
        for name in ["scout", "match", "forge", "coach", "insight"].iter() {
            assert!(registry.contains(name), "missing agent {}", name);
        }
        assert_eq!(registry.names().len(), 5);
        assert_eq!(registry.display_name("scout"), "Job Scout");
        assert_eq!(registry.display_name("ghost"), "ghost");
    }

    #[test]
    fn test_duplicate_registration_is_an_error() {
        let mut registry = AgentRegistry::new();
        registry
            .register(AgentProfile::new("a", "A", "brief"))
            .unwrap();
        assert!(registry
            .register(AgentProfile::new("a", "A again", "brief"))
            .is_err());
    }

    #[test]
    fn test_context_snapshots_do_not_alias() {
        let base = PipelineContext::default();
        let extended = base.with_report(AgentReport {
            agent: "scout".to_string(),
            display_name: "Job Scout".to_string(),
            summary: "Found three roles".to_string(),
            content: serde_json::json!({ "top_job_id": "j1" }),
            confidence: 0.8,
            rationale: "fresh postings".to_string(),
            usage: None,
        });
        assert!(base.reports.is_empty());
        assert_eq!(extended.reports.len(), 1);
        assert_eq!(
            extended.reports[0].field("top_job_id"),
            Some(&serde_json::json!("j1"))
        );
    }

    #[test]
    fn test_render_declares_failures() {
        let ctx = PipelineContext::default().with_failure(AgentFailure {
            agent: "forge".to_string(),
            display_name: "Application Forge".to_string(),
            message: "tool backend offline".to_string(),
        });
        let rendered = ctx.render();
        assert!(rendered.contains("Application Forge"));
        assert!(rendered.contains("did not complete"));
    }
}
