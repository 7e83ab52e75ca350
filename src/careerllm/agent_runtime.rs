//! Agent runtime: one agent, one bounded reason/act/observe loop.
//!
//! The runtime takes an [`AgentProfile`], the conversation history, the
//! task, and the pipeline context so far, and drives the LLM until it
//! produces a parseable [`AgentReport`]:
//!
//! 1. Build the reasoning prompt from history, brief, and prior reports.
//! 2. Ask the provider for either a tool call or a final answer.
//! 3. On a tool call: validate and invoke through the registry, record a
//!    `(thought, tool, result)` trace row, emit `agent_reasoning` and
//!    `tool_status`, feed the result back, and loop.
//! 4. On a final answer: parse the report, clamp confidence, and return.
//!
//! Bounds: at most `max_tool_rounds` tool rounds (then a final answer is
//! forced), a per-tool timeout with one identical-args retry for read-only
//! tools, one schema-repair attempt on parse failure, and cancellation
//! polled between rounds and before every tool call. A cancelled agent
//! returns without partial output.
//!
//! Tool calls are detected by scanning the reply for a
//! `{"tool_call": {"name": ..., "parameters": ...}}` fragment with brace
//! counting, which tolerates models that wrap the call in prose.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::careerllm::agent::{AgentProfile, AgentReport, PipelineContext};
use crate::careerllm::config::AgentRuntimeConfig;
use crate::careerllm::error::ErrorKind;
use crate::careerllm::event::{EventSink, TurnEvent};
use crate::careerllm::llm_provider::{
    LLMProvider, Message, ProviderError, StructuredReply, TokenUsage,
};
use crate::careerllm::parse;
use crate::careerllm::store::{MessageRole, StoredMessage};
use crate::careerllm::tool_registry::{
    ToolOutcome, ToolRegistry, ToolRequest, ToolSideEffect,
};
use crate::careerllm::trace::{Trace, TraceStatus};

/// A file the user attached to their message.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub content: String,
}

/// Everything one agent execution needs.
pub struct AgentRunInput<'a> {
    /// User on whose behalf the agent runs; scopes tool invocations.
    pub user_id: &'a str,
    /// Conversation history, oldest first.
    pub history: &'a [StoredMessage],
    /// The task for this execution (the user's message or a step title).
    pub task: &'a str,
    /// Optional attached file.
    pub attachment: Option<&'a Attachment>,
    /// Reports and failures of prior pipeline steps.
    pub context: &'a PipelineContext,
    /// Turn-level cancellation token.
    pub cancel: &'a CancellationToken,
}

/// Why an agent execution did not produce a report.
#[derive(Debug)]
pub enum AgentRunError {
    /// The cancellation token was raised.
    Cancelled,
    /// The final answer failed to parse even after the repair attempt.
    ParseFailed(String),
    /// The provider failed.
    Provider(ProviderError),
}

impl AgentRunError {
    /// The wire-level category for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentRunError::Cancelled => ErrorKind::Cancelled,
            AgentRunError::ParseFailed(_) => ErrorKind::AgentParseFailed,
            AgentRunError::Provider(_) => ErrorKind::LlmUnavailable,
        }
    }
}

impl std::fmt::Display for AgentRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRunError::Cancelled => write!(f, "cancelled"),
            AgentRunError::ParseFailed(msg) => write!(f, "final answer unparseable: {}", msg),
            AgentRunError::Provider(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for AgentRunError {}

/// The result of one agent execution. The trace is always present, whatever
/// the outcome; the orchestrator persists it.
pub struct AgentRun {
    pub trace: Trace,
    pub outcome: Result<AgentReport, AgentRunError>,
}

/// Shape of a tool call fragment in a model reply.
#[derive(Debug, Clone)]
struct ParsedToolCall {
    name: String,
    parameters: Value,
}

#[derive(Deserialize)]
struct RawReport {
    summary: String,
    confidence: Option<f32>,
    #[serde(default)]
    rationale: String,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

/// Executes agents against a provider and a tool registry.
pub struct AgentRuntime {
    provider: Arc<dyn LLMProvider>,
    tools: Arc<ToolRegistry>,
    config: AgentRuntimeConfig,
}

impl AgentRuntime {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        tools: Arc<ToolRegistry>,
        config: AgentRuntimeConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            config,
        }
    }

    /// Run one agent to completion, emitting reasoning and tool events into
    /// `sink` as it goes.
    pub async fn execute(
        &self,
        profile: &AgentProfile,
        input: AgentRunInput<'_>,
        sink: &dyn EventSink,
    ) -> AgentRun {
        let started = Instant::now();
        let mut trace = Trace::begin(
            &profile.name,
            &format!("{}\n{}", input.task, input.context.render()),
        );
        let mut usage = TokenUsage::default();
        let mut saw_usage = false;

        let mut messages = self.build_messages(profile, &input);
        let mut rounds_used = 0usize;
        let mut force_final = false;
        let mut repaired = false;

        let outcome = loop {
            if input.cancel.is_cancelled() {
                break Err(AgentRunError::Cancelled);
            }

            let reply = match self.provider.complete_structured(&messages).await {
                Ok(reply) => reply,
                Err(err) => break Err(AgentRunError::Provider(err)),
            };
            absorb_usage(&reply, &mut usage, &mut saw_usage);

            if !force_final {
                if let Some(call) = parse_tool_call(&reply.text) {
                    if rounds_used >= self.config.max_tool_rounds {
                        // Cap hit: do not execute, demand a final answer.
                        force_final = true;
                        messages.push(Message::assistant(&reply.text));
                        messages.push(Message::user(
                            "You have used all available tool rounds. Do not request \
                             another tool. Provide your final answer now as a single \
                             JSON object with fields summary, confidence, and rationale.",
                        ));
                        continue;
                    }
                    rounds_used += 1;

                    if input.cancel.is_cancelled() {
                        break Err(AgentRunError::Cancelled);
                    }

                    let thought = thought_before(&reply.text);
                    sink.emit(TurnEvent::AgentReasoning {
                        agent: profile.name.clone(),
                        thought: preview(&thought, 200),
                        tool: call.name.clone(),
                        round: rounds_used,
                    })
                    .await;

                    let outcome = self
                        .invoke_with_timeout(&call, input.user_id, input.cancel)
                        .await;
                    sink.emit(TurnEvent::ToolStatus {
                        agent: profile.name.clone(),
                        tool: call.name.clone(),
                        ok: outcome.ok,
                        latency_ms: outcome.latency_ms,
                    })
                    .await;

                    let rendered = render_outcome(&call.name, &outcome);
                    trace.record(&thought, &call.name, &rendered);

                    messages.push(Message::assistant(&reply.text));
                    messages.push(Message::user(&rendered));
                    continue;
                }
            }

            // Final answer path.
            match parse::parse_reply::<RawReport>(&reply.text) {
                Ok(raw) => {
                    let confidence = raw.confidence.unwrap_or(0.5).clamp(0.0, 1.0);
                    break Ok(AgentReport {
                        agent: profile.name.clone(),
                        display_name: profile.display_name.clone(),
                        summary: raw.summary,
                        content: Value::Object(raw.extra),
                        confidence,
                        rationale: raw.rationale,
                        usage: if saw_usage { Some(usage.clone()) } else { None },
                    });
                }
                Err(parse_err) => {
                    if repaired {
                        break Err(AgentRunError::ParseFailed(parse_err));
                    }
                    repaired = true;
                    force_final = true;
                    messages.push(Message::assistant(&reply.text));
                    messages.push(Message::user(
                        "Your reply could not be parsed. Respond with only a JSON \
                         object, no surrounding prose, with these fields: \
                         \"summary\" (string), \"confidence\" (number between 0 and 1), \
                         \"rationale\" (string), plus any structured findings as \
                         additional fields.",
                    ));
                }
            }
        };

        let status = match &outcome {
            Ok(_) => TraceStatus::Completed,
            Err(AgentRunError::Cancelled) => TraceStatus::Cancelled,
            Err(_) => TraceStatus::Failed,
        };
        let trace = trace.finish(status, started.elapsed().as_millis() as u64);
        AgentRun { trace, outcome }
    }

    /// Invoke one tool under the configured timeout. Read-only tools that
    /// time out are retried once with identical arguments.
    async fn invoke_with_timeout(
        &self,
        call: &ParsedToolCall,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> ToolOutcome {
        let side_effect = self
            .tools
            .metadata(&call.name)
            .map(|m| m.side_effect)
            .unwrap_or(ToolSideEffect::External);
        let attempts = match side_effect {
            ToolSideEffect::ReadOnly => 2,
            ToolSideEffect::External => 1,
        };

        for attempt in 1..=attempts {
            let request = ToolRequest::with_cancel(
                user_id,
                call.parameters.clone(),
                cancel.child_token(),
            );
            match timeout(self.config.tool_timeout, self.tools.invoke(&call.name, request)).await
            {
                Ok(outcome) => return outcome,
                Err(_) => {
                    log::warn!(
                        "tool {} timed out (attempt {}/{})",
                        call.name,
                        attempt,
                        attempts
                    );
                }
            }
        }

        ToolOutcome::failure(
            ErrorKind::ToolTimeout,
            format!("tool {} did not answer in time", call.name),
            self.config.tool_timeout.as_millis() as u64,
        )
    }

    fn build_messages(&self, profile: &AgentProfile, input: &AgentRunInput<'_>) -> Vec<Message> {
        let mut system = format!("You are {}.\n{}\n", profile.display_name, profile.brief);

        let available: Vec<_> = self
            .tools
            .list()
            .into_iter()
            .filter(|m| profile.tools.iter().any(|t| t == &m.name))
            .collect();
        if !available.is_empty() {
            system.push_str("\nYou have access to the following tools:\n");
            for metadata in &available {
                system.push_str(&format!("- {}: {}\n", metadata.name, metadata.description));
                for param in &metadata.parameters {
                    system.push_str(&format!(
                        "    - {} ({:?}{}): {}\n",
                        param.name,
                        param.param_type,
                        if param.required { ", required" } else { "" },
                        param.description.as_deref().unwrap_or("no description")
                    ));
                }
            }
            system.push_str(
                "\nTo use a tool, respond with a JSON object of the form:\n\
                 {\"tool_call\": {\"name\": \"tool_name\", \"parameters\": {...}}}\n\
                 After the tool result arrives you may call another tool or answer.\n",
            );
        }
        system.push_str(
            "\nWhen you are done, answer with a single JSON object with fields \
             \"summary\" (string), \"confidence\" (number between 0 and 1), \
             \"rationale\" (string), plus any structured findings as additional \
             fields.",
        );

        let mut messages = vec![Message::system(&system)];
        for stored in input.history {
            messages.push(match stored.role {
                MessageRole::User => Message::user(&stored.content),
                MessageRole::Assistant => Message::assistant(&stored.content),
            });
        }
        let context = input.context.render();
        if !context.is_empty() {
            messages.push(Message::user(&format!(
                "Reports from specialists that already worked on this request:\n\n{}",
                context
            )));
        }
        if let Some(attachment) = input.attachment {
            messages.push(Message::user(&format!(
                "The user attached a file named \"{}\":\n{}",
                attachment.name, attachment.content
            )));
        }
        messages.push(Message::user(input.task));
        messages
    }
}

fn absorb_usage(reply: &StructuredReply, usage: &mut TokenUsage, saw_usage: &mut bool) {
    if let Some(reported) = &reply.usage {
        usage.absorb(reported);
        *saw_usage = true;
    }
}

/// Scan a reply for a `{"tool_call": ...}` fragment using brace counting,
/// which survives prose around the call. Only the first call is extracted.
fn parse_tool_call(text: &str) -> Option<ParsedToolCall> {
    let start = text.find("{\"tool_call\"")?;
    let fragment = parse::first_json_object(&text[start..])?;
    let parsed: Value = serde_json::from_str(fragment).ok()?;
    let call = parsed.get("tool_call")?;
    let name = call.get("name")?.as_str()?.to_string();
    let parameters = call.get("parameters").cloned().unwrap_or(Value::Null);
    Some(ParsedToolCall { name, parameters })
}

/// The prose preceding the tool call fragment, used as the trace thought.
fn thought_before(text: &str) -> String {
    match text.find("{\"tool_call\"") {
        Some(idx) => text[..idx].trim().to_string(),
        None => String::new(),
    }
}

fn render_outcome(tool: &str, outcome: &ToolOutcome) -> String {
    if outcome.ok {
        let data = outcome
            .data
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "null".to_string());
        format!("Tool '{}' executed successfully. Result: {}", tool, data)
    } else {
        format!(
            "Tool '{}' failed ({}): {}",
            tool,
            outcome
                .error
                .map(|e| e.as_str())
                .unwrap_or("unknown"),
            outcome.message.as_deref().unwrap_or("no detail")
        )
    }
}

/// First `max` characters of `text`, respecting char boundaries.
fn preview(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::careerllm::agent::AgentRegistry;
    use crate::careerllm::event::CollectorSink;
    use crate::careerllm::providers::ScriptedProvider;
    use crate::careerllm::tool_registry::{ToolMetadata, ToolParameter, ToolParameterType};
    use serde_json::json;
    use std::time::Duration;

    fn scout_profile() -> AgentProfile {
        AgentRegistry::default_catalog()
            .get("scout")
            .cloned()
            .expect("catalog has scout")
    }

    fn registry_with_jobs() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        crate::careerllm::tools::JobBoard::with_sample_listings()
            .register(&mut registry)
            .unwrap();
        Arc::new(registry)
    }

    fn runtime(provider: Arc<ScriptedProvider>, tools: Arc<ToolRegistry>) -> AgentRuntime {
        AgentRuntime::new(provider, tools, AgentRuntimeConfig::default())
    }

    fn input<'a>(
        cancel: &'a CancellationToken,
        context: &'a PipelineContext,
    ) -> AgentRunInput<'a> {
        AgentRunInput {
            user_id: "u1",
            history: &[],
            task: "Search for remote Rust jobs",
            attachment: None,
            context,
            cancel,
        }
    }

    #[tokio::test]
    async fn test_tool_round_then_final_answer() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_structured(
            "Let me search first. {\"tool_call\": {\"name\": \"search_jobs\", \
             \"parameters\": {\"keywords\": [\"rust\"], \"max_results\": 15}}}",
        );
        provider.push_structured(
            "{\"summary\": \"Two strong matches\", \"confidence\": 0.85, \
             \"rationale\": \"both roles want rust\", \"top_job_id\": \"job-rust-backend\"}",
        );

        let sink = CollectorSink::new();
        let cancel = CancellationToken::new();
        let context = PipelineContext::default();
        let run = runtime(provider, registry_with_jobs())
            .execute(&scout_profile(), input(&cancel, &context), &sink)
            .await;

        let report = run.outcome.expect("agent should succeed");
        assert_eq!(report.agent, "scout");
        assert!((report.confidence - 0.85).abs() < 1e-6);
        assert_eq!(report.field("top_job_id"), Some(&json!("job-rust-backend")));
        assert_eq!(run.trace.entries.len(), 1);
        assert_eq!(run.trace.entries[0].tool, "search_jobs");
        assert_eq!(sink.kinds(), vec!["agent_reasoning", "tool_status"]);
    }

    #[tokio::test]
    async fn test_parse_repair_recovers_once() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_structured("here is my answer, plain prose, no json");
        provider.push_structured("{\"summary\": \"ok\", \"confidence\": 0.6, \"rationale\": \"r\"}");

        let sink = CollectorSink::new();
        let cancel = CancellationToken::new();
        let context = PipelineContext::default();
        let run = runtime(provider, registry_with_jobs())
            .execute(&scout_profile(), input(&cancel, &context), &sink)
            .await;

        let report = run.outcome.expect("repair should recover");
        assert_eq!(report.summary, "ok");
    }

    #[tokio::test]
    async fn test_second_parse_failure_is_terminal() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_structured("still prose");
        provider.push_structured("more prose");

        let sink = CollectorSink::new();
        let cancel = CancellationToken::new();
        let context = PipelineContext::default();
        let run = runtime(provider, registry_with_jobs())
            .execute(&scout_profile(), input(&cancel, &context), &sink)
            .await;

        match run.outcome {
            Err(AgentRunError::ParseFailed(_)) => {}
            other => panic!("expected parse failure, got {:?}", other.map(|r| r.summary)),
        }
        assert_eq!(run.trace.status, TraceStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancellation_yields_no_partial_output() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_structured("{\"summary\": \"never used\", \"confidence\": 1.0}");

        let sink = CollectorSink::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let context = PipelineContext::default();
        let run = runtime(provider.clone(), registry_with_jobs())
            .execute(&scout_profile(), input(&cancel, &context), &sink)
            .await;

        assert!(matches!(run.outcome, Err(AgentRunError::Cancelled)));
        assert_eq!(run.trace.status, TraceStatus::Cancelled);
        // The provider was never consulted.
        assert_eq!(provider.remaining(), 1);
    }

    #[tokio::test]
    async fn test_tool_cap_forces_final_answer() {
        let provider = Arc::new(ScriptedProvider::new());
        let tool_reply = "{\"tool_call\": {\"name\": \"search_jobs\", \
                          \"parameters\": {\"keywords\": [\"rust\"]}}}";
        // Three allowed rounds, then a fourth attempt that must be refused.
        for _ in 0..4 {
            provider.push_structured(tool_reply);
        }
        provider.push_structured("{\"summary\": \"done\", \"confidence\": 0.7, \"rationale\": \"r\"}");

        let sink = CollectorSink::new();
        let cancel = CancellationToken::new();
        let context = PipelineContext::default();
        let run = runtime(provider, registry_with_jobs())
            .execute(&scout_profile(), input(&cancel, &context), &sink)
            .await;

        let report = run.outcome.expect("forced final answer should parse");
        assert_eq!(report.summary, "done");
        // Only the allowed rounds produced trace rows.
        assert_eq!(run.trace.entries.len(), 3);
    }

    #[tokio::test]
    async fn test_read_only_tool_timeout_retries_then_reports() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_structured(
            "{\"tool_call\": {\"name\": \"slow\", \"parameters\": {}}}",
        );
        provider.push_structured("{\"summary\": \"gave up on the tool\", \"confidence\": 0.4}");

        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolMetadata::new("slow", "Never answers in time").with_parameter(
                    ToolParameter::new("unused", ToolParameterType::String),
                ),
                Arc::new(|_request| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(json!({}))
                    })
                }),
            )
            .unwrap();

        let mut config = AgentRuntimeConfig::default();
        config.tool_timeout = Duration::from_millis(20);
        let runtime = AgentRuntime::new(provider, Arc::new(registry), config);

        let mut profile = scout_profile();
        profile.tools = vec!["slow".to_string()];

        let sink = CollectorSink::new();
        let cancel = CancellationToken::new();
        let context = PipelineContext::default();
        let run = runtime
            .execute(&profile, input(&cancel, &context), &sink)
            .await;

        let report = run.outcome.expect("agent answers after the timeout");
        assert_eq!(report.summary, "gave up on the tool");
        // The timeout was surfaced to the model through the tool result row.
        assert_eq!(run.trace.entries.len(), 1);
        assert!(run.trace.entries[0].result_bytes > 0);
        let statuses: Vec<bool> = sink
            .events()
            .iter()
            .filter_map(|e| match e {
                TurnEvent::ToolStatus { ok, .. } => Some(*ok),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![false]);
    }

    #[test]
    fn test_parse_tool_call_extracts_first_fragment() {
        let text = "thinking... {\"tool_call\": {\"name\": \"a\", \"parameters\": {\"x\": 1}}} \
                    and {\"tool_call\": {\"name\": \"b\", \"parameters\": {}}}";
        let call = parse_tool_call(text).unwrap();
        assert_eq!(call.name, "a");
        assert_eq!(call.parameters["x"], 1);
        assert_eq!(thought_before(text), "thinking...");
    }
}
