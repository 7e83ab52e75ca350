//! Event vocabulary for turn, goal, task, and push streams.
//!
//! Everything observable flows through [`TurnEvent`]. The orchestrator, the
//! goal executor, and the background task runner all produce the same enum;
//! the push fabric and the direct per-request channels wrap each event in an
//! [`EventEnvelope`] carrying a per-subscription sequence number.
//!
//! The wire shape is `{"type": <kind>, "seq": <int>, ...fields}`. Consumers
//! identify events solely by `type`; unknown types must be ignored so the
//! vocabulary can grow without breaking older clients.
//!
//! # Ordering
//!
//! Sequence numbers start at 1 and increase strictly within a subscription.
//! Event order within a turn is the order the orchestrator produced them;
//! no ordering holds across different users.

use crate::careerllm::error::ErrorKind;
use async_trait::async_trait;
use serde::Serialize;

/// Where an agent is in its step lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Running,
    Complete,
    Failed,
}

/// One participant's stance within a negotiation round.
#[derive(Debug, Clone, Serialize)]
pub struct RoundPosition {
    pub agent: String,
    pub stance: String,
    pub confidence: f32,
}

/// Events emitted by the core, identified on the wire by their `type` tag.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// The conversation a turn is bound to, emitted first so callers can
    /// address follow-up requests (including cancellation).
    ConversationId { conversation_id: String },

    /// The routing decision: recognized intent and the planned pipeline.
    /// An empty agent list means the turn is answered directly.
    Routing {
        intent: String,
        agents: Vec<String>,
        confidence: f32,
    },

    /// An agent entered or left the running state.
    AgentStatus {
        agent: String,
        status: AgentPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// One reason/act round inside an agent: the thought that led to a
    /// tool call, and which tool was chosen.
    AgentReasoning {
        agent: String,
        thought: String,
        tool: String,
        round: usize,
    },

    /// A tool invocation finished.
    ToolStatus {
        agent: String,
        tool: String,
        ok: bool,
        latency_ms: u64,
    },

    /// The evaluator's verdict after a step.
    Evaluator {
        decision: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },

    /// One completed negotiation round with every participant's stance.
    NegotiationRound {
        round: usize,
        positions: Vec<RoundPosition>,
    },

    /// The negotiation outcome.
    NegotiationResult {
        consensus: bool,
        position: serde_json::Value,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        dissents: Vec<serde_json::Value>,
    },

    /// A piece of the user-facing reply text.
    Content { text: String },

    /// Identifiers of the traces recorded during this turn.
    TraceIds { ids: Vec<String> },

    /// Terminal marker: the stream is complete.
    Done,

    /// A goal step began executing.
    GoalStepStart {
        goal_id: String,
        ordinal: u32,
        title: String,
        agent: String,
    },

    /// A goal step reached a terminal status.
    GoalStepComplete {
        goal_id: String,
        ordinal: u32,
        status: String,
    },

    /// The remaining plan of a goal was replaced mid-run.
    GoalReplan {
        goal_id: String,
        adjustment: String,
        reason: String,
    },

    /// A notification was written for the subscribed user.
    Notification {
        id: String,
        kind: String,
        title: String,
        body: String,
    },

    /// A background task changed status.
    TaskUpdate {
        task_id: String,
        kind: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },

    /// Heartbeat reply.
    Pong,

    /// A failure the consumer should surface or act on. Terminal when it
    /// ends a stream; informational when followed by `done`.
    Error {
        kind: ErrorKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl TurnEvent {
    /// The wire `type` tag for this event.
    pub fn kind(&self) -> &'static str {
        match self {
            TurnEvent::ConversationId { .. } => "conversation_id",
            TurnEvent::Routing { .. } => "routing",
            TurnEvent::AgentStatus { .. } => "agent_status",
            TurnEvent::AgentReasoning { .. } => "agent_reasoning",
            TurnEvent::ToolStatus { .. } => "tool_status",
            TurnEvent::Evaluator { .. } => "evaluator",
            TurnEvent::NegotiationRound { .. } => "negotiation_round",
            TurnEvent::NegotiationResult { .. } => "negotiation_result",
            TurnEvent::Content { .. } => "content",
            TurnEvent::TraceIds { .. } => "trace_ids",
            TurnEvent::Done => "done",
            TurnEvent::GoalStepStart { .. } => "goal_step_start",
            TurnEvent::GoalStepComplete { .. } => "goal_step_complete",
            TurnEvent::GoalReplan { .. } => "goal_replan",
            TurnEvent::Notification { .. } => "notification",
            TurnEvent::TaskUpdate { .. } => "task_update",
            TurnEvent::Pong => "pong",
            TurnEvent::Error { .. } => "error",
        }
    }

    /// Whether this event terminates its stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnEvent::Done)
    }
}

/// Receives events as a pipeline produces them.
///
/// The orchestrator implements this over its per-turn channel and the push
/// fabric; component code (agent runtime, negotiator) only ever sees the
/// trait, so it can be exercised in isolation with a collector or the
/// no-op sink.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: TurnEvent);
}

/// Sink that drops every event.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn emit(&self, _event: TurnEvent) {}
}

/// Sink that records events for assertions.
#[derive(Default)]
pub struct CollectorSink {
    events: std::sync::Mutex<Vec<TurnEvent>>,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn events(&self) -> Vec<TurnEvent> {
        self.events.lock().expect("collector lock").clone()
    }

    /// The `type` tags of everything emitted so far, in order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.kind()).collect()
    }
}

#[async_trait]
impl EventSink for CollectorSink {
    async fn emit(&self, event: TurnEvent) {
        self.events.lock().expect("collector lock").push(event);
    }
}

/// An event paired with its per-subscription sequence number.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub seq: u64,
    #[serde(flatten)]
    pub event: TurnEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = EventEnvelope {
            seq: 3,
            event: TurnEvent::Routing {
                intent: "job_search".to_string(),
                agents: vec!["scout".to_string()],
                confidence: 0.9,
            },
        };
        let value: serde_json::Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "routing");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["agents"][0], "scout");
    }

    #[test]
    fn test_kind_matches_serialized_tag() {
        let events = vec![
            TurnEvent::Done,
            TurnEvent::Pong,
            TurnEvent::Content {
                text: "hi".to_string(),
            },
            TurnEvent::Error {
                kind: ErrorKind::Internal,
                message: None,
            },
        ];
        for event in events {
            let value: serde_json::Value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.kind());
        }
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let event = TurnEvent::AgentStatus {
            agent: "scout".to_string(),
            status: AgentPhase::Running,
            message: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("message"));
        assert!(json.contains("\"running\""));
    }
}
