//! Wire-level error vocabulary.
//!
//! Every failure that can surface in an event stream, a tool envelope, or a
//! request response is named by an [`ErrorKind`]. The kinds are data, not
//! exceptions: modules keep their own error enums for control flow and map
//! them onto this vocabulary at the boundary where events are produced.
//!
//! Propagation policy:
//!
//! - Recovered locally: `ToolTimeout` (one retry), `AgentParseFailed` (one
//!   repair), `LlmUnavailable` during synthesis (templated fallback),
//!   `SubscriberBackpressure` (that subscriber only is disconnected).
//! - Surfaced as a step failure while the pipeline continues: `ToolFailed`,
//!   `InvalidArgs`, `AgentParseFailed` after the repair attempt.
//! - Surfaced as turn termination: `Cancelled`, `TurnBudgetExceeded`,
//!   `Internal`.
//! - Surfaced to the request caller: `InvalidInput`, `Unauthorized`,
//!   `GoalPreconditionFailed`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable failure category carried in events and tool envelopes.
///
/// Consumers match on the serialized snake_case name and must ignore kinds
/// they do not recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request was malformed (empty user text, unknown goal id, ...).
    InvalidInput,
    /// The caller could not be authenticated for the requested resource.
    Unauthorized,
    /// A tool name did not resolve in the tool registry.
    NoSuchTool,
    /// Tool arguments failed name or type validation before dispatch.
    InvalidArgs,
    /// A tool handler exceeded its invocation timeout (after the retry).
    ToolTimeout,
    /// A tool handler ran and reported failure.
    ToolFailed,
    /// The LLM provider was unreachable or refused the request.
    LlmUnavailable,
    /// An agent's final answer could not be parsed, even after one repair.
    AgentParseFailed,
    /// The turn or goal was cancelled by the user.
    Cancelled,
    /// The per-turn wall-clock budget elapsed before the pipeline finished.
    TurnBudgetExceeded,
    /// A goal operation was attempted in a state that forbids it.
    GoalPreconditionFailed,
    /// A push subscriber could not drain its queue in time.
    SubscriberBackpressure,
    /// Unclassified internal failure.
    Internal,
}

impl ErrorKind {
    /// The snake_case name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NoSuchTool => "no_such_tool",
            ErrorKind::InvalidArgs => "invalid_args",
            ErrorKind::ToolTimeout => "tool_timeout",
            ErrorKind::ToolFailed => "tool_failed",
            ErrorKind::LlmUnavailable => "llm_unavailable",
            ErrorKind::AgentParseFailed => "agent_parse_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::TurnBudgetExceeded => "turn_budget_exceeded",
            ErrorKind::GoalPreconditionFailed => "goal_precondition_failed",
            ErrorKind::SubscriberBackpressure => "subscriber_backpressure",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::SubscriberBackpressure).unwrap();
        assert_eq!(json, "\"subscriber_backpressure\"");
        assert_eq!(
            ErrorKind::SubscriberBackpressure.as_str(),
            "subscriber_backpressure"
        );
    }

    #[test]
    fn test_error_kind_round_trip() {
        for kind in [
            ErrorKind::InvalidInput,
            ErrorKind::ToolTimeout,
            ErrorKind::TurnBudgetExceeded,
            ErrorKind::Internal,
        ]
        .iter()
        {
            let json = serde_json::to_string(kind).unwrap();
            let back: ErrorKind = serde_json::from_str(&json).unwrap();
            assert_eq!(*kind, back);
        }
    }
}
