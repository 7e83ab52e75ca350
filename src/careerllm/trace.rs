//! Append-only execution traces.
//!
//! Every agent execution leaves a [`Trace`]: the inputs digest, one row per
//! reason/act round, the terminal status, and the latency. Rows are only
//! ever appended while the agent runs; after the turn terminates the trace
//! is immutable except for a single optional feedback annotation.
//!
//! Tool results are not stored whole. Each row carries a truncated SHA-256
//! digest plus the byte length of the result, which is enough to correlate
//! and diff runs without dragging payloads into the trace store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::careerllm::store::{new_id, StoreError, StoreResult};

/// User verdict on one agent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackRating {
    Positive,
    Negative,
}

/// How an agent execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Completed,
    Failed,
    Cancelled,
}

/// One reason/act round: what the agent thought, which tool it called, and
/// a digest of what came back.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    pub thought: String,
    pub tool: String,
    pub result_digest: String,
    pub result_bytes: usize,
    pub recorded_at: DateTime<Utc>,
}

/// Durable record of one agent execution within a turn or step.
#[derive(Debug, Clone, Serialize)]
pub struct Trace {
    pub id: String,
    pub agent: String,
    pub inputs_digest: String,
    pub entries: Vec<TraceEntry>,
    pub status: TraceStatus,
    pub latency_ms: u64,
    pub feedback: Option<FeedbackRating>,
    pub created_at: DateTime<Utc>,
}

impl Trace {
    /// Start an in-memory trace for an agent working on the given inputs.
    pub fn begin(agent: impl Into<String>, inputs: &str) -> Self {
        Self {
            id: new_id(),
            agent: agent.into(),
            inputs_digest: digest(inputs.as_bytes()),
            entries: Vec::new(),
            status: TraceStatus::Completed,
            latency_ms: 0,
            feedback: None,
            created_at: Utc::now(),
        }
    }

    /// Append one reason/act row. Rows are never replaced or removed.
    pub fn record(&mut self, thought: &str, tool: &str, result: &str) {
        self.entries.push(TraceEntry {
            thought: thought.to_string(),
            tool: tool.to_string(),
            result_digest: digest(result.as_bytes()),
            result_bytes: result.len(),
            recorded_at: Utc::now(),
        });
    }

    /// Seal the trace with its terminal status and total latency.
    pub fn finish(mut self, status: TraceStatus, latency_ms: u64) -> Self {
        self.status = status;
        self.latency_ms = latency_ms;
        self
    }
}

/// Truncated hex SHA-256, enough to correlate without storing payloads.
pub(crate) fn digest(bytes: &[u8]) -> String {
    let full = Sha256::digest(bytes);
    let hex: String = full.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

/// Trace persistence. Insertion happens once per execution; afterwards only
/// the feedback annotation may be set, and only the first one sticks.
#[async_trait]
pub trait TraceStore: Send + Sync {
    async fn insert(&self, trace: Trace) -> StoreResult<()>;

    async fn get(&self, trace_id: &str) -> StoreResult<Trace>;

    /// Record feedback. Repeated submissions are accepted but only the
    /// first recording is kept.
    async fn set_feedback(&self, trace_id: &str, rating: FeedbackRating) -> StoreResult<()>;
}

/// In-memory [`TraceStore`].
#[derive(Default)]
pub struct MemoryTraceStore {
    traces: Mutex<HashMap<String, Trace>>,
}

impl MemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TraceStore for MemoryTraceStore {
    async fn insert(&self, trace: Trace) -> StoreResult<()> {
        self.traces
            .lock()
            .expect("trace lock")
            .insert(trace.id.clone(), trace);
        Ok(())
    }

    async fn get(&self, trace_id: &str) -> StoreResult<Trace> {
        self.traces
            .lock()
            .expect("trace lock")
            .get(trace_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("trace {}", trace_id)))
    }

    async fn set_feedback(&self, trace_id: &str, rating: FeedbackRating) -> StoreResult<()> {
        let mut traces = self.traces.lock().expect("trace lock");
        let trace = traces
            .get_mut(trace_id)
            .ok_or_else(|| StoreError::NotFound(format!("trace {}", trace_id)))?;
        if trace.feedback.is_none() {
            trace.feedback = Some(rating);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_accumulate_in_order() {
        let mut trace = Trace::begin("scout", "find rust jobs");
        trace.record("search first", "search_jobs", "{\"jobs\": []}");
        trace.record("narrow the query", "search_jobs", "{\"jobs\": [1]}");
        assert_eq!(trace.entries.len(), 2);
        assert_eq!(trace.entries[0].tool, "search_jobs");
        assert_ne!(
            trace.entries[0].result_digest,
            trace.entries[1].result_digest
        );
    }

    #[test]
    fn test_digest_is_stable_and_short() {
        assert_eq!(digest(b"abc"), digest(b"abc"));
        assert_eq!(digest(b"abc").len(), 16);
        assert_ne!(digest(b"abc"), digest(b"abd"));
    }

    #[tokio::test]
    async fn test_feedback_keeps_first_recording() {
        let store = MemoryTraceStore::new();
        let trace = Trace::begin("scout", "x").finish(TraceStatus::Completed, 12);
        let id = trace.id.clone();
        store.insert(trace).await.unwrap();

        store
            .set_feedback(&id, FeedbackRating::Positive)
            .await
            .unwrap();
        store
            .set_feedback(&id, FeedbackRating::Negative)
            .await
            .unwrap();

        let stored = store.get(&id).await.unwrap();
        assert_eq!(stored.feedback, Some(FeedbackRating::Positive));
    }

    #[tokio::test]
    async fn test_feedback_for_unknown_trace_is_not_found() {
        let store = MemoryTraceStore::new();
        let result = store.set_feedback("nope", FeedbackRating::Positive).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
