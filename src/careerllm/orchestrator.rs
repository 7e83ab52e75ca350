//! Conversation orchestrator.
//!
//! [`Orchestrator::run_turn`] is the single public entry for chat: it
//! allocates a turn, ensures a conversation, persists the user message
//! under a per-conversation advisory lock, routes, drives the agent
//! pipeline step by step (consulting the evaluator after every step and
//! the negotiator when reports diverge), synthesizes the final assistant
//! message, persists it, and streams the whole thing as ordered events.
//!
//! Guarantees:
//!
//! - Every stream terminates with `done` exactly once; terminal failures
//!   emit an `error` event first.
//! - A failed agent does not abort the pipeline; its absence is declared
//!   to downstream agents. When at least half the attempted agents fail,
//!   synthesis produces an apology naming them instead of an answer.
//! - Cancellation is observed between steps and inside the running agent;
//!   after it is observed no further agent starts, and an abbreviated
//!   assistant message is still persisted.
//! - A wall-clock budget bounds the whole turn; on expiry the remaining
//!   agents are cancelled and synthesis runs on whatever context exists.
//! - The orchestrator never blocks on a slow event consumer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::careerllm::agent::{AgentFailure, AgentRegistry, PipelineContext};
use crate::careerllm::agent_runtime::{
    AgentRun, AgentRunError, AgentRunInput, AgentRuntime, Attachment,
};
use crate::careerllm::config::RuntimeConfig;
use crate::careerllm::error::ErrorKind;
use crate::careerllm::evaluator::{DecisionLedger, Evaluator, EvaluatorDecision};
use crate::careerllm::event::{AgentPhase, EventEnvelope, EventSink, TurnEvent};
use crate::careerllm::llm_provider::{LLMProvider, Message};
use crate::careerllm::negotiator::{NegotiationOutcome, Negotiator};
use crate::careerllm::push::PushFabric;
use crate::careerllm::router::IntentRouter;
use crate::careerllm::store::{
    ConversationStore, MemoryConversationStore, MemoryProfileStore, MessageRole, ProfileStore,
    StoredMessage,
};
use crate::careerllm::trace::{MemoryTraceStore, Trace, TraceStatus, TraceStore};

/// One turn request.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub user_id: String,
    /// Existing conversation to continue, or `None` to start one.
    pub conversation_id: Option<String>,
    pub text: String,
    pub attachment: Option<Attachment>,
}

impl TurnRequest {
    pub fn new(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: None,
            text: text.into(),
            attachment: None,
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

/// Errors surfaced to the caller of [`Orchestrator::run_turn`] before any
/// stream exists.
#[derive(Debug, Clone)]
pub enum OrchestratorError {
    /// The request was malformed.
    InvalidInput(String),
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestratorError::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
        }
    }
}

impl std::error::Error for OrchestratorError {}

/// Rolled-up view of one drained turn stream.
#[derive(Debug, Default)]
pub struct TurnSummary {
    /// Every envelope received, in order.
    pub events: Vec<EventEnvelope>,
    /// Conversation the turn ran in.
    pub conversation_id: Option<String>,
    /// Concatenated `content` text.
    pub text: String,
    /// Trace ids reported by the turn.
    pub trace_ids: Vec<String>,
    /// The last `error` kind seen, if any.
    pub error: Option<ErrorKind>,
    /// Agents that completed.
    pub agent_completions: usize,
    /// Agents that failed.
    pub agent_failures: usize,
}

impl TurnSummary {
    /// Event type tags in arrival order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.iter().map(|e| e.event.kind()).collect()
    }
}

/// The caller's end of one turn's event stream.
pub struct TurnHandle {
    events: mpsc::Receiver<EventEnvelope>,
}

impl TurnHandle {
    pub(crate) fn from_receiver(events: mpsc::Receiver<EventEnvelope>) -> Self {
        Self { events }
    }

    /// Next envelope, or `None` once the stream is closed.
    pub async fn next_event(&mut self) -> Option<EventEnvelope> {
        self.events.recv().await
    }

    /// Drain the stream to completion and roll it up.
    pub async fn drain(mut self) -> TurnSummary {
        let mut summary = TurnSummary::default();
        while let Some(envelope) = self.events.recv().await {
            match &envelope.event {
                TurnEvent::ConversationId { conversation_id } => {
                    summary.conversation_id = Some(conversation_id.clone());
                }
                TurnEvent::Content { text } => summary.text.push_str(text),
                TurnEvent::TraceIds { ids } => summary.trace_ids = ids.clone(),
                TurnEvent::Error { kind, .. } => summary.error = Some(*kind),
                TurnEvent::AgentStatus { status, .. } => match status {
                    AgentPhase::Complete => summary.agent_completions += 1,
                    AgentPhase::Failed => summary.agent_failures += 1,
                    AgentPhase::Running => {}
                },
                _ => {}
            }
            summary.events.push(envelope);
        }
        summary
    }
}

/// Builds an [`Orchestrator`], defaulting every store to its in-memory
/// implementation.
pub struct OrchestratorBuilder {
    provider: Arc<dyn LLMProvider>,
    agents: Arc<AgentRegistry>,
    tools: Arc<crate::careerllm::tool_registry::ToolRegistry>,
    fabric: PushFabric,
    config: RuntimeConfig,
    conversations: Arc<dyn ConversationStore>,
    traces: Arc<dyn TraceStore>,
    profiles: Arc<dyn ProfileStore>,
}

impl OrchestratorBuilder {
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_conversation_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.conversations = store;
        self
    }

    pub fn with_trace_store(mut self, store: Arc<dyn TraceStore>) -> Self {
        self.traces = store;
        self
    }

    pub fn with_profile_store(mut self, store: Arc<dyn ProfileStore>) -> Self {
        self.profiles = store;
        self
    }

    pub fn build(self) -> Orchestrator {
        let runtime = AgentRuntime::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.tools),
            self.config.agent.clone(),
        );
        let router = IntentRouter::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.agents),
            self.config.router.clone(),
        );
        let evaluator = Evaluator::new(Arc::clone(&self.provider), self.config.evaluator.clone());
        let negotiator =
            Negotiator::new(Arc::clone(&self.provider), self.config.negotiation.clone());
        Orchestrator {
            inner: Arc::new(Inner {
                provider: self.provider,
                agents: self.agents,
                runtime,
                router,
                evaluator,
                negotiator,
                conversations: self.conversations,
                traces: self.traces,
                profiles: self.profiles,
                fabric: self.fabric,
                config: self.config,
                cancels: tokio::sync::Mutex::new(HashMap::new()),
                conversation_locks: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }
}

struct Inner {
    provider: Arc<dyn LLMProvider>,
    agents: Arc<AgentRegistry>,
    runtime: AgentRuntime,
    router: IntentRouter,
    evaluator: Evaluator,
    negotiator: Negotiator,
    conversations: Arc<dyn ConversationStore>,
    traces: Arc<dyn TraceStore>,
    profiles: Arc<dyn ProfileStore>,
    fabric: PushFabric,
    config: RuntimeConfig,
    cancels: tokio::sync::Mutex<HashMap<(String, String), CancellationToken>>,
    conversation_locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Fan-out sink for one stream: the direct per-request channel plus the
/// push fabric. The direct channel is bounded; a caller that stops
/// draining is dropped rather than awaited. Also used by the goal
/// executor and the task runner for their own streams.
pub(crate) struct TurnSink {
    user_id: String,
    direct: std::sync::Mutex<Option<mpsc::Sender<EventEnvelope>>>,
    seq: AtomicU64,
    fabric: PushFabric,
}

impl TurnSink {
    pub(crate) fn new(user_id: &str, sender: mpsc::Sender<EventEnvelope>, fabric: PushFabric) -> Self {
        Self {
            user_id: user_id.to_string(),
            direct: std::sync::Mutex::new(Some(sender)),
            seq: AtomicU64::new(0),
            fabric,
        }
    }
}

#[async_trait]
impl EventSink for TurnSink {
    async fn emit(&self, event: TurnEvent) {
        self.fabric.publish(&self.user_id, &event).await;

        let sender = self.direct.lock().expect("direct lock").clone();
        if let Some(sender) = sender {
            let envelope = EventEnvelope {
                seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
                event,
            };
            if sender.try_send(envelope).is_err() {
                log::warn!("turn caller stopped draining, dropping direct channel");
                *self.direct.lock().expect("direct lock") = None;
            }
        }
    }
}

/// The conversation orchestrator. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Start building an orchestrator.
    pub fn builder(
        provider: Arc<dyn LLMProvider>,
        agents: Arc<AgentRegistry>,
        tools: Arc<crate::careerllm::tool_registry::ToolRegistry>,
        fabric: PushFabric,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            provider,
            agents,
            tools,
            fabric,
            config: RuntimeConfig::default(),
            conversations: Arc::new(MemoryConversationStore::new()),
            traces: Arc::new(MemoryTraceStore::new()),
            profiles: Arc::new(MemoryProfileStore::new()),
        }
    }

    /// Run one turn. Returns immediately with the event stream; the work
    /// proceeds on its own task.
    pub fn run_turn(&self, request: TurnRequest) -> Result<TurnHandle, OrchestratorError> {
        if request.text.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "user text must not be empty".to_string(),
            ));
        }
        if request.user_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "user id must not be empty".to_string(),
            ));
        }

        let (sender, receiver) = mpsc::channel(self.inner.config.push.queue_capacity + 1);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.drive_turn(request, sender).await;
        });
        Ok(TurnHandle { events: receiver })
    }

    /// Raise the cancel token of the turn running in `conversation_id` for
    /// `user_id`. Idempotent; unknown turns are a no-op.
    pub async fn cancel_turn(&self, user_id: &str, conversation_id: &str) {
        let cancels = self.inner.cancels.lock().await;
        if let Some(token) = cancels.get(&(user_id.to_string(), conversation_id.to_string())) {
            token.cancel();
        }
    }

    /// Annotate a trace with user feedback. Repeated submissions keep the
    /// first recording.
    pub async fn submit_feedback(
        &self,
        trace_id: &str,
        rating: crate::careerllm::trace::FeedbackRating,
    ) -> Result<(), crate::careerllm::store::StoreError> {
        self.inner.traces.set_feedback(trace_id, rating).await
    }

    /// The conversation store this orchestrator persists through.
    pub fn conversations(&self) -> Arc<dyn ConversationStore> {
        Arc::clone(&self.inner.conversations)
    }

    /// The trace store this orchestrator persists through.
    pub fn traces(&self) -> Arc<dyn TraceStore> {
        Arc::clone(&self.inner.traces)
    }
}

impl Inner {
    async fn drive_turn(self: Arc<Self>, request: TurnRequest, sender: mpsc::Sender<EventEnvelope>) {
        let sink = TurnSink::new(&request.user_id, sender, self.fabric.clone());

        // Resolve or create the conversation.
        let conversation = match &request.conversation_id {
            Some(id) => match self.conversations.get_conversation(id).await {
                Ok(conversation) => conversation,
                Err(err) => {
                    sink.emit(TurnEvent::Error {
                        kind: ErrorKind::InvalidInput,
                        message: Some(err.to_string()),
                    })
                    .await;
                    sink.emit(TurnEvent::Done).await;
                    return;
                }
            },
            None => {
                let title = title_from(&request.text);
                match self
                    .conversations
                    .create_conversation(&request.user_id, &title)
                    .await
                {
                    Ok(conversation) => conversation,
                    Err(err) => {
                        sink.emit(TurnEvent::Error {
                            kind: ErrorKind::Internal,
                            message: Some(err.to_string()),
                        })
                        .await;
                        sink.emit(TurnEvent::Done).await;
                        return;
                    }
                }
            }
        };
        sink.emit(TurnEvent::ConversationId {
            conversation_id: conversation.id.clone(),
        })
        .await;

        // One turn writes a conversation at a time.
        let lock = self.lock_for(&conversation.id).await;
        let _guard = lock.lock_owned().await;

        if let Err(err) = self
            .conversations
            .append_message(&conversation.id, MessageRole::User, &request.text)
            .await
        {
            self.fail(&sink, ErrorKind::Internal, err.to_string()).await;
            return;
        }

        let cancel = self
            .register_cancel(&request.user_id, &conversation.id)
            .await;
        let deadline = tokio::time::Instant::now() + self.config.turn.wall_clock_budget;

        let history = match self.conversations.list_messages(&conversation.id).await {
            Ok(mut messages) => {
                // The just-persisted user message is passed separately.
                messages.pop();
                messages
            }
            Err(err) => {
                self.fail(&sink, ErrorKind::Internal, err.to_string()).await;
                self.unregister_cancel(&request.user_id, &conversation.id)
                    .await;
                return;
            }
        };

        let profile_hint = match self.profiles.get(&request.user_id).await {
            Ok(Some(profile)) => Some(profile.as_hint()),
            _ => None,
        };

        let routing = self
            .router
            .route(&history, &request.text, profile_hint.as_deref())
            .await;
        sink.emit(TurnEvent::Routing {
            intent: routing.intent.clone(),
            agents: routing.agents.clone(),
            confidence: routing.confidence,
        })
        .await;

        if routing.direct_response {
            self.direct_answer(&request, &conversation.id, &history, &sink)
                .await;
            self.unregister_cancel(&request.user_id, &conversation.id)
                .await;
            return;
        }

        self.pipeline_answer(&request, &conversation.id, &history, routing.agents, &sink, &cancel, deadline)
            .await;
        self.unregister_cancel(&request.user_id, &conversation.id)
            .await;
    }

    /// The direct path: no agents, one streamed model reply.
    async fn direct_answer(
        &self,
        request: &TurnRequest,
        conversation_id: &str,
        history: &[StoredMessage],
        sink: &TurnSink,
    ) {
        let mut messages = vec![Message::system(
            "You are a friendly, practical career assistant. Answer \
             conversationally and keep it short unless detail is needed.",
        )];
        messages.extend(history_messages(history));
        if let Some(attachment) = &request.attachment {
            messages.push(Message::user(&format!(
                "The user attached a file named \"{}\":\n{}",
                attachment.name, attachment.content
            )));
        }
        messages.push(Message::user(&request.text));

        let text = self.stream_reply(&messages, sink).await;
        let text = if text.is_empty() {
            let fallback = "I hit a temporary problem answering just now. Please try again \
                            in a moment.";
            sink.emit(TurnEvent::Content {
                text: fallback.to_string(),
            })
            .await;
            fallback.to_string()
        } else {
            text
        };

        let trace = Trace::begin("direct", &request.text).finish(TraceStatus::Completed, 0);
        let trace_id = trace.id.clone();
        if let Err(err) = self.traces.insert(trace).await {
            log::error!("failed to persist direct trace: {}", err);
        }

        if let Err(err) = self
            .conversations
            .append_message(conversation_id, MessageRole::Assistant, &text)
            .await
        {
            self.fail(sink, ErrorKind::Internal, err.to_string()).await;
            return;
        }

        sink.emit(TurnEvent::TraceIds {
            ids: vec![trace_id],
        })
        .await;
        sink.emit(TurnEvent::Done).await;
    }

    /// The agent pipeline path.
    #[allow(clippy::too_many_arguments)]
    async fn pipeline_answer(
        &self,
        request: &TurnRequest,
        conversation_id: &str,
        history: &[StoredMessage],
        agents: Vec<String>,
        sink: &TurnSink,
        cancel: &CancellationToken,
        deadline: tokio::time::Instant,
    ) {
        let mut queue: VecDeque<String> = agents.into();
        let mut executed: Vec<String> = Vec::new();
        let mut context = PipelineContext::default();
        let mut trace_ids: Vec<String> = Vec::new();
        let mut ledger = DecisionLedger::new();
        let mut cancelled = false;
        let mut budget_exceeded = false;

        while let Some(agent_name) = queue.pop_front() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                budget_exceeded = true;
                break;
            }

            let profile = match self.agents.get(&agent_name) {
                Some(profile) => profile.clone(),
                None => {
                    log::error!("pipeline references unknown agent {}", agent_name);
                    continue;
                }
            };

            sink.emit(TurnEvent::AgentStatus {
                agent: agent_name.clone(),
                status: AgentPhase::Running,
                message: None,
            })
            .await;

            // A child token lets the budget cancel this step without
            // conflating it with a user cancel.
            let work_token = cancel.child_token();
            let run: AgentRun = {
                let input = AgentRunInput {
                    user_id: &request.user_id,
                    history,
                    task: &request.text,
                    attachment: request.attachment.as_ref(),
                    context: &context,
                    cancel: &work_token,
                };
                let exec = self.runtime.execute(&profile, input, sink);
                tokio::pin!(exec);
                tokio::select! {
                    run = &mut exec => run,
                    _ = tokio::time::sleep_until(deadline) => {
                        work_token.cancel();
                        exec.await
                    }
                }
            };

            trace_ids.push(run.trace.id.clone());
            if let Err(err) = self.traces.insert(run.trace).await {
                log::error!("failed to persist trace: {}", err);
            }

            match run.outcome {
                Ok(report) => {
                    sink.emit(TurnEvent::AgentStatus {
                        agent: agent_name.clone(),
                        status: AgentPhase::Complete,
                        message: None,
                    })
                    .await;
                    executed.push(agent_name.clone());
                    context = context.with_report(report.clone());

                    let remaining: Vec<String> = queue.iter().cloned().collect();
                    let decision = self
                        .evaluator
                        .review(&report, &executed, &remaining, &context, &self.agents, &mut ledger)
                        .await;
                    sink.emit(TurnEvent::Evaluator {
                        decision: decision.name().to_string(),
                        reason: decision.reason().map(|r| r.to_string()),
                        target: decision.target().map(|t| t.to_string()),
                    })
                    .await;
                    match decision {
                        EvaluatorDecision::Continue => {}
                        EvaluatorDecision::SkipNext { .. } => {
                            if let Some(skipped) = queue.pop_front() {
                                log::info!("evaluator skipped agent {}", skipped);
                            }
                        }
                        EvaluatorDecision::LoopBack { target, .. } => {
                            queue.push_front(target);
                        }
                        EvaluatorDecision::Stop { .. } => {
                            queue.clear();
                        }
                        EvaluatorDecision::AddAgent { target, .. } => {
                            queue.push_front(target);
                        }
                    }
                }
                Err(AgentRunError::Cancelled) => {
                    let user_cancel = cancel.is_cancelled();
                    sink.emit(TurnEvent::AgentStatus {
                        agent: agent_name.clone(),
                        status: AgentPhase::Failed,
                        message: Some(if user_cancel {
                            "cancelled".to_string()
                        } else {
                            "turn budget exceeded".to_string()
                        }),
                    })
                    .await;
                    if user_cancel {
                        cancelled = true;
                    } else {
                        budget_exceeded = true;
                    }
                    break;
                }
                Err(err) => {
                    sink.emit(TurnEvent::AgentStatus {
                        agent: agent_name.clone(),
                        status: AgentPhase::Failed,
                        message: Some(err.to_string()),
                    })
                    .await;
                    context = context.with_failure(AgentFailure {
                        agent: agent_name.clone(),
                        display_name: self.agents.display_name(&agent_name),
                        message: err.to_string(),
                    });
                }
            }
        }

        // Negotiation across divergent reports.
        let mut negotiated: Option<NegotiationOutcome> = None;
        if !cancelled && !budget_exceeded && self.negotiator.divergent(&context.reports, &self.agents)
        {
            negotiated = Some(
                self.negotiator
                    .run(&request.text, &context.reports, &self.agents, sink)
                    .await,
            );
        }

        // Synthesis.
        let text = if cancelled {
            let text = "This request was cancelled before it finished. Ask again whenever \
                        you are ready."
                .to_string();
            sink.emit(TurnEvent::Content { text: text.clone() }).await;
            text
        } else {
            self.synthesize(request, &context, negotiated.as_ref(), sink)
                .await
        };

        if let Err(err) = self
            .conversations
            .append_message(conversation_id, MessageRole::Assistant, &text)
            .await
        {
            self.fail(sink, ErrorKind::Internal, err.to_string()).await;
            return;
        }

        sink.emit(TurnEvent::TraceIds { ids: trace_ids }).await;
        if budget_exceeded {
            sink.emit(TurnEvent::Error {
                kind: ErrorKind::TurnBudgetExceeded,
                message: Some("the turn ran out of time; partial results were used".to_string()),
            })
            .await;
        }
        sink.emit(TurnEvent::Done).await;
    }

    /// Compose the final assistant message from the pipeline context.
    async fn synthesize(
        &self,
        request: &TurnRequest,
        context: &PipelineContext,
        negotiated: Option<&NegotiationOutcome>,
        sink: &TurnSink,
    ) -> String {
        let attempted = context.reports.len() + context.failures.len();
        let failure_heavy = attempted > 0
            && context.failures.len() as f32 / attempted as f32
                >= self.config.turn.failure_apology_ratio;

        if failure_heavy {
            let names: Vec<String> = context
                .failures
                .iter()
                .map(|f| f.display_name.clone())
                .collect();
            let text = format!(
                "I'm sorry, I couldn't put together a confident answer this time. \
                 The following specialists ran into trouble: {}. Please try again \
                 in a moment.",
                names.join(", ")
            );
            sink.emit(TurnEvent::Content { text: text.clone() }).await;
            return text;
        }

        let mut prompt = format!(
            "The user asked:\n{}\n\nSpecialist reports:\n{}",
            request.text,
            context.render()
        );
        if let Some(outcome) = negotiated {
            prompt.push_str(&format!(
                "\nAfter debate the specialists {} on this position: {}\n",
                if outcome.consensus {
                    "reached consensus"
                } else {
                    "did not fully agree; the strongest position is"
                },
                outcome.position
            ));
            for dissent in &outcome.dissents {
                prompt.push_str(&format!("Dissenting view: {}\n", dissent));
            }
        }

        let messages = vec![
            Message::system(
                "You are a career assistant. Integrate the specialist reports \
                 into one helpful, honest answer for the user. Credit concrete \
                 findings, note anything that could not be completed, and do \
                 not invent results.",
            ),
            Message::user(&prompt),
        ];

        let text = self.stream_reply(&messages, sink).await;
        if !text.is_empty() {
            return text;
        }

        // Synthesis provider failure: fall back to a templated digest of
        // what the agents produced.
        let mut fallback =
            String::from("I had trouble composing a full answer, but here is what was found:\n");
        for report in &context.reports {
            fallback.push_str(&format!("- {}: {}\n", report.display_name, report.summary));
        }
        for failure in &context.failures {
            fallback.push_str(&format!(
                "- {} could not finish ({})\n",
                failure.display_name, failure.message
            ));
        }
        sink.emit(TurnEvent::Content {
            text: fallback.clone(),
        })
        .await;
        fallback
    }

    /// Stream one model reply as `content` events, returning the full text.
    /// Returns an empty string when the provider fails.
    async fn stream_reply(&self, messages: &[Message], sink: &TurnSink) -> String {
        let mut collected = String::new();
        match self.provider.complete_stream(messages).await {
            Ok(mut stream) => {
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(chunk) => {
                            if chunk.content.is_empty() {
                                continue;
                            }
                            collected.push_str(&chunk.content);
                            sink.emit(TurnEvent::Content {
                                text: chunk.content,
                            })
                            .await;
                        }
                        Err(err) => {
                            log::warn!("reply stream interrupted: {}", err);
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                log::warn!("streaming reply failed: {}", err);
            }
        }
        collected
    }

    async fn fail(&self, sink: &TurnSink, kind: ErrorKind, message: String) {
        sink.emit(TurnEvent::Error {
            kind,
            message: Some(message),
        })
        .await;
        sink.emit(TurnEvent::Done).await;
    }

    async fn lock_for(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.conversation_locks.lock().await;
        Arc::clone(
            locks
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    async fn register_cancel(&self, user_id: &str, conversation_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancels
            .lock()
            .await
            .insert((user_id.to_string(), conversation_id.to_string()), token.clone());
        token
    }

    async fn unregister_cancel(&self, user_id: &str, conversation_id: &str) {
        self.cancels
            .lock()
            .await
            .remove(&(user_id.to_string(), conversation_id.to_string()));
    }
}

fn history_messages(history: &[StoredMessage]) -> Vec<Message> {
    history
        .iter()
        .map(|stored| match stored.role {
            MessageRole::User => Message::user(&stored.content),
            MessageRole::Assistant => Message::assistant(&stored.content),
        })
        .collect()
}

/// Derive a conversation title from the opening message.
fn title_from(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(60) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_truncation_respects_char_boundaries() {
        assert_eq!(title_from("short"), "short");
        let long = "x".repeat(100);
        let title = title_from(&long);
        assert!(title.ends_with("..."));
        assert_eq!(title.len(), 63);
    }

    #[test]
    fn test_empty_text_is_rejected_before_streaming() {
        let provider = Arc::new(crate::careerllm::providers::ScriptedProvider::new());
        let fabric = PushFabric::new(
            Arc::new(crate::careerllm::push::OpenAuth),
            crate::careerllm::config::PushConfig::default(),
        );
        let orchestrator = Orchestrator::builder(
            provider,
            Arc::new(AgentRegistry::default_catalog()),
            Arc::new(crate::careerllm::tool_registry::ToolRegistry::new()),
            fabric,
        )
        .build();

        let result = orchestrator.run_turn(TurnRequest::new("u1", "   "));
        assert!(matches!(result, Err(OrchestratorError::InvalidInput(_))));
    }
}
