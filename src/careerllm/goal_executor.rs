//! Goal executor.
//!
//! Runs a goal's steps through the orchestrator's public entry, one at a
//! time or autonomously end to end. At most one executor holds a goal at
//! any instant: the per-goal hold is acquired before a step transitions to
//! `in_progress` and released when the run ends, so two steps of the same
//! goal can never be `in_progress` together.
//!
//! Autonomous runs terminate when:
//!
//! 1. a step fails and the retry budget is exhausted (the goal pauses),
//! 2. the goal-scoped cancel token is raised (the goal pauses),
//! 3. every non-skipped step is completed (the goal completes),
//!
//! and between steps the planner reviews the remaining plan; when a step's
//! output invalidates it, the pending tail is replaced and a `goal_replan`
//! event streams with the adjustment and reason.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::careerllm::config::GoalConfig;
use crate::careerllm::error::ErrorKind;
use crate::careerllm::event::{EventSink, TurnEvent};
use crate::careerllm::goal::{Goal, GoalStatus, GoalStore, StepRecord, StepStatus};
use crate::careerllm::goal_planner::{GoalPlanner, PlanError, PlanReview};
use crate::careerllm::orchestrator::{Orchestrator, TurnHandle, TurnRequest, TurnSink};
use crate::careerllm::push::PushFabric;
use crate::careerllm::store::{
    new_id, Notification, NotificationStore, ProfileStore, StoreError,
};

/// Errors surfaced to the caller of a goal request.
#[derive(Debug)]
pub enum GoalError {
    /// The goal is in a state that forbids the operation, or another
    /// executor holds it.
    Precondition(String),
    /// Planning failed outright.
    Plan(PlanError),
    /// The store failed.
    Store(StoreError),
}

impl std::fmt::Display for GoalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GoalError::Precondition(msg) => write!(f, "goal precondition failed: {}", msg),
            GoalError::Plan(err) => write!(f, "{}", err),
            GoalError::Store(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for GoalError {}

impl From<StoreError> for GoalError {
    fn from(err: StoreError) -> Self {
        GoalError::Store(err)
    }
}

/// Drives goals through the orchestrator.
#[derive(Clone)]
pub struct GoalExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    orchestrator: Orchestrator,
    planner: GoalPlanner,
    goals: Arc<dyn GoalStore>,
    profiles: Arc<dyn ProfileStore>,
    notifications: Arc<dyn NotificationStore>,
    fabric: PushFabric,
    config: GoalConfig,
    queue_capacity: usize,
    holds: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cancels: std::sync::Mutex<HashMap<String, CancellationToken>>,
}

impl GoalExecutor {
    pub fn new(
        orchestrator: Orchestrator,
        planner: GoalPlanner,
        goals: Arc<dyn GoalStore>,
        profiles: Arc<dyn ProfileStore>,
        notifications: Arc<dyn NotificationStore>,
        fabric: PushFabric,
        config: GoalConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                orchestrator,
                planner,
                goals,
                profiles,
                notifications,
                fabric,
                config,
                queue_capacity: 256,
                holds: std::sync::Mutex::new(HashMap::new()),
                cancels: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Plan an objective and persist the resulting goal and steps.
    pub async fn create_goal(
        &self,
        user_id: &str,
        objective: &str,
    ) -> Result<(Goal, Vec<StepRecord>), GoalError> {
        let profile = self
            .inner
            .profiles
            .get(user_id)
            .await
            .unwrap_or_default();
        let (goal, steps) = self
            .inner
            .planner
            .plan(user_id, objective, profile.as_ref())
            .await
            .map_err(GoalError::Plan)?;
        self.inner
            .goals
            .create_goal(goal.clone(), steps.clone())
            .await?;
        Ok((goal, steps))
    }

    /// Run the lowest-ordinal pending step of a goal.
    pub async fn execute_step(&self, goal_id: &str) -> Result<TurnHandle, GoalError> {
        let (goal, step) = self.next_pending(goal_id).await?;
        let hold = self.inner.acquire_hold(goal_id)?;

        let (sender, receiver) = mpsc::channel(self.inner.queue_capacity + 1);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _hold = hold;
            let sink = TurnSink::new(&goal.user_id, sender, inner.fabric.clone());
            let completed: Vec<StepRecord> = match inner.goals.list_steps(&goal.id).await {
                Ok(steps) => steps
                    .into_iter()
                    .filter(|s| s.status == StepStatus::Completed)
                    .collect(),
                Err(_) => Vec::new(),
            };
            let _ = inner.run_step(&goal, step, &completed, &sink).await;
            inner.maybe_complete_goal(&goal.id).await;
            sink.emit(TurnEvent::Done).await;
        });
        Ok(TurnHandle::from_receiver(receiver))
    }

    /// Run a goal's steps in order until a terminal condition.
    pub async fn auto_execute(&self, goal_id: &str) -> Result<TurnHandle, GoalError> {
        let goal = self.inner.goals.get_goal(goal_id).await?;
        if goal.status == GoalStatus::Completed || goal.status == GoalStatus::Abandoned {
            return Err(GoalError::Precondition(format!(
                "goal is {:?}",
                goal.status
            )));
        }
        let hold = self.inner.acquire_hold(goal_id)?;
        let cancel = self.register_cancel(goal_id);

        let (sender, receiver) = mpsc::channel(self.inner.queue_capacity + 1);
        let inner = Arc::clone(&self.inner);
        let executor = self.clone();
        tokio::spawn(async move {
            let _hold = hold;
            let sink = TurnSink::new(&goal.user_id, sender, inner.fabric.clone());
            inner.auto_loop(&goal, &cancel, &sink).await;
            executor.unregister_cancel(&goal.id);
            sink.emit(TurnEvent::Done).await;
        });
        Ok(TurnHandle::from_receiver(receiver))
    }

    /// Raise the goal-scoped cancel token. Idempotent.
    pub fn cancel_goal(&self, goal_id: &str) {
        let cancels = self.inner.cancels.lock().expect("cancel lock");
        if let Some(token) = cancels.get(goal_id) {
            token.cancel();
        }
    }

    async fn next_pending(&self, goal_id: &str) -> Result<(Goal, StepRecord), GoalError> {
        let goal = self.inner.goals.get_goal(goal_id).await?;
        if goal.status == GoalStatus::Completed || goal.status == GoalStatus::Abandoned {
            return Err(GoalError::Precondition(format!(
                "goal is {:?}",
                goal.status
            )));
        }
        let steps = self.inner.goals.list_steps(goal_id).await?;
        let step = steps
            .into_iter()
            .find(|s| s.status == StepStatus::Pending)
            .ok_or_else(|| GoalError::Precondition("no pending steps".to_string()))?;
        Ok((goal, step))
    }

    fn register_cancel(&self, goal_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.inner
            .cancels
            .lock()
            .expect("cancel lock")
            .insert(goal_id.to_string(), token.clone());
        token
    }

    fn unregister_cancel(&self, goal_id: &str) {
        self.inner
            .cancels
            .lock()
            .expect("cancel lock")
            .remove(goal_id);
    }
}

impl ExecutorInner {
    /// Exclusive per-goal hold. Fails immediately when another executor
    /// already holds the goal.
    fn acquire_hold(
        &self,
        goal_id: &str,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>, GoalError> {
        let lock = {
            let mut holds = self.holds.lock().expect("hold lock");
            Arc::clone(
                holds
                    .entry(goal_id.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        lock.try_lock_owned().map_err(|_| {
            GoalError::Precondition("another executor holds this goal".to_string())
        })
    }

    /// Execute one step through the orchestrator. Returns the updated
    /// record and whether it failed.
    async fn run_step(
        &self,
        goal: &Goal,
        mut step: StepRecord,
        completed: &[StepRecord],
        sink: &TurnSink,
    ) -> (StepRecord, bool) {
        step.status = StepStatus::InProgress;
        if let Err(err) = self.goals.update_step(step.clone()).await {
            log::error!("failed to mark step in_progress: {}", err);
        }
        sink.emit(TurnEvent::GoalStepStart {
            goal_id: goal.id.clone(),
            ordinal: step.ordinal,
            title: step.title.clone(),
            agent: step.agent.clone(),
        })
        .await;

        let mut task = format!(
            "Goal: {}\nCurrent step: {}\nWhy this step: {}\nWork with the {} specialist.",
            goal.title, step.title, step.rationale, step.agent
        );
        if !completed.is_empty() {
            task.push_str("\n\nResults of earlier steps:\n");
            for earlier in completed {
                task.push_str(&format!(
                    "{}. {}\n{}\n",
                    earlier.ordinal,
                    earlier.title,
                    earlier.output.as_deref().unwrap_or("(no output)")
                ));
            }
        }

        let failed;
        match self
            .orchestrator
            .run_turn(TurnRequest::new(goal.user_id.clone(), task))
        {
            Ok(handle) => {
                let summary = handle.drain().await;
                let turn_failed = summary.error.is_some()
                    || (summary.agent_completions == 0 && summary.agent_failures > 0)
                    || summary.text.is_empty();
                step.output = Some(summary.text);
                step.trace_ids = summary.trace_ids;
                failed = turn_failed;
            }
            Err(err) => {
                log::error!("synthetic turn rejected: {}", err);
                failed = true;
            }
        }

        step.status = if failed {
            StepStatus::Failed
        } else {
            StepStatus::Completed
        };
        step.completed_at = Some(chrono::Utc::now());
        if let Err(err) = self.goals.update_step(step.clone()).await {
            log::error!("failed to persist step result: {}", err);
        }
        sink.emit(TurnEvent::GoalStepComplete {
            goal_id: goal.id.clone(),
            ordinal: step.ordinal,
            status: step.status.as_str().to_string(),
        })
        .await;

        (step, failed)
    }

    /// The autonomous loop: steps in order, retries, re-planning.
    async fn auto_loop(&self, goal: &Goal, cancel: &CancellationToken, sink: &TurnSink) {
        loop {
            if cancel.is_cancelled() {
                self.pause(goal, "cancelled").await;
                sink.emit(TurnEvent::Error {
                    kind: ErrorKind::Cancelled,
                    message: Some("goal paused on cancellation".to_string()),
                })
                .await;
                return;
            }

            let steps = match self.goals.list_steps(&goal.id).await {
                Ok(steps) => steps,
                Err(err) => {
                    log::error!("failed to list steps: {}", err);
                    self.pause(goal, "store failure").await;
                    return;
                }
            };
            let completed: Vec<StepRecord> = steps
                .iter()
                .filter(|s| s.status == StepStatus::Completed)
                .cloned()
                .collect();
            let next = match steps.iter().find(|s| s.status == StepStatus::Pending) {
                Some(step) => step.clone(),
                None => {
                    self.maybe_complete_goal(&goal.id).await;
                    return;
                }
            };

            // Retry budget applies per step.
            let mut step = next;
            let mut failed = true;
            for attempt in 0..=self.config.step_retry_budget {
                if attempt > 0 {
                    log::info!(
                        "retrying step {} of goal {} (attempt {})",
                        step.ordinal,
                        goal.id,
                        attempt + 1
                    );
                    step.status = StepStatus::Pending;
                }
                let (updated, step_failed) = self.run_step(goal, step, &completed, sink).await;
                step = updated;
                failed = step_failed;
                if !failed || cancel.is_cancelled() {
                    break;
                }
            }

            if failed {
                self.pause(goal, "step failed after retries").await;
                return;
            }

            // Re-plan when the step's output invalidates the tail.
            if self.config.replan_enabled {
                let remaining: Vec<StepRecord> = match self.goals.list_steps(&goal.id).await {
                    Ok(steps) => steps
                        .into_iter()
                        .filter(|s| s.status == StepStatus::Pending)
                        .collect(),
                    Err(_) => Vec::new(),
                };
                if let PlanReview::Revise { tail, reason } =
                    self.planner.review(goal, &step, &remaining).await
                {
                    let adjustment = tail
                        .iter()
                        .map(|s| s.title.as_str())
                        .collect::<Vec<_>>()
                        .join("; ");
                    match self
                        .goals
                        .replace_tail(&goal.id, step.ordinal + 1, tail)
                        .await
                    {
                        Ok(_) => {
                            sink.emit(TurnEvent::GoalReplan {
                                goal_id: goal.id.clone(),
                                adjustment,
                                reason,
                            })
                            .await;
                        }
                        Err(err) => log::error!("failed to replace plan tail: {}", err),
                    }
                }
            }
        }
    }

    async fn pause(&self, goal: &Goal, why: &str) {
        log::info!("pausing goal {}: {}", goal.id, why);
        if let Err(err) = self
            .goals
            .update_goal_status(&goal.id, GoalStatus::Paused)
            .await
        {
            log::error!("failed to pause goal: {}", err);
        }
        self.notify_status(
            goal,
            "goal_paused",
            &format!("Paused: {}", goal.title),
            why,
        )
        .await;
    }

    /// Complete the goal when every non-skipped step is completed.
    async fn maybe_complete_goal(&self, goal_id: &str) {
        let steps = match self.goals.list_steps(goal_id).await {
            Ok(steps) => steps,
            Err(_) => return,
        };
        let done = !steps.is_empty()
            && steps
                .iter()
                .all(|s| s.status == StepStatus::Completed || s.status == StepStatus::Skipped);
        if !done {
            return;
        }
        if let Err(err) = self
            .goals
            .update_goal_status(goal_id, GoalStatus::Completed)
            .await
        {
            log::error!("failed to complete goal: {}", err);
            return;
        }
        if let Ok(goal) = self.goals.get_goal(goal_id).await {
            self.notify_status(
                &goal,
                "goal_completed",
                &format!("Completed: {}", goal.title),
                "every step finished",
            )
            .await;
        }
    }

    /// Record a goal status transition as a notification and push it.
    async fn notify_status(&self, goal: &Goal, kind: &str, title: &str, body: &str) {
        let notification = Notification {
            id: new_id(),
            user_id: goal.user_id.clone(),
            kind: kind.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            payload: serde_json::json!({ "goal_id": goal.id }),
            read: false,
            created_at: chrono::Utc::now(),
        };
        if let Err(err) = self.notifications.insert(notification.clone()).await {
            log::error!("failed to persist goal notification: {}", err);
            return;
        }
        self.fabric
            .publish(
                &goal.user_id,
                &TurnEvent::Notification {
                    id: notification.id,
                    kind: notification.kind,
                    title: notification.title,
                    body: notification.body,
                },
            )
            .await;
    }
}
