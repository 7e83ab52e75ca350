//! Goals and their ordered steps.
//!
//! A goal is a long-horizon objective owned by one user, decomposed into a
//! totally-ordered list of steps, each assigned to a known agent. Steps
//! move `pending -> in_progress -> completed | skipped | failed`; a goal
//! whose non-skipped steps are all completed is `completed`, which is
//! terminal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::careerllm::store::{new_id, StoreError, StoreResult};

/// Lifecycle of a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Suggested,
    Active,
    Paused,
    Completed,
    Abandoned,
}

/// Lifecycle of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
}

impl StepStatus {
    /// The snake_case name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Skipped => "skipped",
            StepStatus::Failed => "failed",
        }
    }
}

/// One user objective.
#[derive(Debug, Clone, Serialize)]
pub struct Goal {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: String,
    pub status: GoalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Goal {
    /// A fresh active goal.
    pub fn new(user_id: &str, title: &str, description: &str) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            status: GoalStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A planned step before it becomes a record.
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub title: String,
    pub rationale: String,
    pub agent: String,
}

/// One ordinal unit of a goal's plan.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub id: String,
    pub goal_id: String,
    pub ordinal: u32,
    pub title: String,
    pub rationale: String,
    pub agent: String,
    pub status: StepStatus,
    pub output: Option<String>,
    pub trace_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// Materialize a spec at the given ordinal.
    pub fn from_spec(goal_id: &str, ordinal: u32, spec: &StepSpec) -> Self {
        Self {
            id: new_id(),
            goal_id: goal_id.to_string(),
            ordinal,
            title: spec.title.clone(),
            rationale: spec.rationale.clone(),
            agent: spec.agent.clone(),
            status: StepStatus::Pending,
            output: None,
            trace_ids: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Goal persistence.
#[async_trait]
pub trait GoalStore: Send + Sync {
    async fn create_goal(&self, goal: Goal, steps: Vec<StepRecord>) -> StoreResult<()>;

    async fn get_goal(&self, goal_id: &str) -> StoreResult<Goal>;

    async fn list_goals_for_user(&self, user_id: &str) -> StoreResult<Vec<Goal>>;

    /// Steps in ordinal order.
    async fn list_steps(&self, goal_id: &str) -> StoreResult<Vec<StepRecord>>;

    /// Transition a goal. `completed` is terminal; leaving it is a
    /// conflict.
    async fn update_goal_status(&self, goal_id: &str, status: GoalStatus) -> StoreResult<()>;

    /// Replace a step record wholesale (matched by id).
    async fn update_step(&self, step: StepRecord) -> StoreResult<()>;

    /// Replace the pending tail from `from_ordinal` on with a new plan.
    /// Returns the new records.
    async fn replace_tail(
        &self,
        goal_id: &str,
        from_ordinal: u32,
        specs: Vec<StepSpec>,
    ) -> StoreResult<Vec<StepRecord>>;
}

/// In-memory [`GoalStore`].
#[derive(Default)]
pub struct MemoryGoalStore {
    goals: Mutex<HashMap<String, Goal>>,
    steps: Mutex<HashMap<String, Vec<StepRecord>>>,
}

impl MemoryGoalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GoalStore for MemoryGoalStore {
    async fn create_goal(&self, goal: Goal, steps: Vec<StepRecord>) -> StoreResult<()> {
        self.steps
            .lock()
            .expect("step lock")
            .insert(goal.id.clone(), steps);
        self.goals
            .lock()
            .expect("goal lock")
            .insert(goal.id.clone(), goal);
        Ok(())
    }

    async fn get_goal(&self, goal_id: &str) -> StoreResult<Goal> {
        self.goals
            .lock()
            .expect("goal lock")
            .get(goal_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("goal {}", goal_id)))
    }

    async fn list_goals_for_user(&self, user_id: &str) -> StoreResult<Vec<Goal>> {
        let mut list: Vec<Goal> = self
            .goals
            .lock()
            .expect("goal lock")
            .values()
            .filter(|g| g.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn list_steps(&self, goal_id: &str) -> StoreResult<Vec<StepRecord>> {
        let mut steps = self
            .steps
            .lock()
            .expect("step lock")
            .get(goal_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("goal {}", goal_id)))?;
        steps.sort_by_key(|s| s.ordinal);
        Ok(steps)
    }

    async fn update_goal_status(&self, goal_id: &str, status: GoalStatus) -> StoreResult<()> {
        let mut goals = self.goals.lock().expect("goal lock");
        let goal = goals
            .get_mut(goal_id)
            .ok_or_else(|| StoreError::NotFound(format!("goal {}", goal_id)))?;
        if goal.status == GoalStatus::Completed && status != GoalStatus::Completed {
            return Err(StoreError::Conflict(
                "a completed goal cannot be reopened".to_string(),
            ));
        }
        goal.status = status;
        goal.updated_at = Utc::now();
        Ok(())
    }

    async fn update_step(&self, step: StepRecord) -> StoreResult<()> {
        let mut table = self.steps.lock().expect("step lock");
        let steps = table
            .get_mut(&step.goal_id)
            .ok_or_else(|| StoreError::NotFound(format!("goal {}", step.goal_id)))?;
        match steps.iter_mut().find(|s| s.id == step.id) {
            Some(existing) => {
                *existing = step;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("step {}", step.id))),
        }
    }

    async fn replace_tail(
        &self,
        goal_id: &str,
        from_ordinal: u32,
        specs: Vec<StepSpec>,
    ) -> StoreResult<Vec<StepRecord>> {
        let mut table = self.steps.lock().expect("step lock");
        let steps = table
            .get_mut(goal_id)
            .ok_or_else(|| StoreError::NotFound(format!("goal {}", goal_id)))?;
        steps.retain(|s| s.ordinal < from_ordinal || s.status != StepStatus::Pending);

        let mut created = Vec::new();
        let mut ordinal = from_ordinal;
        for spec in &specs {
            let record = StepRecord::from_spec(goal_id, ordinal, spec);
            created.push(record.clone());
            steps.push(record);
            ordinal += 1;
        }
        steps.sort_by_key(|s| s.ordinal);
        Ok(created)
    }
}
