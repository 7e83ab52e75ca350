//! Background task runner.
//!
//! Tasks are pluggable [`BackgroundTask`] implementations registered by
//! kind. Periodic kinds run on an interval per user; on-demand kinds run
//! once. Every execution is recorded as a
//! [`TaskRun`](crate::store::TaskRun) and streamed as `task_update`
//! events; notifications a task writes are pushed to the owning user's
//! subscriptions as they happen, so cancelling a run keeps everything it
//! already produced.
//!
//! Three task kinds ship built in: the periodic job-match scanner, the
//! periodic application-status reminder, and on-demand company research.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::careerllm::config::TaskConfig;
use crate::careerllm::event::TurnEvent;
use crate::careerllm::push::PushFabric;
use crate::careerllm::store::{
    new_id, Notification, NotificationStore, ProfileStore, StoreError, TaskRun, TaskRunStore,
    TaskStatus,
};
use crate::careerllm::tools::{ApplicationTracker, CompanyDirectory, JobBoard};

/// When a task kind runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSchedule {
    /// Runs on this interval for every scheduled user.
    Interval(Duration),
    /// Runs only when requested.
    OnDemand,
}

/// Errors surfaced by task requests.
#[derive(Debug)]
pub enum TaskError {
    /// No task with that kind is registered.
    UnknownKind(String),
    /// The store failed.
    Store(StoreError),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::UnknownKind(kind) => write!(f, "unknown task kind: {}", kind),
            TaskError::Store(err) => write!(f, "{}", err),
        }
    }
}

impl Error for TaskError {}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        TaskError::Store(err)
    }
}

/// What a task execution sees: its user, its configuration, its cancel
/// token, and a way to emit notifications immediately.
pub struct TaskContext {
    pub user_id: String,
    pub config: Value,
    pub cancel: CancellationToken,
    notifications: Arc<dyn NotificationStore>,
    fabric: PushFabric,
}

impl TaskContext {
    /// Write one notification and push it to the user's subscriptions.
    /// Notifications survive a later cancellation of the run.
    pub async fn notify(&self, kind: &str, title: &str, body: &str, payload: Value) {
        let notification = Notification {
            id: new_id(),
            user_id: self.user_id.clone(),
            kind: kind.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            payload,
            read: false,
            created_at: Utc::now(),
        };
        if let Err(err) = self.notifications.insert(notification.clone()).await {
            log::error!("failed to persist notification: {}", err);
            return;
        }
        self.fabric
            .publish(
                &self.user_id,
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

/// A pluggable background job.
#[async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Stable kind name, used for registration and task-run records.
    fn kind(&self) -> &str;

    /// Default schedule for this kind.
    fn schedule(&self, config: &TaskConfig) -> TaskSchedule;

    /// Run once for one user. Returns a result summary.
    async fn run(&self, ctx: &TaskContext) -> Result<String, String>;
}

struct RunnerInner {
    tasks: HashMap<String, Arc<dyn BackgroundTask>>,
    runs: Arc<dyn TaskRunStore>,
    notifications: Arc<dyn NotificationStore>,
    fabric: PushFabric,
    config: TaskConfig,
    cancels: std::sync::Mutex<HashMap<String, CancellationToken>>,
}

/// Registers task kinds, schedules them, and records their runs.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
}

impl TaskRunner {
    /// Start building a runner.
    pub fn builder(
        runs: Arc<dyn TaskRunStore>,
        notifications: Arc<dyn NotificationStore>,
        fabric: PushFabric,
        config: TaskConfig,
    ) -> TaskRunnerBuilder {
        TaskRunnerBuilder {
            tasks: HashMap::new(),
            runs,
            notifications,
            fabric,
            config,
        }
    }

    /// Start one execution now. Returns the task-run id.
    pub async fn run_now(
        &self,
        kind: &str,
        user_id: &str,
        config: Value,
    ) -> Result<String, TaskError> {
        let task = self
            .inner
            .tasks
            .get(kind)
            .cloned()
            .ok_or_else(|| TaskError::UnknownKind(kind.to_string()))?;

        let now = Utc::now();
        let run = TaskRun {
            id: new_id(),
            user_id: user_id.to_string(),
            kind: kind.to_string(),
            config: config.clone(),
            status: TaskStatus::Pending,
            summary: None,
            created_at: now,
            updated_at: now,
        };
        let run_id = run.id.clone();
        self.inner.runs.insert(run).await?;

        let cancel = CancellationToken::new();
        self.inner
            .cancels
            .lock()
            .expect("cancel lock")
            .insert(run_id.clone(), cancel.clone());

        let inner = Arc::clone(&self.inner);
        let spawned_run_id = run_id.clone();
        let user = user_id.to_string();
        tokio::spawn(async move {
            inner
                .execute(task, spawned_run_id.clone(), user, config, cancel)
                .await;
            inner
                .cancels
                .lock()
                .expect("cancel lock")
                .remove(&spawned_run_id);
        });
        Ok(run_id)
    }

    /// Run a periodic kind for one user on its schedule until aborted.
    pub fn schedule_for_user(
        &self,
        kind: &str,
        user_id: &str,
        config: Value,
    ) -> Result<tokio::task::JoinHandle<()>, TaskError> {
        let task = self
            .inner
            .tasks
            .get(kind)
            .cloned()
            .ok_or_else(|| TaskError::UnknownKind(kind.to_string()))?;
        let period = match task.schedule(&self.inner.config) {
            TaskSchedule::Interval(period) => period,
            TaskSchedule::OnDemand => {
                return Err(TaskError::UnknownKind(format!(
                    "{} is on-demand, not periodic",
                    kind
                )));
            }
        };

        let runner = self.clone();
        let kind = kind.to_string();
        let user = user_id.to_string();
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The immediate first tick would race startup; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = runner.run_now(&kind, &user, config.clone()).await {
                    log::error!("scheduled {} for {} failed to start: {}", kind, user, err);
                }
            }
        }))
    }

    /// Cancel a running execution. Notifications already produced are
    /// kept. Idempotent; unknown runs are a no-op.
    pub fn cancel(&self, run_id: &str) {
        let cancels = self.inner.cancels.lock().expect("cancel lock");
        if let Some(token) = cancels.get(run_id) {
            token.cancel();
        }
    }
}

/// Builder collecting task implementations before the runner starts.
pub struct TaskRunnerBuilder {
    tasks: HashMap<String, Arc<dyn BackgroundTask>>,
    runs: Arc<dyn TaskRunStore>,
    notifications: Arc<dyn NotificationStore>,
    fabric: PushFabric,
    config: TaskConfig,
}

impl TaskRunnerBuilder {
    /// Register one task kind. Later registrations with the same kind
    /// replace earlier ones.
    pub fn register(mut self, task: Arc<dyn BackgroundTask>) -> Self {
        self.tasks.insert(task.kind().to_string(), task);
        self
    }

    pub fn build(self) -> TaskRunner {
        TaskRunner {
            inner: Arc::new(RunnerInner {
                tasks: self.tasks,
                runs: self.runs,
                notifications: self.notifications,
                fabric: self.fabric,
                config: self.config,
                cancels: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl RunnerInner {
    async fn execute(
        &self,
        task: Arc<dyn BackgroundTask>,
        run_id: String,
        user_id: String,
        config: Value,
        cancel: CancellationToken,
    ) {
        self.transition(&run_id, &user_id, task.kind(), TaskStatus::Running, None)
            .await;

        let ctx = TaskContext {
            user_id: user_id.clone(),
            config,
            cancel: cancel.clone(),
            notifications: Arc::clone(&self.notifications),
            fabric: self.fabric.clone(),
        };

        let result = tokio::select! {
            result = task.run(&ctx) => Some(result),
            _ = cancel.cancelled() => None,
        };

        match result {
            None => {
                self.transition(
                    &run_id,
                    &user_id,
                    task.kind(),
                    TaskStatus::Cancelled,
                    Some("cancelled before completion".to_string()),
                )
                .await;
            }
            Some(Ok(summary)) => {
                self.transition(
                    &run_id,
                    &user_id,
                    task.kind(),
                    TaskStatus::Completed,
                    Some(summary),
                )
                .await;
            }
            Some(Err(message)) => {
                log::warn!("task {} failed: {}", task.kind(), message);
                self.transition(
                    &run_id,
                    &user_id,
                    task.kind(),
                    TaskStatus::Failed,
                    Some(message),
                )
                .await;
            }
        }
    }

    async fn transition(
        &self,
        run_id: &str,
        user_id: &str,
        kind: &str,
        status: TaskStatus,
        summary: Option<String>,
    ) {
        if let Err(err) = self.runs.update_status(run_id, status, summary.clone()).await {
            log::error!("failed to record task transition: {}", err);
        }
        self.fabric
            .publish(
                user_id,
                &TurnEvent::TaskUpdate {
                    task_id: run_id.to_string(),
                    kind: kind.to_string(),
                    status: status.as_str().to_string(),
                    summary,
                },
            )
            .await;
    }
}

// ---- Built-in tasks ----

/// Periodic scan matching fresh job listings against a user's profile.
pub struct JobMatchScanTask {
    board: JobBoard,
    profiles: Arc<dyn ProfileStore>,
}

impl JobMatchScanTask {
    pub fn new(board: JobBoard, profiles: Arc<dyn ProfileStore>) -> Self {
        Self { board, profiles }
    }
}

#[async_trait]
impl BackgroundTask for JobMatchScanTask {
    fn kind(&self) -> &str {
        "job_match_scan"
    }

    fn schedule(&self, config: &TaskConfig) -> TaskSchedule {
        TaskSchedule::Interval(config.default_interval)
    }

    async fn run(&self, ctx: &TaskContext) -> Result<String, String> {
        let profile = self
            .profiles
            .get(&ctx.user_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("no profile for user {}", ctx.user_id))?;

        let matches = self.board.matches_for_profile(&profile, 10);
        if matches.is_empty() {
            return Ok("no new matches".to_string());
        }

        if ctx.cancel.is_cancelled() {
            return Ok("cancelled before notifying".to_string());
        }
        let titles: Vec<String> = matches
            .iter()
            .map(|j| format!("{} at {}", j.title, j.company))
            .collect();
        ctx.notify(
            "job_match",
            &format!("{} roles match your profile", matches.len()),
            &titles.join("\n"),
            json!({ "jobs": matches }),
        )
        .await;
        Ok(format!("{} matches", matches.len()))
    }
}

/// Periodic reminder for applications that have not moved in a while.
pub struct ApplicationReminderTask {
    tracker: ApplicationTracker,
    idle: chrono::Duration,
}

impl ApplicationReminderTask {
    pub fn new(tracker: ApplicationTracker, idle: chrono::Duration) -> Self {
        Self { tracker, idle }
    }
}

#[async_trait]
impl BackgroundTask for ApplicationReminderTask {
    fn kind(&self) -> &str {
        "application_reminder"
    }

    fn schedule(&self, config: &TaskConfig) -> TaskSchedule {
        TaskSchedule::Interval(config.default_interval)
    }

    async fn run(&self, ctx: &TaskContext) -> Result<String, String> {
        let stale = self.tracker.stale_for_user(&ctx.user_id, self.idle);
        if stale.is_empty() {
            return Ok("nothing stale".to_string());
        }
        let lines: Vec<String> = stale
            .iter()
            .map(|r| format!("{} at {} ({})", r.role, r.company, r.stage.as_str()))
            .collect();
        ctx.notify(
            "application_reminder",
            &format!("{} applications may need a follow-up", stale.len()),
            &lines.join("\n"),
            json!({ "applications": stale }),
        )
        .await;
        Ok(format!("{} reminders", stale.len()))
    }
}

/// On-demand research into one company.
pub struct CompanyResearchTask {
    directory: CompanyDirectory,
}

impl CompanyResearchTask {
    pub fn new(directory: CompanyDirectory) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl BackgroundTask for CompanyResearchTask {
    fn kind(&self) -> &str {
        "company_research"
    }

    fn schedule(&self, _config: &TaskConfig) -> TaskSchedule {
        TaskSchedule::OnDemand
    }

    async fn run(&self, ctx: &TaskContext) -> Result<String, String> {
        let name = ctx.config["company"]
            .as_str()
            .ok_or_else(|| "config must carry a company name".to_string())?;
        match self.directory.lookup(name) {
            Some(company) => {
                ctx.notify(
                    "company_research",
                    &format!("Research ready: {}", company.name),
                    &format!("{}\nHiring: {}", company.summary, company.hiring_notes),
                    json!({ "company": company }),
                )
                .await;
                Ok(format!("researched {}", name))
            }
            None => Err(format!("company {} not found", name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::careerllm::config::PushConfig;
    use crate::careerllm::push::OpenAuth;
    use crate::careerllm::store::{
        MemoryNotificationStore, MemoryProfileStore, MemoryTaskRunStore, UserProfile,
    };

    struct Harness {
        runner: TaskRunner,
        runs: Arc<MemoryTaskRunStore>,
        notifications: Arc<MemoryNotificationStore>,
        fabric: PushFabric,
    }

    async fn harness() -> Harness {
        let runs = Arc::new(MemoryTaskRunStore::new());
        let notifications = Arc::new(MemoryNotificationStore::new());
        let fabric = PushFabric::new(Arc::new(OpenAuth), PushConfig::default());
        let profiles = Arc::new(MemoryProfileStore::new());
        let harness_profiles = Arc::clone(&profiles);

        let runner = TaskRunner::builder(
            runs.clone() as Arc<dyn TaskRunStore>,
            notifications.clone() as Arc<dyn NotificationStore>,
            fabric.clone(),
            TaskConfig::default(),
        )
        .register(Arc::new(JobMatchScanTask::new(
            JobBoard::with_sample_listings(),
            harness_profiles,
        )))
        .register(Arc::new(CompanyResearchTask::new(
            CompanyDirectory::with_sample_companies(),
        )))
        .build();

        profiles
            .upsert(UserProfile {
                user_id: "u1".to_string(),
                headline: "Rust engineer".to_string(),
                skills: vec!["rust".to_string()],
                locations: vec!["remote".to_string()],
                notes: String::new(),
            })
            .await
            .unwrap();

        Harness {
            runner,
            runs,
            notifications,
            fabric,
        }
    }

    async fn wait_for_terminal(runs: &MemoryTaskRunStore, run_id: &str) -> TaskRun {
        for _ in 0..100 {
            let run = runs.get(run_id).await.unwrap();
            if run.status != TaskStatus::Pending && run.status != TaskStatus::Running {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task run never reached a terminal status");
    }

    #[tokio::test]
    async fn test_job_match_scan_notifies_and_completes() {
        let h = harness().await;
        let mut sub = h.fabric.subscribe("u1", "x").unwrap();

        let run_id = h
            .runner
            .run_now("job_match_scan", "u1", json!({}))
            .await
            .unwrap();
        let run = wait_for_terminal(&h.runs, &run_id).await;
        assert_eq!(run.status, TaskStatus::Completed);

        let notifications = h.notifications.list_for_user("u1").await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, "job_match");

        let mut kinds = Vec::new();
        while let Some(envelope) = sub.try_next_event() {
            kinds.push(envelope.event.kind());
        }
        assert!(kinds.contains(&"notification"));
        assert!(kinds.contains(&"task_update"));
    }

    #[tokio::test]
    async fn test_on_demand_research_reports_misses_as_failure() {
        let h = harness().await;
        let run_id = h
            .runner
            .run_now(
                "company_research",
                "u1",
                json!({ "company": "does not exist" }),
            )
            .await
            .unwrap();
        let run = wait_for_terminal(&h.runs, &run_id).await;
        assert_eq!(run.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_rejected() {
        let h = harness().await;
        let result = h.runner.run_now("mystery", "u1", json!({})).await;
        assert!(matches!(result, Err(TaskError::UnknownKind(_))));
    }

    #[tokio::test]
    async fn test_on_demand_kind_cannot_be_scheduled() {
        let h = harness().await;
        let result = h.runner.schedule_for_user("company_research", "u1", json!({}));
        assert!(result.is_err());
    }
}
