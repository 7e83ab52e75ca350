//! Persistence contracts and record types.
//!
//! The runtime persists through narrow async traits so a relational backend
//! can be swapped in without touching orchestration code. The in-memory
//! implementations here back every test and double as reference semantics:
//! message ordinals are strictly increasing per conversation, notification
//! `read` is a one-way flag, and task runs are keyed by user and type.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Mutex;
use uuid::Uuid;

/// Failures surfaced by a store backend.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// The addressed record does not exist.
    NotFound(String),
    /// The operation conflicts with current state.
    Conflict(String),
    /// The backend itself failed.
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(what) => write!(f, "not found: {}", what),
            StoreError::Conflict(what) => write!(f, "conflict: {}", what),
            StoreError::Backend(what) => write!(f, "store backend error: {}", what),
        }
    }
}

impl Error for StoreError {}

pub type StoreResult<T> = Result<T, StoreError>;

/// Author of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A conversation owned by one user.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One message within a conversation. Ordinals start at 1 and increase
/// strictly in append order.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub ordinal: u64,
    pub created_at: DateTime<Utc>,
}

/// A notification written for a user. `read` only ever flips to true.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub payload: Value,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Status of a background task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// The snake_case name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// One scheduled or ad-hoc background task execution.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRun {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub config: Value,
    pub status: TaskStatus,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What the runtime knows about a user, fed to the router and the planners
/// as hints and scanned by the periodic background tasks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserProfile {
    pub user_id: String,
    pub headline: String,
    pub skills: Vec<String>,
    pub locations: Vec<String>,
    pub notes: String,
}

impl UserProfile {
    /// Render the profile as a short hint block for prompts.
    pub fn as_hint(&self) -> String {
        let mut hint = String::new();
        if !self.headline.is_empty() {
            hint.push_str(&format!("Headline: {}\n", self.headline));
        }
        if !self.skills.is_empty() {
            hint.push_str(&format!("Skills: {}\n", self.skills.join(", ")));
        }
        if !self.locations.is_empty() {
            hint.push_str(&format!("Locations: {}\n", self.locations.join(", ")));
        }
        if !self.notes.is_empty() {
            hint.push_str(&format!("Notes: {}\n", self.notes));
        }
        hint
    }
}

/// Conversations and their ordered messages.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, user_id: &str, title: &str) -> StoreResult<Conversation>;

    async fn get_conversation(&self, conversation_id: &str) -> StoreResult<Conversation>;

    async fn append_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
    ) -> StoreResult<StoredMessage>;

    /// Messages in ordinal order.
    async fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<StoredMessage>>;
}

/// Notifications keyed by user.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert(&self, notification: Notification) -> StoreResult<()>;

    /// Newest first.
    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<Notification>>;

    /// One-way flag; marking an already-read notification is a no-op.
    async fn mark_read(&self, notification_id: &str) -> StoreResult<()>;
}

/// Task runs keyed by user and type.
#[async_trait]
pub trait TaskRunStore: Send + Sync {
    async fn insert(&self, run: TaskRun) -> StoreResult<()>;

    async fn update_status(
        &self,
        run_id: &str,
        status: TaskStatus,
        summary: Option<String>,
    ) -> StoreResult<()>;

    async fn get(&self, run_id: &str) -> StoreResult<TaskRun>;

    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<TaskRun>>;
}

/// User profiles.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn upsert(&self, profile: UserProfile) -> StoreResult<()>;

    async fn get(&self, user_id: &str) -> StoreResult<Option<UserProfile>>;

    async fn list(&self) -> StoreResult<Vec<UserProfile>>;
}

/// Allocate a fresh record id.
pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ---- In-memory implementations ----

/// In-memory [`ConversationStore`].
#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: Mutex<HashMap<String, Conversation>>,
    messages: Mutex<HashMap<String, Vec<StoredMessage>>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create_conversation(&self, user_id: &str, title: &str) -> StoreResult<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: new_id(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.conversations
            .lock()
            .expect("conversation lock")
            .insert(conversation.id.clone(), conversation.clone());
        self.messages
            .lock()
            .expect("message lock")
            .insert(conversation.id.clone(), Vec::new());
        Ok(conversation)
    }

    async fn get_conversation(&self, conversation_id: &str) -> StoreResult<Conversation> {
        self.conversations
            .lock()
            .expect("conversation lock")
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("conversation {}", conversation_id)))
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
    ) -> StoreResult<StoredMessage> {
        let mut conversations = self.conversations.lock().expect("conversation lock");
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {}", conversation_id)))?;
        conversation.updated_at = Utc::now();

        let mut messages = self.messages.lock().expect("message lock");
        let list = messages
            .entry(conversation_id.to_string())
            .or_insert_with(Vec::new);
        let message = StoredMessage {
            id: new_id(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            ordinal: list.len() as u64 + 1,
            created_at: Utc::now(),
        };
        list.push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<StoredMessage>> {
        self.messages
            .lock()
            .expect("message lock")
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("conversation {}", conversation_id)))
    }
}

/// In-memory [`NotificationStore`].
#[derive(Default)]
pub struct MemoryNotificationStore {
    notifications: Mutex<Vec<Notification>>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn insert(&self, notification: Notification) -> StoreResult<()> {
        self.notifications
            .lock()
            .expect("notification lock")
            .push(notification);
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<Notification>> {
        let mut list: Vec<Notification> = self
            .notifications
            .lock()
            .expect("notification lock")
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn mark_read(&self, notification_id: &str) -> StoreResult<()> {
        let mut notifications = self.notifications.lock().expect("notification lock");
        match notifications.iter_mut().find(|n| n.id == notification_id) {
            Some(notification) => {
                notification.read = true;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!(
                "notification {}",
                notification_id
            ))),
        }
    }
}

/// In-memory [`TaskRunStore`].
#[derive(Default)]
pub struct MemoryTaskRunStore {
    runs: Mutex<HashMap<String, TaskRun>>,
}

impl MemoryTaskRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRunStore for MemoryTaskRunStore {
    async fn insert(&self, run: TaskRun) -> StoreResult<()> {
        self.runs
            .lock()
            .expect("task run lock")
            .insert(run.id.clone(), run);
        Ok(())
    }

    async fn update_status(
        &self,
        run_id: &str,
        status: TaskStatus,
        summary: Option<String>,
    ) -> StoreResult<()> {
        let mut runs = self.runs.lock().expect("task run lock");
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(format!("task run {}", run_id)))?;
        run.status = status;
        if summary.is_some() {
            run.summary = summary;
        }
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, run_id: &str) -> StoreResult<TaskRun> {
        self.runs
            .lock()
            .expect("task run lock")
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("task run {}", run_id)))
    }

    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<TaskRun>> {
        let mut list: Vec<TaskRun> = self
            .runs
            .lock()
            .expect("task run lock")
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }
}

/// In-memory [`ProfileStore`].
#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: Mutex<HashMap<String, UserProfile>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn upsert(&self, profile: UserProfile) -> StoreResult<()> {
        self.profiles
            .lock()
            .expect("profile lock")
            .insert(profile.user_id.clone(), profile);
        Ok(())
    }

    async fn get(&self, user_id: &str) -> StoreResult<Option<UserProfile>> {
        Ok(self
            .profiles
            .lock()
            .expect("profile lock")
            .get(user_id)
            .cloned())
    }

    async fn list(&self) -> StoreResult<Vec<UserProfile>> {
        let mut list: Vec<UserProfile> = self
            .profiles
            .lock()
            .expect("profile lock")
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_ordinals_increase_strictly() {
        let store = MemoryConversationStore::new();
        let conversation = store.create_conversation("u1", "chat").await.unwrap();
        store
            .append_message(&conversation.id, MessageRole::User, "hi")
            .await
            .unwrap();
        store
            .append_message(&conversation.id, MessageRole::Assistant, "hello")
            .await
            .unwrap();
        store
            .append_message(&conversation.id, MessageRole::User, "bye")
            .await
            .unwrap();

        let messages = store.list_messages(&conversation.id).await.unwrap();
        let ordinals: Vec<u64> = messages.iter().map(|m| m.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_reload_preserves_message_order() {
        let store = MemoryConversationStore::new();
        let conversation = store.create_conversation("u1", "chat").await.unwrap();
        for text in ["a", "b", "c"].iter() {
            store
                .append_message(&conversation.id, MessageRole::User, text)
                .await
                .unwrap();
        }
        let first = store.list_messages(&conversation.id).await.unwrap();
        let second = store.list_messages(&conversation.id).await.unwrap();
        let contents: Vec<&str> = second.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b", "c"]);
        assert_eq!(first.len(), second.len());
    }

    #[tokio::test]
    async fn test_notification_read_is_one_way() {
        let store = MemoryNotificationStore::new();
        let notification = Notification {
            id: "n1".to_string(),
            user_id: "u1".to_string(),
            kind: "job_match".to_string(),
            title: "New match".to_string(),
            body: "A role matched your profile".to_string(),
            payload: serde_json::json!({}),
            read: false,
            created_at: Utc::now(),
        };
        store.insert(notification).await.unwrap();
        store.mark_read("n1").await.unwrap();
        store.mark_read("n1").await.unwrap();
        let list = store.list_for_user("u1").await.unwrap();
        assert!(list[0].read);
    }

    #[tokio::test]
    async fn test_task_runs_are_scoped_per_user() {
        let store = MemoryTaskRunStore::new();
        for (id, user) in [("t1", "u1"), ("t2", "u2"), ("t3", "u1")].iter() {
            store
                .insert(TaskRun {
                    id: id.to_string(),
                    user_id: user.to_string(),
                    kind: "job_match_scan".to_string(),
                    config: serde_json::json!({}),
                    status: TaskStatus::Pending,
                    summary: None,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let runs = store.list_for_user("u1").await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.user_id == "u1"));
    }
}
