//! Per-user application records behind the `list_applications` and
//! `log_application` tools.
//!
//! The tracker is also read directly by the application-status reminder
//! task, which looks for records that have not moved in a while.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

use crate::careerllm::store::new_id;
use crate::careerllm::tool_registry::{
    ToolMetadata, ToolParameter, ToolParameterType, ToolRegistry, ToolRegistryError, ToolRequest,
};

/// Stage of one job application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStage {
    Applied,
    Screening,
    Interview,
    Offer,
    Closed,
}

impl ApplicationStage {
    /// The snake_case name used in notifications and payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStage::Applied => "applied",
            ApplicationStage::Screening => "screening",
            ApplicationStage::Interview => "interview",
            ApplicationStage::Offer => "offer",
            ApplicationStage::Closed => "closed",
        }
    }
}

/// One tracked application.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationRecord {
    pub id: String,
    pub user_id: String,
    pub company: String,
    pub role: String,
    pub stage: ApplicationStage,
    pub applied_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Shared application store, scoped per user.
#[derive(Clone, Default)]
pub struct ApplicationTracker {
    records: Arc<Mutex<Vec<ApplicationRecord>>>,
}

impl ApplicationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fresh application in the `Applied` stage.
    pub fn log(&self, user_id: &str, company: &str, role: &str) -> ApplicationRecord {
        let now = Utc::now();
        let record = ApplicationRecord {
            id: new_id(),
            user_id: user_id.to_string(),
            company: company.to_string(),
            role: role.to_string(),
            stage: ApplicationStage::Applied,
            applied_at: now,
            updated_at: now,
        };
        self.records
            .lock()
            .expect("application lock")
            .push(record.clone());
        record
    }

    /// Move an application to a new stage.
    pub fn advance(&self, record_id: &str, stage: ApplicationStage) -> bool {
        let mut records = self.records.lock().expect("application lock");
        match records.iter_mut().find(|r| r.id == record_id) {
            Some(record) => {
                record.stage = stage;
                record.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// All applications for a user, newest first.
    pub fn list_for_user(&self, user_id: &str) -> Vec<ApplicationRecord> {
        let mut list: Vec<ApplicationRecord> = self
            .records
            .lock()
            .expect("application lock")
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.applied_at.cmp(&a.applied_at));
        list
    }

    /// Open applications for a user that have not moved within `idle`.
    pub fn stale_for_user(&self, user_id: &str, idle: Duration) -> Vec<ApplicationRecord> {
        let cutoff = Utc::now() - idle;
        self.list_for_user(user_id)
            .into_iter()
            .filter(|r| {
                r.updated_at < cutoff
                    && r.stage != ApplicationStage::Closed
                    && r.stage != ApplicationStage::Offer
            })
            .collect()
    }

    /// Install `list_applications` and `log_application` into the registry.
    pub fn register(&self, registry: &mut ToolRegistry) -> Result<(), ToolRegistryError> {
        let tracker = self.clone();
        registry.register(
            ToolMetadata::new(
                "list_applications",
                "List the user's tracked job applications, newest first.",
            ),
            Arc::new(move |request: ToolRequest| {
                let tracker = tracker.clone();
                Box::pin(async move {
                    let records = tracker.list_for_user(&request.user_id);
                    serde_json::to_value(json!({
                        "count": records.len(),
                        "applications": records,
                    }))
                    .map_err(|e| e.to_string())
                })
            }),
        )?;

        let tracker = self.clone();
        registry.register(
            ToolMetadata::new("log_application", "Record a new job application for the user.")
                .external_effect()
                .with_parameter(
                    ToolParameter::new("company", ToolParameterType::String).required(),
                )
                .with_parameter(ToolParameter::new("role", ToolParameterType::String).required()),
            Arc::new(move |request: ToolRequest| {
                let tracker = tracker.clone();
                Box::pin(async move { run_log(&tracker, &request.user_id, &request.args) })
            }),
        )
    }
}

fn run_log(tracker: &ApplicationTracker, user_id: &str, args: &Value) -> Result<Value, String> {
    let company = args["company"].as_str().unwrap_or_default();
    let role = args["role"].as_str().unwrap_or_default();
    let record = tracker.log(user_id, company, role);
    serde_json::to_value(json!({ "logged": true, "application": record })).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::careerllm::tool_registry::ToolRequest;

    #[test]
    fn test_records_are_scoped_per_user() {
        let tracker = ApplicationTracker::new();
        tracker.log("u1", "Ferric Systems", "Backend Engineer");
        tracker.log("u2", "Lumen Labs", "ML Engineer");

        assert_eq!(tracker.list_for_user("u1").len(), 1);
        assert_eq!(tracker.list_for_user("u2").len(), 1);
        assert!(tracker.list_for_user("u3").is_empty());
    }

    #[test]
    fn test_stale_excludes_closed_and_recent() {
        let tracker = ApplicationTracker::new();
        let fresh = tracker.log("u1", "Ferric Systems", "Backend Engineer");
        let closed = tracker.log("u1", "Northwind Data", "Platform Engineer");
        tracker.advance(&closed.id, ApplicationStage::Closed);

        // Nothing is older than an hour yet.
        assert!(tracker.stale_for_user("u1", Duration::hours(1)).is_empty());

        // With a zero idle threshold the open record counts as stale.
        let stale = tracker.stale_for_user("u1", Duration::zero());
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, fresh.id);
    }

    #[tokio::test]
    async fn test_tools_use_the_requesting_user() {
        let tracker = ApplicationTracker::new();
        let mut registry = ToolRegistry::new();
        tracker.register(&mut registry).unwrap();

        let logged = registry
            .invoke(
                "log_application",
                ToolRequest::new(
                    "u7",
                    serde_json::json!({ "company": "Ferric Systems", "role": "Backend" }),
                ),
            )
            .await;
        assert!(logged.ok);

        let listed = registry
            .invoke("list_applications", ToolRequest::new("u7", serde_json::json!({})))
            .await;
        assert_eq!(listed.data.unwrap()["count"], 1);

        let other = registry
            .invoke("list_applications", ToolRequest::new("u8", serde_json::json!({})))
            .await;
        assert_eq!(other.data.unwrap()["count"], 0);
    }
}
