//! In-process job board backing the `search_jobs` tool.
//!
//! Listings live in a shared, thread-safe store that can be seeded with
//! sample data for development and tests, or fed by an external ingestion
//! path in production. The search is a case-insensitive keyword match over
//! title, company, and skills, optionally narrowed by location.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

use crate::careerllm::store::UserProfile;
use crate::careerllm::tool_registry::{
    ToolMetadata, ToolParameter, ToolParameterType, ToolRegistry, ToolRegistryError, ToolRequest,
};

/// One open role.
#[derive(Debug, Clone, Serialize)]
pub struct JobListing {
    pub id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub remote: bool,
    pub skills: Vec<String>,
}

impl JobListing {
    fn matches_keyword(&self, keyword: &str) -> bool {
        let needle = keyword.to_lowercase();
        self.title.to_lowercase().contains(&needle)
            || self.company.to_lowercase().contains(&needle)
            || self
                .skills
                .iter()
                .any(|s| s.to_lowercase().contains(&needle))
    }

    fn matches_location(&self, location: &str) -> bool {
        let needle = location.to_lowercase();
        if needle == "remote" {
            return self.remote;
        }
        self.location.to_lowercase().contains(&needle)
    }
}

/// Shared listing store.
#[derive(Clone, Default)]
pub struct JobBoard {
    listings: Arc<Mutex<Vec<JobListing>>>,
}

impl JobBoard {
    /// Create an empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// A board pre-loaded with a small sample data set.
    pub fn with_sample_listings() -> Self {
        let board = Self::new();
        let samples = vec![
            JobListing {
                id: "job-rust-backend".to_string(),
                title: "Senior Backend Engineer (Rust)".to_string(),
                company: "Ferric Systems".to_string(),
                location: "Berlin".to_string(),
                remote: true,
                skills: vec!["rust".to_string(), "tokio".to_string(), "postgres".to_string()],
            },
            JobListing {
                id: "job-platform".to_string(),
                title: "Platform Engineer".to_string(),
                company: "Northwind Data".to_string(),
                location: "Amsterdam".to_string(),
                remote: false,
                skills: vec!["kubernetes".to_string(), "go".to_string()],
            },
            JobListing {
                id: "job-ml-infra".to_string(),
                title: "ML Infrastructure Engineer".to_string(),
                company: "Lumen Labs".to_string(),
                location: "London".to_string(),
                remote: true,
                skills: vec!["python".to_string(), "rust".to_string(), "gpu".to_string()],
            },
            JobListing {
                id: "job-frontend".to_string(),
                title: "Frontend Engineer".to_string(),
                company: "Brightside".to_string(),
                location: "Stockholm".to_string(),
                remote: false,
                skills: vec!["typescript".to_string(), "react".to_string()],
            },
        ];
        for listing in samples {
            board.add(listing);
        }
        board
    }

    /// Add a listing.
    pub fn add(&self, listing: JobListing) {
        self.listings.lock().expect("job board lock").push(listing);
    }

    /// Number of listings currently on the board.
    pub fn len(&self) -> usize {
        self.listings.lock().expect("job board lock").len()
    }

    /// Whether the board is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keyword search, optionally narrowed by location, capped at `max`.
    pub fn search(&self, keywords: &[String], location: Option<&str>, max: usize) -> Vec<JobListing> {
        let listings = self.listings.lock().expect("job board lock");
        listings
            .iter()
            .filter(|listing| {
                keywords.is_empty() || keywords.iter().any(|k| listing.matches_keyword(k))
            })
            .filter(|listing| location.map_or(true, |loc| listing.matches_location(loc)))
            .take(max)
            .cloned()
            .collect()
    }

    /// Listings matching a user profile's skills and locations, used by the
    /// periodic job-match scanner.
    pub fn matches_for_profile(&self, profile: &UserProfile, max: usize) -> Vec<JobListing> {
        let location = profile.locations.first().map(|l| l.as_str());
        self.search(&profile.skills, location, max)
    }

    /// Install `search_jobs` into the registry.
    pub fn register(&self, registry: &mut ToolRegistry) -> Result<(), ToolRegistryError> {
        let board = self.clone();
        registry.register(
            ToolMetadata::new(
                "search_jobs",
                "Search open roles by keyword, optionally narrowed by location.",
            )
            .with_parameter(
                ToolParameter::new("keywords", ToolParameterType::Array)
                    .with_items(ToolParameterType::String)
                    .with_description("Keywords matched against title, company, and skills")
                    .required(),
            )
            .with_parameter(
                ToolParameter::new("location", ToolParameterType::String)
                    .with_description("City name, or \"remote\""),
            )
            .with_parameter(
                ToolParameter::new("max_results", ToolParameterType::Integer)
                    .with_default(json!(15)),
            ),
            Arc::new(move |request: ToolRequest| {
                let board = board.clone();
                Box::pin(async move { run_search(&board, &request.args) })
            }),
        )
    }
}

fn run_search(board: &JobBoard, args: &Value) -> Result<Value, String> {
    let keywords: Vec<String> = args["keywords"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    let location = args["location"].as_str();
    let max = args["max_results"].as_u64().unwrap_or(15) as usize;

    let listings = board.search(&keywords, location, max);
    serde_json::to_value(json!({
        "count": listings.len(),
        "jobs": listings,
    }))
    .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::careerllm::tool_registry::ToolRequest;

    #[test]
    fn test_keyword_search_matches_skills() {
        let board = JobBoard::with_sample_listings();
        let hits = board.search(&["rust".to_string()], None, 10);
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|j| j.skills.contains(&"rust".to_string())));
    }

    #[test]
    fn test_remote_location_filter() {
        let board = JobBoard::with_sample_listings();
        let hits = board.search(&[], Some("remote"), 10);
        assert!(hits.iter().all(|j| j.remote));
    }

    #[test]
    fn test_max_results_caps_output() {
        let board = JobBoard::with_sample_listings();
        let hits = board.search(&[], None, 2);
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_search_jobs_tool_round_trip() {
        let board = JobBoard::with_sample_listings();
        let mut registry = ToolRegistry::new();
        board.register(&mut registry).unwrap();

        let outcome = registry
            .invoke(
                "search_jobs",
                ToolRequest::new(
                    "u1",
                    serde_json::json!({ "keywords": ["rust"], "max_results": 5 }),
                ),
            )
            .await;
        assert!(outcome.ok);
        let data = outcome.data.unwrap();
        assert_eq!(data["count"], 2);
    }

    #[test]
    fn test_profile_matching_uses_skills_and_location() {
        let board = JobBoard::with_sample_listings();
        let profile = UserProfile {
            user_id: "u1".to_string(),
            headline: "Backend engineer".to_string(),
            skills: vec!["rust".to_string()],
            locations: vec!["remote".to_string()],
            notes: String::new(),
        };
        let hits = board.matches_for_profile(&profile, 10);
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|j| j.remote));
    }
}
