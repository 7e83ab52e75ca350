//! In-process company directory backing the `company_lookup` tool.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

use crate::careerllm::tool_registry::{
    ToolMetadata, ToolParameter, ToolParameterType, ToolRegistry, ToolRegistryError, ToolRequest,
};

/// What the runtime knows about one company.
#[derive(Debug, Clone, Serialize)]
pub struct CompanyProfile {
    pub name: String,
    pub industry: String,
    pub headcount: u32,
    pub summary: String,
    pub hiring_notes: String,
}

/// Shared company store with case-insensitive lookup.
#[derive(Clone, Default)]
pub struct CompanyDirectory {
    companies: Arc<Mutex<Vec<CompanyProfile>>>,
}

impl CompanyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A directory pre-loaded with the companies from the sample job board.
    pub fn with_sample_companies() -> Self {
        let directory = Self::new();
        directory.add(CompanyProfile {
            name: "Ferric Systems".to_string(),
            industry: "Developer infrastructure".to_string(),
            headcount: 120,
            summary: "Builds high-throughput data pipelines for fintech customers.".to_string(),
            hiring_notes: "Two technical interviews plus a take-home; values systems depth."
                .to_string(),
        });
        directory.add(CompanyProfile {
            name: "Northwind Data".to_string(),
            industry: "Analytics".to_string(),
            headcount: 450,
            summary: "Self-serve analytics platform for mid-market retailers.".to_string(),
            hiring_notes: "Panel interviews; strong emphasis on production experience.".to_string(),
        });
        directory.add(CompanyProfile {
            name: "Lumen Labs".to_string(),
            industry: "Machine learning".to_string(),
            headcount: 60,
            summary: "Training-infrastructure startup working with research labs.".to_string(),
            hiring_notes: "Fast process, one systems design round, one coding round.".to_string(),
        });
        directory
    }

    /// Add a company profile.
    pub fn add(&self, profile: CompanyProfile) {
        self.companies
            .lock()
            .expect("company directory lock")
            .push(profile);
    }

    /// Case-insensitive substring lookup.
    pub fn lookup(&self, name: &str) -> Option<CompanyProfile> {
        let needle = name.to_lowercase();
        self.companies
            .lock()
            .expect("company directory lock")
            .iter()
            .find(|c| c.name.to_lowercase().contains(&needle))
            .cloned()
    }

    /// Install `company_lookup` into the registry.
    pub fn register(&self, registry: &mut ToolRegistry) -> Result<(), ToolRegistryError> {
        let directory = self.clone();
        registry.register(
            ToolMetadata::new("company_lookup", "Look up what is known about a company.")
                .with_parameter(
                    ToolParameter::new("name", ToolParameterType::String)
                        .with_description("Company name, full or partial")
                        .required(),
                ),
            Arc::new(move |request: ToolRequest| {
                let directory = directory.clone();
                Box::pin(async move { run_lookup(&directory, &request.args) })
            }),
        )
    }
}

fn run_lookup(directory: &CompanyDirectory, args: &Value) -> Result<Value, String> {
    let name = args["name"].as_str().unwrap_or_default();
    match directory.lookup(name) {
        Some(profile) => serde_json::to_value(json!({ "found": true, "company": profile }))
            .map_err(|e| e.to_string()),
        None => Ok(json!({ "found": false, "company": Value::Null })),
    }
}
