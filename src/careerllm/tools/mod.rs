//! Built-in career tools.
//!
//! Each submodule owns an in-process data source and knows how to install
//! its tools into a [`ToolRegistry`](crate::tool_registry::ToolRegistry):
//!
//! - [`job_board`]: seedable job listings behind the `search_jobs` tool
//! - [`company_directory`]: company profiles behind `company_lookup`
//! - [`application_tracker`]: per-user application records behind
//!   `list_applications` and `log_application`
//!
//! Production deployments replace the data sources with handlers that call
//! real services; the tool names and schemas stay the same, so agents and
//! router configuration are unaffected.

pub mod application_tracker;
pub mod company_directory;
pub mod job_board;

pub use application_tracker::{ApplicationRecord, ApplicationStage, ApplicationTracker};
pub use company_directory::{CompanyDirectory, CompanyProfile};
pub use job_board::{JobBoard, JobListing};
