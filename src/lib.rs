// src/lib.rs

// Import the top-level `careerllm` module.
pub mod careerllm;

// Re-exporting key items for easier external access.
pub use careerllm::agent::{AgentProfile, AgentRegistry, AgentReport};
pub use careerllm::config::RuntimeConfig;
pub use careerllm::event::{EventEnvelope, TurnEvent};
pub use careerllm::goal_executor::GoalExecutor;
pub use careerllm::goal_planner::GoalPlanner;
pub use careerllm::llm_provider::LLMProvider;
pub use careerllm::orchestrator::{Orchestrator, TurnHandle, TurnRequest};
pub use careerllm::push::PushFabric;
pub use careerllm::tasks::TaskRunner;
pub use careerllm::tool_registry::ToolRegistry;

// Flatten the module paths users import from, mirroring the layout on disk.
pub use careerllm::{
    agent, agent_runtime, config, error, evaluator, event, goal, goal_executor, goal_planner,
    llm_provider, negotiator, orchestrator, providers, push, router, store, tasks, tool_registry,
    tools, trace,
};
