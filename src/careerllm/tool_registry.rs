//! Tool registry and invocation layer.
//!
//! The registry is a name to (metadata, handler) map built once at process
//! start and read-only afterwards. Validation happens here at the boundary,
//! not inside handlers: argument names and types are checked against the
//! declared parameters before dispatch, and an invalid call never reaches
//! the handler. Every invocation, valid or not, yields the same
//! [`ToolOutcome`] envelope so the agent runtime has a single shape to
//! reason about.
//!
//! Handlers declare their side effect ([`ToolSideEffect`]) so the agent
//! runtime can decide which timed-out invocations are safe to retry.
//! Handlers receive the cancellation token of the turn that invoked them
//! and are expected to observe it at natural boundaries.
//!
//! # Example
//!
//! ```rust
//! use careerllm::tool_registry::{
//!     ToolMetadata, ToolOutcome, ToolParameter, ToolParameterType, ToolRegistry, ToolRequest,
//! };
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let mut registry = ToolRegistry::new();
//! registry
//!     .register(
//!         ToolMetadata::new("echo", "Echoes its input back")
//!             .with_parameter(ToolParameter::new("text", ToolParameterType::String).required()),
//!         Arc::new(|request: ToolRequest| {
//!             Box::pin(async move { Ok(serde_json::json!({ "echo": request.args["text"] })) })
//!         }),
//!     )
//!     .unwrap();
//!
//! let outcome = registry
//!     .invoke("echo", ToolRequest::new("user-1", serde_json::json!({ "text": "hi" })))
//!     .await;
//! assert!(outcome.ok);
//! # });
//! ```

use crate::careerllm::error::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Declared type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ToolParameterType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ToolParameterType::String => value.is_string(),
            ToolParameterType::Number => value.is_number(),
            ToolParameterType::Integer => value.is_i64() || value.is_u64(),
            ToolParameterType::Boolean => value.is_boolean(),
            ToolParameterType::Array => value.is_array(),
            ToolParameterType::Object => value.is_object(),
        }
    }
}

/// One declared parameter of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ToolParameterType,
    pub description: Option<String>,
    pub required: bool,
    pub default: Option<Value>,
    /// For array parameters, the expected element type.
    pub items: Option<ToolParameterType>,
}

impl ToolParameter {
    /// Define a parameter with the given name and type.
    pub fn new(name: impl Into<String>, param_type: ToolParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: None,
            required: false,
            default: None,
            items: None,
        }
    }

    /// Attach a human-readable description surfaced to agents.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark the parameter as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Value substituted when the caller omits the parameter.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// For array parameters, declare the element type.
    pub fn with_items(mut self, items: ToolParameterType) -> Self {
        self.items = Some(items);
        self
    }
}

/// Whether a handler only reads or also acts on the outside world.
///
/// Read-only handlers that time out are retried once with identical
/// arguments; external-effect handlers are not retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSideEffect {
    ReadOnly,
    External,
}

/// Identity, contract, and side-effect declaration of one tool.
#[derive(Debug, Clone)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub side_effect: ToolSideEffect,
    pub parameters: Vec<ToolParameter>,
}

impl ToolMetadata {
    /// Create metadata for a read-only tool.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            side_effect: ToolSideEffect::ReadOnly,
            parameters: Vec::new(),
        }
    }

    /// Declare that the handler has effects beyond reading.
    pub fn external_effect(mut self) -> Self {
        self.side_effect = ToolSideEffect::External;
        self
    }

    /// Append a parameter declaration.
    pub fn with_parameter(mut self, param: ToolParameter) -> Self {
        self.parameters.push(param);
        self
    }
}

/// The typed argument record a handler receives.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    /// User on whose behalf the tool runs; handlers scope their data by it.
    pub user_id: String,
    /// Validated arguments with declared defaults filled in.
    pub args: Value,
    /// Cancellation token of the invoking turn.
    pub cancel: CancellationToken,
}

impl ToolRequest {
    /// Build a request with a fresh (never cancelled) token.
    pub fn new(user_id: impl Into<String>, args: Value) -> Self {
        Self {
            user_id: user_id.into(),
            args,
            cancel: CancellationToken::new(),
        }
    }

    /// Build a request bound to an existing cancellation token.
    pub fn with_cancel(user_id: impl Into<String>, args: Value, cancel: CancellationToken) -> Self {
        Self {
            user_id: user_id.into(),
            args,
            cancel,
        }
    }
}

/// Uniform result envelope for every invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub latency_ms: u64,
}

impl ToolOutcome {
    /// Successful envelope.
    pub fn success(data: Value, latency_ms: u64) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            message: None,
            latency_ms,
        }
    }

    /// Failed envelope with a categorized error.
    pub fn failure(error: ErrorKind, message: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
            message: Some(message.into()),
            latency_ms,
        }
    }
}

/// What a handler returns; the registry folds it into a [`ToolOutcome`].
pub type ToolHandlerResult = Result<Value, String>;

/// Boxed async tool handler.
pub type ToolHandler = Arc<
    dyn Fn(ToolRequest) -> Pin<Box<dyn Future<Output = ToolHandlerResult> + Send>> + Send + Sync,
>;

/// Errors raised while building a registry.
#[derive(Debug, Clone)]
pub enum ToolRegistryError {
    /// A tool with the same name was already registered.
    Duplicate(String),
}

impl fmt::Display for ToolRegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolRegistryError::Duplicate(name) => {
                write!(f, "tool already registered: {}", name)
            }
        }
    }
}

impl Error for ToolRegistryError {}

struct RegisteredTool {
    metadata: ToolMetadata,
    handler: ToolHandler,
}

/// Name to handler map with boundary validation.
///
/// Built during startup, then shared immutably (typically behind `Arc`)
/// across every turn and background task.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a tool. Duplicate names are a construction error.
    pub fn register(
        &mut self,
        metadata: ToolMetadata,
        handler: ToolHandler,
    ) -> Result<(), ToolRegistryError> {
        let name = metadata.name.clone();
        if self.tools.contains_key(&name) {
            return Err(ToolRegistryError::Duplicate(name));
        }
        self.order.push(name.clone());
        self.tools.insert(name, RegisteredTool { metadata, handler });
        Ok(())
    }

    /// Whether a tool name resolves.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Borrow a tool's metadata.
    pub fn metadata(&self, name: &str) -> Option<&ToolMetadata> {
        self.tools.get(name).map(|t| &t.metadata)
    }

    /// List metadata in registration order.
    pub fn list(&self) -> Vec<&ToolMetadata> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name).map(|t| &t.metadata))
            .collect()
    }

    /// Validate and dispatch one invocation.
    ///
    /// Unknown names and argument mismatches are reported in the envelope
    /// without invoking the handler. Handler panics are not caught; handler
    /// errors become `tool_failed`.
    pub async fn invoke(&self, name: &str, mut request: ToolRequest) -> ToolOutcome {
        let started = Instant::now();
        let tool = match self.tools.get(name) {
            Some(tool) => tool,
            None => {
                return ToolOutcome::failure(
                    ErrorKind::NoSuchTool,
                    format!("unknown tool: {}", name),
                    elapsed_ms(started),
                );
            }
        };

        if let Err(message) = validate_args(&tool.metadata, &mut request.args) {
            return ToolOutcome::failure(ErrorKind::InvalidArgs, message, elapsed_ms(started));
        }

        match (tool.handler)(request).await {
            Ok(data) => ToolOutcome::success(data, elapsed_ms(started)),
            Err(message) => {
                ToolOutcome::failure(ErrorKind::ToolFailed, message, elapsed_ms(started))
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Check argument names and types against the declaration, filling defaults.
fn validate_args(metadata: &ToolMetadata, args: &mut Value) -> Result<(), String> {
    if args.is_null() {
        *args = Value::Object(serde_json::Map::new());
    }
    let map = match args.as_object_mut() {
        Some(map) => map,
        None => return Err("arguments must be a JSON object".to_string()),
    };

    for key in map.keys() {
        if !metadata.parameters.iter().any(|p| &p.name == key) {
            return Err(format!("unknown argument: {}", key));
        }
    }

    for param in &metadata.parameters {
        match map.get(&param.name) {
            Some(value) => {
                if !param.param_type.accepts(value) {
                    return Err(format!(
                        "argument {} has the wrong type (expected {:?})",
                        param.name, param.param_type
                    ));
                }
                if let (ToolParameterType::Array, Some(items)) = (param.param_type, param.items) {
                    let all_match = value
                        .as_array()
                        .map(|a| a.iter().all(|v| items.accepts(v)))
                        .unwrap_or(false);
                    if !all_match {
                        return Err(format!(
                            "argument {} has elements of the wrong type (expected {:?})",
                            param.name, items
                        ));
                    }
                }
            }
            None => {
                if let Some(default) = &param.default {
                    map.insert(param.name.clone(), default.clone());
                } else if param.required {
                    return Err(format!("missing required argument: {}", param.name));
                }
            }
        }
    }

    Ok(())
}
