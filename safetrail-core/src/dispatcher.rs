//! Tool registry and action dispatch.
//!
//! Tools are registered by name at startup. A dispatch runs each requested
//! action in order under the tool's timeout; one action failing, timing out,
//! or panicking never affects the others.

use crate::error::ToolError;
use crate::types::{Location, RequestContext};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a tool sees about the request that triggered it.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub user_id: String,
    pub location: Option<Location>,
    pub request: RequestContext,
}

impl ToolContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn with_location(mut self, location: Option<Location>) -> Self {
        self.location = location;
        self
    }
}

/// A named capability provider.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn execute(&self, ctx: &ToolContext) -> Result<serde_json::Value, ToolError>;

    /// Maximum execution time before timeout.
    fn timeout(&self) -> Duration {
        Duration::from_secs(15)
    }
}

/// Outcome of one dispatched action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResult {
    Success { data: serde_json::Value },
    Failed { error: String },
    NotImplemented { message: String },
}

impl ToolResult {
    pub fn is_error(&self) -> bool {
        !matches!(self, ToolResult::Success { .. })
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        match self {
            ToolResult::Success { data } => Some(data),
            _ => None,
        }
    }
}

/// Name and description of a registered tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}

/// Results of one dispatch, keyed by action name.
pub type ToolResults = BTreeMap<String, ToolResult>;

/// Holds the registered tools and runs them.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    default_timeout: Option<Duration>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            default_timeout: None,
        }
    }

    /// Cap every tool's timeout at `timeout`.
    pub fn with_timeout_cap(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Register a tool. Returns error if a tool with the same name is already registered.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::AlreadyRegistered { name });
        }
        debug!(tool = %name, "Registering tool");
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Result<(), ToolError> {
        if self.tools.remove(name).is_none() {
            return Err(ToolError::NotFound {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered tool names, sorted.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Name and description of every registered tool, sorted by name.
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        let mut tools: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|tool| ToolInfo {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    fn effective_timeout(&self, tool: &dyn Tool) -> Duration {
        match self.default_timeout {
            Some(cap) => tool.timeout().min(cap),
            None => tool.timeout(),
        }
    }

    /// Execute a single tool by name, applying its timeout and catching panics.
    pub async fn execute(
        &self,
        name: &str,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })?;

        let timeout = self.effective_timeout(tool.as_ref());
        info!(tool = %name, timeout_secs = timeout.as_secs(), "Executing tool");

        let guarded = AssertUnwindSafe(tool.execute(ctx)).catch_unwind();
        match tokio::time::timeout(timeout, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(_panic)) => Err(ToolError::ExecutionFailed {
                name: name.to_string(),
                message: "tool panicked".to_string(),
            }),
            Err(_) => Err(ToolError::Timeout {
                name: name.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    /// Run each action once, in order, isolating failures per action.
    pub async fn dispatch(&self, actions: &[String], ctx: &ToolContext) -> ToolResults {
        let mut results = ToolResults::new();
        let mut seen = HashSet::new();

        for action in actions {
            if !seen.insert(action.as_str()) {
                continue;
            }
            let result = match self.execute(action, ctx).await {
                Ok(data) => ToolResult::Success { data },
                Err(ToolError::NotFound { .. }) => ToolResult::NotImplemented {
                    message: format!("Action '{}' not implemented", action),
                },
                Err(e) => {
                    warn!(tool = %action, user_id = %ctx.user_id, error = %e, "Tool action failed");
                    ToolResult::Failed {
                        error: format!("Error executing {}: {}", action, e),
                    }
                }
            };
            results.insert(action.clone(), result);
        }
        results
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A tool that always returns the same JSON value.
pub struct StaticTool {
    name: String,
    value: serde_json::Value,
}

impl StaticTool {
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Returns a fixed value"
    }

    async fn execute(&self, _ctx: &ToolContext) -> Result<serde_json::Value, ToolError> {
        Ok(self.value.clone())
    }
}

/// A tool that always fails with `message`.
pub struct FailingTool {
    name: String,
    message: String,
}

impl FailingTool {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    async fn execute(&self, _ctx: &ToolContext) -> Result<serde_json::Value, ToolError> {
        Err(ToolError::ExecutionFailed {
            name: self.name.clone(),
            message: self.message.clone(),
        })
    }
}
