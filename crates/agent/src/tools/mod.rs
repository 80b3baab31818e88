//! Tool registry
//!
//! Name-keyed catalog of tools the model may invoke. Registration is rare
//! (startup), lookups and dispatch are frequent and concurrent.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weaver_provider::{ToolCall, ToolDefinition, ToolResult};

use crate::{AgentError, Result};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Identity and cancellation scope handed to every tool handler
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub tenant_id: String,
    pub user_id: String,
    pub project_id: Option<String>,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            project_id: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Executable half of a tool
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(
        &self,
        ctx: &ToolContext,
        input: Value,
    ) -> std::result::Result<Value, BoxError>;
}

/// Handler backed by an async closure, see [`handler_fn`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(ToolContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, BoxError>> + Send + 'static,
{
    async fn execute(
        &self,
        ctx: &ToolContext,
        input: Value,
    ) -> std::result::Result<Value, BoxError> {
        (self.0)(ctx.clone(), input).await
    }
}

/// Adapt an async closure into a tool handler
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ToolContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, BoxError>> + Send + 'static,
{
    FnHandler(f)
}

/// A named, schema-described tool
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    handler: Option<Arc<dyn ToolHandler>>,
}

impl Tool {
    /// Tool without a handler; attach one before registering
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: impl ToolHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_shared_handler(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Exported projection, handler excluded
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(&self.name, &self.description, self.input_schema.clone())
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .field("has_handler", &self.has_handler())
            .finish()
    }
}

/// Batch execution seam used by the agent loop
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Run every call in order. Individual tool failures become error
    /// results; an `Err` means the batch itself could not run.
    async fn execute_batch(&self, ctx: &ToolContext, calls: &[ToolCall]) -> Result<Vec<ToolResult>>;
}

/// Concurrency-safe tool catalog
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Tool>> {
        self.tools.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a tool. The first registration of a name wins.
    pub fn register(&self, tool: Tool) -> Result<()> {
        if tool.name.trim().is_empty() {
            return Err(AgentError::InvalidTool("tool name is empty".to_string()));
        }
        if !tool.has_handler() {
            return Err(AgentError::InvalidTool(format!(
                "tool '{}' has no handler",
                tool.name
            )));
        }

        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        if tools.contains_key(&tool.name) {
            return Err(AgentError::DuplicateTool(tool.name));
        }

        info!("◆ Registered tool {}", tool.name);
        tools.insert(tool.name.clone(), tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Tool> {
        self.read().get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Definitions for the chat request. Order is unspecified.
    pub fn list_definitions(&self) -> Vec<ToolDefinition> {
        self.read().values().map(Tool::definition).collect()
    }

    /// Invoke a tool by name. Aborts with `Cancelled` when the context's
    /// token fires; handler failures are returned as `ToolExecution`.
    pub async fn execute(&self, ctx: &ToolContext, name: &str, input: Value) -> Result<Value> {
        // Clone the handler out so no lock is held across the await
        let handler = self
            .read()
            .get(name)
            .and_then(|t| t.handler.clone())
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))?;

        if ctx.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(AgentError::Cancelled),
            result = handler.execute(ctx, input) => {
                result.map_err(|source| AgentError::ToolExecution {
                    tool: name.to_string(),
                    source,
                })
            }
        }
    }

    /// Execute calls sequentially, preserving order
    pub async fn execute_batch(
        &self,
        ctx: &ToolContext,
        calls: &[ToolCall],
    ) -> Result<Vec<ToolResult>> {
        let mut results = Vec::with_capacity(calls.len());

        for call in calls {
            debug!("Executing tool: {}", call.name);

            match self.execute(ctx, &call.name, call.input.clone()).await {
                Ok(output) => results.push(ToolResult::success(&call.id, output)),
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => {
                    warn!("Tool {} failed: {}", call.name, e);
                    results.push(ToolResult::error(&call.id, e.to_string()));
                }
            }
        }

        Ok(results)
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.list_definitions()
    }

    async fn execute_batch(
        &self,
        ctx: &ToolContext,
        calls: &[ToolCall],
    ) -> Result<Vec<ToolResult>> {
        ToolRegistry::execute_batch(self, ctx, calls).await
    }
}
