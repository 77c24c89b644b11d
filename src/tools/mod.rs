//! Agent tools: local files, the analytical database and web search
//!
//! Tools are registered in a fixed order; that order is the order the model
//! sees them in.

mod analytics;
mod file_ops;
mod web_search;

pub use analytics::{
    AnalyticsDb, CreateTableFromPathTool, DescribeTableTool, RunQueryTool, ShowTablesTool,
};
pub use file_ops::{ListFilesTool, ReadFileTool, SaveFileTool};
pub use web_search::WebSearchTool;

use crate::config::ToolsConfig;
use crate::llm::ToolDefinition;
use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Result of executing a tool
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
        }
    }
}

/// Trait for agent tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name
    fn name(&self) -> &str;

    /// Get the tool description
    fn description(&self) -> &str;

    /// Get the JSON schema for parameters
    fn parameters(&self) -> Value;

    /// Execute the tool with given parameters
    async fn execute(&self, params: Value) -> Result<ToolResult>;

    /// Convert to LLM tool definition
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Resolve a tool-supplied path against the tool's base directory
pub(crate) fn resolve_path(base: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Resolve `requested` under `base`, rejecting paths that escape it
pub(crate) fn contained_path(base: &Path, requested: &str) -> Option<PathBuf> {
    let path = resolve_path(base, requested);
    let escapes = path
        .components()
        .any(|c| matches!(c, Component::ParentDir));
    if escapes || !path.starts_with(base) {
        None
    } else {
        Some(path)
    }
}

/// Registry of available tools
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    working_dir: PathBuf,
    tool_timeout_secs: u64,
}

impl ToolRegistry {
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            tools: Vec::new(),
            working_dir,
            tool_timeout_secs: 60,
        }
    }

    /// The analyst tool set: file tools, analytical database, web search
    pub fn for_analyst(working_dir: PathBuf, config: &ToolsConfig) -> Result<Self> {
        let mut registry = Self::new(working_dir.clone());
        registry.set_tool_timeout_secs(config.tool_timeout_secs);

        if config.save_files {
            registry.register(Arc::new(SaveFileTool::new(working_dir.clone())));
        }
        if config.read_files {
            registry.register(Arc::new(ReadFileTool::new(working_dir.clone())));
        }
        if config.list_files {
            registry.register(Arc::new(ListFilesTool::new(working_dir.clone())));
        }

        let db = AnalyticsDb::in_memory(working_dir)?;
        registry.register(Arc::new(CreateTableFromPathTool::new(db.clone())));
        registry.register(Arc::new(ShowTablesTool::new(db.clone())));
        registry.register(Arc::new(DescribeTableTool::new(db.clone())));
        registry.register(Arc::new(RunQueryTool::new(db)));

        registry.register(Arc::new(WebSearchTool::new(config.web_search_results)));

        tracing::debug!(tools = ?registry.names(), "Registered analyst tools");
        Ok(registry)
    }

    /// Register a tool, replacing any tool with the same name in place
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        match self.tools.iter_mut().find(|t| t.name() == tool.name()) {
            Some(existing) => *existing = tool,
            None => self.tools.push(tool),
        }
    }

    /// Set the default tool timeout (seconds)
    pub fn set_tool_timeout_secs(&mut self, secs: u64) {
        self.tool_timeout_secs = secs;
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Tool names in registration order
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Execute a tool by name
    ///
    /// Unknown tools, bad arguments, panics and timeouts all come back as
    /// error results so the model can see what went wrong.
    pub async fn execute(&self, name: &str, params: Value) -> ToolResult {
        let Some(tool) = self.get(name) else {
            return ToolResult::error(format!("Unknown tool: {}", name));
        };

        let timeout_duration = Duration::from_secs(self.tool_timeout_secs);

        // Wrap tool execution with timeout + panic recovery to prevent crashes
        match timeout(
            timeout_duration,
            AssertUnwindSafe(tool.execute(params)).catch_unwind(),
        )
        .await
        {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(e))) => {
                tracing::warn!("Tool '{}' failed: {:#}", name, e);
                ToolResult::error(format!("Error: {:#}", e))
            }
            Ok(Err(panic_info)) => {
                let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                tracing::error!("Tool '{}' panicked: {}", name, panic_msg);
                ToolResult::error(format!("Tool '{}' crashed: {}", name, panic_msg))
            }
            Err(_) => ToolResult::error(format!(
                "Tool '{}' timed out after {} seconds",
                name, self.tool_timeout_secs
            )),
        }
    }

    /// Get all tool definitions for LLM, in registration order
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.to_definition()).collect()
    }

    /// Get working directory
    pub fn working_dir(&self) -> &PathBuf {
        &self.working_dir
    }
}
