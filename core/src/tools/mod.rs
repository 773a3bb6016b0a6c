//! Tools the react loop can dispatch.
//!
//! `apply_edit` and `finalize_task` are built in; CLI tools come from user
//! definitions. Every tool renders recoverable failures as text for the
//! model; only structural problems (an unknown tool, a poisoned registry)
//! surface as errors.

pub(crate) mod apply_edit;
pub mod cli;
pub(crate) mod finalize;

use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;

use crate::error::AxeErr;
use crate::error::Result;

/// Result of one tool invocation. `return_directly` marks the content as the
/// agent's final output, terminating the react loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ToolOutput {
    pub content: String,
    pub return_directly: bool,
}

impl ToolOutput {
    pub(crate) fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            return_directly: false,
        }
    }
}

#[async_trait]
pub(crate) trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> String;
    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;
    async fn invoke(&self, arguments: &str) -> Result<ToolOutput>;
}

/// Dispatch table keyed by tool name. Duplicate names are a configuration
/// error, surfaced at build time.
pub(crate) struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry").finish_non_exhaustive()
    }
}

impl ToolRegistry {
    pub(crate) fn new(tools: Vec<Box<dyn Tool>>) -> Result<Self> {
        for (i, tool) in tools.iter().enumerate() {
            if tools[..i].iter().any(|other| other.name() == tool.name()) {
                return Err(AxeErr::DuplicateTool(tool.name().to_string()));
            }
        }
        Ok(Self { tools })
    }

    pub(crate) fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|tool| tool.name() == name)
            .map(Box::as_ref)
    }

    /// Tool schemas in the Chat Completions function-calling format.
    pub(crate) fn schemas(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.parameters(),
                    },
                })
            })
            .collect()
    }
}
