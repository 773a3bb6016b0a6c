//! Tool that ends the react loop and records the run's outcome.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tracing::info;

use crate::error::Result;
use crate::history::ChangelogHandle;
use crate::tools::Tool;
use crate::tools::ToolOutput;

pub(crate) const FINALIZE_TOOL_NAME: &str = "finalize_task";

pub(crate) struct FinalizeTool {
    changelog: ChangelogHandle,
}

impl FinalizeTool {
    pub(crate) fn new(changelog: ChangelogHandle) -> Self {
        Self { changelog }
    }
}

#[derive(Debug, Deserialize)]
struct FinalizeRequest {
    status: String,
    #[serde(default)]
    changelog: String,
    #[serde(default)]
    todo: String,
}

#[async_trait]
impl Tool for FinalizeTool {
    fn name(&self) -> &str {
        FINALIZE_TOOL_NAME
    }

    fn description(&self) -> String {
        "Mark the task as complete. Use status `success` only when the instruction is satisfied."
            .to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "status": {
                    "type": "string",
                    "enum": ["success", "failure"],
                    "description": "Set to `success` or `failure`.",
                },
                "changelog": {
                    "type": "string",
                    "description": "A detailed changelog of the task, covering all the changes made to the code and tests.",
                },
                "todo": {
                    "type": "string",
                    "description": "Remaining work to pick up in a later run, if any.",
                },
            },
            "required": ["status"],
            "additionalProperties": false,
        })
    }

    async fn invoke(&self, arguments: &str) -> Result<ToolOutput> {
        info!(arguments, "finalize_task: finalizing task");
        if arguments.trim().is_empty() {
            return Ok(ToolOutput::text("finalize_task: missing arguments"));
        }
        let request: FinalizeRequest = match serde_json::from_str(arguments) {
            Ok(request) => request,
            Err(e) => {
                return Ok(ToolOutput::text(format!(
                    "finalize_task: failed to parse arguments: {e}"
                )));
            }
        };

        let status = request.status.trim().to_lowercase();
        if status != "success" && status != "failure" {
            return Ok(ToolOutput::text(
                "finalize_task: status must be \"success\" or \"failure\"",
            ));
        }
        let success = status == "success";

        let mut summary = request.changelog.trim().to_string();
        if summary.is_empty() {
            summary = if success {
                "Task marked as success.".to_string()
            } else {
                "Task marked as failure.".to_string()
            };
        }

        self.changelog.set_success(success);
        self.changelog.add_log(summary.clone());
        self.changelog.set_todo(request.todo.trim());

        Ok(ToolOutput {
            content: summary,
            return_directly: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::history::Changelog;

    fn tool() -> (FinalizeTool, ChangelogHandle) {
        let handle = ChangelogHandle::new(Changelog::new());
        (FinalizeTool::new(handle.clone()), handle)
    }

    #[tokio::test]
    async fn success_records_the_changelog_and_returns_directly() {
        let (tool, handle) = tool();
        let arguments = serde_json::to_string(&json!({
            "status": "success",
            "changelog": "Replaced the sort with a stable one.",
            "todo": "profile large inputs",
        }))
        .unwrap();

        let output = tool.invoke(&arguments).await.unwrap();
        assert!(output.return_directly);
        assert_eq!(output.content, "Replaced the sort with a stable one.");

        let snapshot = handle.snapshot();
        assert!(snapshot.success);
        assert_eq!(snapshot.logs, vec!["Replaced the sort with a stable one."]);
        assert_eq!(snapshot.todo, "profile large inputs");
    }

    #[tokio::test]
    async fn failure_is_a_normal_termination_with_default_summary() {
        let (tool, handle) = tool();
        let output = tool
            .invoke(&serde_json::to_string(&json!({"status": "failure"})).unwrap())
            .await
            .unwrap();
        assert!(output.return_directly);
        assert_eq!(output.content, "Task marked as failure.");
        assert!(!handle.snapshot().success);
    }

    #[tokio::test]
    async fn invalid_status_comes_back_as_text() {
        let (tool, handle) = tool();
        let output = tool
            .invoke(&serde_json::to_string(&json!({"status": "done"})).unwrap())
            .await
            .unwrap();
        assert!(!output.return_directly);
        assert!(output.content.contains("status must be"), "{}", output.content);
        assert!(handle.snapshot().logs.is_empty());
    }

    #[tokio::test]
    async fn status_is_case_insensitive() {
        let (tool, handle) = tool();
        let output = tool
            .invoke(&serde_json::to_string(&json!({"status": " Success "})).unwrap())
            .await
            .unwrap();
        assert!(output.return_directly);
        assert!(handle.snapshot().success);
    }
}
