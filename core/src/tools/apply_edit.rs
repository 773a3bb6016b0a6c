//! Tool that applies a model-proposed CodeOutput envelope to the container
//! and persists the result.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use axe_apply_patch::identify_files_added;
use axe_apply_patch::identify_files_needed;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tracing::debug;

use crate::container::CodeContainer;
use crate::container::parse_code_output;
use crate::error::AxeErr;
use crate::error::Result;
use crate::tools::Tool;
use crate::tools::ToolOutput;

pub(crate) const APPLY_EDIT_TOOL_NAME: &str = "apply_edit";

const APPLY_EDIT_INSTRUCTIONS: &str = include_str!("apply_edit_instructions.md");

pub(crate) struct ApplyEditTool {
    container: Arc<Mutex<CodeContainer>>,
}

impl ApplyEditTool {
    pub(crate) fn new(container: Arc<Mutex<CodeContainer>>) -> Self {
        Self { container }
    }
}

#[derive(Debug, Deserialize)]
struct ApplyEditRequest {
    code_output: String,
}

#[async_trait]
impl Tool for ApplyEditTool {
    fn name(&self) -> &str {
        APPLY_EDIT_TOOL_NAME
    }

    fn description(&self) -> String {
        format!("Apply your code edits with the <CodeOutput> XML format.\n\n{APPLY_EDIT_INSTRUCTIONS}")
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code_output": {
                    "type": "string",
                    "description": "XML string of CodeOutput edits to apply.",
                },
            },
            "required": ["code_output"],
            "additionalProperties": false,
        })
    }

    // Failures here are recoverable by the model, so they come back as text
    // rather than as errors.
    async fn invoke(&self, arguments: &str) -> Result<ToolOutput> {
        debug!(arguments, "apply_edit: applying edits");
        if arguments.trim().is_empty() {
            return Ok(ToolOutput::text("apply_edit: missing arguments, empty string"));
        }

        let request: ApplyEditRequest = match serde_json::from_str(arguments) {
            Ok(request) => request,
            Err(e) => {
                return Ok(ToolOutput::text(format!(
                    "apply_edit: failed to parse arguments: {e}"
                )));
            }
        };

        let payload = request.code_output.trim();
        if payload.is_empty() {
            return Ok(ToolOutput::text("apply_edit: xml payload is empty"));
        }

        let output = match parse_code_output(payload) {
            Ok(output) => output,
            Err(e) => {
                return Ok(ToolOutput::text(format!(
                    "apply_edit: failed to parse CodeOutput XML: {e}"
                )));
            }
        };

        let mut container = self
            .container
            .lock()
            .map_err(|_| AxeErr::InvalidConfig("code container lock poisoned".to_string()))?;
        if let Err(e) = container.apply(&output.patch) {
            return Ok(ToolOutput::text(format!(
                "apply_edit: failed to apply edits: {e}"
            )));
        }

        let mut changed = identify_files_needed(&output.patch);
        changed.extend(identify_files_added(&output.patch));

        let written = match container.write_to_files() {
            Ok(written) => written,
            Err(e) => return Ok(ToolOutput::text(format!("failed to write files: {e}"))),
        };
        debug!(written = written.join(", "), "apply_edit: flushed container");

        Ok(ToolOutput::text(format!(
            "Applied edits to {} file(s): {}",
            changed.len(),
            changed.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn tool_over(entries: &[(&str, &str)]) -> (ApplyEditTool, Arc<Mutex<CodeContainer>>) {
        let container = Arc::new(Mutex::new(CodeContainer::new(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        )));
        (ApplyEditTool::new(container.clone()), container)
    }

    fn envelope(patch: &str) -> String {
        serde_json::to_string(&json!({
            "code_output": format!("<CodeOutput><![CDATA[{patch}]]></CodeOutput>"),
        }))
        .expect("serialize arguments")
    }

    #[tokio::test]
    async fn applies_a_patch_and_reports_changed_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt").to_string_lossy().into_owned();
        std::fs::write(&path, "one\ntwo").unwrap();
        let (tool, container) = tool_over(&[(path.as_str(), "one\ntwo")]);

        let patch = format!(
            "*** Begin Patch\n*** Update File: {path}\n@@\n-two\n+three\n*** End Patch"
        );
        let output = tool.invoke(&envelope(&patch)).await.unwrap();

        assert!(output.content.starts_with("Applied edits to 1 file(s):"), "{}", output.content);
        assert!(!output.return_directly);
        assert_eq!(container.lock().unwrap().files()[&path], "one\nthree");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\nthree");
    }

    #[tokio::test]
    async fn malformed_arguments_come_back_as_text() {
        let (tool, _) = tool_over(&[]);
        let output = tool.invoke("not json").await.unwrap();
        assert!(output.content.contains("failed to parse arguments"), "{}", output.content);
    }

    #[tokio::test]
    async fn missing_envelope_comes_back_as_text() {
        let (tool, _) = tool_over(&[]);
        let arguments = serde_json::to_string(&json!({"code_output": "no xml here"})).unwrap();
        let output = tool.invoke(&arguments).await.unwrap();
        assert!(
            output.content.contains("failed to parse CodeOutput XML"),
            "{}",
            output.content
        );
    }

    #[tokio::test]
    async fn unresolvable_patch_comes_back_as_text() {
        let (tool, _) = tool_over(&[("f.txt", "a")]);
        let patch = "*** Begin Patch\n*** Update File: f.txt\n@@\n-zzz\n+y\n*** End Patch";
        let output = tool.invoke(&envelope(patch)).await.unwrap();
        assert!(output.content.contains("failed to apply edits"), "{}", output.content);
    }

    #[tokio::test]
    async fn empty_arguments_come_back_as_text() {
        let (tool, _) = tool_over(&[]);
        let output = tool.invoke("  ").await.unwrap();
        assert_eq!(output.content, "apply_edit: missing arguments, empty string");
    }
}
