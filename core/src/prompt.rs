//! Builds the initial system and user messages for a run.

use serde_json::Value;

use crate::models::system_message;
use crate::models::user_message;
use crate::tools::apply_edit::APPLY_EDIT_TOOL_NAME;
use crate::tools::finalize::FINALIZE_TOOL_NAME;

const CLI_HINT: &str = "Additionally, you can call user-provided CLI tools when needed. Choose the appropriate tool at the right time.\n";

pub(crate) fn build_initial_messages(
    instruction: &str,
    code_input_xml: &str,
    has_cli_tools: bool,
) -> Vec<Value> {
    let cli_hint = if has_cli_tools { CLI_HINT } else { "" };
    let system = format!(
        "You are Axe, a focused ReAct coding assistant. Use the available tools to follow the user's instruction exactly.\n\
        \n\
        Tooling rules:\n\
        1. To change code, call {APPLY_EDIT_TOOL_NAME} with a <CodeOutput> envelope carrying a patch for each file you edit.\n\
        2. Finish only by calling {FINALIZE_TOOL_NAME} with status 'success' once the instruction is satisfied. If you cannot complete the task, call it with status 'failure' and explain why.\n\
        {cli_hint}Reason about the plan before calling tools, cite file paths explicitly, and avoid editing files that were not provided."
    );
    let user = format!("Instruction: {instruction}\n\nCodeInput: {code_input_xml}");
    vec![system_message(&system), user_message(&user)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_hint_appears_only_with_cli_tools() {
        let with = build_initial_messages("fix it", "<CodeInput></CodeInput>", true);
        let without = build_initial_messages("fix it", "<CodeInput></CodeInput>", false);
        let system_with = with[0]["content"].as_str().unwrap();
        let system_without = without[0]["content"].as_str().unwrap();
        assert!(system_with.contains("CLI tools"));
        assert!(!system_without.contains("CLI tools"));
    }

    #[test]
    fn user_message_carries_instruction_and_code_input() {
        let messages = build_initial_messages("rename foo", "<CodeInput></CodeInput>", false);
        let user = messages[1]["content"].as_str().unwrap();
        assert!(user.starts_with("Instruction: rename foo"));
        assert!(user.contains("<CodeInput>"));
    }
}
