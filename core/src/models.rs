//! Wire-level shapes shared by the chat client and the react loop.

use serde_json::Value;
use serde_json::json;

/// One fragment of a streamed tool call. Chat deltas identify calls by
/// `index`; the id and name typically arrive only on the first fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// The delta payload of one streamed chat chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct MessageDelta {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug)]
pub(crate) enum StreamEvent {
    Delta(MessageDelta),
    Completed,
}

/// A fully accumulated tool invocation, ready for dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

pub(crate) fn system_message(text: &str) -> Value {
    json!({"role": "system", "content": text})
}

pub(crate) fn user_message(text: &str) -> Value {
    json!({"role": "user", "content": text})
}

pub(crate) fn assistant_message(content: &str, tool_calls: &[ToolCall]) -> Value {
    let content = if content.is_empty() {
        Value::Null
    } else {
        Value::String(content.to_string())
    };
    json!({
        "role": "assistant",
        "content": content,
        "tool_calls": tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments,
                    },
                })
            })
            .collect::<Vec<Value>>(),
    })
}

pub(crate) fn tool_message(call_id: &str, content: &str) -> Value {
    json!({"role": "tool", "tool_call_id": call_id, "content": content})
}
