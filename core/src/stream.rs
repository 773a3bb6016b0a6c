//! Classifies streamed frames and renders them to the output channel.
//!
//! Each frame is inspected once: plain assistant text is forwarded verbatim;
//! a frame with exactly one tool-call fragment is routed through the
//! identity-scoped [`ToolCallStreamer`]; frames carrying several simultaneous
//! calls bypass the streamer and are rendered whole. In parallel, an
//! accumulator rebuilds the complete assistant turn for dispatch.

use std::collections::BTreeMap;

use futures::StreamExt;
use tokio::sync::mpsc;

use crate::chat_completions::ResponseStream;
use crate::error::Result;
use crate::models::StreamEvent;
use crate::models::ToolCall;
use crate::models::ToolCallDelta;
use crate::tool_call_stream::ToolCallStreamer;

/// The fully assembled assistant turn.
#[derive(Debug, Default)]
pub(crate) struct Turn {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl Turn {
    pub(crate) fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Drains one model reply, multiplexing rendering and accumulation. A final
/// `"\n"` is emitted once the stream ends.
pub(crate) async fn consume_stream(
    stream: &mut ResponseStream,
    out: &mpsc::Sender<String>,
) -> Result<Turn> {
    let mut content = String::new();
    let mut accumulator: BTreeMap<u32, ToolCall> = BTreeMap::new();
    let mut streamer: Option<ToolCallStreamer> = None;

    let mut result = Ok(());
    while let Some(event) = stream.next().await {
        let delta = match event {
            Ok(StreamEvent::Completed) => break,
            Ok(StreamEvent::Delta(delta)) => delta,
            Err(err) => {
                result = Err(err);
                break;
            }
        };

        if let Some(text) = &delta.content {
            content.push_str(text);
        }
        for fragment in &delta.tool_calls {
            let call = accumulator.entry(fragment.index).or_default();
            if call.id.is_empty() {
                if let Some(id) = &fragment.id {
                    call.id = id.clone();
                }
            }
            if let Some(name) = &fragment.name {
                call.name.push_str(name);
            }
            if let Some(arguments) = &fragment.arguments {
                call.arguments.push_str(arguments);
            }
        }

        match delta.tool_calls.as_slice() {
            [] => {
                if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                    let _ = out.send(text).await;
                }
            }
            [fragment] => {
                let current = match streamer.take() {
                    Some(current) if belongs_to(&current, fragment) => current,
                    Some(stale) => {
                        // New identity: drain the old call before starting.
                        stale.close().await;
                        new_streamer(fragment, out)
                    }
                    None => new_streamer(fragment, out),
                };
                let current = streamer.insert(current);
                current.on_fragment(fragment).await;
            }
            fragments => {
                if let Some(stale) = streamer.take() {
                    stale.close().await;
                }
                render_whole_frame(fragments, out).await;
            }
        }
    }

    if let Some(active) = streamer.take() {
        active.close().await;
    }
    let _ = out.send("\n".to_string()).await;
    result?;

    Ok(Turn {
        content,
        tool_calls: accumulator.into_values().collect(),
    })
}

fn belongs_to(streamer: &ToolCallStreamer, fragment: &ToolCallDelta) -> bool {
    match fragment.id.as_deref() {
        None | Some("") => true,
        Some(id) => id == streamer.id(),
    }
}

fn new_streamer(fragment: &ToolCallDelta, out: &mpsc::Sender<String>) -> ToolCallStreamer {
    ToolCallStreamer::new(fragment.id.clone().unwrap_or_default(), out.clone())
}

/// Fallback for frames with several simultaneous tool calls: emit each call's
/// header and raw argument text without incremental decoding.
async fn render_whole_frame(fragments: &[ToolCallDelta], out: &mpsc::Sender<String>) {
    for fragment in fragments {
        if let Some(id) = fragment.id.as_deref().filter(|id| !id.is_empty()) {
            let _ = out.send(format!("\nTool call id: {id}\n")).await;
        }
        if let Some(name) = fragment.name.as_deref().filter(|n| !n.is_empty()) {
            let _ = out.send(format!("Tool call function name: {name}\n")).await;
            let _ = out.send("Tool call arguments:\n".to_string()).await;
        }
        if let Some(arguments) = fragment.arguments.as_deref().filter(|a| !a.trim().is_empty()) {
            let _ = out.send(arguments.to_string()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::MessageDelta;

    fn delta_text(text: &str) -> StreamEvent {
        StreamEvent::Delta(MessageDelta {
            content: Some(text.to_string()),
            tool_calls: Vec::new(),
        })
    }

    fn delta_call(
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> ToolCallDelta {
        ToolCallDelta {
            index,
            id: id.map(str::to_string),
            name: name.map(str::to_string),
            arguments: arguments.map(str::to_string),
        }
    }

    fn delta_calls(calls: Vec<ToolCallDelta>) -> StreamEvent {
        StreamEvent::Delta(MessageDelta {
            content: None,
            tool_calls: calls,
        })
    }

    async fn run_classifier(events: Vec<StreamEvent>) -> (Turn, String) {
        let (tx_event, rx_event) = mpsc::channel(64);
        for event in events {
            tx_event.send(Ok(event)).await.unwrap();
        }
        drop(tx_event);

        let mut stream = ResponseStream::new(rx_event);
        let (out_tx, mut out_rx) = mpsc::channel(256);
        let turn = consume_stream(&mut stream, &out_tx).await.unwrap();
        drop(out_tx);

        let mut transcript = String::new();
        while let Some(chunk) = out_rx.recv().await {
            transcript.push_str(&chunk);
        }
        (turn, transcript)
    }

    #[tokio::test]
    async fn text_frames_are_forwarded_verbatim() {
        let (turn, transcript) =
            run_classifier(vec![delta_text("hel"), delta_text("lo"), StreamEvent::Completed])
                .await;
        assert_eq!(transcript, "hello\n");
        assert_eq!(turn.content, "hello");
        assert!(!turn.has_tool_calls());
    }

    #[tokio::test]
    async fn id_change_drains_the_previous_call_first() {
        let events = vec![
            delta_calls(vec![delta_call(
                0,
                Some("A"),
                Some("apply_edit"),
                Some("{\"code_output\":\""),
            )]),
            delta_calls(vec![delta_call(0, None, None, Some("patch body\"}"))]),
            delta_calls(vec![delta_call(
                1,
                Some("B"),
                Some("finalize_task"),
                Some("{\"status\":\"success\"}"),
            )]),
            StreamEvent::Completed,
        ];
        let (turn, transcript) = run_classifier(events).await;

        let decoded_a = transcript.find("code_output:\npatch body\n").expect("A decoded");
        let header_b = transcript.find("Tool call id: B").expect("B header");
        assert!(
            decoded_a < header_b,
            "call A must drain before call B begins:\n{transcript}"
        );

        assert_eq!(turn.tool_calls.len(), 2);
        assert_eq!(turn.tool_calls[0].id, "A");
        assert_eq!(turn.tool_calls[0].name, "apply_edit");
        assert_eq!(turn.tool_calls[0].arguments, "{\"code_output\":\"patch body\"}");
        assert_eq!(turn.tool_calls[1].id, "B");
    }

    #[tokio::test]
    async fn multiple_simultaneous_calls_bypass_the_streamer() {
        let events = vec![
            delta_calls(vec![
                delta_call(0, Some("A"), Some("one"), Some("{\"a\":\"1\"}")),
                delta_call(1, Some("B"), Some("two"), Some("{\"b\":\"2\"}")),
            ]),
            StreamEvent::Completed,
        ];
        let (turn, transcript) = run_classifier(events).await;

        // Raw argument text, not decoded key/value lines.
        assert!(transcript.contains("{\"a\":\"1\"}"), "{transcript}");
        assert!(transcript.contains("{\"b\":\"2\"}"), "{transcript}");
        assert!(transcript.contains("Tool call function name: one\n"), "{transcript}");
        assert_eq!(turn.tool_calls.len(), 2);
    }

    #[tokio::test]
    async fn trailing_newline_is_always_emitted() {
        let (_, transcript) = run_classifier(vec![StreamEvent::Completed]).await;
        assert_eq!(transcript, "\n");
    }
}
