//! Streaming client for the Chat Completions API.
//!
//! One request per react turn: messages plus tool schemas go up, SSE deltas
//! come back and are mapped onto [`StreamEvent`] so the rest of the pipeline
//! stays agnostic of the wire format.

use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use futures::TryStreamExt;
use reqwest::StatusCode;
use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use tracing::trace;

use crate::error::AxeErr;
use crate::error::Result;
use crate::flags::AXE_API_KEY;
use crate::flags::AXE_REQUEST_MAX_RETRIES;
use crate::flags::AXE_STREAM_IDLE_TIMEOUT_MS;
use crate::flags::OPENAI_API_KEY;
use crate::flags::OPENAI_BASE_URL;
use crate::models::MessageDelta;
use crate::models::StreamEvent;
use crate::models::ToolCallDelta;
use crate::util::backoff;

/// Connection settings resolved once per run and passed down; nothing below
/// this layer reads the environment.
#[derive(Debug, Clone)]
pub(crate) struct ModelConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
}

impl ModelConfig {
    /// Resolves the config from explicit overrides, falling back to the
    /// environment (`AXE_API_KEY`, then `OPENAI_API_KEY`; `OPENAI_BASE_URL`).
    pub fn resolve(
        model: &str,
        api_key_override: Option<&str>,
        base_url_override: Option<&str>,
    ) -> Result<Self> {
        let api_key = api_key_override
            .or(*AXE_API_KEY)
            .or(*OPENAI_API_KEY)
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .ok_or(AxeErr::MissingApiKey)?;
        let base_url = base_url_override.unwrap_or(*OPENAI_BASE_URL).to_string();
        Ok(Self {
            api_key,
            base_url,
            model: model.to_string(),
            temperature: 0.0,
        })
    }
}

pub(crate) struct ResponseStream {
    rx_event: mpsc::Receiver<Result<StreamEvent>>,
}

impl ResponseStream {
    pub(crate) fn new(rx_event: mpsc::Receiver<Result<StreamEvent>>) -> Self {
        Self { rx_event }
    }
}

impl Stream for ResponseStream {
    type Item = Result<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx_event.poll_recv(cx)
    }
}

pub(crate) async fn stream_chat_completions(
    messages: &[Value],
    tools: &[Value],
    config: &ModelConfig,
    client: &reqwest::Client,
) -> Result<ResponseStream> {
    let mut payload = json!({
        "model": config.model,
        "messages": messages,
        "temperature": config.temperature,
        "stream": true,
    });
    if !tools.is_empty() {
        payload["tools"] = Value::Array(tools.to_vec());
    }

    let base_url = config.base_url.trim_end_matches('/');
    let url = format!("{base_url}/chat/completions");

    debug!(url, "POST (chat)");
    trace!("request payload: {payload}");

    let mut attempt = 0;
    loop {
        attempt += 1;

        let res = client
            .post(&url)
            .bearer_auth(config.api_key.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&payload)
            .send()
            .await;

        match res {
            Ok(resp) if resp.status().is_success() => {
                let (tx_event, rx_event) = mpsc::channel::<Result<StreamEvent>>(16);
                let stream = resp.bytes_stream().map_err(AxeErr::Reqwest);
                tokio::spawn(process_chat_sse(stream, tx_event));
                return Ok(ResponseStream::new(rx_event));
            }
            Ok(res) => {
                let status = res.status();
                if !(status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()) {
                    let body = (res.text().await).unwrap_or_default();
                    return Err(AxeErr::UnexpectedStatus(status, body));
                }

                if attempt > *AXE_REQUEST_MAX_RETRIES {
                    return Err(AxeErr::RetryLimit(status));
                }

                let retry_after_secs = res
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok());

                let delay = retry_after_secs
                    .map(|s| Duration::from_millis(s * 1_000))
                    .unwrap_or_else(|| backoff(attempt));
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if attempt > *AXE_REQUEST_MAX_RETRIES {
                    return Err(e.into());
                }
                let delay = backoff(attempt);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Maps the SSE chunk stream onto [`StreamEvent`]s: assistant text and
/// tool-call fragments pass through as deltas, `[DONE]` closes the turn.
async fn process_chat_sse<S>(stream: S, tx_event: mpsc::Sender<Result<StreamEvent>>)
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut stream = stream.eventsource();

    let idle_timeout = *AXE_STREAM_IDLE_TIMEOUT_MS;

    loop {
        let sse = match timeout(idle_timeout, stream.next()).await {
            Ok(Some(Ok(ev))) => ev,
            Ok(Some(Err(e))) => {
                let _ = tx_event.send(Err(AxeErr::Stream(e.to_string()))).await;
                return;
            }
            Ok(None) => {
                // Stream closed gracefully.
                let _ = tx_event.send(Ok(StreamEvent::Completed)).await;
                return;
            }
            Err(_) => {
                let _ = tx_event
                    .send(Err(AxeErr::Stream("idle timeout waiting for SSE".into())))
                    .await;
                return;
            }
        };

        if sse.data.trim() == "[DONE]" {
            let _ = tx_event.send(Ok(StreamEvent::Completed)).await;
            return;
        }

        let chunk: Value = match serde_json::from_str(&sse.data) {
            Ok(v) => v,
            Err(_) => continue,
        };

        if let Some(delta) = parse_delta(&chunk) {
            if tx_event.send(Ok(StreamEvent::Delta(delta))).await.is_err() {
                return;
            }
        }
    }
}

fn parse_delta(chunk: &Value) -> Option<MessageDelta> {
    let delta = chunk.get("choices")?.get(0)?.get("delta")?;

    let content = delta
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string);

    let tool_calls = delta
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .map(|call| ToolCallDelta {
                    index: call.get("index").and_then(Value::as_u64).unwrap_or(0) as u32,
                    id: call.get("id").and_then(Value::as_str).map(str::to_string),
                    name: call
                        .get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    arguments: call
                        .get("function")
                        .and_then(|f| f.get("arguments"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if content.is_none() && tool_calls.is_empty() {
        return None;
    }
    Some(MessageDelta {
        content,
        tool_calls,
    })
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use pretty_assertions::assert_eq;

    use super::*;

    fn sse_bytes(frames: &[&str]) -> Vec<Result<Bytes>> {
        frames
            .iter()
            .map(|frame| Ok(Bytes::from(format!("data: {frame}\n\n"))))
            .collect()
    }

    async fn run_sse(frames: &[&str]) -> Vec<Result<StreamEvent>> {
        let (tx, mut rx) = mpsc::channel(16);
        let stream = stream::iter(sse_bytes(frames));
        process_chat_sse(Box::pin(stream), tx).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn content_deltas_pass_through_in_order() {
        let events = run_sse(&[
            r#"{"choices":[{"delta":{"content":"hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
            r#"{"choices":[{"delta":{}}]}"#,
            "[DONE]",
        ])
        .await;

        let mut texts = Vec::new();
        let mut completed = false;
        for event in events {
            match event.unwrap() {
                StreamEvent::Delta(delta) => texts.push(delta.content.unwrap_or_default()),
                StreamEvent::Completed => completed = true,
            }
        }
        assert_eq!(texts, vec!["hel", "lo"]);
        assert!(completed);
    }

    #[tokio::test]
    async fn tool_call_fragments_carry_identity_and_arguments() {
        let events = run_sse(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"apply_edit","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"code_output\":\"x\"}"}}]}}]}"#,
            "[DONE]",
        ])
        .await;

        let deltas: Vec<MessageDelta> = events
            .into_iter()
            .filter_map(|event| match event.unwrap() {
                StreamEvent::Delta(delta) => Some(delta),
                StreamEvent::Completed => None,
            })
            .collect();

        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].tool_calls[0].id.as_deref(), Some("call_1"));
        assert_eq!(deltas[0].tool_calls[0].name.as_deref(), Some("apply_edit"));
        assert_eq!(deltas[1].tool_calls[0].id, None);
        assert_eq!(
            deltas[1].tool_calls[0].arguments.as_deref(),
            Some("{\"code_output\":\"x\"}")
        );
    }

    #[tokio::test]
    async fn stream_end_without_done_still_completes() {
        let events = run_sse(&[r#"{"choices":[{"delta":{"content":"hi"}}]}"#]).await;
        assert!(matches!(
            events.last().map(|e| e.as_ref().unwrap()),
            Some(StreamEvent::Completed)
        ));
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let events = run_sse(&["not json", r#"{"choices":[{"delta":{"content":"ok"}}]}"#, "[DONE]"])
            .await;
        let texts: Vec<String> = events
            .into_iter()
            .filter_map(|event| match event.unwrap() {
                StreamEvent::Delta(delta) => delta.content,
                StreamEvent::Completed => None,
            })
            .collect();
        assert_eq!(texts, vec!["ok"]);
    }
}
