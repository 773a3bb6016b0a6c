//! Renders one streamed tool call for the transcript.
//!
//! The classifier owns the write side of a byte pipe and feeds it raw JSON
//! argument fragments as they arrive; a dedicated task owns the read side and
//! runs the incremental [`JsonStreamDecoder`] over it, emitting decoded
//! chunks to the output channel. Closing the writer is the signal for the
//! decoder task to drain. Rendering is advisory: decoder failures are logged
//! and never fail the run, because the complete argument text still reaches
//! the tool through the dispatch path.

use tokio::io::AsyncWriteExt;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::json_stream::JsonStreamDecoder;
use crate::models::ToolCallDelta;

const ARGUMENT_PIPE_CAPACITY: usize = 4096;

pub(crate) struct ToolCallStreamer {
    id: String,
    name: String,
    header_emitted: bool,
    writer: Option<DuplexStream>,
    out: mpsc::Sender<String>,
    decoder: JoinHandle<()>,
}

impl ToolCallStreamer {
    pub(crate) fn new(id: String, out: mpsc::Sender<String>) -> Self {
        let (writer, reader) = tokio::io::duplex(ARGUMENT_PIPE_CAPACITY);
        let decoder_out = out.clone();
        let decoder = tokio::spawn(async move {
            let mut decoder = JsonStreamDecoder::new(reader);
            if let Err(err) = decoder.stream(&decoder_out).await {
                if err.is_partial() {
                    debug!(%err, "partially decoded tool arguments");
                } else {
                    debug!(%err, "failed to decode tool arguments");
                }
            }
        });
        Self {
            id,
            name: String::new(),
            header_emitted: false,
            writer: Some(writer),
            out,
            decoder,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// Feeds one fragment: name pieces accumulate; the first fragment that
    /// carries argument bytes emits the header, then bytes go to the pipe.
    pub(crate) async fn on_fragment(&mut self, fragment: &ToolCallDelta) {
        if let Some(name) = &fragment.name {
            self.name.push_str(name);
        }
        let Some(arguments) = fragment.arguments.as_deref().filter(|a| !a.is_empty()) else {
            return;
        };

        if !self.header_emitted {
            self.header_emitted = true;
            if !self.id.is_empty() {
                let _ = self.out.send(format!("\nTool call id: {}\n", self.id)).await;
            }
            let _ = self
                .out
                .send(format!("Tool call function name: {}\n", self.name))
                .await;
            let _ = self.out.send("Tool call arguments:\n".to_string()).await;
        }

        if let Some(writer) = &mut self.writer {
            if let Err(err) = writer.write_all(arguments.as_bytes()).await {
                debug!(%err, "tool argument pipe closed early");
                self.writer = None;
            }
        }
    }

    /// Closes the writer exactly once and waits for the decoder to drain, so
    /// everything this call decoded reaches the sink before what follows.
    pub(crate) async fn close(mut self) {
        self.writer.take();
        let _ = self.decoder.await;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn fragment(
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> ToolCallDelta {
        ToolCallDelta {
            index: 0,
            id: id.map(str::to_string),
            name: name.map(str::to_string),
            arguments: arguments.map(str::to_string),
        }
    }

    async fn drain(mut rx: mpsc::Receiver<String>) -> Vec<String> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn header_is_emitted_once_and_arguments_are_decoded() {
        let (tx, rx) = mpsc::channel(64);
        let mut streamer = ToolCallStreamer::new("call_1".to_string(), tx);

        streamer
            .on_fragment(&fragment(Some("call_1"), Some("apply_edit"), None))
            .await;
        streamer
            .on_fragment(&fragment(None, None, Some("{\"code_output\":\"")))
            .await;
        streamer
            .on_fragment(&fragment(None, None, Some("patch text\"}")))
            .await;
        streamer.close().await;

        let chunks = drain(rx).await;
        let transcript = chunks.concat();
        assert_eq!(
            transcript.matches("Tool call function name: apply_edit\n").count(),
            1
        );
        assert!(transcript.starts_with("\nTool call id: call_1\n"), "{transcript}");
        assert!(transcript.contains("Tool call arguments:\n"), "{transcript}");
        assert!(transcript.ends_with("code_output:\npatch text\n"), "{transcript}");
    }

    #[tokio::test]
    async fn no_header_without_argument_bytes() {
        let (tx, rx) = mpsc::channel(64);
        let mut streamer = ToolCallStreamer::new("call_1".to_string(), tx);

        streamer
            .on_fragment(&fragment(Some("call_1"), Some("finalize_task"), None))
            .await;
        streamer.on_fragment(&fragment(None, None, Some(""))).await;
        streamer.close().await;

        let chunks = drain(rx).await;
        assert!(chunks.is_empty(), "{chunks:?}");
    }

    #[tokio::test]
    async fn name_fragments_accumulate_before_the_header() {
        let (tx, rx) = mpsc::channel(64);
        let mut streamer = ToolCallStreamer::new(String::new(), tx);

        streamer.on_fragment(&fragment(None, Some("apply"), None)).await;
        streamer.on_fragment(&fragment(None, Some("_edit"), None)).await;
        streamer
            .on_fragment(&fragment(None, None, Some("{\"k\":\"v\"}")))
            .await;
        streamer.close().await;

        let transcript = drain(rx).await.concat();
        // No id line when the fragment never carried an id.
        assert!(
            transcript.starts_with("Tool call function name: apply_edit\n"),
            "{transcript}"
        );
    }

    #[tokio::test]
    async fn close_drains_the_decoder_before_returning() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut streamer = ToolCallStreamer::new("a".to_string(), tx.clone());
        streamer
            .on_fragment(&fragment(None, Some("first"), Some("{\"k\":\"v\"}")))
            .await;
        streamer.close().await;

        // Everything from call A must already be buffered ahead of this
        // marker sent after close() returned.
        tx.send("MARKER".to_string()).await.unwrap();
        drop(tx);

        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        let marker_at = chunks.iter().position(|c| c == "MARKER").unwrap();
        assert_eq!(marker_at, chunks.len() - 1);
        assert!(chunks[..marker_at].concat().contains("k:\nv\n"));
    }
}
