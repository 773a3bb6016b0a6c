//! Incremental decoder that renders a streamed JSON object as plain text.
//!
//! The input is exactly one object whose values are strings, numbers,
//! booleans, or null. For each field the decoder emits `"<key>:\n"` followed
//! by the value rendered as text (strings unescaped, literals verbatim) with
//! a terminating newline. String values are forwarded as soon as their bytes
//! arrive: whenever the next read would block, everything decoded so far is
//! flushed to the consumer. Truncated payloads keep whatever was already
//! emitted; the resulting error is marked partial.

use std::io;

use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::BufReader;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum JsonStreamError {
    #[error("unexpected end of JSON input")]
    UnexpectedEof,

    #[error("expected '{expected}', got '{found}'")]
    UnexpectedByte { expected: char, found: char },

    #[error("expected ',' between object fields")]
    MissingComma,

    #[error("unsupported json stream value type {0}")]
    UnsupportedValue(char),

    #[error("invalid escape sequence \\{0}")]
    InvalidEscape(char),

    #[error("invalid unicode escape")]
    InvalidUnicode,

    #[error("output channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Io(#[from] io::Error),

    /// The inner error struck after at least one chunk reached the consumer.
    #[error("{0}")]
    Partial(#[source] Box<JsonStreamError>),
}

impl JsonStreamError {
    pub fn is_partial(&self) -> bool {
        matches!(self, JsonStreamError::Partial(_))
    }
}

pub struct JsonStreamDecoder<R> {
    reader: BufReader<R>,
    emitted: bool,
}

impl<R: AsyncRead + Unpin> JsonStreamDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            emitted: false,
        }
    }

    /// Decodes the object, sending each rendered chunk to `out`.
    pub async fn stream(&mut self, out: &mpsc::Sender<String>) -> Result<(), JsonStreamError> {
        match self.stream_object(out).await {
            Ok(()) => Ok(()),
            Err(JsonStreamError::ChannelClosed) => Err(JsonStreamError::ChannelClosed),
            Err(err) if self.emitted => Err(JsonStreamError::Partial(Box::new(err))),
            Err(err) => Err(err),
        }
    }

    async fn stream_object(&mut self, out: &mpsc::Sender<String>) -> Result<(), JsonStreamError> {
        self.skip_spaces().await?;
        self.expect_byte(b'{').await?;

        let mut first = true;
        loop {
            self.skip_spaces().await?;
            let Some(next) = self.peek_byte().await? else {
                return Err(JsonStreamError::UnexpectedEof);
            };
            if next == b'}' {
                self.reader.consume(1);
                break;
            }
            if !first {
                if next != b',' {
                    return Err(JsonStreamError::MissingComma);
                }
                self.reader.consume(1);
                self.skip_spaces().await?;
            }

            self.expect_byte(b'"').await?;
            let key = self.read_key().await?;
            self.emit(out, format!("{key}:\n")).await?;

            self.skip_spaces().await?;
            self.expect_byte(b':').await?;
            self.skip_spaces().await?;
            self.read_value(out).await?;
            first = false;
        }
        Ok(())
    }

    async fn emit(
        &mut self,
        out: &mpsc::Sender<String>,
        chunk: String,
    ) -> Result<(), JsonStreamError> {
        out.send(chunk)
            .await
            .map_err(|_| JsonStreamError::ChannelClosed)?;
        self.emitted = true;
        Ok(())
    }

    async fn peek_byte(&mut self) -> Result<Option<u8>, JsonStreamError> {
        let buf = self.reader.fill_buf().await?;
        Ok(buf.first().copied())
    }

    async fn next_byte(&mut self) -> Result<Option<u8>, JsonStreamError> {
        let byte = self.peek_byte().await?;
        if byte.is_some() {
            self.reader.consume(1);
        }
        Ok(byte)
    }

    async fn require_byte(&mut self) -> Result<u8, JsonStreamError> {
        self.next_byte()
            .await?
            .ok_or(JsonStreamError::UnexpectedEof)
    }

    async fn expect_byte(&mut self, expected: u8) -> Result<(), JsonStreamError> {
        let found = self.require_byte().await?;
        if found != expected {
            return Err(JsonStreamError::UnexpectedByte {
                expected: expected as char,
                found: found as char,
            });
        }
        Ok(())
    }

    async fn skip_spaces(&mut self) -> Result<(), JsonStreamError> {
        while let Some(byte) = self.peek_byte().await? {
            if !is_space(byte) {
                break;
            }
            self.reader.consume(1);
        }
        Ok(())
    }

    async fn read_key(&mut self) -> Result<String, JsonStreamError> {
        let mut key: Vec<u8> = Vec::new();
        loop {
            match self.require_byte().await? {
                b'"' => return Ok(String::from_utf8_lossy(&key).into_owned()),
                b'\\' => key.extend_from_slice(self.read_escape().await?.as_bytes()),
                byte => key.push(byte),
            }
        }
    }

    async fn read_value(&mut self, out: &mpsc::Sender<String>) -> Result<(), JsonStreamError> {
        let Some(byte) = self.peek_byte().await? else {
            return Err(JsonStreamError::UnexpectedEof);
        };
        match byte {
            b'"' => {
                self.reader.consume(1);
                self.read_string_value(out).await
            }
            b'{' | b'[' => Err(JsonStreamError::UnsupportedValue(byte as char)),
            _ => self.read_literal_value(out).await,
        }
    }

    async fn read_string_value(
        &mut self,
        out: &mpsc::Sender<String>,
    ) -> Result<(), JsonStreamError> {
        let mut pending: Vec<u8> = Vec::new();
        let mut tail_newline = false;
        let mut flushed = false;

        loop {
            // Forward what we have before a read that would block, so the
            // consumer sees string bytes as soon as the stream delivers them.
            if self.reader.buffer().is_empty() && !pending.is_empty() {
                let chunk = take_valid_prefix(&mut pending);
                if !chunk.is_empty() {
                    tail_newline = chunk.ends_with('\n');
                    flushed = true;
                    self.emit(out, chunk).await?;
                }
            }

            match self.next_byte().await? {
                None => {
                    if !pending.is_empty() {
                        let chunk =
                            ensure_trailing_newline(String::from_utf8_lossy(&pending).into_owned());
                        self.emit(out, chunk).await?;
                    }
                    return Err(JsonStreamError::UnexpectedEof);
                }
                Some(b'"') => {
                    if !pending.is_empty() {
                        let chunk =
                            ensure_trailing_newline(String::from_utf8_lossy(&pending).into_owned());
                        self.emit(out, chunk).await?;
                    } else if !flushed || !tail_newline {
                        self.emit(out, "\n".to_string()).await?;
                    }
                    return Ok(());
                }
                Some(b'\\') => match self.read_escape().await {
                    Ok(decoded) => pending.extend_from_slice(decoded.as_bytes()),
                    Err(err) => {
                        if !pending.is_empty() {
                            let chunk = ensure_trailing_newline(
                                String::from_utf8_lossy(&pending).into_owned(),
                            );
                            self.emit(out, chunk).await?;
                        }
                        return Err(err);
                    }
                },
                Some(byte) => pending.push(byte),
            }
        }
    }

    async fn read_literal_value(
        &mut self,
        out: &mpsc::Sender<String>,
    ) -> Result<(), JsonStreamError> {
        let mut literal: Vec<u8> = Vec::new();
        loop {
            let Some(byte) = self.peek_byte().await? else {
                // A literal cut off by EOF is complete if any of it arrived.
                if literal.is_empty() {
                    return Err(JsonStreamError::UnexpectedEof);
                }
                break;
            };
            if byte == b',' || byte == b'}' {
                break;
            }
            self.reader.consume(1);
            if is_space(byte) {
                self.skip_spaces().await?;
                break;
            }
            literal.push(byte);
        }
        if literal.is_empty() {
            return Err(JsonStreamError::UnexpectedEof);
        }
        let chunk = ensure_trailing_newline(String::from_utf8_lossy(&literal).into_owned());
        self.emit(out, chunk).await
    }

    async fn read_escape(&mut self) -> Result<String, JsonStreamError> {
        match self.require_byte().await? {
            b'u' => self.read_unicode_escape().await,
            byte => simple_escape(byte),
        }
    }

    async fn read_hex4(&mut self) -> Result<u32, JsonStreamError> {
        let mut value = 0u32;
        for _ in 0..4 {
            let byte = self.require_byte().await?;
            let digit = (byte as char)
                .to_digit(16)
                .ok_or(JsonStreamError::InvalidUnicode)?;
            value = value * 16 + digit;
        }
        Ok(value)
    }

    async fn read_unicode_escape(&mut self) -> Result<String, JsonStreamError> {
        let high = self.read_hex4().await?;
        if !(0xD800..0xDC00).contains(&high) {
            return Ok(char_or_replacement(high).to_string());
        }

        // High surrogate: pair it with a following \uXXXX when present.
        if self.peek_byte().await? != Some(b'\\') {
            return Ok(char::REPLACEMENT_CHARACTER.to_string());
        }
        self.reader.consume(1);
        match self.require_byte().await? {
            b'u' => {
                let low = self.read_hex4().await?;
                if (0xDC00..0xE000).contains(&low) {
                    let code = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                    Ok(char_or_replacement(code).to_string())
                } else {
                    let mut both = char::REPLACEMENT_CHARACTER.to_string();
                    both.push(char_or_replacement(low));
                    Ok(both)
                }
            }
            // The backslash opened an ordinary escape; decode it after the
            // unpaired surrogate.
            byte => {
                let mut text = char::REPLACEMENT_CHARACTER.to_string();
                text.push_str(&simple_escape(byte)?);
                Ok(text)
            }
        }
    }
}

fn simple_escape(byte: u8) -> Result<String, JsonStreamError> {
    let decoded = match byte {
        b'"' => '"',
        b'\\' => '\\',
        b'/' => '/',
        b'b' => '\u{0008}',
        b'f' => '\u{000C}',
        b'n' => '\n',
        b'r' => '\r',
        b't' => '\t',
        other => return Err(JsonStreamError::InvalidEscape(other as char)),
    };
    Ok(decoded.to_string())
}

fn char_or_replacement(code: u32) -> char {
    char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER)
}

/// Splits off the longest valid-UTF-8 prefix of `pending`, leaving any
/// incomplete trailing sequence for the next flush.
fn take_valid_prefix(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let out = text.to_string();
            pending.clear();
            out
        }
        Err(err) => {
            let rest = pending.split_off(err.valid_up_to());
            let out = String::from_utf8_lossy(pending).into_owned();
            *pending = rest;
            out
        }
    }
}

fn ensure_trailing_newline(mut text: String) -> String {
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

fn is_space(byte: u8) -> bool {
    matches!(byte, b' ' | b'\n' | b'\r' | b'\t')
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncWriteExt;

    use super::*;

    async fn decode(input: &str) -> (Vec<String>, Result<(), JsonStreamError>) {
        let (tx, mut rx) = mpsc::channel(64);
        let mut decoder = JsonStreamDecoder::new(input.as_bytes());
        let result = decoder.stream(&tx).await;
        drop(tx);
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        (chunks, result)
    }

    #[tokio::test]
    async fn renders_keys_and_string_values() {
        let (chunks, result) = decode(r#"{"k1":"v1","k2":"v2"}"#).await;
        result.unwrap();
        assert_eq!(chunks.concat(), "k1:\nv1\nk2:\nv2\n");
    }

    #[tokio::test]
    async fn renders_literals_as_text() {
        let (chunks, result) = decode(r#"{"a":123,"b":true,"c":null}"#).await;
        result.unwrap();
        assert_eq!(chunks.concat(), "a:\n123\nb:\ntrue\nc:\nnull\n");
    }

    #[tokio::test]
    async fn unescapes_string_values() {
        let (chunks, result) = decode(r#"{"k":"a\nb\t\"q\"\\"}"#).await;
        result.unwrap();
        assert_eq!(chunks.concat(), "k:\na\nb\t\"q\"\\\n");
    }

    #[tokio::test]
    async fn decodes_surrogate_pairs() {
        let (chunks, result) = decode(r#"{"k":"\uD83D\uDE00"}"#).await;
        result.unwrap();
        assert_eq!(chunks.concat(), "k:\n\u{1F600}\n");
    }

    #[tokio::test]
    async fn decodes_basic_unicode_escape() {
        let (chunks, result) = decode(r#"{"k":"\u00e9"}"#).await;
        result.unwrap();
        assert_eq!(chunks.concat(), "k:\né\n");
    }

    #[tokio::test]
    async fn empty_string_value_still_terminates_with_newline() {
        let (chunks, result) = decode(r#"{"k":""}"#).await;
        result.unwrap();
        assert_eq!(chunks.concat(), "k:\n\n");
    }

    #[tokio::test]
    async fn nested_values_are_rejected() {
        let (_, result) = decode(r#"{"k":{"nested":1}}"#).await;
        let err = result.unwrap_err();
        // The key was already emitted, so the rejection is wrapped partial.
        assert!(err.is_partial(), "{err}");
        assert!(err.to_string().contains("unsupported"), "{err}");
    }

    #[tokio::test]
    async fn eof_before_any_output_is_not_partial() {
        let (chunks, result) = decode("   ").await;
        let err = result.unwrap_err();
        assert!(!err.is_partial(), "{err}");
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn missing_comma_is_reported() {
        let (_, result) = decode(r#"{"a":"x" "b":"y"}"#).await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("','"), "{err}");
    }

    #[tokio::test]
    async fn truncated_string_value_keeps_partial_output() {
        let (writer, reader) = tokio::io::duplex(256);
        let (tx, mut rx) = mpsc::channel(64);

        let decoder = tokio::spawn(async move {
            let mut decoder = JsonStreamDecoder::new(reader);
            decoder.stream(&tx).await
        });

        let mut writer = writer;
        writer.write_all(b"{\"code_output\":\"").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "code_output:\n");

        writer.write_all(b"partial value").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "partial value");

        drop(writer);
        let err = decoder.await.unwrap().unwrap_err();
        assert!(err.is_partial(), "{err}");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn long_values_stream_before_the_closing_quote() {
        let (writer, reader) = tokio::io::duplex(256);
        let (tx, mut rx) = mpsc::channel(64);

        let decoder = tokio::spawn(async move {
            let mut decoder = JsonStreamDecoder::new(reader);
            decoder.stream(&tx).await
        });

        let mut writer = writer;
        writer.write_all(b"{\"k\":\"abc").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "k:\n");
        // The first fragment arrives before the closing quote exists.
        assert_eq!(rx.recv().await.unwrap(), "abc");

        writer.write_all(b"def\"}").await.unwrap();
        drop(writer);
        decoder.await.unwrap().unwrap();
        assert_eq!(rx.recv().await.unwrap(), "def\n");
        assert!(rx.recv().await.is_none());
    }
}
