//! JSON-RPC 2.0 framing and child-stream decoding.
//!
//! Messages travel as newline-delimited UTF-8 JSON. When a container
//! runtime multiplexes stdout/stderr into a single stream, each frame
//! carries an 8-byte header (stream id, three reserved bytes, big-endian
//! payload length) that must be stripped before JSON parsing; only the
//! stdout stream contributes to the message path.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC protocol version.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error code for an unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Multiplexed stream id carrying the message path.
pub const STDOUT_STREAM_ID: u8 = 1;

/// Multiplexed stream id carrying diagnostics.
pub const STDERR_STREAM_ID: u8 = 2;

const FRAME_HEADER_LEN: usize = 8;

/// A JSON-RPC request or notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version, always `"2.0"`.
    pub jsonrpc: String,
    /// Request id; absent for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a request expecting a response.
    #[must_use]
    pub fn new(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// Create a notification (no response expected).
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i64,
    /// Error message.
    pub message: String,
    /// Optional structured data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version.
    pub jsonrpc: String,
    /// Id of the request this answers.
    pub id: Option<i64>,
    /// Success payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// Encode a message as a newline-terminated frame.
///
/// # Errors
///
/// Returns an error if the message cannot be serialized.
pub fn encode_frame<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut frame = serde_json::to_string(message)?;
    frame.push('\n');
    Ok(frame)
}

/// Source of a decoded line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    /// Message path.
    Stdout,
    /// Diagnostics.
    Stderr,
    /// Any other multiplexed stream id; discarded from the message path.
    Other(u8),
}

/// One decoded line with its originating stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLine {
    /// Originating stream.
    pub source: StreamSource,
    /// Line content without the trailing newline.
    pub text: String,
}

enum DecodeMode {
    Undetected,
    Raw,
    Multiplexed,
}

/// Incremental decoder for a child's stdout byte stream.
///
/// Detects container-runtime multiplexing from the first bytes: a frame
/// header starts with a stream id of 0–2 followed by three zero bytes,
/// which never begins a raw UTF-8 JSON line. Partial frames and partial
/// lines are buffered until completed.
pub struct StreamDecoder {
    mode: DecodeMode,
    buf: Vec<u8>,
    stdout_line: Vec<u8>,
    stderr_line: Vec<u8>,
}

impl StreamDecoder {
    /// Create a decoder in detection mode.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: DecodeMode::Undetected,
            buf: Vec::new(),
            stdout_line: Vec::new(),
            stderr_line: Vec::new(),
        }
    }

    /// Feed bytes and collect any completed lines.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamLine> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();

        if matches!(self.mode, DecodeMode::Undetected) {
            if self.buf.is_empty() {
                return lines;
            }
            if self.buf[0] > STDERR_STREAM_ID {
                self.mode = DecodeMode::Raw;
            } else if self.buf.len() >= 4 {
                if self.buf[1..4] == [0, 0, 0] {
                    self.mode = DecodeMode::Multiplexed;
                } else {
                    self.mode = DecodeMode::Raw;
                }
            } else {
                // Not enough bytes to decide yet.
                return lines;
            }
        }

        match self.mode {
            DecodeMode::Raw => self.drain_lines(StreamSource::Stdout, &mut lines),
            DecodeMode::Multiplexed => self.drain_frames(&mut lines),
            DecodeMode::Undetected => {},
        }
        lines
    }

    /// Flush any buffered partial lines at end of stream.
    pub fn finish(&mut self) -> Vec<StreamLine> {
        let mut lines = Vec::new();
        let pending = std::mem::take(&mut self.buf);
        if matches!(self.mode, DecodeMode::Raw | DecodeMode::Undetected) && !pending.is_empty() {
            self.stdout_line.extend_from_slice(&pending);
        }
        for (source, acc) in [
            (StreamSource::Stdout, &mut self.stdout_line),
            (StreamSource::Stderr, &mut self.stderr_line),
        ] {
            let rest = std::mem::take(acc);
            if !rest.is_empty() {
                lines.push(StreamLine {
                    source,
                    text: String::from_utf8_lossy(&rest).into_owned(),
                });
            }
        }
        lines
    }

    fn drain_lines(&mut self, source: StreamSource, lines: &mut Vec<StreamLine>) {
        let pending = std::mem::take(&mut self.buf);
        Self::split_into(&mut self.stdout_line, &pending, source, lines);
    }

    fn drain_frames(&mut self, lines: &mut Vec<StreamLine>) {
        loop {
            if self.buf.len() < FRAME_HEADER_LEN {
                return;
            }
            let stream_id = self.buf[0];
            let len_bytes: [u8; 4] = [self.buf[4], self.buf[5], self.buf[6], self.buf[7]];
            let payload_len = u32::from_be_bytes(len_bytes) as usize;
            let frame_end = FRAME_HEADER_LEN.saturating_add(payload_len);
            if self.buf.len() < frame_end {
                return;
            }

            let payload: Vec<u8> = self.buf[FRAME_HEADER_LEN..frame_end].to_vec();
            self.buf.drain(..frame_end);

            match stream_id {
                STDOUT_STREAM_ID => {
                    Self::split_into(&mut self.stdout_line, &payload, StreamSource::Stdout, lines);
                },
                STDERR_STREAM_ID => {
                    Self::split_into(&mut self.stderr_line, &payload, StreamSource::Stderr, lines);
                },
                other => {
                    lines.push(StreamLine {
                        source: StreamSource::Other(other),
                        text: String::from_utf8_lossy(&payload).into_owned(),
                    });
                },
            }
        }
    }

    fn split_into(
        acc: &mut Vec<u8>,
        bytes: &[u8],
        source: StreamSource,
        lines: &mut Vec<StreamLine>,
    ) {
        for &byte in bytes {
            if byte == b'\n' {
                let line = std::mem::take(acc);
                lines.push(StreamLine {
                    source,
                    text: String::from_utf8_lossy(&line).into_owned(),
                });
            } else {
                acc.push(byte);
            }
        }
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mux_frame(stream_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![stream_id, 0, 0, 0];
        frame.extend_from_slice(&u32::try_from(payload.len()).unwrap().to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_request_wire_shape() {
        let request = JsonRpcRequest::new(7, "tools/list", None);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert!(value.get("params").is_none());
    }

    #[test]
    fn test_notification_has_no_id() {
        let note = JsonRpcRequest::notification("notifications/initialized", None);
        let value = serde_json::to_value(&note).unwrap();
        assert!(value.get("id").is_none());
    }

    #[test]
    fn test_encode_frame_newline_terminated() {
        let frame = encode_frame(&JsonRpcRequest::new(1, "ping", None)).unwrap();
        assert!(frame.ends_with('\n'));
        assert_eq!(frame.matches('\n').count(), 1);
    }

    #[test]
    fn test_raw_lines_with_partial_buffer() {
        let mut decoder = StreamDecoder::new();
        let lines = decoder.push(b"{\"a\":1}\n{\"b\"");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "{\"a\":1}");

        let lines = decoder.push(b":2}\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "{\"b\":2}");
        assert_eq!(lines[0].source, StreamSource::Stdout);
    }

    #[test]
    fn test_multiplexed_frames_split_by_stream() {
        let mut decoder = StreamDecoder::new();
        let mut bytes = mux_frame(STDOUT_STREAM_ID, b"{\"id\":1}\n");
        bytes.extend(mux_frame(STDERR_STREAM_ID, b"warn: slow\n"));

        let lines = decoder.push(&bytes);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].source, StreamSource::Stdout);
        assert_eq!(lines[0].text, "{\"id\":1}");
        assert_eq!(lines[1].source, StreamSource::Stderr);
        assert_eq!(lines[1].text, "warn: slow");
    }

    #[test]
    fn test_multiplexed_frame_across_pushes() {
        let mut decoder = StreamDecoder::new();
        let bytes = mux_frame(STDOUT_STREAM_ID, b"{\"id\":1}\n");
        let (head, tail) = bytes.split_at(10);

        assert!(decoder.push(head).is_empty());
        let lines = decoder.push(tail);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "{\"id\":1}");
    }

    #[test]
    fn test_non_stdout_frame_discarded_from_message_path() {
        let mut decoder = StreamDecoder::new();
        let lines = decoder.push(&mux_frame(0, b"stdin echo"));
        assert_eq!(lines.len(), 1);
        assert!(matches!(lines[0].source, StreamSource::Other(0)));
    }

    #[test]
    fn test_finish_flushes_partial_line() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.push(b"{\"tail\"").is_empty());
        let lines = decoder.finish();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "{\"tail\"");
    }
}
