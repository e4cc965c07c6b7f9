//! SSE reframing between upstream chunk boundaries and downstream event
//! boundaries.
//!
//! Upstream bytes arrive at arbitrary boundaries; frames end on a blank line.
//! Only `data:` lines are surfaced, and the `[DONE]` sentinel is mapped to a
//! dedicated payload so the caller can terminate the session.

use std::sync::LazyLock;

use bytes::{Bytes, BytesMut};
use memchr::memmem;

use crate::protocol::anthropic::StreamEvent;
use crate::protocol::openai::ChatUsage;

static FRAME_BOUNDARY: LazyLock<memmem::Finder<'static>> =
    LazyLock::new(|| memmem::Finder::new(b"\n\n"));
static USAGE_KEY: LazyLock<memmem::Finder<'static>> =
    LazyLock::new(|| memmem::Finder::new(b"\"usage\""));

/// A payload extracted from one upstream SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    /// The payload of a `data: ` line.
    Data(String),
    /// The literal `[DONE]` terminator.
    Done,
}

/// Incremental reframer for an upstream SSE byte stream.
///
/// The unterminated remainder is buffered between `feed` calls, so frame
/// terminators split across chunk boundaries are handled transparently.
#[derive(Debug, Default)]
pub struct SseReframer {
    buffer: BytesMut,
}

impl SseReframer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Feed a raw byte chunk, appending extracted payloads to `out`.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<FramePayload>) {
        self.buffer.extend_from_slice(chunk);
        while let Some(boundary) = FRAME_BOUNDARY.find(&self.buffer) {
            let frame = self.buffer.split_to(boundary + 2);
            extract_data_lines(&frame, out);
        }
    }

    /// Drain the tail buffer as a final (unterminated) frame at stream end.
    pub fn finish(&mut self, out: &mut Vec<FramePayload>) {
        if self.buffer.is_empty() {
            return;
        }
        let tail = self.buffer.split();
        extract_data_lines(&tail, out);
    }
}

fn extract_data_lines(frame: &[u8], out: &mut Vec<FramePayload>) {
    for line in frame.split(|&byte| byte == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(payload) = line.strip_prefix(b"data: ") else {
            continue;
        };
        if payload.trim_ascii() == b"[DONE]" {
            out.push(FramePayload::Done);
            continue;
        }
        match std::str::from_utf8(payload) {
            Ok(text) => out.push(FramePayload::Data(text.to_string())),
            Err(_) => tracing::debug!("dropping non-UTF-8 SSE data line"),
        }
    }
}

/// Best-effort extraction of an embedded usage object from a data payload.
///
/// Some upstreams attach the terminal usage block after the final delta; this
/// side channel captures it without requiring the full chunk to parse.
#[must_use]
pub fn sniff_usage(data: &str) -> Option<ChatUsage> {
    USAGE_KEY.find(data.as_bytes())?;
    let value: serde_json::Value = serde_json::from_str(data).ok()?;
    let usage = value.get("usage")?;
    serde_json::from_value(usage.clone()).ok()
}

/// Render a named downstream SSE frame: `event: <name>\ndata: <json>\n\n`.
#[must_use]
pub fn encode_event_frame(event_name: &str, json: &str) -> Bytes {
    let mut out = String::with_capacity(18 + event_name.len() + json.len());
    out.push_str("event: ");
    out.push_str(event_name);
    out.push_str("\ndata: ");
    out.push_str(json);
    out.push_str("\n\n");
    Bytes::from(out)
}

/// Serialize and frame one downstream stream event.
#[must_use]
pub fn encode_stream_event(event: &StreamEvent) -> Bytes {
    let json = serde_json::to_string(event).unwrap_or_default();
    encode_event_frame(event.event_name(), &json)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(chunks: &[&[u8]]) -> Vec<FramePayload> {
        let mut reframer = SseReframer::new();
        let mut out = Vec::new();
        for chunk in chunks {
            reframer.feed(chunk, &mut out);
        }
        reframer.finish(&mut out);
        out
    }

    #[test]
    fn test_single_frame() {
        let payloads = feed_all(&[b"data: {\"a\":1}\n\n"]);
        assert_eq!(payloads, vec![FramePayload::Data("{\"a\":1}".into())]);
    }

    #[test]
    fn test_multiple_frames_one_chunk() {
        let payloads = feed_all(&[b"data: first\n\ndata: second\n\n"]);
        assert_eq!(
            payloads,
            vec![
                FramePayload::Data("first".into()),
                FramePayload::Data("second".into()),
            ]
        );
    }

    #[test]
    fn test_boundary_split_across_chunks() {
        let payloads = feed_all(&[b"data: par", b"tial\n", b"\ndata: next\n\n"]);
        assert_eq!(
            payloads,
            vec![
                FramePayload::Data("partial".into()),
                FramePayload::Data("next".into()),
            ]
        );
    }

    #[test]
    fn test_done_sentinel() {
        let payloads = feed_all(&[b"data: {\"x\":1}\n\ndata: [DONE]\n\n"]);
        assert_eq!(
            payloads,
            vec![FramePayload::Data("{\"x\":1}".into()), FramePayload::Done]
        );
    }

    #[test]
    fn test_crlf_lines() {
        let payloads = feed_all(&[b"data: hello\r\n\n"]);
        assert_eq!(payloads, vec![FramePayload::Data("hello".into())]);
    }

    #[test]
    fn test_non_data_lines_are_ignored() {
        let payloads = feed_all(&[b": comment\nevent: ping\ndata: payload\n\n"]);
        assert_eq!(payloads, vec![FramePayload::Data("payload".into())]);
    }

    #[test]
    fn test_unterminated_tail_flushes_on_finish() {
        let payloads = feed_all(&[b"data: [DONE]"]);
        assert_eq!(payloads, vec![FramePayload::Done]);
    }

    #[test]
    fn test_sniff_usage() {
        let usage = sniff_usage(
            r#"{"choices":[],"usage":{"prompt_tokens":4,"completion_tokens":6,"total_tokens":10}}"#,
        )
        .unwrap();
        assert_eq!(usage.prompt_tokens, 4);
        assert_eq!(usage.completion_tokens, 6);

        assert!(sniff_usage(r#"{"choices":[{"delta":{"content":"hi"}}]}"#).is_none());
        assert!(sniff_usage("not json \"usage\"").is_none());
        assert!(sniff_usage(r#"{"usage":null}"#).is_none());
    }

    #[test]
    fn test_encode_event_frame() {
        let frame = encode_event_frame("message_stop", "{\"type\":\"message_stop\"}");
        assert_eq!(
            frame,
            Bytes::from_static(b"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n")
        );
    }

    #[test]
    fn test_encode_stream_event_round_trips() {
        let frame = encode_stream_event(&StreamEvent::ContentBlockStop { index: 1 });
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("event: content_block_stop\ndata: "));
        assert!(text.ends_with("\n\n"));
    }
}
