//! SSE chunk decoding and re-encoding for streamed chat completions.
//!
//! The upstream may split its `data: ...` frames across reads however it
//! likes; the decoder buffers partial lines until a newline completes them
//! and re-emits every surviving frame in canonical `data: <json>\n\n`
//! framing. A malformed JSON payload is dropped and the stream continues
//! (upstream hiccup), while connection loss is terminal. That asymmetry is
//! deliberate and covered by tests.

use bytes::Bytes;

/// Literal sentinel payload that closes a stream.
pub const DONE_SENTINEL: &str = "[DONE]";

const DATA_PREFIX: &[u8] = b"data:";

/// Incremental decoder for one streaming session.
#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Bytes accumulated since the last frame boundary.
    partial: Vec<u8>,
    terminal: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw upstream bytes, returning zero or more re-encoded frames.
    ///
    /// Once the `[DONE]` sentinel has been seen no further frames are
    /// produced; any bytes after it accumulate as trailing garbage and make
    /// the session dirty (see [`SseDecoder::is_clean`]).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        if self.terminal {
            self.partial.extend_from_slice(chunk);
            return Vec::new();
        }

        self.partial.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(newline) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=newline).collect();
            let line = strip_line_ending(&line);

            if let Some(frame) = self.decode_line(line) {
                frames.push(frame);
            }
            if self.terminal {
                break;
            }
        }

        frames
    }

    fn decode_line(&mut self, line: &[u8]) -> Option<Bytes> {
        // Blank separator lines and non-data fields (event:, id:, comments)
        // carry nothing the relay forwards.
        if !line.starts_with(DATA_PREFIX) {
            return None;
        }

        let payload = trim_leading_space(&line[DATA_PREFIX.len()..]);

        if payload == DONE_SENTINEL.as_bytes() {
            self.terminal = true;
            return Some(Bytes::from_static(b"data: [DONE]\n\n"));
        }

        match std::str::from_utf8(payload) {
            Ok(text) if serde_json::from_str::<serde::de::IgnoredAny>(text).is_ok() => {
                Some(Bytes::from(format!("data: {text}\n\n")))
            }
            _ => {
                // Upstream hiccup: drop the frame, keep the stream alive.
                tracing::debug!(bytes = payload.len(), "dropping malformed SSE frame");
                None
            }
        }
    }

    /// Whether the `[DONE]` sentinel has been seen.
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// A session is clean when it terminated via `[DONE]` and nothing but
    /// the sentinel's own blank-line framing trails it. Only clean sessions
    /// may return their upstream connection to the pool.
    pub fn is_clean(&self) -> bool {
        self.terminal && self.partial.iter().all(|&b| b == b'\n' || b == b'\r')
    }
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim_leading_space(payload: &[u8]) -> &[u8] {
    payload.strip_prefix(b" ").unwrap_or(payload)
}
