use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Line prefix carrying a frame's JSON payload.
const DATA_PREFIX: &[u8] = b"data: ";

/// Incremental decoder for `data: <json>` frames terminated by a blank line.
///
/// Read boundaries are independent of frame boundaries: a chunk may end in
/// the middle of a frame, a line, or a multi-byte character. The decoder
/// keeps one growing byte buffer and emits a frame only once its `\n\n`
/// terminator has arrived, so feeding the same bytes split at any offset
/// yields the same event sequence. Both halves of the pipeline use it: the
/// gateway client for upstream events, the consumer for relay frames.
pub struct FrameDecoder<T> {
    buf: Vec<u8>,
    _payload: PhantomData<T>,
}

impl<T: DeserializeOwned> FrameDecoder<T> {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            _payload: PhantomData,
        }
    }

    /// Append one read's worth of bytes and return every frame that became
    /// complete. A complete frame whose payload is not valid JSON is
    /// malformed input (the terminator rules out "still arriving") and is
    /// dropped with a warning.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<T> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(end) = find_terminator(&self.buf) {
            let frame: Vec<u8> = self.buf.drain(..end + 2).collect();
            for payload in data_payloads(&frame[..end]) {
                match serde_json::from_slice(payload) {
                    Ok(value) => out.push(value),
                    Err(e) => warn!("dropping malformed frame: {e}"),
                }
            }
        }
        out
    }

    /// End of stream. Any residual bytes are a truncated frame that can
    /// never complete; returns how many were discarded.
    pub fn finish(self) -> usize {
        self.buf.len()
    }
}

impl<T: DeserializeOwned> Default for FrameDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/// The JSON payloads of one frame, one per `data: ` line in order; every
/// other line (comments, event names, blanks) is ignored.
fn data_payloads(frame: &[u8]) -> impl Iterator<Item = &[u8]> {
    frame.split(|&b| b == b'\n').filter_map(|line| {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        line.strip_prefix(DATA_PREFIX)
    })
}

/// Encode one value as a `data: <json>` frame with its blank-line terminator.
pub fn encode_frame<T: Serialize>(value: &T) -> serde_json::Result<String> {
    Ok(format!("data: {}\n\n", serde_json::to_string(value)?))
}
