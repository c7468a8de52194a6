use crate::error::StreamError;
use crate::protocol::StreamChunk;
use crate::util::truncate_chars;

use super::splitter::Frame;

/// Payload that marks explicit end of stream.
pub const DONE_SENTINEL: &str = "[DONE]";

const PAYLOAD_PREVIEW_MAX_CHARS: usize = 120;

/// Result of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    /// The `[DONE]` sentinel.
    Terminate,
    Chunk(StreamChunk),
    /// The payload was not a valid chunk; the stream carries on.
    Skip(StreamError),
}

/// Check whether a frame payload is exactly the termination sentinel.
///
/// Surrounding whitespace makes it an ordinary (malformed) payload.
#[must_use]
pub fn is_done_payload(payload: &str) -> bool {
    payload == DONE_SENTINEL
}

/// Decode a data frame into a chunk, the sentinel, or a skip diagnostic.
#[must_use]
pub fn decode_frame(frame: &Frame) -> FrameEvent {
    let payload = frame.payload();
    if is_done_payload(payload) {
        return FrameEvent::Terminate;
    }
    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => FrameEvent::Chunk(chunk),
        Err(err) => FrameEvent::Skip(StreamError::Decode {
            payload_preview: truncate_chars(payload, PAYLOAD_PREVIEW_MAX_CHARS),
            message: err.to_string(),
        }),
    }
}
