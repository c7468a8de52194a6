//! Completions stream decoding: bytes -> text -> frames -> chunks.
pub mod decoder;
pub mod event;
pub mod splitter;

pub use decoder::Utf8StreamDecoder;
pub use event::{decode_frame, is_done_payload, FrameEvent, DONE_SENTINEL};
pub use splitter::{Frame, FrameBatch, LineSplitter, DATA_PREFIX};

use smallvec::SmallVec;

use crate::error::StreamError;

/// Byte-to-event pipeline for a single response body.
///
/// Chains [`Utf8StreamDecoder`], [`LineSplitter`] and [`decode_frame`]. It
/// never suspends; the caller owns the read loop.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    bytes: Utf8StreamDecoder,
    lines: LineSplitter,
    text: String,
    frames: FrameBatch,
}

impl ChunkDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one body chunk and append its complete frames to `out`.
    pub fn feed_frames_into(&mut self, bytes: &[u8], out: &mut FrameBatch) {
        self.text.clear();
        self.bytes.feed_into(bytes, &mut self.text);
        self.lines.push_into(&self.text, out);
    }

    /// Feed one body chunk and return its decoded frame events in order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<FrameEvent> {
        let mut out = Vec::new();
        self.feed_into(bytes, &mut out);
        out
    }

    /// Feed one body chunk and append decoded frame events to `out`.
    pub fn feed_into(&mut self, bytes: &[u8], out: &mut Vec<FrameEvent>) {
        let mut frames = std::mem::take(&mut self.frames);
        self.feed_frames_into(bytes, &mut frames);
        out.extend(frames.drain(..).map(|frame| decode_frame(&frame)));
        self.frames = frames;
    }

    /// Flush both stages at end of body, returning any absorbed diagnostics.
    pub fn finish(&mut self) -> SmallVec<[StreamError; 2]> {
        let mut diagnostics = SmallVec::new();
        if let Err(err) = self.bytes.finish() {
            diagnostics.push(err);
        }
        if let Err(err) = self.lines.finish() {
            diagnostics.push(err);
        }
        diagnostics
    }

    /// Complete lines seen so far that were not data frames.
    #[must_use]
    pub fn ignored_lines(&self) -> usize {
        self.lines.ignored_lines()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_handles_split_character_inside_payload() {
        let body = "data: {\"id\":\"c\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"é\"}}]}\n";
        let bytes = body.as_bytes();
        let split = body.find('é').unwrap() + 1;
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.feed(&bytes[..split]).is_empty());
        let events = decoder.feed(&bytes[split..]);
        assert_eq!(events.len(), 1);
        let FrameEvent::Chunk(chunk) = &events[0] else {
            panic!("expected chunk");
        };
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("é"));
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_finish_collects_both_diagnostics() {
        let mut decoder = ChunkDecoder::new();
        let mut bytes = b"data: {\"tail\":\"".to_vec();
        bytes.extend_from_slice(&"😀".as_bytes()[..2]);
        assert!(decoder.feed(&bytes).is_empty());
        let diagnostics = decoder.finish();
        assert_eq!(
            diagnostics.as_slice(),
            &[
                StreamError::Encoding { dropped_bytes: 2 },
                StreamError::TruncatedFrame { bytes: 15 },
            ]
        );
    }
}
