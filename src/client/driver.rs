//! Stream driver: the read loop that turns a response body into ordered
//! [`StreamEvent`]s.
//!
//! The driver is the only suspension point of a stream. It waits on the next
//! body read (bounded by an optional per-read timeout) or on cancellation,
//! whichever comes first, and pushes decoded chunks into the channel before
//! reading again.
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::error::{ChatError, StreamError};
use crate::observability::{log_stream_failed, log_stream_summary, log_usage};
use crate::protocol::StreamChunk;
use crate::stream::{ChunkDecoder, FrameEvent};

/// Lifecycle of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connecting,
    Reading,
    Completed,
    Failed,
    Cancelled,
}

impl StreamState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Failed | StreamState::Cancelled
        )
    }
}

/// Summary delivered with a successful end of stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Completion {
    /// `false` when the body ended without a `[DONE]` frame.
    pub saw_sentinel: bool,
    pub chunks: usize,
    /// Malformed frames that were dropped.
    pub skipped: usize,
}

/// Item produced by a [`super::ChatStream`].
///
/// Every stream that is not cancelled ends with exactly one `Complete` or
/// `Error`, after its last `Chunk`.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(StreamChunk),
    Complete(Completion),
    Error(ChatError),
}

impl StreamEvent {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Chunk(_))
    }
}

/// State cell shared between the driver task and its handle.
///
/// Once a terminal state is stored it never changes.
#[derive(Debug, Clone)]
pub(crate) struct SharedStreamState(Arc<Mutex<StreamState>>);

impl SharedStreamState {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(StreamState::Idle)))
    }

    pub(crate) fn get(&self) -> StreamState {
        *self.0.lock()
    }

    /// Move to `next` unless already terminal. Returns whether it moved.
    pub(crate) fn advance(&self, next: StreamState) -> bool {
        let mut state = self.0.lock();
        if state.is_terminal() {
            return false;
        }
        *state = next;
        true
    }
}

/// Output side of one stream task: event channel, cancel signal and state.
pub(crate) struct StreamSink {
    tx: mpsc::Sender<StreamEvent>,
    cancel: watch::Receiver<bool>,
    state: SharedStreamState,
    started: Instant,
}

impl StreamSink {
    pub(crate) fn new(
        tx: mpsc::Sender<StreamEvent>,
        cancel: watch::Receiver<bool>,
        state: SharedStreamState,
    ) -> Self {
        Self {
            tx,
            cancel,
            state,
            started: Instant::now(),
        }
    }

    pub(crate) fn advance(&self, next: StreamState) {
        self.state.advance(next);
    }

    /// Whether cancellation was requested. A dropped sender counts.
    pub(crate) fn cancel_requested(&self) -> bool {
        *self.cancel.borrow() || self.cancel.has_changed().is_err()
    }

    /// Resolves once cancellation is requested.
    pub(crate) async fn cancelled(&mut self) {
        let _ = self.cancel.wait_for(|requested| *requested).await;
    }

    /// Deliver one event, giving up if the stream is cancelled or the
    /// receiver is gone. Returns `false` when the event was not delivered.
    async fn deliver(&mut self, event: StreamEvent) -> bool {
        let Self { tx, cancel, .. } = self;
        tokio::select! {
            biased;
            _ = cancel.wait_for(|requested| *requested) => false,
            sent = tx.send(event) => sent.is_ok(),
        }
    }

    pub(crate) fn finish_cancelled(&self) -> StreamState {
        tracing::debug!("stream cancelled");
        self.state.advance(StreamState::Cancelled);
        StreamState::Cancelled
    }

    /// Deliver the error and move to `Failed`, unless already cancelled.
    pub(crate) async fn fail(&mut self, error: ChatError) -> StreamState {
        if self.cancel_requested() {
            return self.finish_cancelled();
        }
        log_stream_failed(&error, self.started.elapsed());
        self.finish_with(StreamState::Failed, StreamEvent::Error(error))
            .await
    }

    async fn complete(&mut self, completion: Completion) -> StreamState {
        log_stream_summary(&completion, self.started.elapsed());
        self.finish_with(StreamState::Completed, StreamEvent::Complete(completion))
            .await
    }

    /// Deliver the terminal event, then record `state`. A terminal event
    /// that never reached the consumer leaves the stream `Cancelled`.
    async fn finish_with(&mut self, state: StreamState, event: StreamEvent) -> StreamState {
        if self.deliver(event).await {
            self.state.advance(state);
            state
        } else {
            self.finish_cancelled()
        }
    }
}

fn log_absorbed(diagnostic: &StreamError) {
    match diagnostic {
        StreamError::TruncatedFrame { .. } => {
            tracing::debug!(diagnostic = %diagnostic, "discarding truncated stream tail");
        }
        StreamError::Encoding { .. } | StreamError::Decode { .. } => {
            tracing::warn!(diagnostic = %diagnostic, "stream diagnostic");
        }
    }
}

/// Read `byte_stream` to its end, delivering events through `sink`.
///
/// Returns the terminal state the stream reached. Frame-level and byte-level
/// problems are logged and never end the stream; read errors and timeouts
/// deliver one [`StreamEvent::Error`]. Nothing is delivered after the
/// terminal event, and nothing at all once cancellation is requested.
pub(crate) async fn drive_byte_stream<S, E>(
    byte_stream: S,
    mut sink: StreamSink,
    read_timeout: Option<Duration>,
) -> StreamState
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut byte_stream = std::pin::pin!(byte_stream);
    let mut decoder = ChunkDecoder::new();
    let mut events = Vec::with_capacity(8);
    let mut completion = Completion::default();
    let mut received_any = false;
    sink.advance(StreamState::Reading);

    loop {
        if sink.cancel_requested() {
            return sink.finish_cancelled();
        }

        let read = async {
            match read_timeout {
                Some(limit) => tokio::time::timeout(limit, byte_stream.next())
                    .await
                    .map_err(|_| limit),
                None => Ok(byte_stream.next().await),
            }
        };
        let next = tokio::select! {
            biased;
            () = sink.cancelled() => return sink.finish_cancelled(),
            next = read => next,
        };

        let bytes = match next {
            Ok(Some(Ok(bytes))) => bytes,
            Ok(Some(Err(err))) => {
                let error = if received_any {
                    ChatError::Read(err.to_string())
                } else {
                    ChatError::UnreadableBody(err.to_string())
                };
                return sink.fail(error).await;
            }
            Err(limit) => return sink.fail(ChatError::ReadTimeout(limit)).await,
            Ok(None) => {
                for diagnostic in decoder.finish() {
                    log_absorbed(&diagnostic);
                }
                if decoder.ignored_lines() > 0 {
                    tracing::trace!(ignored_lines = decoder.ignored_lines(), "non-data lines ignored");
                }
                return sink.complete(completion).await;
            }
        };
        received_any = true;

        decoder.feed_into(&bytes, &mut events);
        for event in events.drain(..) {
            match event {
                FrameEvent::Chunk(chunk) => {
                    completion.chunks += 1;
                    if let Some(usage) = &chunk.usage {
                        log_usage(&chunk.model, usage);
                    }
                    if !sink.deliver(StreamEvent::Chunk(chunk)).await {
                        return sink.finish_cancelled();
                    }
                }
                FrameEvent::Terminate => {
                    tracing::debug!(chunks = completion.chunks, "received [DONE] sentinel");
                    completion.saw_sentinel = true;
                    return sink.complete(completion).await;
                }
                FrameEvent::Skip(diagnostic) => {
                    completion.skipped += 1;
                    log_absorbed(&diagnostic);
                }
            }
        }
    }
}
