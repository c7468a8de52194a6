use std::sync::atomic::{AtomicU64, Ordering};

/// Correlation ids for stream tracing spans.
///
/// Ids are a random per-process seed mixed with a sequence number, so they
/// are unique within a process without touching the RNG per stream.
#[derive(Debug)]
pub struct StreamIdGenerator {
    seed: u128,
    counter: AtomicU64,
}

impl StreamIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        let seed_hi = u128::from(fastrand::u64(..));
        let seed_lo = u128::from(fastrand::u64(..));
        Self {
            seed: (seed_hi << 64) | seed_lo,
            counter: AtomicU64::new(1),
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    #[must_use]
    pub fn stream_uuid(&self, stream_seq: u64) -> uuid::Uuid {
        uuid::Uuid::from_u128(self.seed ^ u128::from(stream_seq))
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> uuid::Uuid {
        self.stream_uuid(self.next_seq())
    }
}

impl Default for StreamIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
