/*!
Consumer side of the coprocessor's shared sample ring.

The producer owns the data and both of its counters; the consumer owns only
its read position. [`RingConsumer`] is the single access path to a
[`SampleRing`]: it snapshots the producer's write counter, unwraps the
unread bytes into at most two spans, hands every sample to a visitor, and
only afterwards checks the producer's before-write counter for an overrun.
*/

use std::ops::Range;
use std::sync::atomic::{fence, Ordering};

use serde::Serialize;
use tracing::error;

use crate::error::{IorecError, Result};
use crate::protocol::SAMPLE_SIZE_BYTES;

/// A fixed-capacity circular sample region written by an independent producer.
///
/// Counters are byte counts that only ever increase (modulo 2^32); the
/// physical position of a counter is `counter % capacity`.
pub trait SampleRing {
    /// Size of the region in bytes
    fn capacity(&self) -> u32;

    /// Bytes the producer has finished writing ("after-write" counter)
    fn write_counter(&self) -> u32;

    /// Bytes the producer has started writing ("before-write" counter).
    /// Always at or ahead of [`SampleRing::write_counter`].
    fn before_write_counter(&self) -> u32;

    /// The sample stored at physical byte `offset` (4-aligned, below capacity)
    fn sample(&self, offset: u32) -> u32;
}

/// Unread bytes of the ring as physical offsets, split at the wrap point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingSpans {
    pub first: Range<u32>,
    pub second: Range<u32>,
}

impl RingSpans {
    /// Physical spans holding the bytes `[last_read, write_counter)`.
    ///
    /// At most `capacity` bytes are ever unread; anything beyond that has
    /// been overwritten and is reported by [`is_overrun`] instead.
    pub fn compute(last_read: u32, write_counter: u32, capacity: u32) -> Self {
        let unread = write_counter.wrapping_sub(last_read).min(capacity);
        let begin = last_read % capacity;
        let end = begin as u64 + unread as u64;

        if end <= capacity as u64 {
            Self {
                first: begin..end as u32,
                second: 0..0,
            }
        } else {
            Self {
                first: begin..capacity,
                second: 0..(end - capacity as u64) as u32,
            }
        }
    }

    /// Combined length of both spans in bytes
    pub fn len(&self) -> u32 {
        self.first.len() as u32 + self.second.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The spans in consumption order
    pub fn iter(&self) -> impl Iterator<Item = Range<u32>> {
        [self.first.clone(), self.second.clone()]
            .into_iter()
            .filter(|r| !r.is_empty())
    }
}

/// True when the producer has begun writing more than `capacity` bytes past
/// `last_read`, i.e. it has overwritten data that had not been consumed.
///
/// Compared as a wrapping distance so the test holds across the 32-bit wrap
/// of the hardware counters.
#[inline]
pub fn is_overrun(before_write_counter: u32, last_read: u32, capacity: u32) -> bool {
    before_write_counter.wrapping_sub(last_read) > capacity
}

/// Throughput and buffer-use statistics of a capture
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    /// Bytes consumed from the ring
    pub bytes_consumed: u64,
    /// Number of polls of the write counter
    pub polls: u64,
    /// Largest unread span observed at a poll, in bytes
    pub peak_unread: u32,
}

impl CaptureStats {
    pub fn bytes_per_poll(&self) -> u64 {
        if self.polls == 0 {
            0
        } else {
            self.bytes_consumed / self.polls
        }
    }

    /// Peak buffer use as a fraction of the ring capacity
    pub fn peak_fill_ratio(&self, capacity: u32) -> f64 {
        self.peak_unread as f64 / capacity as f64
    }
}

/// Snapshot of what can be read right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Available {
    pub write_counter: u32,
    pub spans: RingSpans,
}

/// Check that `capacity` can back a ring addressed by 32-bit byte counters.
///
/// Slots are found as `counter % capacity`, which stays continuous across
/// the counter wrap only when the capacity divides 2^32.
pub fn validate_capacity(capacity: u32) -> Result<()> {
    if capacity < SAMPLE_SIZE_BYTES || !capacity.is_power_of_two() {
        return Err(IorecError::config(format!(
            "ring capacity {} is not a power of two of at least {} bytes",
            capacity, SAMPLE_SIZE_BYTES
        )));
    }
    Ok(())
}

/// Reads a [`SampleRing`] without ever getting ahead of its producer
pub struct RingConsumer<R: SampleRing> {
    ring: R,
    capacity: u32,
    last_read: u32,
    observed_write: u32,
    stats: CaptureStats,
}

impl<R: SampleRing> RingConsumer<R> {
    /// Start consuming at counter value 0
    pub fn new(ring: R) -> Result<Self> {
        let capacity = ring.capacity();
        validate_capacity(capacity)?;

        Ok(Self {
            ring,
            capacity,
            last_read: 0,
            observed_write: 0,
            stats: CaptureStats::default(),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Read counter: bytes consumed so far, modulo 2^32
    pub fn last_read(&self) -> u32 {
        self.last_read
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    /// Take a fresh snapshot of the producer's after-write counter
    pub fn snapshot_write_counter(&mut self) -> u32 {
        self.observed_write = self.ring.write_counter();
        self.observed_write
    }

    /// Snapshot the write counter and compute the unread spans
    pub fn peek_available(&mut self) -> Available {
        let write_counter = self.snapshot_write_counter();
        Available {
            write_counter,
            spans: RingSpans::compute(self.last_read, write_counter, self.capacity),
        }
    }

    /// Mark `n` bytes consumed, never moving past the last write snapshot
    pub fn advance_read(&mut self, n: u32) {
        let unread = self.observed_write.wrapping_sub(self.last_read);
        self.last_read = self.last_read.wrapping_add(n.min(unread));
    }

    /// Consume everything written since the previous poll.
    ///
    /// `visit` receives the logical byte offset of each sample (counted from
    /// the start of the capture) and the sample itself. Returns the number of
    /// bytes consumed. An overrun or a visitor error ends the capture; the
    /// read position is not advanced in either case.
    pub fn poll<F>(&mut self, mut visit: F) -> Result<u32>
    where
        F: FnMut(u64, u32) -> Result<()>,
    {
        let available = self.peek_available();
        let len = available.spans.len();

        let mut offset = self.stats.bytes_consumed;
        for span in available.spans.iter() {
            for pos in span.step_by(SAMPLE_SIZE_BYTES as usize) {
                visit(offset, self.ring.sample(pos))?;
                offset += SAMPLE_SIZE_BYTES as u64;
            }
        }

        self.stats.polls += 1;
        let unread = available.write_counter.wrapping_sub(self.last_read);
        self.stats.peak_unread = self.stats.peak_unread.max(unread);

        // The before-write counter must be read after the data, not before
        fence(Ordering::SeqCst);
        let before = self.ring.before_write_counter();

        if is_overrun(before, self.last_read, self.capacity) {
            error!(
                "Buffer overrun: before-write {}, after-write {}, last read {}, capacity {}",
                before, available.write_counter, self.last_read, self.capacity
            );
            return Err(IorecError::Overrun {
                before,
                write: available.write_counter,
                last_read: self.last_read,
                capacity: self.capacity,
            });
        }

        self.advance_read(len);
        self.stats.bytes_consumed += len as u64;

        Ok(len)
    }
}
