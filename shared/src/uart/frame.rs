/*!
DECODE phase: majority-vote extraction of one character per frame window.

The window holds `frame_length + frame_length / 8` raw samples starting at
a start bit. Each of the 10 logical bits is read from three consecutive
samples at `frame_length * i / 10`; any low sample makes the bit low. The
remaining samples of a bit period are not looked at.
*/

use super::annotation::{AnnotationSink, MARK_SAMPLE};
use super::sync::SyncLock;
use super::BitOrder;
use crate::error::Result;
use crate::protocol::BITS_PER_CHARACTER;

/// Raw samples examined per logical bit
const VOTE_SAMPLES: usize = 3;

/// Which framing bit was wrong
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingFault {
    StartBit,
    StopBit,
}

/// Result of feeding one sample to the frame decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStep {
    /// Window not full yet
    Pending,
    /// A character was decoded and the next start bit is already buffered
    Byte(u8),
    /// A character was decoded but no next start bit exists in the window
    ByteThenLost(u8),
    /// Start or stop bit validation failed; the window is abandoned
    Rejected(FramingFault),
}

/// Buffers one frame window and decodes it
#[derive(Debug)]
pub struct FrameDecoder {
    frame_length: usize,
    required: usize,
    bit_order: BitOrder,
    samples: Vec<bool>,
    start: usize,
    frame_offset: u64,
}

impl FrameDecoder {
    /// Begin decoding at a sync lock, reusing `buffer` for the window.
    ///
    /// The falling-edge sample that resolved the sync is sample 0.
    pub fn begin(lock: SyncLock, bit_order: BitOrder, mut buffer: Vec<bool>) -> Self {
        let required = lock.frame_length + lock.frame_length / 8;
        buffer.clear();
        buffer.reserve(3 * required);
        buffer.push(false);

        Self {
            frame_length: lock.frame_length,
            required,
            bit_order,
            samples: buffer,
            start: 0,
            frame_offset: lock.offset,
        }
    }

    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    /// Samples needed before a frame is decoded
    pub fn required_samples(&self) -> usize {
        self.required
    }

    /// Sample offset of the current frame's start bit
    pub fn frame_offset(&self) -> u64 {
        self.frame_offset
    }

    /// Samples buffered for the current frame
    pub fn buffered(&self) -> usize {
        self.samples.len() - self.start
    }

    /// Give the window buffer back for reuse
    pub fn into_buffer(self) -> Vec<bool> {
        self.samples
    }

    /// Feed one sample; decodes once the window is full.
    pub fn push<A: AnnotationSink>(&mut self, bit: bool, annotations: &mut A) -> Result<FrameStep> {
        if self.start >= self.required {
            // Slide the window back to the front of the buffer
            self.samples.drain(..self.start);
            self.start = 0;
        }

        self.samples.push(bit);
        if self.buffered() < self.required {
            return Ok(FrameStep::Pending);
        }

        let window = &self.samples[self.start..];
        let mut byte = 0u8;

        for i in 0..BITS_PER_CHARACTER {
            let offset = self.frame_length * i / BITS_PER_CHARACTER;
            annotations.mark(self.frame_offset + offset as u64, MARK_SAMPLE)?;

            let bit = window[offset..offset + VOTE_SAMPLES].iter().all(|&s| s);

            match i {
                0 if bit => return Ok(FrameStep::Rejected(FramingFault::StartBit)),
                9 if !bit => return Ok(FrameStep::Rejected(FramingFault::StopBit)),
                0 | 9 => {}
                _ => match self.bit_order {
                    BitOrder::MsbFirst => byte = (byte << 1) | bit as u8,
                    BitOrder::LsbFirst => byte |= (bit as u8) << (i - 1),
                },
            }
        }

        // The next start bit is the first low sample after the stop bit's sampling point
        let search_from = self.frame_length * 9 / BITS_PER_CHARACTER + 1;
        match window[search_from..].iter().position(|&s| !s) {
            Some(found) => {
                let advance = search_from + found;
                self.start += advance;
                self.frame_offset += advance as u64;
                Ok(FrameStep::Byte(byte))
            }
            None => Ok(FrameStep::ByteThenLost(byte)),
        }
    }
}
