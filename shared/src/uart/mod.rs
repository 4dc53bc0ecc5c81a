/*!
Asynchronous-serial recovery from a one-bit-per-sample capture.

The decoder alternates between two phases. SYNC measures high runs until a
sync pulse at least twice the character width ends in a falling edge; DECODE
then reads one character per frame window and follows the start bits from
frame to frame. Any framing violation, or a window with no further start
bit, drops back to SYNC.
*/

pub mod annotation;
pub mod frame;
pub mod sync;
pub mod synth;

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use tracing::{debug, info};

pub use annotation::{AnnotationSink, FileAnnotations, NullAnnotations};
pub use frame::{FrameDecoder, FrameStep, FramingFault};
pub use sync::{SyncDetector, SyncLock};
pub use synth::SignalSynth;

use crate::error::{IorecError, Result};
use crate::protocol::{DEFAULT_FRAME_LENGTH, DEFAULT_FRAME_LENGTH_TOL, MIN_FRAME_LENGTH};

/// Order in which the 8 data bits arrive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum BitOrder {
    /// First data bit is the most significant (the capture tools' historic order)
    #[default]
    MsbFirst,
    /// First data bit is the least significant (standard UART wire order)
    LsbFirst,
}

impl FromStr for BitOrder {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "msb" | "msb-first" => Ok(Self::MsbFirst),
            "lsb" | "lsb-first" => Ok(Self::LsbFirst),
            other => Err(format!("unknown bit order '{}' (expected msb or lsb)", other)),
        }
    }
}

impl fmt::Display for BitOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MsbFirst => "msb",
            Self::LsbFirst => "lsb",
        })
    }
}

/// Decoder parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Nominal character width in raw samples
    pub frame_length: usize,
    /// Accepted deviation when learning the width from the sync pulse
    pub frame_length_tol: usize,
    pub bit_order: BitOrder,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            frame_length: DEFAULT_FRAME_LENGTH,
            frame_length_tol: DEFAULT_FRAME_LENGTH_TOL,
            bit_order: BitOrder::default(),
        }
    }
}

impl DecoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frame_length < MIN_FRAME_LENGTH {
            return Err(IorecError::config(format!(
                "frame length {} is below the minimum of {} samples",
                self.frame_length, MIN_FRAME_LENGTH
            )));
        }
        Ok(())
    }
}

/// Counters of a decode run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecodeStats {
    pub samples: u64,
    pub syncs: u64,
    pub bytes_decoded: u64,
    pub start_bit_errors: u64,
    pub stop_bit_errors: u64,
    pub resync_exhausted: u64,
}

/// Which phase the decoder is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderPhase {
    Sync,
    Decode,
}

enum Phase {
    Sync(SyncDetector),
    Decode(FrameDecoder),
}

/// Sample-by-sample SYNC/DECODE state machine
pub struct UartDecoder<A: AnnotationSink> {
    config: DecoderConfig,
    phase: Phase,
    spare: Vec<bool>,
    annotations: A,
    stats: DecodeStats,
    offset: u64,
}

impl UartDecoder<NullAnnotations> {
    /// Decoder without an annotation side channel
    pub fn without_annotations(config: DecoderConfig) -> Result<Self> {
        Self::new(config, NullAnnotations)
    }
}

impl<A: AnnotationSink> UartDecoder<A> {
    pub fn new(config: DecoderConfig, annotations: A) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            phase: Phase::Sync(SyncDetector::new(config.frame_length, config.frame_length_tol)),
            spare: Vec::new(),
            annotations,
            stats: DecodeStats::default(),
            offset: 0,
        })
    }

    pub fn phase(&self) -> DecoderPhase {
        match self.phase {
            Phase::Sync(_) => DecoderPhase::Sync,
            Phase::Decode(_) => DecoderPhase::Decode,
        }
    }

    /// Sample offset of the current frame's start bit while decoding
    pub fn frame_offset(&self) -> Option<u64> {
        match &self.phase {
            Phase::Decode(frame) => Some(frame.frame_offset()),
            Phase::Sync(_) => None,
        }
    }

    /// Character width in use while decoding
    pub fn frame_length(&self) -> Option<usize> {
        match &self.phase {
            Phase::Decode(frame) => Some(frame.frame_length()),
            Phase::Sync(_) => None,
        }
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Feed the next sample; returns a byte when a frame validates
    pub fn push(&mut self, bit: bool) -> Result<Option<u8>> {
        let offset = self.offset;
        self.offset += 1;
        self.stats.samples += 1;

        match &mut self.phase {
            Phase::Sync(detector) => {
                if let Some(lock) = detector.push(bit, offset) {
                    info!(
                        "🔒 Sync at sample {}: {} high samples, frame length {}",
                        lock.offset, lock.run, lock.frame_length
                    );
                    self.annotations.mark(lock.offset, annotation::MARK_SYNC)?;
                    self.stats.syncs += 1;

                    let buffer = std::mem::take(&mut self.spare);
                    self.phase = Phase::Decode(FrameDecoder::begin(lock, self.config.bit_order, buffer));
                }
                Ok(None)
            }

            Phase::Decode(frame) => match frame.push(bit, &mut self.annotations)? {
                FrameStep::Pending => Ok(None),
                FrameStep::Byte(byte) => {
                    self.stats.bytes_decoded += 1;
                    Ok(Some(byte))
                }
                FrameStep::ByteThenLost(byte) => {
                    self.stats.bytes_decoded += 1;
                    self.stats.resync_exhausted += 1;
                    debug!("No start bit after frame ending at sample {}, resyncing", offset);
                    self.resync();
                    Ok(Some(byte))
                }
                FrameStep::Rejected(fault) => {
                    let frame_offset = frame.frame_offset();
                    match fault {
                        FramingFault::StartBit => self.stats.start_bit_errors += 1,
                        FramingFault::StopBit => self.stats.stop_bit_errors += 1,
                    }
                    debug!("{:?} violation in frame at sample {}, resyncing", fault, frame_offset);
                    self.annotations.mark(frame_offset, annotation::MARK_FRAMING)?;
                    self.resync();
                    Ok(None)
                }
            },
        }
    }

    /// Flush the annotation sink and hand back the counters and the sink
    pub fn finish(mut self) -> Result<(DecodeStats, A)> {
        self.annotations.finish()?;
        Ok((self.stats, self.annotations))
    }

    /// Drop the buffered window and return to SYNC with the high run counted from zero
    fn resync(&mut self) {
        let detector = SyncDetector::new(self.config.frame_length, self.config.frame_length_tol);
        if let Phase::Decode(frame) = std::mem::replace(&mut self.phase, Phase::Sync(detector)) {
            self.spare = frame.into_buffer();
        }
    }
}
