/*!
# iorec Shared Library

Core of the iorec single-bit capture pipeline: everything between the
coprocessor's shared-memory ring and the recovered serial bytes.

## Core Types

- [`RingConsumer`] - polls a [`SampleRing`], unwraps new data into spans and detects overrun
- [`BitPacker`] / [`BitUnpacker`] - the persisted 32-bit MSB-first bitstream
- [`UartDecoder`] - sync detection and majority-vote frame decoding

## Modules

- [`ring`] - ring spans, overrun test, consumer and statistics
- [`bitstream`] - bit packing and unpacking
- [`sample`] - raw 32-bit sample streams and signal bit extraction
- [`uart`] - SYNC/DECODE state machine, annotations and signal synthesis
- [`error`] - Common error types
*/

pub mod bitstream;
pub mod error;
pub mod ring;
pub mod sample;
pub mod uart;

// Re-export commonly used types
pub use bitstream::{BitPacker, BitUnpacker};
pub use error::{IorecError, Result};
pub use ring::{CaptureStats, RingConsumer, RingSpans, SampleRing};
pub use sample::{signal_bit, validate_signal_bit, RawSampleReader, RawSampleWriter};
pub use uart::{AnnotationSink, BitOrder, DecodeStats, DecoderConfig, UartDecoder};

/// Version information for the shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol constants
pub mod protocol {
    /// Size of one coprocessor sample in bytes
    pub const SAMPLE_SIZE_BYTES: u32 = 4;

    /// Bit position of the signal of interest inside a sample
    pub const DEFAULT_SIGNAL_BIT: u32 = 15;

    /// Bits per persisted word
    pub const PACKED_WORD_BITS: u32 = 32;

    /// Words per bulk write of the bit packer
    pub const OUTPUT_BATCH_WORDS: usize = 4096;

    /// Words per bulk read of the bit unpacker
    pub const INPUT_BATCH_WORDS: usize = 1024;

    /// Smallest shared ring the acquisition tool accepts (8 MiB)
    pub const MIN_RING_BYTES: u32 = 8 * 1024 * 1024;

    /// Default coprocessor throttle value
    pub const DEFAULT_CAPTURE_CHOKE: u32 = 23;

    /// Logical bits per asynchronous character: start, 8 data, stop
    pub const BITS_PER_CHARACTER: usize = 10;

    /// Nominal character width in raw samples
    pub const DEFAULT_FRAME_LENGTH: usize = 116;

    /// Accepted deviation of a learned character width, in samples
    pub const DEFAULT_FRAME_LENGTH_TOL: usize = 10;

    /// Smallest character width the three-sample majority vote fits into
    pub const MIN_FRAME_LENGTH: usize = 20;
}
