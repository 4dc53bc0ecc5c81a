/*!
Raw coprocessor samples.

A sample is one 32-bit word per sampling tick; only the signal bit carries
meaning. The raw stream format (every sample, little-endian, no header) is
what the acquisition tool writes in raw output mode and what the decoder
accepts as its alternative input.
*/

use std::io::{ErrorKind, Read, Write};

use crate::error::{IorecError, Result};
use crate::protocol::SAMPLE_SIZE_BYTES;

/// Extract the signal-of-interest bit from a sample. Bits past 31 read as low.
#[inline]
pub fn signal_bit(sample: u32, bit: u32) -> bool {
    sample.checked_shr(bit).map_or(false, |v| v & 1 == 1)
}

/// Check that `bit` names one of a sample's 32 bits
pub fn validate_signal_bit(bit: u32) -> Result<()> {
    if bit >= u32::BITS {
        return Err(IorecError::config(format!(
            "signal bit {} is outside a {}-bit sample",
            bit,
            u32::BITS
        )));
    }
    Ok(())
}

/// Read until `buf` is full or the source reports end of stream
pub(crate) fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Writes raw samples in fixed-size batches
pub struct RawSampleWriter<W: Write> {
    sink: W,
    batch: Vec<u8>,
    batch_bytes: usize,
    samples_written: u64,
}

impl<W: Write> RawSampleWriter<W> {
    pub fn new(sink: W, batch_samples: usize) -> Self {
        let batch_bytes = batch_samples.max(1) * SAMPLE_SIZE_BYTES as usize;
        Self {
            sink,
            batch: Vec::with_capacity(batch_bytes),
            batch_bytes,
            samples_written: 0,
        }
    }

    #[inline]
    pub fn add(&mut self, sample: u32) -> Result<()> {
        self.batch.extend_from_slice(&sample.to_le_bytes());
        if self.batch.len() >= self.batch_bytes {
            self.write_batch()?;
        }
        Ok(())
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    /// Write any buffered samples and return the sink
    pub fn finish(mut self) -> Result<W> {
        self.write_batch()?;
        self.sink.flush()?;
        Ok(self.sink)
    }

    fn write_batch(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let written = self.sink.write(&self.batch)?;
        if written != self.batch.len() {
            return Err(IorecError::ShortWrite {
                expected: self.batch.len(),
                written,
            });
        }

        self.samples_written += (self.batch.len() / SAMPLE_SIZE_BYTES as usize) as u64;
        self.batch.clear();
        Ok(())
    }
}

/// Reads raw samples and yields their signal bit
pub struct RawSampleReader<R: Read> {
    source: R,
    signal_bit: u32,
    buf: Vec<u8>,
    len: usize,
    pos: usize,
}

impl<R: Read> RawSampleReader<R> {
    pub fn new(source: R, signal_bit: u32) -> Self {
        Self {
            source,
            signal_bit,
            buf: vec![0u8; 4096],
            len: 0,
            pos: 0,
        }
    }

    /// Next sample, or `None` at end of stream.
    ///
    /// A stream that ends part-way through a sample is malformed.
    pub fn next_sample(&mut self) -> Result<Option<u32>> {
        if self.pos == self.len {
            self.len = read_full(&mut self.source, &mut self.buf)?;
            self.pos = 0;

            if self.len == 0 {
                return Ok(None);
            }
            if self.len % SAMPLE_SIZE_BYTES as usize != 0 {
                return Err(IorecError::invalid_file_format(format!(
                    "raw sample stream ends with a {}-byte fragment",
                    self.len % SAMPLE_SIZE_BYTES as usize
                )));
            }
        }

        let b = &self.buf[self.pos..self.pos + 4];
        self.pos += 4;
        Ok(Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]])))
    }

    /// Next signal bit, or `None` at end of stream
    #[inline]
    pub fn get(&mut self) -> Result<Option<bool>> {
        Ok(self.next_sample()?.map(|s| signal_bit(s, self.signal_bit)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_signal_bit_extraction() {
        assert!(signal_bit(1 << 15, 15));
        assert!(!signal_bit(!(1 << 15), 15));
        assert!(signal_bit(0x8000_0000, 31));
    }

    #[test]
    fn test_out_of_range_signal_bit() {
        assert!(!signal_bit(u32::MAX, 32));
        assert!(!signal_bit(u32::MAX, 200));
        assert!(validate_signal_bit(31).is_ok());
        assert!(matches!(validate_signal_bit(32), Err(IorecError::Config(_))));

        let mut reader = RawSampleReader::new(Cursor::new(u32::MAX.to_le_bytes().to_vec()), 32);
        assert_eq!(reader.get().unwrap(), Some(false));
    }

    #[test]
    fn test_raw_round_trip() {
        let samples = [0u32, 1 << 15, 0xFFFF_FFFF, 0x0000_7FFF, 1 << 15];
        let mut writer = RawSampleWriter::new(Vec::new(), 2);
        for &s in &samples {
            writer.add(s).unwrap();
        }
        assert_eq!(writer.samples_written(), 4);
        let bytes = writer.finish().unwrap();
        assert_eq!(bytes.len(), 20);

        let mut reader = RawSampleReader::new(Cursor::new(bytes), 15);
        let mut bits = Vec::new();
        while let Some(b) = reader.get().unwrap() {
            bits.push(b);
        }
        assert_eq!(bits, vec![false, true, true, false, true]);
    }

    #[test]
    fn test_fragment_is_rejected() {
        let mut reader = RawSampleReader::new(Cursor::new(vec![0u8; 6]), 15);
        assert!(matches!(reader.get(), Err(IorecError::InvalidFileFormat(_))));
    }
}
