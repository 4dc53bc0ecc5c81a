/*!
Persisted bitstream format.

One bit per coprocessor sample, packed MSB-first into 32-bit words that are
stored little-endian with no header or trailer. The packer writes whole
batches of words; whatever bits have not completed a word at shutdown are
dropped, and the unpacker accordingly never yields a partial trailing word.
*/

use std::io::{Read, Write};

use tracing::{debug, warn};

use crate::error::{IorecError, Result};
use crate::protocol::{INPUT_BATCH_WORDS, OUTPUT_BATCH_WORDS, PACKED_WORD_BITS};
use crate::sample::read_full;

/// Accumulates bits into words and writes them to a sink in bulk
pub struct BitPacker<W: Write> {
    sink: W,
    batch: Vec<u32>,
    batch_words: usize,
    scratch: Vec<u8>,
    cur_word: u32,
    next_bit: u32,
    words_written: u64,
}

impl<W: Write> BitPacker<W> {
    /// Create a packer with the default batch of 4096 words
    pub fn new(sink: W) -> Self {
        Self::with_batch_words(sink, OUTPUT_BATCH_WORDS)
    }

    /// Create a packer that writes every `batch_words` completed words
    pub fn with_batch_words(sink: W, batch_words: usize) -> Self {
        let batch_words = batch_words.max(1);
        Self {
            sink,
            batch: Vec::with_capacity(batch_words),
            batch_words,
            scratch: Vec::with_capacity(batch_words * 4),
            cur_word: 0,
            next_bit: 0,
            words_written: 0,
        }
    }

    /// Append one bit. The 32nd bit completes a word; a full batch is written out.
    #[inline]
    pub fn add(&mut self, bit: bool) -> Result<()> {
        self.cur_word = (self.cur_word << 1) | bit as u32;
        self.next_bit += 1;

        if self.next_bit == PACKED_WORD_BITS {
            self.batch.push(self.cur_word);
            self.cur_word = 0;
            self.next_bit = 0;

            if self.batch.len() == self.batch_words {
                self.write_batch()?;
            }
        }

        Ok(())
    }

    /// Bits accumulated towards the current, incomplete word
    pub fn pending_bits(&self) -> u32 {
        self.next_bit
    }

    /// Words handed to the sink so far
    pub fn words_written(&self) -> u64 {
        self.words_written
    }

    /// Write out completed words and return the sink.
    ///
    /// The incomplete word (fewer than 32 bits) is discarded.
    pub fn finish(mut self) -> Result<W> {
        if self.next_bit > 0 {
            debug!("Discarding {} trailing bits of an incomplete word", self.next_bit);
        }
        self.write_batch()?;
        self.sink.flush()?;
        Ok(self.sink)
    }

    fn write_batch(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }

        self.scratch.clear();
        for word in &self.batch {
            self.scratch.extend_from_slice(&word.to_le_bytes());
        }

        // One bulk write per batch; anything less than the whole batch is fatal
        let written = self.sink.write(&self.scratch)?;
        if written != self.scratch.len() {
            return Err(IorecError::ShortWrite {
                expected: self.scratch.len(),
                written,
            });
        }

        self.words_written += self.batch.len() as u64;
        self.batch.clear();
        Ok(())
    }
}

/// Yields the bits of a persisted bitstream in capture order
pub struct BitUnpacker<R: Read> {
    source: R,
    raw: Vec<u8>,
    batch: Vec<u32>,
    next_idx: usize,
    cur_word: u32,
    bits_left: u32,
    bits_read: u64,
}

impl<R: Read> BitUnpacker<R> {
    /// Create an unpacker reading 1024 words per refill
    pub fn new(source: R) -> Self {
        Self::with_batch_words(source, INPUT_BATCH_WORDS)
    }

    pub fn with_batch_words(source: R, batch_words: usize) -> Self {
        let batch_words = batch_words.max(1);
        Self {
            source,
            raw: vec![0u8; batch_words * 4],
            batch: Vec::with_capacity(batch_words),
            next_idx: 0,
            cur_word: 0,
            bits_left: 0,
            bits_read: 0,
        }
    }

    /// Next bit, or `None` once the source is exhausted
    #[inline]
    pub fn get(&mut self) -> Result<Option<bool>> {
        if self.bits_left == 0 {
            if self.next_idx == self.batch.len() && !self.refill()? {
                return Ok(None);
            }

            self.cur_word = self.batch[self.next_idx];
            self.next_idx += 1;
            self.bits_left = PACKED_WORD_BITS;
        }

        let bit = self.cur_word >> 31 == 1;
        self.cur_word <<= 1;
        self.bits_left -= 1;
        self.bits_read += 1;

        Ok(Some(bit))
    }

    /// Bits yielded so far
    pub fn bits_read(&self) -> u64 {
        self.bits_read
    }

    fn refill(&mut self) -> Result<bool> {
        let filled = read_full(&mut self.source, &mut self.raw)?;
        let whole = filled - filled % 4;
        if whole != filled {
            warn!("Ignoring {} trailing bytes that do not form a whole word", filled - whole);
        }

        self.batch.clear();
        self.batch.extend(
            self.raw[..whole]
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        );
        self.next_idx = 0;

        Ok(!self.batch.is_empty())
    }
}

impl<R: Read> Iterator for BitUnpacker<R> {
    type Item = Result<bool>;

    fn next(&mut self) -> Option<Self::Item> {
        self.get().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn pack(bits: &[bool], batch_words: usize) -> Vec<u8> {
        let mut packer = BitPacker::with_batch_words(Vec::new(), batch_words);
        for &b in bits {
            packer.add(b).unwrap();
        }
        packer.finish().unwrap()
    }

    fn unpack(bytes: Vec<u8>, batch_words: usize) -> Vec<bool> {
        BitUnpacker::with_batch_words(Cursor::new(bytes), batch_words)
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    /// Writer that accepts at most `limit` bytes per call
    struct Stingy {
        limit: usize,
    }

    impl Write for Stingy {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len().min(self.limit))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_first_bit_is_most_significant() {
        let mut bits = vec![false; 32];
        bits[0] = true;
        bits[31] = true;
        let bytes = pack(&bits, 4);
        assert_eq!(bytes, 0x8000_0001u32.to_le_bytes().to_vec());
    }

    #[test]
    fn test_partial_word_is_dropped() {
        let bits: Vec<bool> = (0..70).map(|i| i % 3 == 0).collect();
        let bytes = pack(&bits, 1);
        assert_eq!(bytes.len(), 8);
        assert_eq!(unpack(bytes, 1), bits[..64].to_vec());
    }

    #[test]
    fn test_batches_are_written_whole() {
        let mut packer = BitPacker::with_batch_words(Vec::new(), 2);
        for _ in 0..32 * 3 {
            packer.add(true).unwrap();
        }
        assert_eq!(packer.words_written(), 2);
        let out = packer.finish().unwrap();
        assert_eq!(out.len(), 12);
    }

    #[test]
    fn test_short_write_is_an_error() {
        let mut packer = BitPacker::with_batch_words(Stingy { limit: 3 }, 1);
        let mut result = Ok(());
        for _ in 0..32 {
            result = packer.add(false);
        }
        assert!(matches!(
            result,
            Err(IorecError::ShortWrite { expected: 4, written: 3 })
        ));
    }

    #[test]
    fn test_zero_length_write_is_an_error() {
        let mut packer = BitPacker::with_batch_words(Stingy { limit: 0 }, 1);
        for _ in 0..31 {
            packer.add(true).unwrap();
        }
        assert!(packer.add(true).is_err());
    }

    #[test]
    fn test_empty_source_yields_nothing() {
        let mut unpacker = BitUnpacker::new(Cursor::new(Vec::new()));
        assert_eq!(unpacker.get().unwrap(), None);
        assert_eq!(unpacker.bits_read(), 0);
    }

    #[test]
    fn test_trailing_fragment_is_ignored() {
        let mut bytes = 0xFFFF_FFFFu32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xAB, 0xCD]);
        assert_eq!(unpack(bytes, 16), vec![true; 32]);
    }

    #[test]
    fn test_file_round_trip() {
        let bits: Vec<bool> = (0..32 * 5000).map(|i| (i * 7 + i / 13) % 5 < 2).collect();
        let file = tempfile::NamedTempFile::new().unwrap();

        let packer_file = file.reopen().unwrap();
        let mut packer = BitPacker::new(packer_file);
        for &b in &bits {
            packer.add(b).unwrap();
        }
        packer.finish().unwrap();

        let unpacked: Vec<bool> = BitUnpacker::new(file.reopen().unwrap())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(unpacked, bits);
    }

    proptest! {
        #[test]
        fn prop_whole_words_round_trip(
            words in proptest::collection::vec(any::<u32>(), 0..200),
            out_batch in 1usize..64,
            in_batch in 1usize..64,
        ) {
            let bits: Vec<bool> = words
                .iter()
                .flat_map(|w| (0..32).rev().map(move |i| (w >> i) & 1 == 1))
                .collect();
            let bytes = pack(&bits, out_batch);
            prop_assert_eq!(unpack(bytes, in_batch), bits);
        }

        #[test]
        fn prop_trailing_bits_are_lost(
            bits in proptest::collection::vec(any::<bool>(), 0..500),
        ) {
            let keep = bits.len() - bits.len() % 32;
            let bytes = pack(&bits, 3);
            prop_assert_eq!(unpack(bytes, 5), bits[..keep].to_vec());
        }
    }
}
