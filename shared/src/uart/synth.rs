/*!
Synthesizes an oversampled asynchronous-serial signal.

Used to drive the simulated coprocessor and to build decoder test inputs.
Logical bit `i` of a character occupies samples
`[frame_length * i / 10, frame_length * (i + 1) / 10)` of its frame.
*/

use super::BitOrder;
use crate::protocol::BITS_PER_CHARACTER;

/// Builder for a raw one-bit-per-sample signal
#[derive(Debug, Clone)]
pub struct SignalSynth {
    frame_length: usize,
    bit_order: BitOrder,
    samples: Vec<bool>,
}

impl SignalSynth {
    pub fn new(frame_length: usize, bit_order: BitOrder) -> Self {
        Self {
            frame_length,
            bit_order,
            samples: Vec::new(),
        }
    }

    /// `n` samples of idle (high) line
    pub fn idle(&mut self, n: usize) -> &mut Self {
        self.samples.extend(std::iter::repeat(true).take(n));
        self
    }

    /// `n` samples of low line
    pub fn low(&mut self, n: usize) -> &mut Self {
        self.samples.extend(std::iter::repeat(false).take(n));
        self
    }

    /// A high run of exactly twice the character width
    pub fn sync_pulse(&mut self) -> &mut Self {
        self.idle(2 * self.frame_length)
    }

    /// One framed character: start bit, 8 data bits, stop bit
    pub fn byte(&mut self, value: u8) -> &mut Self {
        for i in 0..BITS_PER_CHARACTER {
            let level = match i {
                0 => false,
                9 => true,
                _ => match self.bit_order {
                    BitOrder::MsbFirst => (value >> (8 - i)) & 1 == 1,
                    BitOrder::LsbFirst => (value >> (i - 1)) & 1 == 1,
                },
            };
            let from = self.frame_length * i / BITS_PER_CHARACTER;
            let to = self.frame_length * (i + 1) / BITS_PER_CHARACTER;
            self.samples.extend(std::iter::repeat(level).take(to - from));
        }
        self
    }

    pub fn bytes(&mut self, values: &[u8]) -> &mut Self {
        for &v in values {
            self.byte(v);
        }
        self
    }

    /// A complete transmission: a low lead-in, the sync pulse, the
    /// characters back to back, then enough idle line to close the last frame
    pub fn message(&mut self, values: &[u8]) -> &mut Self {
        let frame_length = self.frame_length;
        self.low(frame_length)
            .sync_pulse()
            .bytes(values)
            .idle(frame_length)
    }

    pub fn samples(&self) -> &[bool] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<bool> {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_character_layout() {
        let mut synth = SignalSynth::new(20, BitOrder::MsbFirst);
        synth.byte(0b1000_0001);
        let s = synth.samples();
        assert_eq!(s.len(), 20);
        assert!(!s[0] && !s[1]);
        assert!(s[2] && s[3]);
        assert!(!s[4]);
        assert!(s[16] && s[17]);
        assert!(s[18] && s[19]);
    }

    #[test]
    fn test_uneven_bit_periods_fill_frame() {
        let mut synth = SignalSynth::new(116, BitOrder::LsbFirst);
        synth.byte(0x42);
        assert_eq!(synth.samples().len(), 116);
    }

    #[test]
    fn test_message_framing() {
        let mut synth = SignalSynth::new(40, BitOrder::MsbFirst);
        synth.message(b"hi");
        assert_eq!(synth.samples().len(), 40 + 80 + 2 * 40 + 40);
    }
}
