/*!
SYNC phase: waits for a sustained high level followed by a falling edge.
*/

use crate::protocol::MIN_FRAME_LENGTH;

/// Where and how wide the decoder locked on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncLock {
    /// Character width in raw samples to decode with
    pub frame_length: usize,
    /// Sample offset of the falling edge, i.e. the first start-bit sample
    pub offset: u64,
    /// Length of the high run that preceded the edge
    pub run: usize,
}

/// Measures high-level run length until a sync pulse is seen
#[derive(Debug, Clone)]
pub struct SyncDetector {
    frame_length: usize,
    tolerance: usize,
    consecutive_highs: usize,
    last: bool,
}

impl SyncDetector {
    pub fn new(frame_length: usize, tolerance: usize) -> Self {
        Self {
            frame_length,
            tolerance,
            consecutive_highs: 0,
            last: false,
        }
    }

    pub fn consecutive_highs(&self) -> usize {
        self.consecutive_highs
    }

    /// Feed one sample. Returns the lock on a falling edge that ends a high
    /// run of at least twice the nominal character width.
    #[inline]
    pub fn push(&mut self, bit: bool, offset: u64) -> Option<SyncLock> {
        if bit {
            self.consecutive_highs += 1;
            self.last = true;
            return None;
        }

        let lock = if self.last && self.consecutive_highs >= 2 * self.frame_length {
            Some(SyncLock {
                frame_length: self.learned_length(self.consecutive_highs),
                offset,
                run: self.consecutive_highs,
            })
        } else {
            None
        };

        self.consecutive_highs = 0;
        self.last = false;
        lock
    }

    /// Half the sync run if it is within tolerance of the nominal width,
    /// otherwise the nominal width (a long idle line says nothing about it).
    fn learned_length(&self, run: usize) -> usize {
        let estimate = run / 2;
        let low = self.frame_length.saturating_sub(self.tolerance);
        let high = self.frame_length + self.tolerance;

        if estimate > low && estimate < high && estimate >= MIN_FRAME_LENGTH {
            estimate
        } else {
            self.frame_length
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(detector: &mut SyncDetector, bits: impl IntoIterator<Item = bool>) -> Option<SyncLock> {
        let mut lock = None;
        for (i, b) in bits.into_iter().enumerate() {
            if let Some(l) = detector.push(b, i as u64) {
                lock = Some(l);
            }
        }
        lock
    }

    fn pulse(highs: usize) -> Vec<bool> {
        let mut bits = vec![false; 3];
        bits.extend(std::iter::repeat(true).take(highs));
        bits.push(false);
        bits
    }

    #[test]
    fn test_run_of_twice_frame_length_locks() {
        let mut detector = SyncDetector::new(40, 10);
        let lock = feed(&mut detector, pulse(80)).expect("lock");
        assert_eq!(lock.frame_length, 40);
        assert_eq!(lock.offset, 83);
        assert_eq!(lock.run, 80);
    }

    #[test]
    fn test_run_one_short_does_not_lock() {
        let mut detector = SyncDetector::new(40, 10);
        assert!(feed(&mut detector, pulse(79)).is_none());
        assert_eq!(detector.consecutive_highs(), 0);
    }

    #[test]
    fn test_learns_width_within_tolerance() {
        let mut detector = SyncDetector::new(116, 10);
        let lock = feed(&mut detector, pulse(2 * 116 + 10)).unwrap();
        assert_eq!(lock.frame_length, 121);
    }

    #[test]
    fn test_long_idle_keeps_nominal_width() {
        let mut detector = SyncDetector::new(116, 10);
        let lock = feed(&mut detector, pulse(5000)).unwrap();
        assert_eq!(lock.frame_length, 116);
    }

    #[test]
    fn test_low_samples_reset_run() {
        let mut detector = SyncDetector::new(40, 10);
        let mut bits = vec![true; 50];
        bits.push(false);
        bits.extend(vec![true; 50]);
        bits.push(false);
        assert!(feed(&mut detector, bits).is_none());
    }
}
