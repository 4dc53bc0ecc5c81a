/*!
Software stand-in for the PRU.

The simulated producer follows the same counter protocol as the PRU
program: it bumps the before-write counter, stores the sample, then bumps
the after-write counter. It either runs on its own thread (`--simulate`)
or, for tests, produces a burst each time the consumer polls.
*/

use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use shared::protocol::SAMPLE_SIZE_BYTES;
use shared::ring::validate_capacity;
use shared::uart::SignalSynth;
use shared::{BitOrder, IorecError, Result, SampleRing};
use tracing::{info, warn};

use crate::config::{CaptureConfig, SimulationConfig};
use crate::coprocessor::Coprocessor;

/// What the simulated producer writes into each sample
#[derive(Debug, Clone)]
pub enum SamplePattern {
    /// The sample's own logical byte offset, as the self-test program does
    Counter,
    /// A repeating one-bit waveform placed at `bit`
    Signal { levels: Arc<[bool]>, bit: u32 },
}

impl SamplePattern {
    /// A serial line repeatedly transmitting `message`
    pub fn uart(message: &[u8], frame_length: usize, bit: u32) -> Self {
        let mut synth = SignalSynth::new(frame_length, BitOrder::MsbFirst);
        synth.message(message);
        Self::Signal {
            levels: synth.into_samples().into(),
            bit,
        }
    }

    fn value(&self, logical_offset: u64) -> u32 {
        match self {
            Self::Counter => logical_offset as u32,
            Self::Signal { levels, bit } => {
                if levels.is_empty() {
                    return 0;
                }
                let index = (logical_offset / SAMPLE_SIZE_BYTES as u64) % levels.len() as u64;
                if levels[index as usize] {
                    1u32.checked_shl(*bit).unwrap_or(0)
                } else {
                    0
                }
            }
        }
    }
}

/// How the producer is paced
#[derive(Debug, Clone, Copy)]
pub enum Drive {
    /// Background thread writing `chunk_samples`, then sleeping for `pause`
    Threaded { chunk_samples: u32, pause: Duration },
    /// A burst of `chunk_samples` on every write-counter read, up to `total_bytes`
    Lockstep { chunk_samples: u32, total_bytes: u64 },
}

struct SimRegion {
    data: Box<[AtomicU32]>,
    capacity: u32,
    before: AtomicU32,
    after: AtomicU32,
    produced: AtomicU64,
    pattern: SamplePattern,
}

impl SimRegion {
    fn new(capacity: u32, pattern: SamplePattern) -> Self {
        let words = (capacity / SAMPLE_SIZE_BYTES) as usize;
        Self {
            data: (0..words).map(|_| AtomicU32::new(0)).collect(),
            capacity,
            before: AtomicU32::new(0),
            after: AtomicU32::new(0),
            produced: AtomicU64::new(0),
            pattern,
        }
    }

    /// Write `samples` more samples. Only one thread may produce.
    fn produce(&self, samples: u32) {
        for _ in 0..samples {
            let at = self.after.load(Ordering::Relaxed);
            let next = at.wrapping_add(SAMPLE_SIZE_BYTES);
            let logical = self.produced.load(Ordering::Relaxed);

            self.before.store(next, Ordering::SeqCst);
            fence(Ordering::SeqCst);

            let slot = ((at % self.capacity) / SAMPLE_SIZE_BYTES) as usize;
            self.data[slot].store(self.pattern.value(logical), Ordering::Relaxed);

            self.after.store(next, Ordering::Release);
            self.produced.store(logical + SAMPLE_SIZE_BYTES as u64, Ordering::Relaxed);
        }
    }
}

/// Consumer view of the simulated region
pub struct SimRing {
    region: Arc<SimRegion>,
    lockstep: Option<(u32, u64)>,
}

impl SampleRing for SimRing {
    fn capacity(&self) -> u32 {
        self.region.capacity
    }

    fn write_counter(&self) -> u32 {
        if let Some((chunk_samples, total_bytes)) = self.lockstep {
            let remaining = total_bytes.saturating_sub(self.region.produced.load(Ordering::Relaxed));
            let samples = (remaining / SAMPLE_SIZE_BYTES as u64).min(chunk_samples as u64) as u32;
            self.region.produce(samples);
        }
        self.region.after.load(Ordering::Acquire)
    }

    fn before_write_counter(&self) -> u32 {
        self.region.before.load(Ordering::SeqCst)
    }

    fn sample(&self, offset: u32) -> u32 {
        self.region.data[(offset / SAMPLE_SIZE_BYTES) as usize].load(Ordering::Relaxed)
    }
}

/// A [`Coprocessor`] that runs entirely in this process
pub struct SimulatedCoprocessor {
    region: Arc<SimRegion>,
    drive: Drive,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    halted: bool,
}

impl SimulatedCoprocessor {
    pub fn new(capacity: u32, pattern: SamplePattern, drive: Drive) -> Self {
        Self {
            region: Arc::new(SimRegion::new(capacity, pattern)),
            drive,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            halted: false,
        }
    }

    /// Threaded producer configured like `--simulate` runs
    pub fn from_config(simulation: &SimulationConfig, capture: &CaptureConfig, test_mode: bool) -> Result<Self> {
        // The producer indexes the region before any consumer looks at it
        validate_capacity(simulation.ring_bytes)?;

        let pattern = if test_mode {
            SamplePattern::Counter
        } else {
            SamplePattern::uart(simulation.message.as_bytes(), simulation.frame_length, capture.signal_bit)
        };
        let drive = Drive::Threaded {
            chunk_samples: simulation.chunk_samples,
            pause: Duration::from_micros(100 * capture.capture_choke.max(1) as u64),
        };
        Ok(Self::new(simulation.ring_bytes, pattern, drive))
    }

    /// Bytes written into the ring so far
    pub fn produced_bytes(&self) -> u64 {
        self.region.produced.load(Ordering::Relaxed)
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    fn stop_worker(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            handle
                .join()
                .map_err(|_| IorecError::config("simulated producer thread panicked"))?;
        }
        Ok(())
    }
}

impl Coprocessor for SimulatedCoprocessor {
    type Ring = SimRing;

    fn start(&mut self) -> Result<SimRing> {
        if self.worker.is_some() {
            return Err(IorecError::config("simulated producer already started"));
        }
        self.halted = false;

        let lockstep = match self.drive {
            Drive::Threaded { chunk_samples, pause } => {
                info!("🧪 Starting simulated producer ({} samples every {:?})", chunk_samples, pause);
                self.running.store(true, Ordering::SeqCst);
                let region = Arc::clone(&self.region);
                let running = Arc::clone(&self.running);
                self.worker = Some(thread::spawn(move || {
                    while running.load(Ordering::SeqCst) {
                        region.produce(chunk_samples);
                        thread::sleep(pause);
                    }
                }));
                None
            }
            Drive::Lockstep { chunk_samples, total_bytes } => Some((chunk_samples, total_bytes)),
        };

        Ok(SimRing {
            region: Arc::clone(&self.region),
            lockstep,
        })
    }

    fn halt(&mut self) -> Result<()> {
        self.stop_worker()?;
        if !self.halted {
            info!("🧪 Simulated producer stopped after {} bytes", self.produced_bytes());
        }
        self.halted = true;
        Ok(())
    }
}

impl Drop for SimulatedCoprocessor {
    fn drop(&mut self) {
        if let Err(e) = self.stop_worker() {
            warn!("Failed to stop simulated producer: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::signal_bit;

    #[test]
    fn test_lockstep_produces_on_poll() {
        let mut sim = SimulatedCoprocessor::new(
            64,
            SamplePattern::Counter,
            Drive::Lockstep { chunk_samples: 4, total_bytes: 40 },
        );
        let ring = sim.start().unwrap();

        assert_eq!(ring.write_counter(), 16);
        assert_eq!(ring.before_write_counter(), 16);
        assert_eq!(ring.sample(0), 0);
        assert_eq!(ring.sample(12), 12);

        assert_eq!(ring.write_counter(), 32);
        assert_eq!(ring.write_counter(), 40);
        // Limit reached
        assert_eq!(ring.write_counter(), 40);
        assert_eq!(sim.produced_bytes(), 40);
    }

    #[test]
    fn test_counter_wraps_physically() {
        let mut sim = SimulatedCoprocessor::new(
            16,
            SamplePattern::Counter,
            Drive::Lockstep { chunk_samples: 6, total_bytes: 24 },
        );
        let ring = sim.start().unwrap();

        assert_eq!(ring.write_counter(), 24);
        // Slots 0 and 1 were overwritten by samples 4 and 5
        assert_eq!(ring.sample(0), 16);
        assert_eq!(ring.sample(4), 20);
        assert_eq!(ring.sample(8), 8);
    }

    #[test]
    fn test_uart_pattern_places_signal_bit() {
        let pattern = SamplePattern::uart(b"U", 20, 15);
        let SamplePattern::Signal { levels, .. } = &pattern else {
            panic!("expected a signal pattern");
        };
        // Low lead-in, then the sync pulse
        assert!(!levels[0]);
        assert!(levels[20]);

        assert!(!signal_bit(pattern.value(0), 15));
        assert_eq!(pattern.value(20 * 4), 1 << 15);
        assert!(signal_bit(pattern.value(20 * 4), 15));
    }

    #[test]
    fn test_from_config_rejects_unusable_ring_size() {
        let capture = CaptureConfig::default();
        for ring_bytes in [0, 12, 3 * 1024 * 1024] {
            let simulation = SimulationConfig {
                ring_bytes,
                ..SimulationConfig::default()
            };
            let result = SimulatedCoprocessor::from_config(&simulation, &capture, false);
            assert!(matches!(result, Err(IorecError::Config(_))), "ring_bytes {}", ring_bytes);
        }

        let sim = SimulatedCoprocessor::from_config(&SimulationConfig::default(), &capture, true).unwrap();
        assert_eq!(sim.produced_bytes(), 0);
    }

    #[test]
    fn test_threaded_producer_halts() {
        let mut sim = SimulatedCoprocessor::new(
            4096,
            SamplePattern::Counter,
            Drive::Threaded { chunk_samples: 8, pause: Duration::from_millis(1) },
        );
        let ring = sim.start().unwrap();
        while ring.write_counter() == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        sim.halt().unwrap();
        assert!(sim.is_halted());
        let stopped_at = sim.produced_bytes();
        thread::sleep(Duration::from_millis(5));
        assert_eq!(sim.produced_bytes(), stopped_at);

        // Halting twice is harmless
        sim.halt().unwrap();
    }
}
