/*!
Acquisition loop.

Starts a [`Coprocessor`], polls its ring until interrupted, limited or
failed, and hands every sample to a [`SampleSink`]. The coprocessor is
halted on every exit path, including start-up failures.
*/

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local};
use serde::Serialize;
use shared::{signal_bit, BitPacker, CaptureStats, IorecError, RawSampleWriter, Result, RingConsumer};
use tracing::{error, info, warn};

use crate::coprocessor::Coprocessor;

/// Checks that every sample equals its own logical byte offset
#[derive(Debug, Default)]
pub struct SelfTestVerifier {
    checked: u64,
    mismatch: Option<(u64, u32, u32)>,
}

impl SelfTestVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&mut self, offset: u64, sample: u32) {
        self.checked += 1;
        let expected = offset as u32;
        if sample != expected && self.mismatch.is_none() {
            error!(
                "❌ Self-test mismatch at byte {}: expected {:#010x}, got {:#010x}",
                offset, expected, sample
            );
            self.mismatch = Some((offset, expected, sample));
        }
    }

    /// Samples verified so far
    pub fn checked(&self) -> u64 {
        self.checked
    }

    fn failure(&self) -> Option<IorecError> {
        self.mismatch.map(|(offset, expected, actual)| IorecError::SelfTest {
            offset,
            expected,
            actual,
        })
    }
}

/// Destination of consumed samples, chosen once before the capture
pub enum SampleSink<W: Write> {
    /// Signal bit of each sample into the packed bitstream
    Packed(BitPacker<W>),
    /// Every sample verbatim
    Raw(RawSampleWriter<W>),
    /// Counter verification instead of output
    SelfTest(SelfTestVerifier),
    /// Samples are counted and dropped
    Discard,
}

impl<W: Write> SampleSink<W> {
    fn accept(&mut self, offset: u64, sample: u32, bit: u32) -> Result<()> {
        match self {
            Self::Packed(packer) => packer.add(signal_bit(sample, bit)),
            Self::Raw(writer) => writer.add(sample),
            Self::SelfTest(verifier) => {
                verifier.check(offset, sample);
                Ok(())
            }
            Self::Discard => Ok(()),
        }
    }

    fn verification_failure(&self) -> Option<IorecError> {
        match self {
            Self::SelfTest(verifier) => verifier.failure(),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Packed(_) => "packed",
            Self::Raw(_) => "raw",
            Self::SelfTest(_) => "self-test",
            Self::Discard => "discard",
        }
    }

    /// Flush buffered output, returning the writer if there is one
    pub fn finish(self) -> Result<Option<W>> {
        match self {
            Self::Packed(packer) => packer.finish().map(Some),
            Self::Raw(writer) => writer.finish().map(Some),
            Self::SelfTest(verifier) => {
                info!("🧪 Self-test verified {} samples", verifier.checked());
                Ok(None)
            }
            Self::Discard => Ok(None),
        }
    }
}

/// Why a capture ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Interrupted,
    LimitReached,
    Overrun,
    SelfTestFailed,
    Failed,
}

/// What a capture achieved, logged at the end and optionally saved as JSON
#[derive(Debug, Clone, Serialize)]
pub struct CaptureSummary {
    pub started_at: DateTime<Local>,
    pub elapsed_secs: f64,
    pub sink: &'static str,
    pub ring_capacity: u32,
    pub stats: CaptureStats,
    pub bytes_per_poll: u64,
    pub megabytes_per_sec: f64,
    pub peak_fill_percent: f64,
    pub stop_reason: StopReason,
}

impl CaptureSummary {
    pub fn log(&self) {
        info!("📊 Capture summary ({:?}):", self.stop_reason);
        info!(
            "   {} bytes read in {:.3} sec",
            self.stats.bytes_consumed, self.elapsed_secs
        );
        info!("   {:.2} MB/second transferred from the coprocessor", self.megabytes_per_sec);
        info!("   {} bytes/poll over {} polls", self.bytes_per_poll, self.stats.polls);
        info!(
            "   Peak unread {} bytes ({:.1}% of the {} byte ring)",
            self.stats.peak_unread, self.peak_fill_percent, self.ring_capacity
        );
    }

    /// Write the summary as pretty-printed JSON
    pub fn write_json<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

/// Result of a capture that got as far as starting the coprocessor
#[derive(Debug)]
pub struct CaptureReport {
    pub summary: CaptureSummary,
    /// Error that ended the capture, if any
    pub error: Option<IorecError>,
}

/// Halts the coprocessor when dropped
struct HaltGuard<'a, C: Coprocessor> {
    coprocessor: &'a mut C,
}

impl<'a, C: Coprocessor> HaltGuard<'a, C> {
    fn start(&mut self) -> Result<C::Ring> {
        self.coprocessor.start()
    }
}

impl<'a, C: Coprocessor> Drop for HaltGuard<'a, C> {
    fn drop(&mut self) {
        if let Err(e) = self.coprocessor.halt() {
            error!("Failed to halt coprocessor: {}", e);
        }
    }
}

/// Drives one capture from start to teardown
pub struct Acquisition {
    signal_bit: u32,
    max_bytes: Option<u64>,
    running: Arc<AtomicBool>,
}

impl Acquisition {
    pub fn new(signal_bit: u32, max_bytes: Option<u64>) -> Self {
        Self {
            signal_bit,
            max_bytes,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Flag that stops the loop when cleared (from a signal handler)
    pub fn get_running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Run until interrupted, limited, or failed.
    ///
    /// An `Err` means the coprocessor never started; failures after that
    /// are carried in [`CaptureReport::error`] next to the summary.
    pub fn run<C, W>(&self, coprocessor: &mut C, mut sink: SampleSink<W>) -> Result<CaptureReport>
    where
        C: Coprocessor,
        W: Write,
    {
        let mut guard = HaltGuard { coprocessor };
        let ring = guard.start()?;
        let mut consumer = RingConsumer::new(ring)?;

        let started_at = Local::now();
        let started = Instant::now();
        let sink_name = sink.name();
        info!(
            "🚀 Capturing into {} sink (ring {} bytes, signal bit {})",
            sink_name,
            consumer.capacity(),
            self.signal_bit
        );

        let bit = self.signal_bit;
        let outcome: std::result::Result<StopReason, (StopReason, IorecError)> = loop {
            if !self.running.load(Ordering::SeqCst) {
                break Ok(StopReason::Interrupted);
            }
            if let Some(limit) = self.max_bytes {
                if consumer.stats().bytes_consumed >= limit {
                    break Ok(StopReason::LimitReached);
                }
            }

            if let Err(e) = consumer.poll(|offset, sample| sink.accept(offset, sample, bit)) {
                let reason = if e.is_overrun() {
                    StopReason::Overrun
                } else {
                    StopReason::Failed
                };
                break Err((reason, e));
            }

            // Reported only once the poll has passed its overrun check
            if let Some(e) = sink.verification_failure() {
                break Err((StopReason::SelfTestFailed, e));
            }
        };

        drop(guard);
        let elapsed_secs = started.elapsed().as_secs_f64();

        let (stop_reason, mut error) = match outcome {
            Ok(reason) => (reason, None),
            Err((reason, e)) => (reason, Some(e)),
        };

        if let Err(e) = sink.finish() {
            warn!("Failed to flush capture output: {}", e);
            error.get_or_insert(e);
        }

        let stats = consumer.stats();
        let capacity = consumer.capacity();
        let summary = CaptureSummary {
            started_at,
            elapsed_secs,
            sink: sink_name,
            ring_capacity: capacity,
            stats,
            bytes_per_poll: stats.bytes_per_poll(),
            megabytes_per_sec: if elapsed_secs > 0.0 {
                stats.bytes_consumed as f64 / elapsed_secs / 1_000_000.0
            } else {
                0.0
            },
            peak_fill_percent: stats.peak_fill_ratio(capacity) * 100.0,
            stop_reason,
        };
        summary.log();

        Ok(CaptureReport { summary, error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Drive, SamplePattern, SimulatedCoprocessor};
    use shared::uart::SignalSynth;
    use shared::{BitOrder, BitUnpacker, DecoderConfig, UartDecoder};
    use tempfile::NamedTempFile;

    fn lockstep(capacity: u32, pattern: SamplePattern, chunk_samples: u32, total_bytes: u64) -> SimulatedCoprocessor {
        SimulatedCoprocessor::new(capacity, pattern, Drive::Lockstep { chunk_samples, total_bytes })
    }

    #[test]
    fn test_self_test_capture_verifies_every_sample() {
        let total = 256 * 1024;
        let mut sim = lockstep(64 * 1024, SamplePattern::Counter, 3000, total);
        let acquisition = Acquisition::new(15, Some(total));

        let report = acquisition
            .run(&mut sim, SampleSink::<Vec<u8>>::SelfTest(SelfTestVerifier::new()))
            .unwrap();

        assert!(report.error.is_none());
        assert_eq!(report.summary.stop_reason, StopReason::LimitReached);
        assert_eq!(report.summary.stats.bytes_consumed, total);
        assert!(report.summary.stats.peak_unread <= 64 * 1024);
        assert!(sim.is_halted());
    }

    #[test]
    fn test_overrun_ends_capture() {
        // More than a full ring between two polls
        let mut sim = lockstep(1024, SamplePattern::Counter, 300, 1 << 20);
        let acquisition = Acquisition::new(15, None);

        let report = acquisition
            .run(&mut sim, SampleSink::<Vec<u8>>::SelfTest(SelfTestVerifier::new()))
            .unwrap();

        assert_eq!(report.summary.stop_reason, StopReason::Overrun);
        assert!(report.error.as_ref().is_some_and(|e| e.is_overrun()));
        assert_eq!(report.summary.stats.bytes_consumed, 0);
        assert!(sim.is_halted());
    }

    #[test]
    fn test_self_test_mismatch_is_reported() {
        // A signal waveform is not a counter
        let pattern = SamplePattern::uart(b"x", 20, 15);
        let mut sim = lockstep(4096, pattern, 64, 4096);
        let acquisition = Acquisition::new(15, Some(4096));

        let report = acquisition
            .run(&mut sim, SampleSink::<Vec<u8>>::SelfTest(SelfTestVerifier::new()))
            .unwrap();

        assert_eq!(report.summary.stop_reason, StopReason::SelfTestFailed);
        match report.error {
            Some(IorecError::SelfTest { offset, .. }) => assert_eq!(offset, 4),
            other => panic!("expected a self-test error, got {:?}", other),
        }
    }

    #[test]
    fn test_interrupted_before_first_poll() {
        let mut sim = lockstep(1024, SamplePattern::Counter, 16, 1024);
        let acquisition = Acquisition::new(15, None);
        acquisition.get_running_flag().store(false, Ordering::SeqCst);

        let report = acquisition.run(&mut sim, SampleSink::<Vec<u8>>::Discard).unwrap();

        assert_eq!(report.summary.stop_reason, StopReason::Interrupted);
        assert_eq!(report.summary.stats.polls, 0);
        assert!(sim.is_halted());
    }

    #[test]
    fn test_packed_capture_decodes() {
        let frame_length = 40;
        let mut synth = SignalSynth::new(frame_length, BitOrder::MsbFirst);
        synth.message(b"PRU");
        let samples = synth.samples().len() as u64;
        // Whole words only; the partial word is dropped
        let total = (samples / 32) * 32 * 4;

        let pattern = SamplePattern::uart(b"PRU", frame_length, 15);
        let mut sim = lockstep(8192, pattern, 100, total);
        let acquisition = Acquisition::new(15, Some(total));

        let output = NamedTempFile::new().unwrap();
        let sink = SampleSink::Packed(BitPacker::with_batch_words(output.reopen().unwrap(), 2));
        let report = acquisition.run(&mut sim, sink).unwrap();
        assert!(report.error.is_none());
        assert_eq!(report.summary.stats.bytes_consumed, total);

        let bytes = std::fs::read(output.path()).unwrap();
        assert_eq!(bytes.len() as u64, total / 32);

        let config = DecoderConfig {
            frame_length,
            ..DecoderConfig::default()
        };
        let mut decoder = UartDecoder::without_annotations(config).unwrap();
        let mut out = Vec::new();
        for bit in BitUnpacker::new(bytes.as_slice()) {
            if let Some(byte) = decoder.push(bit.unwrap()).unwrap() {
                out.push(byte);
            }
        }
        assert_eq!(out, b"PRU");
    }

    #[test]
    fn test_summary_json() {
        let mut sim = lockstep(1024, SamplePattern::Counter, 16, 512);
        let acquisition = Acquisition::new(15, Some(512));
        let report = acquisition.run(&mut sim, SampleSink::<Vec<u8>>::Discard).unwrap();

        let mut json = Vec::new();
        report.summary.write_json(&mut json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["stop_reason"], "limit_reached");
        assert_eq!(value["stats"]["bytes_consumed"], 512);
        assert_eq!(value["sink"], "discard");
    }
}
