/*!
Configuration management for the iorec acquisition tool.
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shared::protocol::{
    DEFAULT_CAPTURE_CHOKE, DEFAULT_FRAME_LENGTH, DEFAULT_SIGNAL_BIT, MIN_RING_BYTES, OUTPUT_BATCH_WORDS,
};
use shared::ring::validate_capacity;
use shared::validate_signal_bit;
use std::path::{Path, PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub capture: CaptureConfig,
    pub hardware: HardwareConfig,
    pub simulation: SimulationConfig,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse config file as TOML")?;
        config
            .validate()
            .with_context(|| format!("Invalid settings in {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Reject values the capture cannot run with
    pub fn validate(&self) -> shared::Result<()> {
        validate_signal_bit(self.capture.signal_bit)?;
        validate_capacity(self.simulation.ring_bytes)?;
        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}

/// On-disk layout of the captured samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One bit per sample, 32 bits per word
    #[default]
    Packed,
    /// Every 32-bit sample as read from the ring
    Raw,
}

/// Acquisition loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Throttle value handed to the PRU program
    pub capture_choke: u32,

    /// Bit of each sample that carries the signal
    pub signal_bit: u32,

    /// Words per bulk write of the packed output
    pub output_batch_words: usize,

    /// Stop after this many bytes have been consumed from the ring
    pub max_bytes: Option<u64>,

    pub output_format: OutputFormat,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            capture_choke: DEFAULT_CAPTURE_CHOKE,
            signal_bit: DEFAULT_SIGNAL_BIT,
            output_batch_words: OUTPUT_BATCH_WORDS,
            max_bytes: None,
            output_format: OutputFormat::Packed,
        }
    }
}

/// Where the PRU and its shared DDR region are found
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// UIO device exposing the PRU subsystem
    pub uio_device: PathBuf,

    /// Size descriptor of the PRU subsystem window (hex text)
    pub pruss_size_file: PathBuf,

    /// Physical address descriptor of the shared region (hex text)
    pub extmem_addr_file: PathBuf,

    /// Size descriptor of the shared region (hex text)
    pub extmem_size_file: PathBuf,

    /// Device used to map the shared region by physical address
    pub mem_device: PathBuf,

    /// PRU program for normal capture
    pub program: PathBuf,

    /// PRU program that writes an incrementing counter
    pub test_program: PathBuf,

    /// Smallest acceptable shared region in bytes
    pub min_ring_bytes: u32,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            uio_device: PathBuf::from("/dev/uio0"),
            pruss_size_file: PathBuf::from("/sys/class/uio/uio0/maps/map0/size"),
            extmem_addr_file: PathBuf::from("/sys/class/uio/uio0/maps/map1/addr"),
            extmem_size_file: PathBuf::from("/sys/class/uio/uio0/maps/map1/size"),
            mem_device: PathBuf::from("/dev/mem"),
            program: PathBuf::from("./iorec.bin"),
            test_program: PathBuf::from("./iorec-test.bin"),
            min_ring_bytes: MIN_RING_BYTES,
        }
    }
}

/// Software producer used with `--simulate`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Size of the simulated ring in bytes
    pub ring_bytes: u32,

    /// Samples produced per burst
    pub chunk_samples: u32,

    /// Character width of the synthesized serial signal
    pub frame_length: usize,

    /// Text repeated on the synthesized serial line
    pub message: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            ring_bytes: MIN_RING_BYTES,
            chunk_samples: 4096,
            frame_length: DEFAULT_FRAME_LENGTH,
            message: "iorec simulated capture\n".to_string(),
        }
    }
}
