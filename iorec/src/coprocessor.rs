/*!
Coprocessor control.

A [`Coprocessor`] is anything that, once started, fills a [`SampleRing`]
on its own. [`UioPruss`] drives a real PRU through the UIO driver and a
physical mapping of the shared DDR region; the simulator in
[`crate::sim`] stands in for it off-target.
*/

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

use shared::ring::validate_capacity;
use shared::{IorecError, Result, SampleRing};
use tracing::{debug, info};

use crate::config::{CaptureConfig, HardwareConfig};

/// Start/stop surface of a sample producer
pub trait Coprocessor {
    type Ring: SampleRing;

    /// Configure, load and enable the producer, returning its ring
    fn start(&mut self) -> Result<Self::Ring>;

    /// Stop the producer. Must be safe to call more than once.
    fn halt(&mut self) -> Result<()>;
}

// PRU0 layout inside the PRU subsystem window (AM335x)
const PRU0_DATA_RAM: usize = 0x0000_0000;
const PRU0_CONTROL: usize = 0x0002_2000;
const PRU0_IRAM: usize = 0x0003_4000;
const PRU_IRAM_BYTES: usize = 8 * 1024;

// Control register values
const CONTROL_RESET: u32 = 0;
const CONTROL_HALT: u32 = 1;
const CONTROL_ENABLE: u32 = 2;

// Data-RAM word slots shared with the PRU program
const SLOT_BEFORE_WRITE: usize = 0;
const SLOT_AFTER_WRITE: usize = 1;
const SLOT_RING_ADDR: usize = 2;
const SLOT_RING_SIZE: usize = 3;
const SLOT_CAPTURE_CHOKE: usize = 4;

/// Parse a sysfs descriptor: one `0x`-prefixed hexadecimal number
pub fn parse_descriptor(text: &str) -> Result<u64> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| IorecError::config(format!("descriptor {:?} is not 0x-prefixed hex", trimmed)))?;

    u64::from_str_radix(digits, 16)
        .map_err(|e| IorecError::config(format!("descriptor {:?} is not valid hex: {}", trimmed, e)))
}

/// Read and parse a descriptor file
pub fn read_descriptor(path: &Path) -> Result<u64> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        IorecError::config(format!("failed to read descriptor {}: {}", path.display(), e))
    })?;
    parse_descriptor(&text)
}

/// Check that a shared region can serve as the sample ring
pub fn validate_ring_size(size: u64, min_ring_bytes: u32) -> Result<u32> {
    let size = u32::try_from(size)
        .map_err(|_| IorecError::config(format!("shared region of {} bytes does not fit a 32-bit counter", size)))?;

    if size < min_ring_bytes {
        return Err(IorecError::config(format!(
            "shared region is {} bytes, at least {} are required",
            size, min_ring_bytes
        )));
    }
    validate_capacity(size)?;

    Ok(size)
}

/// A shared memory mapping, unmapped on drop
struct Mapping {
    base: NonNull<u8>,
    len: usize,
}

// The mapping is plain device memory; all access goes through volatile word operations
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn map(file: &File, len: usize, offset: u64) -> Result<Self> {
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| IorecError::config(format!("mapping offset {:#x} out of range", offset)))?;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }

        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| IorecError::config("mmap returned a null mapping"))?;
        Ok(Self { base, len })
    }

    fn word(&self, byte_offset: usize) -> *mut u32 {
        debug_assert!(byte_offset % 4 == 0 && byte_offset + 4 <= self.len);
        unsafe { self.base.as_ptr().add(byte_offset).cast::<u32>() }
    }

    fn read_word(&self, byte_offset: usize) -> u32 {
        unsafe { std::ptr::read_volatile(self.word(byte_offset)) }
    }

    fn write_word(&self, byte_offset: usize, value: u32) {
        unsafe { std::ptr::write_volatile(self.word(byte_offset), value) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

/// Ring view over the PRU data RAM counters and the shared DDR region
pub struct MappedRing {
    pruss: Arc<Mapping>,
    extmem: Arc<Mapping>,
    capacity: u32,
}

impl SampleRing for MappedRing {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn write_counter(&self) -> u32 {
        self.pruss.read_word(PRU0_DATA_RAM + SLOT_AFTER_WRITE * 4)
    }

    fn before_write_counter(&self) -> u32 {
        self.pruss.read_word(PRU0_DATA_RAM + SLOT_BEFORE_WRITE * 4)
    }

    fn sample(&self, offset: u32) -> u32 {
        self.extmem.read_word(offset as usize)
    }
}

/// PRU0 of the PRU subsystem, reached through `/dev/uioN`
pub struct UioPruss {
    pruss: Arc<Mapping>,
    extmem: Arc<Mapping>,
    extmem_addr: u64,
    ring_bytes: u32,
    capture_choke: u32,
    program: PathBuf,
}

impl UioPruss {
    /// Map the PRU subsystem and the shared region; the PRU is left untouched
    pub fn open(hardware: &HardwareConfig, capture: &CaptureConfig, test_mode: bool) -> Result<Self> {
        if unsafe { libc::geteuid() } != 0 {
            return Err(IorecError::config("must be run as root in order to access the PRU"));
        }

        let extmem_addr = read_descriptor(&hardware.extmem_addr_file)?;
        let ring_bytes = validate_ring_size(read_descriptor(&hardware.extmem_size_file)?, hardware.min_ring_bytes)?;
        let pruss_size = read_descriptor(&hardware.pruss_size_file)?;
        let pruss_size = usize::try_from(pruss_size)
            .map_err(|_| IorecError::config(format!("PRU subsystem size {:#x} out of range", pruss_size)))?;
        if pruss_size < PRU0_IRAM + PRU_IRAM_BYTES {
            return Err(IorecError::config(format!("PRU subsystem window of {:#x} bytes is too small", pruss_size)));
        }

        info!("🔌 Opening {} ({:#x} bytes)", hardware.uio_device.display(), pruss_size);
        let uio = open_sync(&hardware.uio_device)?;
        let pruss = Mapping::map(&uio, pruss_size, 0)?;

        info!("🔌 Mapping shared region at {:#x} ({} bytes)", extmem_addr, ring_bytes);
        let mem = open_sync(&hardware.mem_device)?;
        let extmem = Mapping::map(&mem, ring_bytes as usize, extmem_addr)?;

        let program = if test_mode {
            hardware.test_program.clone()
        } else {
            hardware.program.clone()
        };

        Ok(Self {
            pruss: Arc::new(pruss),
            extmem: Arc::new(extmem),
            extmem_addr,
            ring_bytes,
            capture_choke: capture.capture_choke,
            program,
        })
    }

    fn control(&self, value: u32) {
        self.pruss.write_word(PRU0_CONTROL, value);
    }

    fn data_slot(&self, slot: usize, value: u32) {
        self.pruss.write_word(PRU0_DATA_RAM + slot * 4, value);
    }

    fn load_program(&self) -> Result<()> {
        let image = std::fs::read(&self.program).map_err(|e| {
            IorecError::config(format!("failed to read PRU program {}: {}", self.program.display(), e))
        })?;
        if image.len() % 4 != 0 || image.len() > PRU_IRAM_BYTES {
            return Err(IorecError::invalid_file_format(format!(
                "PRU program {} is {} bytes; expected whole words, at most {}",
                self.program.display(),
                image.len(),
                PRU_IRAM_BYTES
            )));
        }

        for (i, word) in image.chunks_exact(4).enumerate() {
            let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            self.pruss.write_word(PRU0_IRAM + i * 4, word);
        }
        debug!("Loaded {} bytes of PRU program", image.len());
        Ok(())
    }
}

impl Coprocessor for UioPruss {
    type Ring = MappedRing;

    fn start(&mut self) -> Result<MappedRing> {
        self.control(CONTROL_RESET);

        // Counters are initialized only while the PRU is held in reset
        self.data_slot(SLOT_BEFORE_WRITE, 0);
        self.data_slot(SLOT_AFTER_WRITE, 0);

        // Physical addresses on this SoC fit in 32 bits
        self.data_slot(SLOT_RING_ADDR, self.extmem_addr as u32);
        self.data_slot(SLOT_RING_SIZE, self.ring_bytes);
        self.data_slot(SLOT_CAPTURE_CHOKE, self.capture_choke);

        self.load_program()?;

        info!("🚀 Starting PRU program {} (capture choke {})", self.program.display(), self.capture_choke);
        self.control(CONTROL_ENABLE);

        Ok(MappedRing {
            pruss: Arc::clone(&self.pruss),
            extmem: Arc::clone(&self.extmem),
            capacity: self.ring_bytes,
        })
    }

    fn halt(&mut self) -> Result<()> {
        self.control(CONTROL_HALT);
        info!("🛑 PRU halted");
        Ok(())
    }
}

fn open_sync(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_SYNC)
        .open(path)
        .map_err(|e| IorecError::config(format!("failed to open {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_descriptor() {
        assert_eq!(parse_descriptor("0x9e940000\n").unwrap(), 0x9e94_0000);
        assert_eq!(parse_descriptor("  0X00800000 ").unwrap(), 0x0080_0000);
    }

    #[test]
    fn test_parse_descriptor_rejects_non_hex() {
        assert!(parse_descriptor("8388608").is_err());
        assert!(parse_descriptor("0xzz").is_err());
        assert!(parse_descriptor("").is_err());
    }

    #[test]
    fn test_read_descriptor_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "0x00800000").unwrap();
        assert_eq!(read_descriptor(file.path()).unwrap(), 8 * 1024 * 1024);

        let missing = read_descriptor(Path::new("/nonexistent/iorec/size"));
        assert!(matches!(missing, Err(IorecError::Config(_))));
    }

    #[test]
    fn test_validate_ring_size() {
        let min = shared::protocol::MIN_RING_BYTES;
        assert_eq!(validate_ring_size(min as u64, min).unwrap(), min);
        assert!(validate_ring_size(min as u64 - 4, min).is_err());
        assert!(validate_ring_size(min as u64 + 2, min).is_err());
        assert!(validate_ring_size(1 << 33, min).is_err());
        assert_eq!(validate_ring_size(2 * min as u64, min).unwrap(), 2 * min);
    }

    #[test]
    fn test_validate_ring_size_requires_power_of_two() {
        let min = shared::protocol::MIN_RING_BYTES;
        // 12 MiB: large enough and word aligned, but not a power of two
        assert!(matches!(
            validate_ring_size(min as u64 + min as u64 / 2, min),
            Err(IorecError::Config(_))
        ));
        assert!(validate_ring_size(min as u64 + 4, min).is_err());
    }
}
