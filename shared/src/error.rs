/*!
Common error types for the iorec capture and decode tools.
*/

use thiserror::Error;

/// Common result type used throughout the shared library
pub type Result<T> = std::result::Result<T, IorecError>;

/// Error taxonomy for capture, persistence and decode operations.
///
/// Framing violations are deliberately absent: the decoder recovers from
/// them locally and only counts them in [`crate::uart::DecodeStats`].
#[derive(Error, Debug)]
pub enum IorecError {
    /// I/O errors (bitstream sink/source, descriptor files, annotation output)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A bulk write accepted fewer bytes than it was handed
    #[error("short write: {written} of {expected} bytes accepted")]
    ShortWrite { expected: usize, written: usize },

    /// The producer lapped the consumer; unread samples were overwritten
    #[error(
        "buffer overrun: producer at {before} passed last read {last_read} + capacity {capacity} (gap {} bytes)",
        byte_gap(.write, .last_read)
    )]
    Overrun {
        before: u32,
        write: u32,
        last_read: u32,
        capacity: u32,
    },

    /// The self-test verifier saw a sample that is not the expected counter value
    #[error("self-test failed at byte offset {offset}: expected {expected:#010x}, got {actual:#010x}")]
    SelfTest { offset: u64, expected: u32, actual: u32 },

    /// Serialization errors (capture summaries)
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Configuration errors (descriptor files, privilege, undersized ring)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input that does not follow the persisted bitstream or raw sample layout
    #[error("Invalid file format: {0}")]
    InvalidFileFormat(String),
}

fn byte_gap(write: &u32, last_read: &u32) -> u32 {
    write.wrapping_sub(*last_read)
}

impl IorecError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new invalid file format error
    pub fn invalid_file_format(msg: impl Into<String>) -> Self {
        Self::InvalidFileFormat(msg.into())
    }

    /// True for the fatal "producer lapped us" condition
    pub fn is_overrun(&self) -> bool {
        matches!(self, Self::Overrun { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrun_message_reports_gap() {
        let err = IorecError::Overrun {
            before: 9000,
            write: 8800,
            last_read: 100,
            capacity: 8192,
        };
        assert!(err.is_overrun());
        assert!(err.to_string().contains("gap 8700 bytes"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::WriteZero, "disk full");
        let err: IorecError = io.into();
        assert!(matches!(err, IorecError::Io(_)));
        assert!(!err.is_overrun());
    }
}
