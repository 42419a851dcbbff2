//! Error types for the metadata subsystem.

use thiserror::Error;

/// Result type alias for metadata operations.
pub type MetaResult<T> = Result<T, MetaError>;

/// Error variants for metadata operations.
#[derive(Debug, Error)]
pub enum MetaError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The metadata device reported a failure for this block.
    #[error("Metadata device error at sector {sector}: {reason}")]
    DeviceError {
        /// The first sector of the failed block.
        sector: u64,
        /// Description of the error.
        reason: String,
    },

    /// Access outside of the metadata area.
    #[error("Sector {sector} out of range (capacity {capacity} sectors)")]
    OutOfRange {
        /// The requested sector.
        sector: u64,
        /// Capacity of the metadata device in sectors.
        capacity: u64,
    },

    /// Sector or buffer is not properly aligned.
    #[error("Not aligned: {what} {value} is not aligned to {alignment}")]
    NotAligned {
        /// What was misaligned (sector, buffer length).
        what: &'static str,
        /// The offending value.
        value: u64,
        /// The required alignment.
        alignment: u64,
    },

    /// Checksum of a metadata block does not match its contents.
    #[error("Checksum mismatch at sector {sector}: expected {expected:#x}, actual {actual:#x}")]
    ChecksumMismatch {
        /// The sector of the block.
        sector: u64,
        /// The checksum stored in the block.
        expected: u32,
        /// The checksum computed over the block.
        actual: u32,
    },

    /// A metadata block carries an unexpected magic number.
    #[error("Bad magic at sector {sector}: {found:#x}")]
    BadMagic {
        /// The sector of the block.
        sector: u64,
        /// The magic that was found.
        found: u32,
    },

    /// The requested layout cannot be built for this device.
    #[error("Invalid layout: {reason}")]
    InvalidLayout {
        /// Description of the problem.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_result_alias() {
        let ok: MetaResult<u32> = Ok(7);
        assert!(ok.is_ok());
        let err: MetaResult<u32> = Err(MetaError::OutOfRange {
            sector: 10,
            capacity: 8,
        });
        assert!(err.is_err());
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: MetaError = std_err.into();
        assert!(matches!(err, MetaError::IoError(_)));
    }

    #[test]
    fn test_checksum_mismatch_display() {
        let err = MetaError::ChecksumMismatch {
            sector: 64,
            expected: 0xdead,
            actual: 0xbeef,
        };
        let msg = err.to_string();
        assert!(msg.contains("0xdead"));
        assert!(msg.contains("0xbeef"));
        assert!(msg.contains("64"));
    }

    #[test]
    fn test_not_aligned_display() {
        let err = MetaError::NotAligned {
            what: "sector",
            value: 3,
            alignment: 8,
        };
        assert_eq!(err.to_string(), "Not aligned: sector 3 is not aligned to 8");
    }
}
