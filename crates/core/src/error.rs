//! Error types for Tributary
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Errors fall into four groups:
//! - Usage errors: programming mistakes such as starting a message twice.
//!   These are reported immediately and never retried.
//! - Mapping failures: the OS refused to map or grow a region.
//! - Data errors: bytes on disk that do not decode.
//! - Transformation failures raised by pipeline user code.
//!
//! Running out of published data is not an error; pollers report it as a
//! zero-progress return.

use std::io;
use thiserror::Error;

/// Result type alias for Tributary operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the Tributary log and pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file open, resize, lock)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Mapping a region of the backing file failed
    #[error("Failed to map region at position {position}: {source}")]
    Mapping {
        /// Start position of the region in the backing file
        position: u64,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// `start_message` was called while a message is open
    #[error("Current message is not finished, must be finished before appending next")]
    MessageAlreadyStarted,

    /// `finish_message` (or a put) was called with no message open
    #[error("No message started")]
    NoMessageStarted,

    /// A region was mapped twice without an unmap in between
    #[error("Region already mapped to position {0}")]
    RegionAlreadyMapped(u64),

    /// A region was accessed or unmapped while not mapped
    #[error("Region is not mapped")]
    RegionNotMapped,

    /// A write was attempted through a read-only region
    #[error("Region at position {0} is mapped read-only")]
    ReadOnlyRegion(u64),

    /// An access fell outside the mapped region
    #[error("Access out of bounds: offset {offset}, length {len}, region size {size}")]
    OutOfBounds {
        /// Offset into the region
        offset: u64,
        /// Length of the access
        len: u64,
        /// Size of the region
        size: u64,
    },

    /// An atomic access was not aligned to its width
    #[error("Misaligned access: offset {offset} is not a multiple of {align}")]
    Misaligned {
        /// Offset into the region
        offset: u64,
        /// Required alignment
        align: u64,
    },

    /// A read-only mapping would extend past the end of the backing file
    #[error("Region at position {position} lies past the end of the file ({file_len} bytes)")]
    PastEndOfFile {
        /// Start of the requested region
        position: u64,
        /// Current file length
        file_len: u64,
    },

    /// An index ordinal whose record position is not addressable
    #[error("Index {0} is out of range")]
    IndexOutOfRange(u64),

    /// A second appender was requested for a log that already has one
    #[error("Log {0} already has an active appender")]
    AppenderInUse(String),

    /// The handle was closed
    #[error("{0} is closed")]
    Closed(&'static str),

    /// Payload does not fit the 32-bit length fields
    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge {
        /// Requested payload length
        len: usize,
        /// Maximum supported payload length
        max: usize,
    },

    /// Header fields rejected by validation or decoding
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Bytes on disk do not follow the record layout
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A pipeline transformation failed
    #[error("Transformation failed: {0}")]
    Transform(String),
}

impl Error {
    /// Create a transformation failure from any displayable reason.
    pub fn transform(reason: impl std::fmt::Display) -> Self {
        Error::Transform(reason.to_string())
    }

    /// True for programming errors that must not be retried.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Error::MessageAlreadyStarted
                | Error::NoMessageStarted
                | Error::RegionAlreadyMapped(_)
                | Error::RegionNotMapped
                | Error::ReadOnlyRegion(_)
                | Error::OutOfBounds { .. }
                | Error::Misaligned { .. }
                | Error::IndexOutOfRange(_)
                | Error::AppenderInUse(_)
                | Error::Closed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_io() {
        let err = Error::Io(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
    }

    #[test]
    fn test_error_display_mapping() {
        let err = Error::Mapping {
            position: 4096,
            source: io::Error::new(io::ErrorKind::OutOfMemory, "ENOMEM"),
        };
        let msg = err.to_string();
        assert!(msg.contains("4096"));
        assert!(msg.contains("ENOMEM"));
    }

    #[test]
    fn test_error_display_message_already_started() {
        let msg = Error::MessageAlreadyStarted.to_string();
        assert!(msg.contains("not finished"));
    }

    #[test]
    fn test_error_display_out_of_bounds() {
        let err = Error::OutOfBounds {
            offset: 10,
            len: 8,
            size: 16,
        };
        let msg = err.to_string();
        assert!(msg.contains("offset 10"));
        assert!(msg.contains("region size 16"));
    }

    #[test]
    fn test_transform_helper() {
        let err = Error::transform("bad input");
        assert!(matches!(err, Error::Transform(ref s) if s == "bad input"));
        assert!(!err.is_usage_error());
    }

    #[test]
    fn test_usage_error_classification() {
        assert!(Error::MessageAlreadyStarted.is_usage_error());
        assert!(Error::NoMessageStarted.is_usage_error());
        assert!(Error::RegionAlreadyMapped(0).is_usage_error());
        assert!(Error::RegionNotMapped.is_usage_error());
        assert!(Error::IndexOutOfRange(1 << 59).is_usage_error());
        assert!(!Error::PastEndOfFile {
            position: 0,
            file_len: 0
        }
        .is_usage_error());
        assert!(!Error::Corruption("x".into()).is_usage_error());
        assert!(!Error::InvalidConfig("x".into()).is_usage_error());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
