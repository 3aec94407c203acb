//! Engine error taxonomy.
//!
//! Collaborator failures (transport, flash, image parsing, boot selection)
//! are mapped into this single public taxonomy at the session boundary; the
//! collaborator modules keep their own narrower error enums.

use thiserror::Error;

use crate::boot::BootError;
use crate::decrypt::DecryptError;
use crate::flash::FlashError;
use crate::image::ImageError;
use crate::phase::Phase;
use crate::transport::TransportError;

/// Errors surfaced by the public update API.
#[derive(Error, Debug)]
pub enum OtaError {
    /// Malformed configuration.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Operation invoked out of legal phase order.
    #[error("operation not legal in phase {phase}")]
    InvalidState {
        /// Phase the session was in when the call was rejected.
        phase: Phase,
    },

    /// Internal buffer allocation failed.
    #[error("buffer allocation failed")]
    NoMemory,

    /// The transport could not establish or sustain the HTTP(S) session.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Chip mismatch, bad magic, digest mismatch or premature finish.
    #[error("image validation failed: {0}")]
    ImageValidationFailed(String),

    /// A flash operation did not complete in time.
    #[error("flash operation timed out after {timeout_ms}ms")]
    FlashTimeout {
        /// Timeout reported by the storage driver.
        timeout_ms: u64,
    },

    /// A flash erase/write/read failed.
    #[error("flash operation failed: {0}")]
    FlashOpFailed(String),

    /// Boot-layout lookup failed.
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<TransportError> for OtaError {
    fn from(err: TransportError) -> Self {
        OtaError::ConnectionFailed(err.to_string())
    }
}

impl From<FlashError> for OtaError {
    fn from(err: FlashError) -> Self {
        match err {
            FlashError::Timeout { timeout_ms } => OtaError::FlashTimeout { timeout_ms },
            other => OtaError::FlashOpFailed(other.to_string()),
        }
    }
}

impl From<ImageError> for OtaError {
    fn from(err: ImageError) -> Self {
        OtaError::ImageValidationFailed(err.to_string())
    }
}

impl From<DecryptError> for OtaError {
    fn from(err: DecryptError) -> Self {
        OtaError::ImageValidationFailed(err.to_string())
    }
}

impl From<BootError> for OtaError {
    fn from(err: BootError) -> Self {
        match err {
            BootError::NoUpdatablePartition | BootError::UnknownPartition(_) => {
                OtaError::NotFound(err.to_string())
            }
            BootError::SelectFailed(_) => OtaError::FlashOpFailed(err.to_string()),
        }
    }
}
