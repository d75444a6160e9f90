//! Error types for the flexalloc block I/O layer
//!
//! Validation and geometry errors are raised before any command is issued.
//! Submission and completion errors describe a single failed command, while
//! `StripeIo` is the aggregate outcome of a striped transfer.

use crate::types::{CplStatus, Opcode, SubmitError};
use thiserror::Error;

/// Common result type for flexalloc operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for flexalloc
#[derive(Debug, Error)]
pub enum Error {
    // Raised before any command is issued
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported device geometry: {0}")]
    Geometry(String),

    // Command failures
    #[error("{op} at lba {slba} could not be submitted: {error}")]
    Submission {
        op: Opcode,
        slba: u64,
        error: SubmitError,
    },

    #[error("{op} at lba {slba} completed with status {status}")]
    Completion {
        op: Opcode,
        slba: u64,
        status: CplStatus,
    },

    #[error(
        "striped transfer failed: member {member} reported {errors} error(s), \
         {failed_members} member(s) failed in total"
    )]
    StripeIo {
        member: u32,
        errors: u32,
        failed_members: u32,
    },

    // Queue lifecycle
    #[error("queue resource error: {0}")]
    Resource(String),

    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a geometry error
    pub fn geometry(msg: impl Into<String>) -> Self {
        Self::Geometry(msg.into())
    }

    /// Create a queue resource error
    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this error means data may not have reached the device
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(
            self,
            Self::Submission { .. }
                | Self::Completion { .. }
                | Self::StripeIo { .. }
                | Self::DiskIo(_)
        )
    }

    /// Check if this is a transient submission error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Submission { error, .. } => error.is_transient(),
            _ => false,
        }
    }

    /// Check if this error was raised before any command was issued
    #[must_use]
    pub const fn is_precondition(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Geometry(_))
    }

    /// Negative errno equivalent, for callers bridging to C-style APIs
    #[must_use]
    pub fn errno(&self) -> i32 {
        use nix::errno::Errno;

        let errno = match self {
            Self::Validation(_) | Self::Geometry(_) | Self::Configuration(_) => Errno::EINVAL,
            Self::Submission { error, .. } => error.errno(),
            Self::Completion { .. } | Self::StripeIo { .. } => Errno::EIO,
            Self::Resource(_) => Errno::ENOMEM,
            Self::DiskIo(e) => e.raw_os_error().map_or(Errno::EIO, Errno::from_raw),
        };
        -(errno as i32)
    }
}
