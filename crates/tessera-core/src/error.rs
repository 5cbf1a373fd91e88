//! Error types for tessera-core.

use crate::kernel::KernelId;
use crate::tensor::BufferId;
use thiserror::Error;

/// Error type for backend operations.
///
/// Every error is returned to the immediate caller. Nothing is retried
/// internally, and a failed invocation leaves the backend usable.
#[derive(Error, Debug)]
pub enum Error {
    #[error("GPU device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Buffer not found: {0}")]
    BufferNotFound(BufferId),

    #[error("Kernel instance not found: {0}")]
    KernelNotFound(KernelId),

    #[error("Kernel {requested} invoked while kernel {active} is executing")]
    ConcurrencyViolation { active: KernelId, requested: KernelId },

    #[error("Failed to allocate {size} bytes: {reason}")]
    AllocationFailure { size: u64, reason: String },

    #[error("Upload of {len} bytes does not fit buffer {id} ({size} bytes)")]
    InvalidUpload { id: BufferId, len: usize, size: u64 },

    #[error("Missing attribute: {0}")]
    MissingAttribute(String),

    #[error("Invalid attribute '{0}': {1}")]
    InvalidAttribute(String, String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// True for unknown buffer or kernel ids.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::BufferNotFound(_) | Self::KernelNotFound(_))
    }
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;
