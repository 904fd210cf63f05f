use thiserror::Error;

pub type Result<T> = std::result::Result<T, CmdStreamError>;

/// Failure reported by the kernel submit/wait transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("kernel call failed with errno {0}")]
    Errno(i32),

    #[error("kernel transport error: {0}")]
    Other(String),
}

/// Failure reported by the buffer-object allocator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("out of memory allocating {size} byte buffer object")]
    OutOfMemory { size: u32 },

    #[error("failed to map buffer object {handle}")]
    MapFailed { handle: u32 },
}

/// Unified error type for command recording and submission.
///
/// [`CmdStreamError::SubmitFailed`] means the recorded work for that flush is gone; nothing in
/// this crate retries a submission. [`CmdStreamError::WaitTimeout`] is recoverable: the fence is
/// still valid and can be waited on again.
#[derive(Debug, Error)]
pub enum CmdStreamError {
    #[error("resource exhausted: {what}")]
    ResourceExhausted { what: &'static str },

    /// Backing storage for a ring could not be allocated or mapped.
    #[error("buffer object allocation failed: {0}")]
    Alloc(#[from] AllocError),

    #[error("submit failed: {0}")]
    SubmitFailed(#[source] TransportError),

    #[error("timed out waiting for fence {fence}")]
    WaitTimeout { fence: u32 },

    #[error("fence wait failed: {0}")]
    WaitFailed(#[source] TransportError),

    #[error("invariant violated: {0}")]
    InvariantViolation(&'static str),
}

impl CmdStreamError {
    /// Table growth and backing allocation failures both leave the object unusable.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(
            self,
            CmdStreamError::ResourceExhausted { .. } | CmdStreamError::Alloc(_)
        )
    }

    /// Whether the caller may retry the operation without re-recording anything.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CmdStreamError::WaitTimeout { .. })
    }
}
