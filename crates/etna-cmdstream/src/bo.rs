//! Buffer objects as seen by the submission core.
//!
//! Allocation, mapping, and lifetime are owned by an external allocator (see [`BoAllocator`]).
//! Sharing uses `Arc`: the registry holds an extra clone for as long as a BO is part of an open
//! submission, so the caller may drop its own handle mid-recording.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::AllocError;

bitflags! {
    /// Allocation flags passed through to the allocator.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BoFlags: u32 {
        /// Backing store for a command stream.
        const CMDSTREAM = 0x0000_0001;
    }
}

bitflags! {
    /// How a submission accesses a BO. Accumulated per BO over one submission cycle.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BoAccess: u32 {
        const READ = 0x0001;
        const WRITE = 0x0002;
    }
}

/// A GPU buffer object handle.
pub struct BufferObject {
    handle: u32,
    size: u32,
    presumed: AtomicU64,
}

impl BufferObject {
    pub fn new(handle: u32, size: u32, presumed: u64) -> Self {
        Self {
            handle,
            size,
            presumed: AtomicU64::new(presumed),
        }
    }

    /// Kernel GEM handle.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Speculative GPU address used to pre-compute relocated words.
    pub fn presumed(&self) -> u64 {
        self.presumed.load(Ordering::Relaxed)
    }

    /// Record the address the kernel actually placed this BO at.
    pub fn set_presumed(&self, presumed: u64) {
        self.presumed.store(presumed, Ordering::Relaxed);
    }
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("presumed", &format_args!("{:#x}", self.presumed()))
            .finish()
    }
}

/// CPU-writable view of a mapped command-stream BO, in 32-bit words.
pub trait CommandMemory {
    fn words(&self) -> &[u32];
    fn words_mut(&mut self) -> &mut [u32];
}

impl CommandMemory for Vec<u32> {
    fn words(&self) -> &[u32] {
        self
    }

    fn words_mut(&mut self) -> &mut [u32] {
        self
    }
}

impl CommandMemory for Box<[u32]> {
    fn words(&self) -> &[u32] {
        self
    }

    fn words_mut(&mut self) -> &mut [u32] {
        self
    }
}

/// External BO allocator. Reference counting is `Arc`; dropping the last clone releases the BO.
pub trait BoAllocator {
    fn alloc(&self, size: u32, flags: BoFlags) -> Result<Arc<BufferObject>, AllocError>;

    /// Map `bo` for CPU writes. The mapping stays valid for as long as it is held.
    fn map(&self, bo: &Arc<BufferObject>) -> Result<Box<dyn CommandMemory>, AllocError>;
}
