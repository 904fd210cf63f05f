//! Deferred address patches and their flush-time association with command buffers.

use std::ops::Range;
use std::sync::Arc;

use crate::bo::{BoAccess, BufferObject};

/// A relocation as requested by the caller.
#[derive(Clone, Debug)]
pub struct Reloc {
    pub bo: Arc<BufferObject>,
    pub access: BoAccess,
    /// Byte offset within `bo` the kernel adds when it patches the word.
    pub offset: u32,
    pub or: u32,
    /// Negative values shift right by `-shift`.
    pub shift: i32,
}

impl Reloc {
    /// A plain read reference to the start of `bo`.
    pub fn read(bo: &Arc<BufferObject>) -> Self {
        Self {
            bo: Arc::clone(bo),
            access: BoAccess::READ,
            offset: 0,
            or: 0,
            shift: 0,
        }
    }

    /// A plain write reference to the start of `bo`.
    pub fn write(bo: &Arc<BufferObject>) -> Self {
        Self {
            access: BoAccess::WRITE,
            ..Self::read(bo)
        }
    }

    /// The word written into the stream before the kernel confirms placement.
    pub fn patch_value(&self) -> u32 {
        patch_value(self.bo.presumed(), self.or, self.shift)
    }
}

/// `(presumed shifted by shift) | or`, truncated to one stream word.
///
/// The shift is logical in both directions; shifting by 64 or more yields zero.
pub fn patch_value(presumed: u64, or: u32, shift: i32) -> u32 {
    let addr = if shift < 0 {
        presumed.checked_shr(shift.unsigned_abs()).unwrap_or(0)
    } else {
        presumed.checked_shl(shift as u32).unwrap_or(0)
    };
    (addr as u32) | or
}

/// A recorded relocation awaiting submission.
#[derive(Clone, Debug)]
pub struct RelocEntry {
    pub bo: Arc<BufferObject>,
    pub access: BoAccess,
    pub reloc_offset: u32,
    pub or: u32,
    pub shift: i32,
    /// Byte offset of the patched word within the ring that wrote it.
    pub submit_offset: u32,
}

/// Index of the first entry at or after `start` whose `submit_offset >= offset`.
///
/// `relocs` must be ordered by `submit_offset`. Returns `relocs.len()` when nothing qualifies.
pub fn find_next_reloc_idx(relocs: &[RelocEntry], start: usize, offset: u32) -> usize {
    let start = start.min(relocs.len());
    start + relocs[start..].partition_point(|r| r.submit_offset < offset)
}

/// Indices of the relocations whose patched word lies in `[offset, offset + size)`.
pub fn reloc_range(relocs: &[RelocEntry], offset: u32, size: u32) -> Range<usize> {
    let a = find_next_reloc_idx(relocs, 0, offset);
    let b = find_next_reloc_idx(relocs, a, offset.saturating_add(size));
    a..b
}
