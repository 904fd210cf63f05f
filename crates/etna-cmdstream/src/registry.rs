use std::collections::HashMap;
use std::sync::Arc;

use crate::bo::{BoAccess, BufferObject};
use crate::error::{CmdStreamError, Result};
use crate::record_table::RecordTable;

/// One BO referenced by the open submission.
#[derive(Clone, Debug)]
pub struct RegisteredBo {
    pub bo: Arc<BufferObject>,
    pub access: BoAccess,
}

/// Per-submission BO table with identity deduplication.
///
/// Each registered entry holds a clone of the BO's `Arc`, keeping it alive until [`clear`]
/// runs at the end of the flush.
///
/// [`clear`]: BoRegistry::clear
#[derive(Debug)]
pub struct BoRegistry {
    entries: RecordTable<RegisteredBo>,
    by_handle: HashMap<u32, usize>,
}

impl Default for BoRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BoRegistry {
    pub fn new() -> Self {
        Self {
            entries: RecordTable::new("bo"),
            by_handle: HashMap::new(),
        }
    }

    /// Register `bo` for this submission (once) and OR `access` into its flags.
    ///
    /// Returns the BO's index in the submission's BO table.
    pub fn ensure_registered(&mut self, bo: &Arc<BufferObject>, access: BoAccess) -> Result<usize> {
        let index = match self.by_handle.get(&bo.handle()) {
            Some(&index) => {
                let Some(entry) = self.entries.get(index) else {
                    debug_assert!(false, "bo {} indexed past end of table", bo.handle());
                    return Err(CmdStreamError::InvariantViolation(
                        "bo registry index out of range",
                    ));
                };
                if !Arc::ptr_eq(&entry.bo, bo) {
                    debug_assert!(false, "two live bos share handle {}", bo.handle());
                    return Err(CmdStreamError::InvariantViolation(
                        "distinct buffer objects share a kernel handle",
                    ));
                }
                index
            }
            None => {
                debug_assert_eq!(self.by_handle.len(), self.entries.len());
                let index = self.entries.append(RegisteredBo {
                    bo: Arc::clone(bo),
                    access: BoAccess::empty(),
                })?;
                self.by_handle.insert(bo.handle(), index);
                index
            }
        };

        if let Some(entry) = self.entries.get_mut(index) {
            entry.access |= access;
        }
        Ok(index)
    }

    /// Index of `bo` in the current table, if registered.
    pub fn index_of(&self, bo: &BufferObject) -> Option<usize> {
        self.by_handle.get(&bo.handle()).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[RegisteredBo] {
        self.entries.as_slice()
    }

    /// Release every registration and the references they hold.
    pub fn clear(&mut self) {
        self.by_handle.clear();
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bo(handle: u32) -> Arc<BufferObject> {
        Arc::new(BufferObject::new(handle, 4096, u64::from(handle) << 12))
    }

    #[test]
    fn repeated_registration_reuses_index_and_accumulates_flags() {
        let mut registry = BoRegistry::new();
        let a = bo(1);
        let b = bo(2);

        assert_eq!(registry.ensure_registered(&a, BoAccess::READ).unwrap(), 0);
        assert_eq!(registry.ensure_registered(&b, BoAccess::READ).unwrap(), 1);
        assert_eq!(registry.ensure_registered(&a, BoAccess::WRITE).unwrap(), 0);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.entries()[0].access, BoAccess::READ | BoAccess::WRITE);
        assert_eq!(registry.entries()[1].access, BoAccess::READ);
        assert_eq!(registry.index_of(&b), Some(1));
    }

    #[test]
    fn registration_keeps_bo_alive_until_clear() {
        let mut registry = BoRegistry::new();
        let a = bo(3);
        registry.ensure_registered(&a, BoAccess::READ).unwrap();
        assert_eq!(Arc::strong_count(&a), 2);

        let weak = Arc::downgrade(&a);
        drop(a);
        assert!(weak.upgrade().is_some());

        registry.clear();
        assert!(weak.upgrade().is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn first_registration_at_index_zero_is_distinct_from_unregistered() {
        let mut registry = BoRegistry::new();
        let a = bo(9);
        assert_eq!(registry.index_of(&a), None);
        registry.ensure_registered(&a, BoAccess::empty()).unwrap();
        assert_eq!(registry.index_of(&a), Some(0));
        assert_eq!(registry.entries()[0].access, BoAccess::empty());
    }

    proptest! {
        #[test]
        fn each_bo_appears_once_with_or_of_requested_flags(
            calls in proptest::collection::vec((0u32..8, 0u32..4), 0..64)
        ) {
            let bos: Vec<_> = (0..8).map(bo).collect();
            let mut registry = BoRegistry::new();
            let mut expected = [BoAccess::empty(); 8];
            let mut seen = [false; 8];

            for &(which, bits) in &calls {
                let access = BoAccess::from_bits_truncate(bits);
                registry.ensure_registered(&bos[which as usize], access).unwrap();
                expected[which as usize] |= access;
                seen[which as usize] = true;
            }

            prop_assert_eq!(registry.len(), seen.iter().filter(|s| **s).count());
            for (handle, entry) in registry.entries().iter().map(|e| (e.bo.handle(), e)) {
                prop_assert_eq!(entry.access, expected[handle as usize]);
                let dupes = registry
                    .entries()
                    .iter()
                    .filter(|e| e.bo.handle() == handle)
                    .count();
                prop_assert_eq!(dupes, 1);
            }
        }
    }
}
