use std::fmt;
use std::ops::Index;

use crate::error::{CmdStreamError, Result};

/// Compute the capacity to grow to so that one more record fits.
///
/// Doubles the current capacity; if that is still too small (including the initial empty
/// table), jumps straight to `len + 5`.
pub(crate) fn grown_capacity(len: usize, capacity: usize) -> usize {
    let needed = len + 1;
    if needed <= capacity {
        return capacity;
    }
    let doubled = capacity.saturating_mul(2);
    if doubled < needed {
        len + 5
    } else {
        doubled
    }
}

/// Append-only table of submission records.
///
/// Backing storage grows geometrically and is never released by [`RecordTable::clear`], so a
/// table reused across many flushes stops allocating once it has seen its peak size.
#[derive(Clone, PartialEq, Eq)]
pub struct RecordTable<T> {
    what: &'static str,
    records: Vec<T>,
}

impl<T> RecordTable<T> {
    /// Create an empty table. `what` names the table in resource-exhaustion errors.
    pub fn new(what: &'static str) -> Self {
        Self {
            what,
            records: Vec::new(),
        }
    }

    /// Append `record` and return its index.
    ///
    /// On allocation failure the table keeps its previous contents and
    /// [`CmdStreamError::ResourceExhausted`] is returned.
    pub fn append(&mut self, record: T) -> Result<usize> {
        let len = self.records.len();
        let target = grown_capacity(len, self.records.capacity());
        if target > self.records.capacity() {
            self.records
                .try_reserve_exact(target - len)
                .map_err(|_| CmdStreamError::ResourceExhausted { what: self.what })?;
        }
        self.records.push(record);
        Ok(len)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.records.capacity()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.records.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.records.get_mut(index)
    }

    pub fn last(&self) -> Option<&T> {
        self.records.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.records.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.records
    }

    /// Drop every record while keeping the allocation.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Drop the first `count` records, shifting the rest down.
    pub fn drain_front(&mut self, count: usize) {
        let count = count.min(self.records.len());
        self.records.drain(..count);
    }
}

impl<T> Index<usize> for RecordTable<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.records[index]
    }
}

impl<'a, T> IntoIterator for &'a RecordTable<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl<T: fmt::Debug> fmt::Debug for RecordTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordTable")
            .field("what", &self.what)
            .field("len", &self.records.len())
            .field("capacity", &self.records.capacity())
            .field("records", &self.records)
            .finish()
    }
}
