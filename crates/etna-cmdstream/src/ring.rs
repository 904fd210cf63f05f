//! Command stream rings and the flush path that turns them into kernel submissions.
//!
//! A ring records into a mapped BO and keeps its submission bookkeeping (BO table, command
//! buffers, relocations) in a [`SubmitState`]. Chained rings created with [`Ring::new_child`]
//! share their owner's state: every BO and relocation they record is attributed to the owner's
//! next submission, and their content only reaches the GPU through
//! [`Ring::emit_reloc_ring`] on the owner.

use std::cell::{Cell, RefCell, RefMut};
use std::fmt;
use std::ops::{Deref, DerefMut, Range};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::abi::{SubmitBo, SubmitCmd, SubmitReloc, SubmitRequest, SUBMIT_CMD_BUF};
use crate::bo::{BoAccess, BoFlags, BufferObject, CommandMemory};
use crate::error::{AllocError, CmdStreamError, Result};
use crate::pipe::Pipe;
use crate::record_table::RecordTable;
use crate::registry::BoRegistry;
use crate::reloc::{reloc_range, Reloc, RelocEntry};

/// Per-ring relocation bookkeeping inside a shared submission state.
#[derive(Debug)]
struct StreamRecord {
    relocs: RecordTable<RelocEntry>,
    /// Bytes of this ring already handed to the open (or a past) submission.
    consumed: u32,
    timestamp: Weak<Cell<u32>>,
}

impl StreamRecord {
    fn new(timestamp: &Rc<Cell<u32>>) -> Self {
        Self {
            relocs: RecordTable::new("reloc"),
            consumed: 0,
            timestamp: Rc::downgrade(timestamp),
        }
    }

    fn is_live(&self) -> bool {
        self.timestamp.strong_count() > 0
    }

    /// Forget relocations that belong to content already submitted.
    fn drop_consumed(&mut self) {
        if !self.is_live() {
            self.relocs.clear();
            return;
        }
        let consumed = self.consumed;
        let done = self
            .relocs
            .as_slice()
            .partition_point(|r| r.submit_offset < consumed);
        self.relocs.drain_front(done);
    }
}

#[derive(Clone, Debug)]
struct CmdRecord {
    bo: Arc<BufferObject>,
    offset: u32,
    size: u32,
    kind: u32,
    stream: usize,
}

impl CmdRecord {
    fn same_region(&self, other: &CmdRecord) -> bool {
        self.offset == other.offset
            && self.size == other.size
            && self.kind == other.kind
            && Arc::ptr_eq(&self.bo, &other.bo)
    }
}

/// Table lengths of the submission currently being recorded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingTables {
    pub bos: usize,
    pub cmds: usize,
    pub relocs: usize,
    pub chained: usize,
}

/// Everything one submission is built from.
#[derive(Debug)]
struct SubmitState {
    bos: BoRegistry,
    cmds: RecordTable<CmdRecord>,
    /// Streams that contributed a command buffer to the open submission.
    chained: RecordTable<usize>,
    streams: Vec<StreamRecord>,
}

impl SubmitState {
    fn new(owner_timestamp: &Rc<Cell<u32>>) -> Self {
        Self {
            bos: BoRegistry::new(),
            cmds: RecordTable::new("cmd"),
            chained: RecordTable::new("chained ring"),
            streams: vec![StreamRecord::new(owner_timestamp)],
        }
    }

    fn is_chained(&self, stream: usize) -> bool {
        self.chained.iter().any(|&s| s == stream)
    }

    /// A dead ring's slot is only reused once the open submission no longer refers to it.
    fn attach_stream(&mut self, timestamp: &Rc<Cell<u32>>) -> usize {
        let reusable = (0..self.streams.len()).find(|&slot| {
            let record = &self.streams[slot];
            !record.is_live() && record.relocs.is_empty() && !self.is_chained(slot)
        });
        if let Some(slot) = reusable {
            self.streams[slot] = StreamRecord::new(timestamp);
            return slot;
        }
        self.streams.push(StreamRecord::new(timestamp));
        self.streams.len() - 1
    }

    /// Add a command buffer unless an identical one is already part of this submission.
    fn append_cmd(&mut self, cmd: CmdRecord) -> Result<usize> {
        self.bos.ensure_registered(&cmd.bo, BoAccess::READ)?;

        if !self.is_chained(cmd.stream) {
            self.chained.append(cmd.stream)?;
        }

        if let Some(index) = self.cmds.iter().position(|c| c.same_region(&cmd)) {
            return Ok(index);
        }
        self.cmds.append(cmd)
    }

    fn record_reloc(&mut self, stream: usize, entry: RelocEntry) -> Result<()> {
        self.bos.ensure_registered(&entry.bo, entry.access)?;

        let Some(record) = self.streams.get_mut(stream) else {
            debug_assert!(false, "relocation for unknown stream {stream}");
            return Err(CmdStreamError::InvariantViolation(
                "relocation recorded for an unknown ring",
            ));
        };
        if let Some(last) = record.relocs.last() {
            if last.submit_offset > entry.submit_offset {
                debug_assert!(
                    false,
                    "relocation at {:#x} emitted after {:#x}",
                    entry.submit_offset, last.submit_offset
                );
                return Err(CmdStreamError::InvariantViolation(
                    "relocations emitted out of stream order",
                ));
            }
        }
        record.relocs.append(entry)?;
        Ok(())
    }

    fn reloc_range_for(&self, cmd: &CmdRecord) -> Range<usize> {
        match self.streams.get(cmd.stream) {
            Some(record) => reloc_range(record.relocs.as_slice(), cmd.offset, cmd.size),
            None => 0..0,
        }
    }

    /// Register everything the command buffers reference, then lay out the wire request.
    fn build_request(&mut self, pipe: u32) -> Result<SubmitRequest> {
        let ranges: Vec<Range<usize>> = self
            .cmds
            .iter()
            .map(|cmd| self.reloc_range_for(cmd))
            .collect();

        let SubmitState {
            bos, cmds, streams, ..
        } = self;

        for (cmd, range) in cmds.iter().zip(&ranges) {
            bos.ensure_registered(&cmd.bo, BoAccess::READ)?;
            for reloc in &streams[cmd.stream].relocs.as_slice()[range.clone()] {
                bos.ensure_registered(&reloc.bo, reloc.access)?;
            }
        }

        let index_of = |bo: &BufferObject| -> Result<u32> {
            bos.index_of(bo)
                .map(|i| i as u32)
                .ok_or(CmdStreamError::InvariantViolation(
                    "referenced bo missing from submission",
                ))
        };

        let mut wire_cmds = Vec::with_capacity(cmds.len());
        let mut wire_relocs = Vec::with_capacity(cmds.len());
        for (cmd, range) in cmds.iter().zip(&ranges) {
            wire_cmds.push(SubmitCmd {
                kind: cmd.kind,
                submit_idx: index_of(cmd.bo.as_ref())?,
                submit_offset: cmd.offset,
                size: cmd.size,
                ..SubmitCmd::default()
            });

            let relocs = streams[cmd.stream].relocs.as_slice()[range.clone()]
                .iter()
                .map(|r| -> Result<SubmitReloc> {
                    Ok(SubmitReloc {
                        submit_offset: r.submit_offset,
                        or: r.or,
                        shift: r.shift,
                        reloc_idx: index_of(r.bo.as_ref())?,
                        reloc_offset: u64::from(r.reloc_offset),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            wire_relocs.push(relocs);
        }

        let wire_bos = bos
            .entries()
            .iter()
            .map(|e| SubmitBo {
                flags: e.access.bits(),
                handle: e.bo.handle(),
                presumed: e.bo.presumed(),
            })
            .collect();

        Ok(SubmitRequest::new(pipe, wire_bos, wire_cmds, wire_relocs))
    }

    fn write_back_presumed(&self, request: &SubmitRequest) {
        for (entry, wire) in self.bos.entries().iter().zip(&request.bos) {
            if entry.bo.presumed() != wire.presumed {
                entry.bo.set_presumed(wire.presumed);
            }
        }
    }

    fn propagate_fence(&self, fence: u32) {
        for &stream in &self.chained {
            if let Some(timestamp) = self.streams.get(stream).and_then(|s| s.timestamp.upgrade()) {
                timestamp.set(fence);
            }
        }
    }

    fn pending_relocs(&self) -> usize {
        self.streams.iter().map(|s| s.relocs.len()).sum()
    }

    /// Release registrations and empty the per-submission tables.
    fn reset(&mut self) {
        self.bos.clear();
        self.cmds.clear();
        self.chained.clear();
        for stream in &mut self.streams {
            stream.drop_consumed();
        }
    }
}

/// Resets the submission state when the flush scope ends, on success and on every error path.
struct FlushScope<'a> {
    state: RefMut<'a, SubmitState>,
}

impl Deref for FlushScope<'_> {
    type Target = SubmitState;

    fn deref(&self) -> &SubmitState {
        &self.state
    }
}

impl DerefMut for FlushScope<'_> {
    fn deref_mut(&mut self) -> &mut SubmitState {
        &mut self.state
    }
}

impl Drop for FlushScope<'_> {
    fn drop(&mut self) {
        self.state.reset();
    }
}

/// A linear command stream backed by one mapped BO.
pub struct Ring {
    pipe: Rc<Pipe>,
    bo: Arc<BufferObject>,
    map: Box<dyn CommandMemory>,
    /// Capacity in words.
    end: usize,
    cur: usize,
    last_start: usize,
    last_timestamp: Rc<Cell<u32>>,
    state: Rc<RefCell<SubmitState>>,
    stream: usize,
    chained: bool,
}

impl Ring {
    /// Allocate and map a `size` byte ring that submits on its own.
    pub fn new(pipe: &Rc<Pipe>, size: u32) -> Result<Self> {
        let last_timestamp = Rc::new(Cell::new(0));
        let state = Rc::new(RefCell::new(SubmitState::new(&last_timestamp)));
        Self::with_state(pipe, size, last_timestamp, state, 0, false)
    }

    /// Allocate a ring whose content is embedded into `owner`'s submissions.
    ///
    /// BOs and relocations recorded through the child are attributed to the owner.
    pub fn new_child(owner: &Ring, size: u32) -> Result<Self> {
        let last_timestamp = Rc::new(Cell::new(0));
        let stream = owner.state.borrow_mut().attach_stream(&last_timestamp);
        Self::with_state(
            &owner.pipe,
            size,
            last_timestamp,
            Rc::clone(&owner.state),
            stream,
            true,
        )
    }

    fn with_state(
        pipe: &Rc<Pipe>,
        size: u32,
        last_timestamp: Rc<Cell<u32>>,
        state: Rc<RefCell<SubmitState>>,
        stream: usize,
        chained: bool,
    ) -> Result<Self> {
        let end = (size / 4) as usize;
        if end == 0 {
            return Err(CmdStreamError::InvariantViolation(
                "ring size must hold at least one word",
            ));
        }

        let bo = pipe.allocator().alloc(size, BoFlags::CMDSTREAM)?;
        let map = pipe.allocator().map(&bo)?;
        if map.words().len() < end {
            return Err(AllocError::MapFailed {
                handle: bo.handle(),
            }
            .into());
        }

        Ok(Self {
            pipe: Rc::clone(pipe),
            bo,
            map,
            end,
            cur: 0,
            last_start: 0,
            last_timestamp,
            state,
            stream,
            chained,
        })
    }

    pub fn pipe(&self) -> &Rc<Pipe> {
        &self.pipe
    }

    /// The BO backing this ring.
    pub fn bo(&self) -> &Arc<BufferObject> {
        &self.bo
    }

    /// Whether this ring is embedded into another ring's submissions.
    pub fn is_chained(&self) -> bool {
        self.chained
    }

    pub fn size_bytes(&self) -> u32 {
        (self.end * 4) as u32
    }

    /// Byte offset of the write cursor.
    pub fn offset_bytes(&self) -> u32 {
        (self.cur * 4) as u32
    }

    /// Byte offset where the next flushed (or chained) range starts.
    pub fn last_start_bytes(&self) -> u32 {
        (self.last_start * 4) as u32
    }

    /// Words left before the end of the buffer.
    pub fn remaining_words(&self) -> usize {
        self.end - self.cur
    }

    /// Words written since the buffer start.
    pub fn words(&self) -> &[u32] {
        &self.map.words()[..self.cur]
    }

    /// Fence of the most recent submission this ring contributed to.
    pub fn timestamp(&self) -> u32 {
        self.last_timestamp.get()
    }

    pub fn pending(&self) -> PendingTables {
        let state = self.state.borrow();
        PendingTables {
            bos: state.bos.len(),
            cmds: state.cmds.len(),
            relocs: state.pending_relocs(),
            chained: state.chained.len(),
        }
    }

    /// Write one word at the cursor. Space must have been reserved.
    pub fn emit(&mut self, word: u32) {
        debug_assert!(self.cur < self.end, "emit past end of ring without reserve");
        self.map.words_mut()[self.cur] = word;
        self.cur += 1;
    }

    /// Skip `words` words, leaving their contents unchanged.
    pub fn advance(&mut self, words: usize) {
        debug_assert!(self.cur + words <= self.end, "advance past end of ring");
        self.cur = (self.cur + words).min(self.end);
    }

    /// Emit the presumed address of `reloc.bo` and record the patch for the kernel.
    pub fn emit_reloc(&mut self, reloc: &Reloc) -> Result<()> {
        let submit_offset = self.offset_bytes();
        self.state.borrow_mut().record_reloc(
            self.stream,
            RelocEntry {
                bo: Arc::clone(&reloc.bo),
                access: reloc.access,
                reloc_offset: reloc.offset,
                or: reloc.or,
                shift: reloc.shift,
                submit_offset,
            },
        )?;

        let value = reloc.patch_value();
        tracing::trace!(
            bo = reloc.bo.handle(),
            submit_offset,
            value = format_args!("{value:#010x}"),
            "emit reloc"
        );
        self.emit(value);
        Ok(())
    }

    /// Embed `target`'s pending range into this ring's submission.
    ///
    /// Emits the address of `target`'s BO (the kernel adds the range offset) and returns the
    /// range size in bytes, which the caller encodes into the jump packet. The range counts as
    /// consumed: `target` continues recording after it.
    pub fn emit_reloc_ring(&mut self, target: &mut Ring) -> Result<u32> {
        if !Rc::ptr_eq(&self.state, &target.state) || !target.chained {
            return Err(CmdStreamError::InvariantViolation(
                "only rings attributed to this submission can be chained into it",
            ));
        }

        let offset = target.last_start_bytes();
        let size = target.offset_bytes() - offset;
        {
            let mut state = self.state.borrow_mut();
            state.append_cmd(CmdRecord {
                bo: Arc::clone(&target.bo),
                offset,
                size,
                kind: SUBMIT_CMD_BUF,
                stream: target.stream,
            })?;
            if let Some(record) = state.streams.get_mut(target.stream) {
                record.consumed = target.offset_bytes();
            }
        }

        self.emit_reloc(&Reloc {
            bo: Arc::clone(&target.bo),
            access: BoAccess::READ,
            offset,
            or: 0,
            shift: 0,
        })?;
        target.last_start = target.cur;
        Ok(size)
    }

    /// Make room for `words` words plus the end-of-stream clearance.
    ///
    /// A ring with its own submissions wraps when full: it flushes, waits for the GPU to retire
    /// that work, and restarts at the buffer start.
    pub fn reserve(&mut self, words: usize) -> Result<()> {
        let cfg = self.pipe.config();
        let size = self.size_bytes();
        let words = u32::try_from(words).unwrap_or(u32::MAX);
        if cfg.fits(size, self.cur as u32, words) {
            return Ok(());
        }
        if self.chained || !cfg.fits(size, 0, words) {
            return Err(CmdStreamError::ResourceExhausted {
                what: "command stream space",
            });
        }

        let fence = self.flush()?;
        self.wait(fence)?;
        self.reset()
    }

    /// Submit `[last_start, cur)` together with every chained command buffer.
    ///
    /// Returns the submission fence. Whatever the outcome, registrations are released, the
    /// tables are emptied, and `last_start` moves to the cursor; a failed submission is not
    /// retried.
    pub fn flush(&mut self) -> Result<u32> {
        if self.chained {
            return Err(CmdStreamError::InvariantViolation(
                "chained rings are submitted through their owner",
            ));
        }

        let offset = self.last_start_bytes();
        let size = self.offset_bytes() - offset;
        self.last_start = self.cur;

        let mut scope = FlushScope {
            state: self.state.borrow_mut(),
        };
        if let Some(record) = scope.streams.get_mut(self.stream) {
            record.consumed = self.offset_bytes();
        }
        scope.append_cmd(CmdRecord {
            bo: Arc::clone(&self.bo),
            offset,
            size,
            kind: SUBMIT_CMD_BUF,
            stream: self.stream,
        })?;

        let pipe = self.pipe.id();
        let mut request = scope.build_request(pipe.0)?;
        let fence = match self.pipe.submit(&mut request) {
            Ok(fence) => fence,
            Err(err) => {
                tracing::warn!(
                    pipe = pipe.0,
                    offset,
                    size,
                    "dropping submission: {err}"
                );
                return Err(err);
            }
        };

        scope.write_back_presumed(&request);
        scope.propagate_fence(fence);
        tracing::debug!(
            pipe = pipe.0,
            offset,
            size,
            bos = request.bos.len(),
            cmds = request.cmds().len(),
            relocs = request.relocs().len(),
            fence,
            "flushed ring"
        );
        Ok(fence)
    }

    /// Block until `timestamp` retires or the pipe's timeout elapses.
    pub fn wait(&self, timestamp: u32) -> Result<()> {
        self.pipe.wait(timestamp)
    }

    /// Flush, then wait for that submission to complete.
    pub fn finish(&mut self) -> Result<()> {
        self.flush()?;
        self.wait(self.timestamp())
    }

    /// Rewind the cursor to the buffer start and drop anything not yet submitted.
    ///
    /// For a ring with its own submissions this discards the whole open submission, including
    /// ranges chained into it. A chained ring cannot rewind while its owner's open submission
    /// still holds one of its ranges.
    pub fn reset(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if self.chained {
            if state.is_chained(self.stream) {
                return Err(CmdStreamError::InvariantViolation(
                    "chained ring reset before its owner submitted the chained range",
                ));
            }
        } else {
            state.reset();
        }
        if let Some(record) = state.streams.get_mut(self.stream) {
            record.relocs.clear();
            record.consumed = 0;
        }
        drop(state);

        self.cur = 0;
        self.last_start = 0;
        Ok(())
    }
}

impl fmt::Debug for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("pipe", &self.pipe.id())
            .field("bo", &self.bo)
            .field("end", &self.end)
            .field("cur", &self.cur)
            .field("last_start", &self.last_start)
            .field("last_timestamp", &self.last_timestamp.get())
            .field("chained", &self.chained)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(bo: &Arc<BufferObject>, submit_offset: u32) -> RelocEntry {
        RelocEntry {
            bo: Arc::clone(bo),
            access: BoAccess::READ,
            reloc_offset: 0,
            or: 0,
            shift: 0,
            submit_offset,
        }
    }

    #[test]
    fn identical_command_buffers_are_registered_once() {
        let timestamp = Rc::new(Cell::new(0));
        let mut state = SubmitState::new(&timestamp);
        let bo = Arc::new(BufferObject::new(1, 4096, 0));
        let cmd = CmdRecord {
            bo: Arc::clone(&bo),
            offset: 0,
            size: 64,
            kind: SUBMIT_CMD_BUF,
            stream: 0,
        };

        assert_eq!(state.append_cmd(cmd.clone()).unwrap(), 0);
        assert_eq!(state.append_cmd(cmd.clone()).unwrap(), 0);
        assert_eq!(
            state
                .append_cmd(CmdRecord {
                    size: 128,
                    ..cmd
                })
                .unwrap(),
            1
        );
        assert_eq!(state.cmds.len(), 2);
        assert_eq!(state.chained.len(), 1);
        assert_eq!(state.bos.len(), 1);
    }

    #[test]
    fn reset_keeps_unconsumed_relocs_of_live_streams() {
        let owner = Rc::new(Cell::new(0));
        let child = Rc::new(Cell::new(0));
        let mut state = SubmitState::new(&owner);
        let stream = state.attach_stream(&child);
        let bo = Arc::new(BufferObject::new(2, 4096, 0));

        for offset in [0, 8, 16, 24] {
            state.record_reloc(stream, entry(&bo, offset)).unwrap();
        }
        state.streams[stream].consumed = 16;
        state.reset();

        let left: Vec<u32> = state.streams[stream]
            .relocs
            .iter()
            .map(|r| r.submit_offset)
            .collect();
        assert_eq!(left, vec![16, 24]);
        assert!(state.bos.is_empty());
    }

    #[test]
    fn dead_stream_slots_are_reused() {
        let owner = Rc::new(Cell::new(0));
        let mut state = SubmitState::new(&owner);
        let first = Rc::new(Cell::new(0));
        let slot = state.attach_stream(&first);
        drop(first);

        let second = Rc::new(Cell::new(0));
        assert_eq!(state.attach_stream(&second), slot);
    }

    #[test]
    fn dead_stream_with_queued_range_keeps_its_slot() {
        let owner = Rc::new(Cell::new(0));
        let mut state = SubmitState::new(&owner);
        let first = Rc::new(Cell::new(0));
        let slot = state.attach_stream(&first);
        state
            .append_cmd(CmdRecord {
                bo: Arc::new(BufferObject::new(3, 4096, 0)),
                offset: 0,
                size: 16,
                kind: SUBMIT_CMD_BUF,
                stream: slot,
            })
            .unwrap();
        drop(first);

        let second = Rc::new(Cell::new(0));
        assert_ne!(state.attach_stream(&second), slot);

        state.reset();
        let third = Rc::new(Cell::new(0));
        assert_eq!(state.attach_stream(&third), slot);
    }

    #[test]
    fn fence_reaches_only_contributing_streams() {
        let owner = Rc::new(Cell::new(0));
        let child = Rc::new(Cell::new(0));
        let idle = Rc::new(Cell::new(0));
        let mut state = SubmitState::new(&owner);
        let child_stream = state.attach_stream(&child);
        state.attach_stream(&idle);

        state.chained.append(0).unwrap();
        state.chained.append(child_stream).unwrap();
        state.propagate_fence(42);

        assert_eq!(owner.get(), 42);
        assert_eq!(child.get(), 42);
        assert_eq!(idle.get(), 0);
    }
}
