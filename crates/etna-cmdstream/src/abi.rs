//! Kernel submit ABI.
//!
//! Layouts mirror the DRM GEM submit ioctl field-for-field. Array fields are user pointers
//! carried as `u64`; [`SubmitRequest`] owns the arrays they point into.

use std::ops::Range;

use bytemuck::{Pod, Zeroable};

/// Command buffer type tag: a self-contained linear command buffer.
pub const SUBMIT_CMD_BUF: u32 = 0x0001;

/// One BO in the submission's BO table.
///
/// The kernel may rewrite `presumed` with the BO's actual GPU address.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SubmitBo {
    pub flags: u32,
    pub handle: u32,
    pub presumed: u64,
}

/// One deferred patch inside a command buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SubmitReloc {
    pub submit_offset: u32,
    pub or: u32,
    pub shift: i32,
    /// Index into the submission's BO table.
    pub reloc_idx: u32,
    pub reloc_offset: u64,
}

/// One region of GPU-executable memory.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SubmitCmd {
    pub kind: u32,
    /// Index of the backing BO in the submission's BO table.
    pub submit_idx: u32,
    pub submit_offset: u32,
    pub size: u32,
    pub pad: u32,
    pub nr_relocs: u32,
    /// User pointer to `nr_relocs` [`SubmitReloc`]s.
    pub relocs: u64,
}

/// Top-level ioctl argument block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SubmitArgs {
    pub pipe: u32,
    /// Written by the kernel.
    pub fence: u32,
    pub nr_bos: u32,
    pub nr_cmds: u32,
    pub bos: u64,
    pub cmds: u64,
}

const _: () = {
    assert!(core::mem::size_of::<SubmitBo>() == 16);
    assert!(core::mem::size_of::<SubmitReloc>() == 24);
    assert!(core::mem::size_of::<SubmitCmd>() == 32);
    assert!(core::mem::size_of::<SubmitArgs>() == 32);
};

/// A fully built submission, ready for the kernel transport.
#[derive(Debug)]
pub struct SubmitRequest {
    pub pipe: u32,
    pub bos: Vec<SubmitBo>,
    cmds: Vec<SubmitCmd>,
    relocs: Vec<SubmitReloc>,
    reloc_ranges: Vec<Range<usize>>,
}

impl SubmitRequest {
    /// Assemble a request. `cmd_relocs[i]` holds the relocations of `cmds[i]`.
    ///
    /// Relocations are laid out contiguously and each command's `relocs`/`nr_relocs` fields are
    /// pointed at its slice.
    pub fn new(
        pipe: u32,
        bos: Vec<SubmitBo>,
        mut cmds: Vec<SubmitCmd>,
        cmd_relocs: Vec<Vec<SubmitReloc>>,
    ) -> Self {
        debug_assert_eq!(cmds.len(), cmd_relocs.len());

        let total = cmd_relocs.iter().map(Vec::len).sum();
        let mut relocs = Vec::with_capacity(total);
        let mut reloc_ranges = Vec::with_capacity(cmds.len());
        for list in cmd_relocs {
            let start = relocs.len();
            relocs.extend(list);
            reloc_ranges.push(start..relocs.len());
        }

        // `relocs` is not resized past this point, so the addresses stay valid for the
        // lifetime of the request.
        for (cmd, range) in cmds.iter_mut().zip(&reloc_ranges) {
            cmd.nr_relocs = range.len() as u32;
            cmd.relocs = if range.is_empty() {
                0
            } else {
                relocs[range.clone()].as_ptr() as u64
            };
        }

        Self {
            pipe,
            bos,
            cmds,
            relocs,
            reloc_ranges,
        }
    }

    pub fn cmds(&self) -> &[SubmitCmd] {
        &self.cmds
    }

    /// Relocations attached to command `index`.
    pub fn relocs_for(&self, index: usize) -> &[SubmitReloc] {
        match self.reloc_ranges.get(index) {
            Some(range) => &self.relocs[range.clone()],
            None => &[],
        }
    }

    /// Every relocation in submission order.
    pub fn relocs(&self) -> &[SubmitReloc] {
        &self.relocs
    }

    /// The ioctl argument block pointing at this request's arrays.
    pub fn args(&self) -> SubmitArgs {
        SubmitArgs {
            pipe: self.pipe,
            fence: 0,
            nr_bos: self.bos.len() as u32,
            nr_cmds: self.cmds.len() as u32,
            bos: self.bos.as_ptr() as u64,
            cmds: self.cmds.as_ptr() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reloc(submit_offset: u32) -> SubmitReloc {
        SubmitReloc {
            submit_offset,
            ..SubmitReloc::default()
        }
    }

    #[test]
    fn commands_point_at_their_reloc_slices() {
        let cmds = vec![SubmitCmd::default(); 3];
        let request = SubmitRequest::new(
            2,
            vec![SubmitBo::default()],
            cmds,
            vec![vec![reloc(0), reloc(8)], vec![], vec![reloc(4)]],
        );

        assert_eq!(request.cmds()[0].nr_relocs, 2);
        assert_eq!(request.cmds()[1].nr_relocs, 0);
        assert_eq!(request.cmds()[1].relocs, 0);
        assert_eq!(request.cmds()[2].nr_relocs, 1);
        assert_eq!(request.cmds()[0].relocs, request.relocs().as_ptr() as u64);
        assert_eq!(
            request.cmds()[2].relocs,
            request.relocs()[2..].as_ptr() as u64
        );
        assert_eq!(request.relocs_for(2), &[reloc(4)]);
        assert!(request.relocs_for(7).is_empty());
    }

    #[test]
    fn args_describe_arrays() {
        let request = SubmitRequest::new(
            1,
            vec![SubmitBo::default(); 2],
            vec![SubmitCmd::default()],
            vec![vec![]],
        );
        let args = request.args();
        assert_eq!(args.pipe, 1);
        assert_eq!(args.nr_bos, 2);
        assert_eq!(args.nr_cmds, 1);
        assert_eq!(args.bos, request.bos.as_ptr() as u64);
        assert_eq!(bytemuck::bytes_of(&args).len(), 32);
    }
}
