//! Command submission core for Vivante (etnaviv) GPUs.
//!
//! This crate records GPU instructions into linear command streams and hands them to the
//! kernel in one atomic submit call:
//! - [`Ring`]: a command stream in a mapped BO, with word and relocation emission.
//! - Chained rings ([`Ring::new_child`] / [`Ring::emit_reloc_ring`]) whose content is embedded
//!   in another ring's submission.
//! - [`Context`]: double-buffered streams that rotate when full.
//! - Flush: BO deduplication ([`BoRegistry`]), relocation slicing per command buffer, kernel
//!   submission ([`abi`]), and fence propagation.
//!
//! BO allocation and the kernel transport are collaborators supplied by the caller through
//! [`BoAllocator`] and [`KernelTransport`]. A ring and everything chained to it must stay on
//! one thread.

mod bo;
mod config;
mod context;
mod error;
mod pipe;
mod record_table;
mod registry;
mod reloc;
mod ring;

pub mod abi;

pub use bo::{BoAccess, BoAllocator, BoFlags, BufferObject, CommandMemory};
pub use config::{SubmitConfig, CMD_STREAM_END_CLEARANCE, CMD_STREAM_SIZE};
pub use context::Context;
pub use error::{AllocError, CmdStreamError, Result, TransportError};
pub use pipe::{FenceWait, KernelTransport, Pipe, PipeId};
pub use record_table::RecordTable;
pub use registry::{BoRegistry, RegisteredBo};
pub use reloc::{find_next_reloc_idx, patch_value, reloc_range, Reloc, RelocEntry};
pub use ring::{PendingTables, Ring};
