//! Shared fakes for `etna-cmdstream` integration tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use etna_cmdstream::abi::{SubmitBo, SubmitCmd, SubmitReloc, SubmitRequest};
use etna_cmdstream::{
    AllocError, BoAllocator, BoFlags, BufferObject, CommandMemory, FenceWait, KernelTransport,
    Pipe, PipeId, SubmitConfig, TransportError,
};

pub const PIPE_2D: PipeId = PipeId(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// Hands out BOs with sequential handles and presumed addresses, backed by plain `Vec`s.
#[derive(Default)]
pub struct MemAllocator {
    next_handle: Cell<u32>,
    pub allocated: RefCell<Vec<(Arc<BufferObject>, BoFlags)>>,
    pub fail_alloc: Cell<bool>,
}

impl MemAllocator {
    /// A BO outside any ring, e.g. a render target.
    pub fn bo(&self, size: u32) -> Arc<BufferObject> {
        self.alloc(size, BoFlags::empty())
            .expect("test allocator does not fail unless asked")
    }
}

impl BoAllocator for MemAllocator {
    fn alloc(&self, size: u32, flags: BoFlags) -> Result<Arc<BufferObject>, AllocError> {
        if self.fail_alloc.get() {
            return Err(AllocError::OutOfMemory { size });
        }
        let handle = self.next_handle.get() + 1;
        self.next_handle.set(handle);
        let bo = Arc::new(BufferObject::new(handle, size, u64::from(handle) << 20));
        self.allocated.borrow_mut().push((Arc::clone(&bo), flags));
        Ok(bo)
    }

    fn map(&self, bo: &Arc<BufferObject>) -> Result<Box<dyn CommandMemory>, AllocError> {
        Ok(Box::new(vec![0u32; (bo.size() / 4) as usize]))
    }
}

/// Owned copy of a submission as the kernel saw it.
#[derive(Clone, Debug)]
pub struct RecordedSubmit {
    pub pipe: u32,
    pub bos: Vec<SubmitBo>,
    pub cmds: Vec<SubmitCmd>,
    pub relocs: Vec<Vec<SubmitReloc>>,
}

/// Records submissions and answers with increasing fences.
#[derive(Default)]
pub struct RecordingTransport {
    pub submits: RefCell<Vec<RecordedSubmit>>,
    pub waits: RefCell<Vec<(PipeId, u32, Duration)>>,
    next_fence: Cell<u32>,
    pub fail_next_submit: Cell<Option<TransportError>>,
    pub wait_results: RefCell<VecDeque<Result<FenceWait, TransportError>>>,
    /// Presumed address the "kernel" assigns to every BO it sees, by handle.
    pub relocate_to: RefCell<Vec<(u32, u64)>>,
}

impl RecordingTransport {
    pub fn last(&self) -> RecordedSubmit {
        self.submits
            .borrow()
            .last()
            .cloned()
            .expect("no submission recorded")
    }

    pub fn submit_count(&self) -> usize {
        self.submits.borrow().len()
    }
}

impl KernelTransport for RecordingTransport {
    fn submit(&self, request: &mut SubmitRequest) -> Result<u32, TransportError> {
        if let Some(err) = self.fail_next_submit.take() {
            return Err(err);
        }

        for bo in &mut request.bos {
            if let Some(&(_, addr)) = self
                .relocate_to
                .borrow()
                .iter()
                .find(|(handle, _)| *handle == bo.handle)
            {
                bo.presumed = addr;
            }
        }

        self.submits.borrow_mut().push(RecordedSubmit {
            pipe: request.pipe,
            bos: request.bos.clone(),
            cmds: request.cmds().to_vec(),
            relocs: (0..request.cmds().len())
                .map(|i| request.relocs_for(i).to_vec())
                .collect(),
        });

        let fence = self.next_fence.get() + 1;
        self.next_fence.set(fence);
        Ok(fence)
    }

    fn wait_fence(
        &self,
        pipe: PipeId,
        fence: u32,
        timeout: Duration,
    ) -> Result<FenceWait, TransportError> {
        self.waits.borrow_mut().push((pipe, fence, timeout));
        self.wait_results
            .borrow_mut()
            .pop_front()
            .unwrap_or(Ok(FenceWait::Signaled))
    }
}

pub struct Harness {
    pub allocator: Rc<MemAllocator>,
    pub transport: Rc<RecordingTransport>,
    pub pipe: Rc<Pipe>,
}

pub fn harness() -> Harness {
    harness_with(SubmitConfig::default())
}

pub fn harness_with(config: SubmitConfig) -> Harness {
    init_tracing();
    let allocator = Rc::new(MemAllocator::default());
    let transport = Rc::new(RecordingTransport::default());
    let pipe = Pipe::new(
        PIPE_2D,
        Rc::clone(&transport) as Rc<dyn KernelTransport>,
        Rc::clone(&allocator) as Rc<dyn BoAllocator>,
        config,
    );
    Harness {
        allocator,
        transport,
        pipe,
    }
}
