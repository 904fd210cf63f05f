use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::abi::SubmitRequest;
use crate::bo::BoAllocator;
use crate::config::SubmitConfig;
use crate::error::{CmdStreamError, Result, TransportError};

/// Kernel identifier of the GPU engine class a ring submits to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipeId(pub u32);

/// Outcome of a bounded fence wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceWait {
    Signaled,
    TimedOut,
}

/// Synchronous kernel submit/wait calls.
pub trait KernelTransport {
    /// Execute `request` and return its fence. The kernel may rewrite `request.bos[..].presumed`.
    fn submit(&self, request: &mut SubmitRequest) -> std::result::Result<u32, TransportError>;

    fn wait_fence(
        &self,
        pipe: PipeId,
        fence: u32,
        timeout: Duration,
    ) -> std::result::Result<FenceWait, TransportError>;
}

/// An execution context: engine id plus the collaborators rings on it use.
pub struct Pipe {
    id: PipeId,
    transport: Rc<dyn KernelTransport>,
    allocator: Rc<dyn BoAllocator>,
    config: SubmitConfig,
}

impl Pipe {
    pub fn new(
        id: PipeId,
        transport: Rc<dyn KernelTransport>,
        allocator: Rc<dyn BoAllocator>,
        config: SubmitConfig,
    ) -> Rc<Self> {
        Rc::new(Self {
            id,
            transport,
            allocator,
            config,
        })
    }

    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn config(&self) -> &SubmitConfig {
        &self.config
    }

    pub(crate) fn allocator(&self) -> &dyn BoAllocator {
        &*self.allocator
    }

    pub(crate) fn submit(&self, request: &mut SubmitRequest) -> Result<u32> {
        self.transport
            .submit(request)
            .map_err(CmdStreamError::SubmitFailed)
    }

    /// Block until `fence` retires or the configured timeout elapses.
    pub fn wait(&self, fence: u32) -> Result<()> {
        match self
            .transport
            .wait_fence(self.id, fence, self.config.wait_timeout)
        {
            Ok(FenceWait::Signaled) => Ok(()),
            Ok(FenceWait::TimedOut) => {
                tracing::warn!(pipe = self.id.0, fence, "fence wait timed out");
                Err(CmdStreamError::WaitTimeout { fence })
            }
            Err(err) => {
                tracing::warn!(pipe = self.id.0, fence, "fence wait failed: {err}");
                Err(CmdStreamError::WaitFailed(err))
            }
        }
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
