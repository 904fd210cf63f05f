use std::rc::Rc;

use crate::error::{CmdStreamError, Result};
use crate::pipe::Pipe;
use crate::reloc::Reloc;
use crate::ring::Ring;

/// Rotating set of command streams.
///
/// While the GPU consumes one stream the CPU records into the next. Rotation never waits: the
/// kernel keeps a submitted buffer referenced until its fence retires.
#[derive(Debug)]
pub struct Context {
    streams: Vec<Ring>,
    current: usize,
    last_timestamp: u32,
}

impl Context {
    /// Allocate `stream_count` streams of `stream_size` bytes, as configured on `pipe`.
    pub fn new(pipe: &Rc<Pipe>) -> Result<Self> {
        let cfg = pipe.config();
        if cfg.stream_count == 0 {
            return Err(CmdStreamError::InvariantViolation(
                "context needs at least one command stream",
            ));
        }

        let streams = (0..cfg.stream_count)
            .map(|_| Ring::new(pipe, cfg.stream_size))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            streams,
            current: 0,
            last_timestamp: 0,
        })
    }

    /// Index of the stream currently being recorded.
    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> &Ring {
        &self.streams[self.current]
    }

    pub fn current_mut(&mut self) -> &mut Ring {
        &mut self.streams[self.current]
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Word offset of the write cursor in the current stream.
    pub fn offset(&self) -> usize {
        (self.current().offset_bytes() / 4) as usize
    }

    /// Ensure `words` words plus the end clearance fit, rotating to the next stream otherwise.
    pub fn reserve(&mut self, words: usize) -> Result<()> {
        let ring = self.current();
        let cfg = ring.pipe().config();
        let words = u32::try_from(words).unwrap_or(u32::MAX);
        if cfg.fits(ring.size_bytes(), ring.offset_bytes() / 4, words) {
            return Ok(());
        }
        if !cfg.fits(ring.size_bytes(), 0, words) {
            return Err(CmdStreamError::ResourceExhausted {
                what: "command stream space",
            });
        }
        self.switch_stream()
    }

    /// Flush the current stream and continue recording at the start of the next one.
    ///
    /// The flush error, if any, is returned after the rotation has happened.
    pub fn switch_stream(&mut self) -> Result<()> {
        let flushed = self.flush();

        self.current = (self.current + 1) % self.streams.len();
        let reset = self.current_mut().reset();
        tracing::trace!(stream = self.current, "switched command stream");

        flushed.and(reset)
    }

    pub fn emit(&mut self, word: u32) {
        self.current_mut().emit(word);
    }

    pub fn emit_reloc(&mut self, reloc: &Reloc) -> Result<()> {
        self.current_mut().emit_reloc(reloc)
    }

    /// Submit the current stream's pending range.
    pub fn flush(&mut self) -> Result<u32> {
        let fence = self.current_mut().flush()?;
        self.last_timestamp = fence;
        Ok(fence)
    }

    /// Flush and wait for completion.
    pub fn finish(&mut self) -> Result<()> {
        let fence = self.flush()?;
        self.current().wait(fence)
    }

    /// Fence of the most recent successful submission from any stream.
    pub fn timestamp(&self) -> u32 {
        self.last_timestamp
    }
}
