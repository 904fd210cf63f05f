use std::time::Duration;

/// Bytes reserved at the end of every stream for the terminating LINK packet.
pub const CMD_STREAM_END_CLEARANCE: u32 = 24;

/// Default size of one rotating command stream.
pub const CMD_STREAM_SIZE: u32 = 0x8000;

/// Tunables shared by every ring created on a [`Pipe`](crate::Pipe).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitConfig {
    /// Upper bound for a blocking fence wait.
    pub wait_timeout: Duration,
    /// Bytes per command stream buffer of a [`Context`](crate::Context).
    pub stream_size: u32,
    /// Number of buffers a [`Context`](crate::Context) rotates through.
    pub stream_count: usize,
    /// Bytes kept free at the end of each stream.
    pub end_clearance: u32,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_millis(5000),
            stream_size: CMD_STREAM_SIZE,
            stream_count: 2,
            end_clearance: CMD_STREAM_END_CLEARANCE,
        }
    }
}

impl SubmitConfig {
    /// Whether `words` more words fit after `offset_words` without eating into the clearance.
    pub fn fits(&self, size_bytes: u32, offset_words: u32, words: u32) -> bool {
        let needed = (u64::from(offset_words) + u64::from(words)) * 4 + u64::from(self.end_clearance);
        needed <= u64::from(size_bytes)
    }
}
