use std::collections::VecDeque;

/// Maximum number of PTY output bytes retained per process.
pub const MAX_BUFFER_BYTES: usize = 1024 * 1024;

/// Bounded append-only window over a process's PTY output.
///
/// Holds the most recent [`MAX_BUFFER_BYTES`] bytes; on overflow the oldest
/// bytes are dropped. Frame boundaries are not preserved.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    bytes: VecDeque<u8>,
}

impl OutputBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk, evicting the earliest overflow bytes if the total
    /// exceeds the cap.
    pub fn append(&mut self, chunk: &[u8]) {
        if chunk.len() >= MAX_BUFFER_BYTES {
            // The chunk alone fills the window; keep only its tail.
            self.bytes.clear();
            self.bytes
                .extend(&chunk[chunk.len() - MAX_BUFFER_BYTES..]);
            return;
        }

        self.bytes.extend(chunk);
        if self.bytes.len() > MAX_BUFFER_BYTES {
            let excess = self.bytes.len() - MAX_BUFFER_BYTES;
            self.bytes.drain(..excess);
        }
    }

    /// Snapshot of the current window contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.iter().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}
