use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Upper bound on the bytes returned by a single read, keeping individual
/// stream messages small on the wire.
pub const MAX_CHUNK_SIZE: usize = 4096;

/// Result of one blocking read against the buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A non-empty chunk of at most [`MAX_CHUNK_SIZE`] bytes.
    Data(Vec<u8>),
    /// The buffer is closed and the cursor has reached its end.
    Eof,
    /// The reader's cancellation token fired while waiting.
    Canceled,
}

struct BufState {
    data: Vec<u8>,
    closed: bool,
}

/// Single-producer, many-reader append-only byte log.
///
/// The producer appends and never waits on readers; each reader owns its
/// cursor and blocks until new data arrives, the buffer closes, or its
/// cancellation token fires. Readers that attach late still see the full
/// output from offset zero.
pub struct OutputBuffer {
    state: Mutex<BufState>,
    readable: Notify,
}

impl std::fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputBuffer").finish_non_exhaustive()
    }
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BufState {
                data: Vec::with_capacity(MAX_CHUNK_SIZE),
                closed: false,
            }),
            readable: Notify::new(),
        }
    }

    /// Appends `bytes` and wakes every waiting reader. Returns the number
    /// of bytes written, always the full input length.
    pub fn append(&self, bytes: &[u8]) -> usize {
        let mut state = self.state.lock().unwrap();
        debug_assert!(!state.closed, "append after close");
        state.data.extend_from_slice(bytes);
        drop(state);
        self.readable.notify_waiters();
        bytes.len()
    }

    /// Latches the closed flag and wakes every waiting reader. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.readable.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn len(&self) -> u64 {
        self.state.lock().unwrap().data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to [`MAX_CHUNK_SIZE`] bytes at `cursor`, waiting while the
    /// buffer is open and has no bytes past the cursor. Returns the outcome
    /// and the new cursor; the cursor only advances on `Data`.
    pub async fn read(&self, cursor: u64, cancel: &CancellationToken) -> (ReadOutcome, u64) {
        loop {
            // Register for the wakeup before inspecting state so an append
            // between the check and the await cannot be missed.
            let mut notified = std::pin::pin!(self.readable.notified());
            notified.as_mut().enable();

            {
                let state = self.state.lock().unwrap();
                let len = state.data.len() as u64;
                if cursor < len {
                    let end = len.min(cursor + MAX_CHUNK_SIZE as u64);
                    let chunk = state.data[cursor as usize..end as usize].to_vec();
                    return (ReadOutcome::Data(chunk), end);
                }
                if state.closed {
                    return (ReadOutcome::Eof, cursor);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return (ReadOutcome::Canceled, cursor),
            }
        }
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A cursor over one [`OutputBuffer`], starting at offset zero.
pub struct OutputReader {
    buffer: Arc<OutputBuffer>,
    cursor: u64,
}

impl OutputReader {
    pub fn new(buffer: Arc<OutputBuffer>) -> Self {
        Self { buffer, cursor: 0 }
    }

    pub async fn next_chunk(&mut self, cancel: &CancellationToken) -> ReadOutcome {
        let (outcome, cursor) = self.buffer.read(self.cursor, cancel).await;
        self.cursor = cursor;
        outcome
    }
}
