//! Fixed-capacity circular byte store between the serial reader and the frame parser.
//!
//! Every operation takes the same lock, so the buffer can be shared between the
//! reader thread and any other thread that needs to inspect or clear it.
//!
//! Overflow policy: a write that does not fit in the free space clears the whole
//! buffer before storing the new bytes. Stale partial frames are dropped in one go
//! and the parser resynchronises on the fresh data.

use std::sync::{Mutex, MutexGuard};

use log::debug;

/// Default capacity used by a transport's receive buffer.
pub const DEFAULT_CAPACITY: usize = 8192;

struct RingState {
    buf: Box<[u8]>,
    read: usize,
    write: usize,
    count: usize,
}

impl RingState {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
        self.count = 0;
    }

    fn copy_out(&self, dest: &mut [u8]) {
        let cap = self.capacity();
        let first = dest.len().min(cap - self.read);
        dest[..first].copy_from_slice(&self.buf[self.read..self.read + first]);
        let rest = dest.len() - first;
        if rest > 0 {
            dest[first..].copy_from_slice(&self.buf[..rest]);
        }
    }

    fn advance(&mut self, n: usize) {
        self.read = (self.read + n) % self.capacity();
        self.count -= n;
    }
}

/// Thread-guarded FIFO byte ring.
pub struct RingBuffer {
    state: Mutex<RingState>,
}

impl RingBuffer {
    /// Create a ring holding at most `capacity` bytes (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(RingState {
                buf: vec![0u8; capacity].into_boxed_slice(),
                read: 0,
                write: 0,
                count: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Space left before the next write triggers the overflow policy.
    pub fn free(&self) -> usize {
        let state = self.lock();
        state.capacity() - state.count
    }

    /// Append `data`, returning the number of bytes stored.
    ///
    /// If `data` does not fit in the free space the buffer is cleared first.
    /// Data larger than the whole capacity is dropped and nothing is stored.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut state = self.lock();
        let cap = state.capacity();

        if data.len() > cap - state.count {
            debug!(
                "Ring overflow: {} bytes incoming, {} free; clearing {} buffered bytes",
                data.len(),
                cap - state.count,
                state.count
            );
            state.reset();
        }
        if data.len() > cap {
            return 0;
        }

        let first = data.len().min(cap - state.write);
        let w = state.write;
        state.buf[w..w + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        if rest > 0 {
            state.buf[..rest].copy_from_slice(&data[first..]);
        }
        state.write = (state.write + data.len()) % cap;
        state.count += data.len();
        data.len()
    }

    /// Copy up to `count` bytes from the front without consuming them.
    pub fn peek(&self, count: usize) -> Vec<u8> {
        let state = self.lock();
        let mut out = vec![0u8; count.min(state.count)];
        state.copy_out(&mut out);
        out
    }

    /// Byte at `offset` from the read cursor, or `None` past the buffered data.
    pub fn peek_byte(&self, offset: usize) -> Option<u8> {
        let state = self.lock();
        if offset >= state.count {
            return None;
        }
        Some(state.buf[(state.read + offset) % state.capacity()])
    }

    /// Remove and return up to `count` bytes from the front.
    pub fn read(&self, count: usize) -> Vec<u8> {
        let mut state = self.lock();
        let mut out = vec![0u8; count.min(state.count)];
        state.copy_out(&mut out);
        state.advance(out.len());
        out
    }

    /// Discard up to `count` bytes from the front, returning how many were dropped.
    pub fn skip(&self, count: usize) -> usize {
        let mut state = self.lock();
        let n = count.min(state.count);
        state.advance(n);
        n
    }

    pub fn clear(&self) {
        self.lock().reset();
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
