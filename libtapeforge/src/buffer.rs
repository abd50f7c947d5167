//! Fixed-capacity FIFO byte buffers, pooled per thread.
//!
//! Tape streams move data in whole blocks, so every stream needs a
//! staging buffer of a few blocks. Buffers are recycled through a
//! thread-local, size-keyed LRU cache instead of being reallocated per
//! stream. Tape sessions are single-threaded, so no locking is needed.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};

use crate::error::Result;

/// A byte buffer with FIFO read/write cursors.
///
/// Invariant: `read <= write <= capacity`. Content is compacted to
/// offset 0 lazily, only when the unused tail is smaller than the next
/// request.
pub struct StreamBuffer {
    data: Vec<u8>,
    read: usize,
    write: usize,
}

impl StreamBuffer {
    pub fn new(capacity: usize) -> StreamBuffer {
        StreamBuffer {
            data: vec![0; capacity],
            read: 0,
            write: 0,
        }
    }

    fn with_storage(mut data: Vec<u8>, capacity: usize) -> StreamBuffer {
        data.resize(capacity, 0);
        StreamBuffer {
            data,
            read: 0,
            write: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.write - self.read
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    /// Unread content.
    pub fn content(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    /// Drop `n` bytes from the front.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.read += n;
        if self.read == self.write {
            self.read = 0;
            self.write = 0;
        }
    }

    fn make_tail_room(&mut self, wanted: usize) {
        if self.data.len() - self.write < wanted && self.read > 0 {
            self.data.copy_within(self.read..self.write, 0);
            self.write -= self.read;
            self.read = 0;
        }
    }

    /// Copy in as much of `bytes` as fits. Returns the count accepted.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        self.make_tail_room(bytes.len());
        let n = bytes.len().min(self.data.len() - self.write);
        self.data[self.write..self.write + n].copy_from_slice(&bytes[..n]);
        self.write += n;
        n
    }

    /// Copy out up to `dst.len()` bytes in FIFO order.
    pub fn consume(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len());
        dst[..n].copy_from_slice(&self.data[self.read..self.read + n]);
        self.advance(n);
        n
    }

    /// Fill from a source callback, up to `n` bytes. The source sees a
    /// contiguous spare slice and returns how much it produced; 0 means
    /// the source is dry.
    pub fn fill_with<F>(&mut self, n: usize, mut source: F) -> Result<usize>
    where
        F: FnMut(&mut [u8]) -> Result<usize>,
    {
        self.make_tail_room(n);
        let room = n.min(self.data.len() - self.write);
        let produced = source(&mut self.data[self.write..self.write + room])?;
        debug_assert!(produced <= room);
        self.write += produced;
        Ok(produced)
    }

    /// Spill up to `n` buffered bytes into a sink callback, FIFO. The
    /// sink returns how much it consumed; spilling stops early when the
    /// sink takes less than offered.
    pub fn spill_with<F>(&mut self, n: usize, mut sink: F) -> Result<usize>
    where
        F: FnMut(&[u8]) -> Result<usize>,
    {
        let mut spilled = 0;
        while spilled < n && !self.is_empty() {
            let chunk = (n - spilled).min(self.len());
            let taken = sink(&self.data[self.read..self.read + chunk])?;
            debug_assert!(taken <= chunk);
            self.advance(taken);
            spilled += taken;
            if taken < chunk {
                break;
            }
        }
        Ok(spilled)
    }

    /// Append zeroes until the content length reaches `n`.
    pub fn zero_pad_to(&mut self, n: usize) {
        while self.len() < n {
            let missing = n - self.len();
            self.make_tail_room(missing);
            let room = missing.min(self.data.len() - self.write);
            debug_assert!(room > 0, "zero_pad_to beyond capacity");
            self.data[self.write..self.write + room].fill(0);
            self.write += room;
        }
    }

    fn into_storage(self) -> Vec<u8> {
        self.data
    }
}

const POOL_MAX_CAPACITIES: usize = 4;
const POOL_PER_CAPACITY: usize = 2;

struct Shelf {
    capacity: usize,
    spares: Vec<Vec<u8>>,
}

#[derive(Default)]
struct BufferPool {
    /// Most recently used capacity first.
    shelves: Vec<Shelf>,
}

impl BufferPool {
    fn acquire(&mut self, capacity: usize) -> StreamBuffer {
        if let Some(at) = self.shelves.iter().position(|s| s.capacity == capacity) {
            let mut shelf = self.shelves.remove(at);
            let storage = shelf.spares.pop();
            self.shelves.insert(0, shelf);
            if let Some(storage) = storage {
                return StreamBuffer::with_storage(storage, capacity);
            }
        }
        StreamBuffer::new(capacity)
    }

    fn release(&mut self, buffer: StreamBuffer) {
        let capacity = buffer.capacity();
        if let Some(at) = self.shelves.iter().position(|s| s.capacity == capacity) {
            let mut shelf = self.shelves.remove(at);
            if shelf.spares.len() < POOL_PER_CAPACITY {
                shelf.spares.push(buffer.into_storage());
            }
            self.shelves.insert(0, shelf);
            return;
        }
        if self.shelves.len() >= POOL_MAX_CAPACITIES {
            self.shelves.pop();
        }
        self.shelves.insert(
            0,
            Shelf {
                capacity,
                spares: vec![buffer.into_storage()],
            },
        );
    }
}

thread_local! {
    static POOL: RefCell<BufferPool> = RefCell::new(BufferPool::default());
}

/// A [`StreamBuffer`] checked out of the thread-local pool; drop returns
/// it.
pub struct PooledBuffer {
    inner: Option<StreamBuffer>,
}

pub fn acquire(capacity: usize) -> PooledBuffer {
    let buffer = POOL.with(|pool| pool.borrow_mut().acquire(capacity));
    PooledBuffer {
        inner: Some(buffer),
    }
}

impl Deref for PooledBuffer {
    type Target = StreamBuffer;

    fn deref(&self) -> &StreamBuffer {
        self.inner.as_ref().unwrap()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut StreamBuffer {
        self.inner.as_mut().unwrap()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut buffer) = self.inner.take() {
            buffer.reset();
            POOL.with(|pool| pool.borrow_mut().release(buffer));
        }
    }
}
