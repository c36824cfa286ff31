//! Double-buffered outbound queue.
//!
//! Producers on any thread append encoded frames to the currently writable
//! buffer. The connection's send loop swaps buffers under the same lock and
//! writes the full one to the socket without holding the lock, so bursts of
//! `enqueue` calls between writer iterations coalesce into a single write.

use std::ops::Deref;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::framing::{self, FrameError};

/// Default initial capacity of each pending buffer. Default: 8 KB.
pub const DEFAULT_SEND_BUFFER_CAPACITY: usize = 8 * 1024;

/// Growable byte buffer with 1.5x growth.
#[derive(Debug, Default)]
pub struct PendingSendBuffer {
    data: Vec<u8>,
}

impl PendingSendBuffer {
    /// Create a buffer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Append `bytes`, growing capacity by 1.5x (or to the required size if
    /// that is larger) when they do not fit.
    pub fn write(&mut self, bytes: &[u8]) {
        let required = self.data.len() + bytes.len();
        if required > self.data.capacity() {
            let grown = self.data.capacity() + self.data.capacity() / 2;
            let target = grown.max(required);
            self.data.reserve_exact(target - self.data.len());
        }
        self.data.extend_from_slice(bytes);
    }

    /// Drop all contents, keeping the allocation.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Number of bytes written.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Allocated capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// The written bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// A drained buffer handed to the writer by [`SendQueue::take_ready_batch`].
///
/// Return it with [`SendQueue::recycle`] once written so the allocation is
/// reused.
#[derive(Debug)]
pub struct Batch {
    buffer: PendingSendBuffer,
}

impl Batch {
    /// Number of bytes in this batch.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the batch holds no frames.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Deref for Batch {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.data()
    }
}

struct Slots {
    buffers: [PendingSendBuffer; 2],
    writable: usize,
    closed: bool,
}

/// Thread-safe double buffer between many producers and one writer.
///
/// At any instant exactly one slot accepts new frames. The other is idle or
/// out with the writer as a [`Batch`]; producers never touch it.
pub struct SendQueue {
    slots: Mutex<Slots>,
    ready: Notify,
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new(DEFAULT_SEND_BUFFER_CAPACITY)
    }
}

impl SendQueue {
    /// Create a queue whose two buffers start with `capacity` bytes each.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                buffers: [
                    PendingSendBuffer::with_capacity(capacity),
                    PendingSendBuffer::with_capacity(capacity),
                ],
                writable: 0,
                closed: false,
            }),
            ready: Notify::new(),
        }
    }

    // A panicking producer cannot leave a slot half-swapped, so a poisoned
    // lock is still consistent.
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Encode a frame and append it to the writable buffer.
    ///
    /// Never performs I/O. An oversized payload fails here, synchronously,
    /// and leaves the buffer untouched. Once the queue is closed frames are
    /// validated and then discarded.
    pub fn enqueue(&self, message_id: u32, payload: &[u8]) -> Result<(), FrameError> {
        let header = framing::encode_header(message_id, payload.len())?;
        {
            let mut slots = self.lock();
            if slots.closed {
                tracing::trace!("Discarding message {message_id} on closed queue");
                return Ok(());
            }
            let writable = slots.writable;
            let buffer = &mut slots.buffers[writable];
            buffer.write(&header);
            buffer.write(payload);
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Swap buffers and hand the previously writable one to the caller.
    ///
    /// The flip and the clear of the new writable slot happen under one lock
    /// acquisition, so concurrent producers always land in a valid buffer.
    /// Only the send loop calls this.
    pub fn take_ready_batch(&self) -> Batch {
        let mut slots = self.lock();
        let ready = slots.writable;
        if slots.buffers[ready].is_empty() {
            return Batch {
                buffer: PendingSendBuffer::default(),
            };
        }
        slots.writable = 1 - ready;
        let writable = slots.writable;
        slots.buffers[writable].clear();
        Batch {
            buffer: std::mem::take(&mut slots.buffers[ready]),
        }
    }

    /// Give a written batch back to the idle slot.
    pub fn recycle(&self, batch: Batch) {
        if batch.buffer.capacity() == 0 {
            return;
        }
        let mut slots = self.lock();
        if slots.closed {
            return;
        }
        let idle = 1 - slots.writable;
        // The idle slot is only ever empty here; keep the larger allocation.
        if slots.buffers[idle].capacity() < batch.buffer.capacity() {
            slots.buffers[idle] = batch.buffer;
        }
    }

    /// Stop accepting frames and free both buffers, including anything not
    /// yet written.
    pub fn close(&self) {
        let mut slots = self.lock();
        slots.closed = true;
        slots.buffers = Default::default();
    }

    /// Whether [`SendQueue::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Bytes waiting in the writable buffer.
    pub fn pending_bytes(&self) -> usize {
        let slots = self.lock();
        slots.buffers[slots.writable].len()
    }

    /// Wait until a producer has enqueued since the last wake-up.
    ///
    /// A notification sent while nobody waits is kept, so a frame enqueued
    /// between [`SendQueue::take_ready_batch`] and this call is not missed.
    pub async fn notified(&self) {
        self.ready.notified().await;
    }
}
