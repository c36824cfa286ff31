//! Fixed-size receive buffer that reassembles frames across read boundaries.

use crate::framing::{self, DecodeResult, FrameError, MAX_FRAME_LEN};

/// Default receive buffer size. Default: 64 KB.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Read buffer plus the count of unconsumed bytes left by the previous read.
///
/// Unconsumed bytes always sit at the front of the buffer; the next read lands
/// right after them. The buffer is never smaller than [`MAX_FRAME_LEN`], so a
/// partial frame can always be completed.
pub struct RecvBuffer {
    buf: Box<[u8]>,
    remaining: usize,
}

impl RecvBuffer {
    /// Allocate a buffer of `size` bytes, raised to [`MAX_FRAME_LEN`] if smaller.
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size.max(MAX_FRAME_LEN)].into_boxed_slice(),
            remaining: 0,
        }
    }

    /// The region a socket read should fill.
    pub fn unfilled(&mut self) -> &mut [u8] {
        &mut self.buf[self.remaining..]
    }

    /// Bytes carried over from the previous read.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Account for `read` new bytes and hand every complete frame to
    /// `on_frame(message_id, bytes, offset, len)`, in wire order.
    ///
    /// The trailing partial frame is moved to the front of the buffer.
    /// Returns the number of frames delivered. A malformed header stops
    /// processing; the stream cannot be resynchronised after that.
    pub fn process<F>(&mut self, read: usize, mut on_frame: F) -> Result<usize, FrameError>
    where
        F: FnMut(u32, &[u8], usize, usize),
    {
        let filled = self.remaining + read;
        debug_assert!(filled <= self.buf.len());

        let mut offset = 0;
        let mut frames = 0;
        while let DecodeResult::Frame {
            message_id,
            payload,
            consumed,
        } = framing::try_decode_one(&self.buf[offset..filled])?
        {
            on_frame(
                message_id,
                &self.buf[..filled],
                offset + payload.start,
                payload.len(),
            );
            offset += consumed;
            frames += 1;
        }

        self.buf.copy_within(offset..filled, 0);
        self.remaining = filled - offset;
        Ok(frames)
    }
}
