//! Length-prefixed framing for TCP streams.
//!
//! Every message on the wire is a frame:
//!
//! ```text
//! +----------------------+------------------------+----------------------------+
//! | total_size (2 bytes) | message_id (4 bytes)   | payload                    |
//! | u16 big-endian       | u32 big-endian         | (total_size - 6 bytes)     |
//! +----------------------+------------------------+----------------------------+
//! ```
//!
//! `total_size` counts the whole frame, including its own two bytes and the
//! message id. Frames are concatenated back-to-back with no other delimiter.
//! Byte order is always network order, independent of the host.

use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the `total_size` field.
pub const SIZE_FIELD_LEN: usize = 2;

/// Size of the `message_id` field.
pub const MESSAGE_ID_LEN: usize = 4;

/// Bytes preceding the payload in every frame.
pub const HEADER_LEN: usize = SIZE_FIELD_LEN + MESSAGE_ID_LEN;

/// Largest frame representable by the 16-bit size field.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - HEADER_LEN;

/// Errors that can occur during framing operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The payload does not fit in a single frame.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: usize,
        /// The largest payload a frame can carry.
        max: usize,
    },

    /// The stream declared a frame shorter than its own header.
    #[error("malformed frame: declared size {declared} is smaller than the 6-byte header")]
    Malformed {
        /// The `total_size` value read from the wire.
        declared: u16,
    },
}

/// Outcome of a single decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    /// The window does not yet hold a complete frame.
    NeedMoreBytes,
    /// One complete frame starts at the beginning of the window.
    Frame {
        /// Message identifier from the header.
        message_id: u32,
        /// Payload position relative to the start of the window.
        payload: Range<usize>,
        /// Bytes this frame occupies, header included.
        consumed: usize,
    },
}

/// Compute `total_size` for a payload of `payload_len` bytes.
pub fn frame_len(payload_len: usize) -> Result<u16, FrameError> {
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: MAX_PAYLOAD_LEN,
        });
    }
    // Bounded by MAX_FRAME_LEN above.
    Ok((HEADER_LEN + payload_len) as u16)
}

/// Encode the 6-byte header for a frame carrying `payload_len` bytes.
pub fn encode_header(message_id: u32, payload_len: usize) -> Result<[u8; HEADER_LEN], FrameError> {
    let total = frame_len(payload_len)?;
    let mut header = [0u8; HEADER_LEN];
    header[..SIZE_FIELD_LEN].copy_from_slice(&total.to_be_bytes());
    header[SIZE_FIELD_LEN..].copy_from_slice(&message_id.to_be_bytes());
    Ok(header)
}

/// Encode a complete frame.
///
/// Fails with [`FrameError::PayloadTooLarge`] before allocating anything if
/// the payload cannot be framed.
pub fn encode(message_id: u32, payload: &[u8]) -> Result<Bytes, FrameError> {
    let header = encode_header(message_id, payload.len())?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&header);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Try to decode one frame from the start of `buf`.
///
/// `buf` may hold any number of complete frames followed by a partial one.
/// Call repeatedly on `&buf[consumed..]` until [`DecodeResult::NeedMoreBytes`]
/// to walk every complete frame in order. Never allocates.
pub fn try_decode_one(buf: &[u8]) -> Result<DecodeResult, FrameError> {
    if buf.len() < SIZE_FIELD_LEN {
        return Ok(DecodeResult::NeedMoreBytes);
    }

    let declared = u16::from_be_bytes([buf[0], buf[1]]);
    let total = declared as usize;
    if total < HEADER_LEN {
        return Err(FrameError::Malformed { declared });
    }
    if total > buf.len() {
        return Ok(DecodeResult::NeedMoreBytes);
    }

    let message_id = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
    Ok(DecodeResult::Frame {
        message_id,
        payload: HEADER_LEN..total,
        consumed: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Decode every complete frame in `buf`, returning owned pairs and the
    /// number of bytes consumed.
    fn decode_all(buf: &[u8]) -> (Vec<(u32, Vec<u8>)>, usize) {
        let mut out = Vec::new();
        let mut offset = 0;
        while let DecodeResult::Frame {
            message_id,
            payload,
            consumed,
        } = try_decode_one(&buf[offset..]).unwrap()
        {
            let start = offset + payload.start;
            let end = offset + payload.end;
            out.push((message_id, buf[start..end].to_vec()));
            offset += consumed;
        }
        (out, offset)
    }

    #[test]
    fn test_single_message_roundtrip() {
        let encoded = encode(42, b"hello world").unwrap();
        let (frames, consumed) = decode_all(&encoded);
        assert_eq!(frames, vec![(42, b"hello world".to_vec())]);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_header_is_big_endian() {
        let encoded = encode(0x0102_0304, b"xy").unwrap();
        assert_eq!(&encoded[..], &[0x00, 0x08, 0x01, 0x02, 0x03, 0x04, b'x', b'y']);
    }

    #[test]
    fn test_zero_length_payload_handled() {
        let encoded = encode(7, &[]).unwrap();
        assert_eq!(encoded.len(), HEADER_LEN);
        assert_eq!(
            try_decode_one(&encoded).unwrap(),
            DecodeResult::Frame {
                message_id: 7,
                payload: HEADER_LEN..HEADER_LEN,
                consumed: HEADER_LEN,
            }
        );
    }

    #[test]
    fn test_largest_payload_accepted() {
        let payload = vec![0xAB; MAX_PAYLOAD_LEN];
        let encoded = encode(1, &payload).unwrap();
        assert_eq!(encoded.len(), MAX_FRAME_LEN);
        assert_eq!(&encoded[..2], &[0xFF, 0xFF]);

        let (frames, _) = decode_all(&encoded);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1.len(), MAX_PAYLOAD_LEN);
    }

    #[test]
    fn test_oversized_message_rejected_on_encode() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert_eq!(
            encode(1, &payload),
            Err(FrameError::PayloadTooLarge {
                size: MAX_PAYLOAD_LEN + 1,
                max: MAX_PAYLOAD_LEN,
            })
        );
        assert!(encode_header(1, MAX_PAYLOAD_LEN + 1).is_err());
    }

    #[test]
    fn test_need_more_bytes_for_short_prefix() {
        assert_eq!(try_decode_one(&[]).unwrap(), DecodeResult::NeedMoreBytes);
        assert_eq!(try_decode_one(&[0x00]).unwrap(), DecodeResult::NeedMoreBytes);
    }

    #[test]
    fn test_need_more_bytes_for_partial_frame() {
        let encoded = encode(9, b"abcdef").unwrap();
        for cut in 0..encoded.len() {
            assert_eq!(
                try_decode_one(&encoded[..cut]).unwrap(),
                DecodeResult::NeedMoreBytes,
                "cut at {cut} should not yield a frame"
            );
        }
    }

    #[test]
    fn test_declared_size_below_header_is_malformed() {
        for declared in 0u16..HEADER_LEN as u16 {
            let mut buf = declared.to_be_bytes().to_vec();
            buf.extend_from_slice(&[0; 8]);
            assert_eq!(
                try_decode_one(&buf),
                Err(FrameError::Malformed { declared }),
            );
        }
    }

    #[test]
    fn test_back_to_back_messages_dont_merge() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode(1, b"aaa").unwrap());
        stream.extend_from_slice(&encode(2, b"bbb").unwrap());
        stream.extend_from_slice(&encode(3, b"").unwrap());

        let (frames, consumed) = decode_all(&stream);
        assert_eq!(
            frames,
            vec![(1, b"aaa".to_vec()), (2, b"bbb".to_vec()), (3, Vec::new())]
        );
        assert_eq!(consumed, stream.len());
    }

    #[test]
    fn test_trailing_partial_frame_left_unconsumed() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode(1, b"a").unwrap());
        let second = encode(2, b"bcdef").unwrap();
        stream.extend_from_slice(&second[..4]);

        let (frames, consumed) = decode_all(&stream);
        assert_eq!(frames, vec![(1, b"a".to_vec())]);
        assert_eq!(stream.len() - consumed, 4);
    }

    #[test]
    fn test_roundtrip_across_payload_sizes() {
        for len in [0usize, 1, 2, 255, 256, 4096, MAX_PAYLOAD_LEN] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let id = len as u32 ^ 0xDEAD_BEEF;
            let encoded = encode(id, &payload).unwrap();
            let (frames, _) = decode_all(&encoded);
            assert_eq!(frames, vec![(id, payload)]);
        }
    }
}
