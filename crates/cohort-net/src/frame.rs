//! Length-prefixed framing.
//!
//! ```text
//! ┌─────────────────┬──────────────────────┐
//! │ length: u32 LE  │ payload (length B)   │
//! └─────────────────┴──────────────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{NetError, NetResult};

/// Size of the length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default upper bound on a single payload (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Appends one frame carrying `payload` to `buf`.
///
/// # Panics
///
/// Panics if the payload does not fit a `u32` length.
pub fn encode(payload: &[u8], buf: &mut BytesMut) {
    assert!(
        u32::try_from(payload.len()).is_ok(),
        "payload length exceeds u32::MAX"
    );
    buf.reserve(FRAME_HEADER_SIZE + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
}

/// Removes one complete frame from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. A declared length above
/// `max_frame_size` is rejected as soon as the header is visible.
pub fn decode(buf: &mut BytesMut, max_frame_size: usize) -> NetResult<Option<Bytes>> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > max_frame_size {
        return Err(NetError::FrameTooLarge {
            len,
            max: max_frame_size,
        });
    }

    if buf.len() < FRAME_HEADER_SIZE + len {
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_SIZE);
    Ok(Some(buf.split_to(len).freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_little_endian_prefix() {
        let mut buf = BytesMut::new();
        encode(b"hey", &mut buf);
        assert_eq!(buf.as_ref(), b"\x03\x00\x00\x00hey");
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut buf = BytesMut::new();
        encode(b"one", &mut buf);
        encode(b"", &mut buf);
        encode(b"three", &mut buf);

        assert_eq!(decode(&mut buf, 64).unwrap().unwrap().as_ref(), b"one");
        assert_eq!(decode(&mut buf, 64).unwrap().unwrap().as_ref(), b"");
        assert_eq!(decode(&mut buf, 64).unwrap().unwrap().as_ref(), b"three");
        assert!(decode(&mut buf, 64).unwrap().is_none());
    }

    #[test]
    fn waits_for_complete_payload() {
        let mut buf = BytesMut::new();
        encode(b"payload", &mut buf);
        let full = buf.clone();

        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(decode(&mut partial, 64).unwrap().is_none());
            assert_eq!(partial.len(), cut);
        }
    }

    #[test]
    fn rejects_oversized_frame_from_header_alone() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1025);
        assert!(matches!(
            decode(&mut buf, 1024),
            Err(NetError::FrameTooLarge { len: 1025, max: 1024 })
        ));
    }

    #[test]
    fn frame_at_limit_is_accepted() {
        let mut buf = BytesMut::new();
        encode(&[7u8; 16], &mut buf);
        assert_eq!(decode(&mut buf, 16).unwrap().unwrap().len(), 16);
    }
}
