//! Handshake encoding of a [`ProcessId`].
//!
//! Both ends of a new connection exchange their identity before any framed
//! traffic flows:
//!
//! ```text
//! ┌──────────────┬──────────────────────┬──────────────┬──────────────────┐
//! │ len: u32 LE  │ hostname (len bytes) │ port: u32 LE │ incarnation: u32 │
//! └──────────────┴──────────────────────┴──────────────┴──────────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{ProcessId, TypesError, TypesResult};

/// Longest hostname accepted in a handshake (DNS limit).
pub const MAX_HOSTNAME_LEN: usize = 255;

const LEN_SIZE: usize = 4;
const TRAILER_SIZE: usize = 8;

/// Appends the handshake encoding of `pid` to `buf`.
///
/// # Panics
///
/// Panics if the address is longer than [`MAX_HOSTNAME_LEN`]; such an
/// identity could never be decoded by the peer.
pub fn encode(pid: &ProcessId, buf: &mut BytesMut) {
    let host = pid.address().as_bytes();
    assert!(
        host.len() <= MAX_HOSTNAME_LEN,
        "process address exceeds {MAX_HOSTNAME_LEN} bytes"
    );

    buf.reserve(LEN_SIZE + host.len() + TRAILER_SIZE);
    buf.put_u32_le(host.len() as u32);
    buf.put_slice(host);
    buf.put_u32_le(u32::from(pid.port()));
    buf.put_u32_le(pid.incarnation());
}

/// Returns the handshake encoding of `pid` as a standalone buffer.
pub fn to_bytes(pid: &ProcessId) -> Bytes {
    let mut buf = BytesMut::new();
    encode(pid, &mut buf);
    buf.freeze()
}

/// Attempts to decode a handshake from the front of `buf`.
///
/// Returns `Ok(None)` if more bytes are needed; on success the consumed bytes
/// are removed from `buf` and anything after them (early framed traffic) is
/// left in place.
pub fn decode(buf: &mut BytesMut) -> TypesResult<Option<ProcessId>> {
    if buf.len() < LEN_SIZE {
        return Ok(None);
    }

    let host_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if host_len > MAX_HOSTNAME_LEN {
        return Err(TypesError::HostnameTooLong {
            len: host_len,
            max: MAX_HOSTNAME_LEN,
        });
    }

    if buf.len() < LEN_SIZE + host_len + TRAILER_SIZE {
        return Ok(None);
    }

    buf.advance(LEN_SIZE);
    let host = buf.split_to(host_len);
    let address = std::str::from_utf8(&host).map_err(|_| TypesError::InvalidHostname)?;
    let port = buf.get_u32_le();
    let incarnation = buf.get_u32_le();

    let port = u16::try_from(port).map_err(|_| TypesError::PortOutOfRange(port))?;
    Ok(Some(ProcessId::new(address, port, incarnation)))
}
