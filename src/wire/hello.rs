// src/wire/hello.rs

//! The 128-byte hello message exchanged first in each direction, and the
//! version-negotiation rule (spec.md §6).

use super::header::{NATIVE_BYTE_ORDER_SENTINEL, get_u16, put_u16};
use crate::error::{ClusterError, Result};
use bytes::{Buf, BufMut, BytesMut};

pub const HELLO_LEN: usize = 128;

/// `{native_byte_order_sentinel, major, minor, min_major, min_minor,
/// peer_id, port, padding}` (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloMessage {
    pub native_byte_order_sentinel: u16,
    pub major: u16,
    pub minor: u16,
    pub min_major: u16,
    pub min_minor: u16,
    pub peer_id: u16,
    pub port: u16,
}

impl HelloMessage {
    pub fn new(major: u16, minor: u16, min_major: u16, min_minor: u16, peer_id: u16, port: u16) -> Self {
        Self {
            native_byte_order_sentinel: NATIVE_BYTE_ORDER_SENTINEL,
            major,
            minor,
            min_major,
            min_minor,
            peer_id,
            port,
        }
    }

    /// The link's byte order is fixed by this message: if the sentinel
    /// reads back byte-swapped, every subsequent header/descriptor/typed
    /// control field on this link must be swapped.
    pub fn byte_order_mismatch(raw_sentinel: u16) -> bool {
        raw_sentinel != NATIVE_BYTE_ORDER_SENTINEL
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HELLO_LEN);
        // The sentinel itself is written in this sender's native order,
        // unswapped — its whole purpose is to be read raw by the peer.
        buf.put_u16(self.native_byte_order_sentinel);
        put_u16(&mut buf, self.major, false);
        put_u16(&mut buf, self.minor, false);
        put_u16(&mut buf, self.min_major, false);
        put_u16(&mut buf, self.min_minor, false);
        put_u16(&mut buf, self.peer_id, false);
        put_u16(&mut buf, self.port, false);
        buf.resize(HELLO_LEN, 0);
        buf
    }

    /// Decodes a hello message, detecting byte-order mismatch from the raw
    /// sentinel bytes before swapping the rest of the fields.
    pub fn decode(mut src: impl Buf) -> Result<(Self, bool)> {
        if src.remaining() < 14 {
            return Err(ClusterError::WireCorruption("short hello message".into()));
        }
        let raw_sentinel = src.get_u16();
        // If neither the raw value nor its swap equals the sentinel the
        // link is simply corrupt.
        let swap = if raw_sentinel == NATIVE_BYTE_ORDER_SENTINEL {
            false
        } else if raw_sentinel.swap_bytes() == NATIVE_BYTE_ORDER_SENTINEL {
            true
        } else {
            return Err(ClusterError::WireCorruption(
                "hello sentinel did not match in either byte order".into(),
            ));
        };
        let major = get_u16(&mut src, swap);
        let minor = get_u16(&mut src, swap);
        let min_major = get_u16(&mut src, swap);
        let min_minor = get_u16(&mut src, swap);
        let peer_id = get_u16(&mut src, swap);
        let port = get_u16(&mut src, swap);
        Ok((
            Self {
                native_byte_order_sentinel: raw_sentinel,
                major,
                minor,
                min_major,
                min_minor,
                peer_id,
                port,
            },
            swap,
        ))
    }
}

/// Picks the highest major version both ends support that also lies in
/// both ends' `min_major..major` range; within that major, uses the
/// initiator's minor if the chosen major equals the initiator's major,
/// else minor 0 (spec.md §6). Returns `None` if no common major exists.
pub fn negotiate_version(
    initiator_major: u16,
    initiator_minor: u16,
    initiator_min_major: u16,
    acceptor_major: u16,
    acceptor_min_major: u16,
) -> Option<(u16, u16)> {
    let lower_bound = initiator_min_major.max(acceptor_min_major);
    let chosen_major = initiator_major.min(acceptor_major);
    if chosen_major < lower_bound {
        return None;
    }
    let minor = if chosen_major == initiator_major {
        initiator_minor
    } else {
        0
    };
    Some((chosen_major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip_no_swap() {
        let hello = HelloMessage::new(2, 3, 1, 0, 42, 8086);
        let buf = hello.encode();
        assert_eq!(buf.len(), HELLO_LEN);
        let (decoded, swap) = HelloMessage::decode(buf.freeze()).unwrap();
        assert!(!swap);
        assert_eq!(decoded.major, 2);
        assert_eq!(decoded.minor, 3);
        assert_eq!(decoded.peer_id, 42);
        assert_eq!(decoded.port, 8086);
    }

    #[test]
    fn negotiates_common_major_initiator_minor() {
        let (major, minor) = negotiate_version(3, 5, 1, 3, 0).unwrap();
        assert_eq!(major, 3);
        assert_eq!(minor, 5);
    }

    #[test]
    fn negotiates_lower_major_uses_minor_zero() {
        // Acceptor only supports up to major 2; initiator is at major 3.
        let (major, minor) = negotiate_version(3, 5, 1, 2, 0).unwrap();
        assert_eq!(major, 2);
        assert_eq!(minor, 0);
    }

    #[test]
    fn no_common_major_aborts() {
        assert!(negotiate_version(3, 0, 3, 1, 0).is_none());
    }
}
