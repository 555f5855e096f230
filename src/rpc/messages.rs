// src/rpc/messages.rs

//! Cache-operation message shapes carried inside inline control items on
//! the control channel (spec.md §4.5/§6).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};

/// Encodes a cache-op message for a control item's body (spec.md §4.5/§6).
/// Payloads travel as `bincode`-framed structs rather than hand-rolled
/// field-by-field encoding, since (unlike the fixed wire header) their
/// shape is internal to this implementation and not part of the
/// cross-version wire contract.
pub fn encode_body<T: Serialize>(msg: &T) -> Result<Bytes> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map(Bytes::from)
        .map_err(|err| ClusterError::WireCorruption(err.to_string()))
}

pub fn decode_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T> {
    bincode::serde::decode_from_slice(body, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|err| ClusterError::WireCorruption(err.to_string()))
}

/// Cache opcodes carried by a cache-op message (spec.md §6). `WriteBuffer`/
/// `ReadBuffer` from the original wire enum are intentionally omitted —
/// every known handler treats them as a fatal assertion there, so this
/// implementation documents them as reserved instead of modeling dead
/// variants (spec.md §9, Open Questions #1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheOpcode {
    OpenRead,
    OpenReadLong,
    OpenWrite,
    OpenWriteLong,
    Update,
    Remove,
    Link,
    Deref,
    /// Not a wire `CacheOp` opcode — `Lookup` travels as its own function
    /// code (spec.md §4.5). Used only to tag a `Continuation` so its
    /// origin is self-describing in the pending table.
    Lookup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FragType {
    Http,
    None,
    Purge,
    Delete,
}

/// 128-bit cache-key fingerprint, opaque to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub [u8; 16]);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheOpFlags: u32 {
        const ALLOW_MULTIPLE_WRITES = 0b0001;
        const LOOKUP_HTTP_ALTERNATE = 0b0010;
        const EVACUATE_ON_READ      = 0b0100;
    }
}

/// `Lookup` (spec.md §4.5): key only; reply is success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupRequest {
    pub seq_number: u32,
    pub key: CacheKey,
    pub frag_type: FragType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupReply {
    pub seq_number: u32,
    pub found: bool,
}

/// Open-read (short or long). The long form additionally carries a
/// marshalled HTTP request and lookup-config parameter block, both
/// treated as opaque bytes here since HTTP marshalling is an external
/// collaborator (spec.md §1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenReadRequest {
    pub seq_number: u32,
    pub key: CacheKey,
    pub frag_type: FragType,
    pub opcode: CacheOpcode,
    /// Channel id the requester pre-allocated for the object data to
    /// arrive on; the responder binds its own VC to this exact id so
    /// both ends agree on the return channel without a second round
    /// trip (spec.md §4.2 "return channel", §4.5).
    pub channel: u16,
    pub pin_time: Option<u32>,
    pub max_initial_bytes: u32,
    /// Present only for `OpenReadLong`: marshalled HTTP request +
    /// lookup-config parameter block.
    pub long_form: Option<Bytes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OpenReadResult {
    Hit,
    /// Open-read failed; for HTTP fragments (not PURGE/DELETE) the
    /// responder converts to an open-write and returns its token
    /// (spec.md §4.5 edge case (d)).
    FailedConvertedToWrite { write_token: u32 },
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenReadReply {
    pub seq_number: u32,
    pub result: OpenReadResult,
    /// Nonzero when the object did not fit in the initial buffer and a
    /// readahead tunnel follows on this token's channel (spec.md §4.5,
    /// edge case (c)).
    pub token: Option<u32>,
    pub is_ram_cache_hit: bool,
    pub cache_info: Option<Bytes>,
    pub initial_data_bytes: u32,
}

/// Open-write (short or long); the long form carries an optional
/// "old info" block for update semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenWriteRequest {
    pub seq_number: u32,
    pub key: CacheKey,
    pub frag_type: FragType,
    pub flags: CacheOpFlags,
    pub pin_time: Option<u32>,
    pub opcode: CacheOpcode,
    /// See `OpenReadRequest::channel`.
    pub channel: u16,
    pub old_info: Option<Bytes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenWriteReply {
    pub seq_number: u32,
    pub success: bool,
    pub token: Option<u32>,
}

/// Update, remove, deref (short): key and flags (spec.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyOpRequest {
    pub seq_number: u32,
    pub opcode: CacheOpcode,
    pub key: CacheKey,
    pub frag_type: FragType,
    pub flags: CacheOpFlags,
}

/// Link (short-2): two keys (spec.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRequest {
    pub seq_number: u32,
    pub from_key: CacheKey,
    pub to_key: CacheKey,
    pub frag_type: FragType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheOpReply {
    pub seq_number: u32,
    pub success: bool,
}

/// Envelope carried on the wire as a `FunctionCode::CacheOp` body
/// (spec.md §4.5): one control message, one of these shapes depending on
/// the opcode it carries. `Update`/`Remove`/`Deref` share `KeyOp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheOpRequest {
    OpenRead(OpenReadRequest),
    OpenWrite(OpenWriteRequest),
    KeyOp(KeyOpRequest),
    Link(LinkRequest),
}

impl CacheOpRequest {
    pub fn seq_number(&self) -> u32 {
        match self {
            CacheOpRequest::OpenRead(r) => r.seq_number,
            CacheOpRequest::OpenWrite(r) => r.seq_number,
            CacheOpRequest::KeyOp(r) => r.seq_number,
            CacheOpRequest::Link(r) => r.seq_number,
        }
    }
}

/// Envelope carried on the wire as a `FunctionCode::CacheOpReply` body
/// (spec.md §4.5). `OpenRead` gets its own reply shape; every other
/// opcode replies with the plain `CacheOpReply` success/failure shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheOpReplyBody {
    OpenRead(OpenReadReply),
    OpenWrite(OpenWriteReply),
    Plain(CacheOpReply),
}

impl CacheOpReplyBody {
    pub fn seq_number(&self) -> u32 {
        match self {
            CacheOpReplyBody::OpenRead(r) => r.seq_number,
            CacheOpReplyBody::OpenWrite(r) => r.seq_number,
            CacheOpReplyBody::Plain(r) => r.seq_number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_request_round_trips_through_encode_body() {
        let req = LookupRequest { seq_number: 7, key: CacheKey([9; 16]), frag_type: FragType::Http };
        let body = encode_body(&req).unwrap();
        let decoded: LookupRequest = decode_body(&body).unwrap();
        assert_eq!(decoded.seq_number, 7);
        assert_eq!(decoded.key, req.key);
        assert_eq!(decoded.frag_type, FragType::Http);
    }

    #[test]
    fn open_write_request_preserves_bitflags_and_optional_fields() {
        let req = OpenWriteRequest {
            seq_number: 1,
            key: CacheKey([1; 16]),
            frag_type: FragType::None,
            flags: CacheOpFlags::ALLOW_MULTIPLE_WRITES | CacheOpFlags::EVACUATE_ON_READ,
            pin_time: Some(30),
            opcode: CacheOpcode::OpenWrite,
            channel: 4,
            old_info: None,
        };
        let body = encode_body(&req).unwrap();
        let decoded: OpenWriteRequest = decode_body(&body).unwrap();
        assert_eq!(decoded.flags, req.flags);
        assert_eq!(decoded.pin_time, Some(30));
        assert_eq!(decoded.channel, 4);
        assert!(decoded.old_info.is_none());
    }

    #[test]
    fn decode_body_rejects_truncated_bytes() {
        let err = decode_body::<CacheOpReply>(&[0u8; 1]).unwrap_err();
        assert!(matches!(err, ClusterError::WireCorruption(_)));
    }

    #[test]
    fn cache_op_request_envelope_round_trips_and_reports_seq_number() {
        let req = CacheOpRequest::OpenRead(OpenReadRequest {
            seq_number: 42,
            key: CacheKey([2; 16]),
            frag_type: FragType::Http,
            opcode: CacheOpcode::OpenRead,
            channel: 7,
            pin_time: None,
            max_initial_bytes: 1024,
            long_form: None,
        });
        assert_eq!(req.seq_number(), 42);
        let body = encode_body(&req).unwrap();
        let decoded: CacheOpRequest = decode_body(&body).unwrap();
        match decoded {
            CacheOpRequest::OpenRead(r) => assert_eq!(r.channel, 7),
            other => panic!("expected OpenRead, got {other:?}"),
        }
    }

    #[test]
    fn cache_op_reply_envelope_round_trips_and_reports_seq_number() {
        let reply = CacheOpReplyBody::Plain(CacheOpReply { seq_number: 9, success: true });
        assert_eq!(reply.seq_number(), 9);
        let body = encode_body(&reply).unwrap();
        let decoded: CacheOpReplyBody = decode_body(&body).unwrap();
        assert!(matches!(decoded, CacheOpReplyBody::Plain(r) if r.success));
    }
}
