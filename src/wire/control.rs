// src/wire/control.rs

//! The inline small-control region: a sequence of `{length:32,
//! function_code:32, body}` items, each padded to 8-byte alignment
//! (spec.md §3/§4.1).

use super::header::{get_u32, put_u32};
use bytes::{Buf, BufMut, Bytes};

/// Cluster function codes, the discriminant carried by each control item.
/// `WRITE_BUFFER`/`READ_BUFFER` from the original wire enum are reserved
/// and intentionally omitted — every known handler treats them as a fatal
/// assertion (spec.md §9, Open Questions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FunctionCode {
    Lookup,
    LookupReply,
    CacheOp,
    CacheOpReply,
    CloseChannel,
    SetChannelData,
    SetChannelPin,
    SetChannelPriority,
    MachineList,
    Ping,
    PingReply,
    /// Reserved range for plugin-defined RPCs and user API callouts
    /// (spec.md §4.7/§6). The numeric code is preserved verbatim.
    Plugin(u32),
}

impl FunctionCode {
    const LOOKUP: u32 = 1;
    const LOOKUP_REPLY: u32 = 2;
    const CACHE_OP: u32 = 3;
    const CACHE_OP_REPLY: u32 = 4;
    const CLOSE_CHANNEL: u32 = 5;
    const SET_CHANNEL_DATA: u32 = 6;
    const SET_CHANNEL_PIN: u32 = 7;
    const SET_CHANNEL_PRIORITY: u32 = 8;
    const MACHINE_LIST: u32 = 9;
    const PING: u32 = 10;
    const PING_REPLY: u32 = 11;
    /// Function codes below this value are reserved for the intrinsic
    /// protocol messages above; everything at or above is a plugin code.
    const PLUGIN_BASE: u32 = 1000;

    pub fn to_u32(self) -> u32 {
        match self {
            FunctionCode::Lookup => Self::LOOKUP,
            FunctionCode::LookupReply => Self::LOOKUP_REPLY,
            FunctionCode::CacheOp => Self::CACHE_OP,
            FunctionCode::CacheOpReply => Self::CACHE_OP_REPLY,
            FunctionCode::CloseChannel => Self::CLOSE_CHANNEL,
            FunctionCode::SetChannelData => Self::SET_CHANNEL_DATA,
            FunctionCode::SetChannelPin => Self::SET_CHANNEL_PIN,
            FunctionCode::SetChannelPriority => Self::SET_CHANNEL_PRIORITY,
            FunctionCode::MachineList => Self::MACHINE_LIST,
            FunctionCode::Ping => Self::PING,
            FunctionCode::PingReply => Self::PING_REPLY,
            FunctionCode::Plugin(code) => code,
        }
    }

    pub fn from_u32(code: u32) -> Self {
        match code {
            Self::LOOKUP => FunctionCode::Lookup,
            Self::LOOKUP_REPLY => FunctionCode::LookupReply,
            Self::CACHE_OP => FunctionCode::CacheOp,
            Self::CACHE_OP_REPLY => FunctionCode::CacheOpReply,
            Self::CLOSE_CHANNEL => FunctionCode::CloseChannel,
            Self::SET_CHANNEL_DATA => FunctionCode::SetChannelData,
            Self::SET_CHANNEL_PIN => FunctionCode::SetChannelPin,
            Self::SET_CHANNEL_PRIORITY => FunctionCode::SetChannelPriority,
            Self::MACHINE_LIST => FunctionCode::MachineList,
            Self::PING => FunctionCode::Ping,
            Self::PING_REPLY => FunctionCode::PingReply,
            other => FunctionCode::Plugin(other),
        }
    }

    /// "Set-data" class messages must be delivered and applied before any
    /// data descriptor for the same VC from the same write side
    /// (spec.md §4.4/§5).
    pub fn is_set_data(self) -> bool {
        matches!(
            self,
            FunctionCode::SetChannelData
                | FunctionCode::SetChannelPin
                | FunctionCode::SetChannelPriority
        )
    }

    /// Whether the function code names an intrinsic cluster-protocol
    /// message (executed on the cluster thread) vs. a plugin/user callout
    /// dispatched to a worker (spec.md §4.4).
    pub fn is_intrinsic(self) -> bool {
        !matches!(self, FunctionCode::Plugin(c) if c >= Self::PLUGIN_BASE)
    }
}

/// One inline control item: `{length, function_code, body}`, padded to an
/// 8-byte boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub function_code: FunctionCode,
    pub body: Bytes,
}

const ITEM_PREFIX_LEN: usize = 8; // length word + function code word

impl ControlMessage {
    pub fn new(function_code: FunctionCode, body: Bytes) -> Self {
        Self { function_code, body }
    }

    /// Total encoded size including 8-byte alignment padding.
    pub fn padded_len(&self) -> usize {
        let raw = ITEM_PREFIX_LEN + self.body.len();
        raw.div_ceil(8) * 8
    }

    pub fn encode(&self, swap: bool, dst: &mut impl BufMut) {
        let raw_len = (ITEM_PREFIX_LEN + self.body.len()) as u32;
        put_u32(dst, raw_len, swap);
        put_u32(dst, self.function_code.to_u32(), swap);
        dst.put_slice(&self.body);
        let pad = self.padded_len() - (ITEM_PREFIX_LEN + self.body.len());
        for _ in 0..pad {
            dst.put_u8(0);
        }
    }

    /// Decodes one item, advancing `src` past its padding. Returns `None`
    /// if fewer than `ITEM_PREFIX_LEN` bytes remain.
    pub fn decode(swap: bool, src: &mut impl Buf) -> Option<Self> {
        if src.remaining() < ITEM_PREFIX_LEN {
            return None;
        }
        let raw_len = get_u32(src, swap) as usize;
        let function_code = FunctionCode::from_u32(get_u32(src, swap));
        let body_len = raw_len.saturating_sub(ITEM_PREFIX_LEN);
        let body = src.copy_to_bytes(body_len.min(src.remaining()));
        let padded = raw_len.div_ceil(8) * 8;
        let pad = padded.saturating_sub(raw_len);
        for _ in 0..pad.min(src.remaining()) {
            src.advance(1);
        }
        Some(Self { function_code, body })
    }
}

/// Encodes a whole inline-control region (a sequence of items back to back).
pub fn encode_control_region(items: &[ControlMessage], swap: bool, dst: &mut impl BufMut) {
    for item in items {
        item.encode(swap, dst);
    }
}

/// Decodes exactly `total_len` bytes worth of inline control items.
pub fn decode_control_region(swap: bool, total_len: usize, src: &mut impl Buf) -> Vec<ControlMessage> {
    let mut items = Vec::new();
    let mut consumed = 0usize;
    while consumed < total_len {
        let before = src.remaining();
        match ControlMessage::decode(swap, src) {
            Some(item) => {
                consumed += before - src.remaining();
                items.push(item);
            }
            None => break,
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_code_round_trips() {
        for fc in [
            FunctionCode::Lookup,
            FunctionCode::LookupReply,
            FunctionCode::CacheOp,
            FunctionCode::CacheOpReply,
            FunctionCode::CloseChannel,
            FunctionCode::SetChannelData,
            FunctionCode::SetChannelPin,
            FunctionCode::SetChannelPriority,
            FunctionCode::MachineList,
            FunctionCode::Ping,
            FunctionCode::PingReply,
            FunctionCode::Plugin(5000),
        ] {
            assert_eq!(FunctionCode::from_u32(fc.to_u32()), fc);
        }
    }

    #[test]
    fn set_data_classification() {
        assert!(FunctionCode::SetChannelData.is_set_data());
        assert!(FunctionCode::SetChannelPin.is_set_data());
        assert!(FunctionCode::SetChannelPriority.is_set_data());
        assert!(!FunctionCode::Ping.is_set_data());
    }

    #[test]
    fn item_is_padded_to_eight_bytes() {
        let msg = ControlMessage::new(FunctionCode::Ping, Bytes::from_static(b"abc"));
        let mut buf = bytes::BytesMut::new();
        msg.encode(false, &mut buf);
        assert_eq!(buf.len() % 8, 0);
    }

    #[test]
    fn control_region_round_trips_multiple_items() {
        let items = vec![
            ControlMessage::new(FunctionCode::Ping, Bytes::from_static(b"x")),
            ControlMessage::new(FunctionCode::SetChannelPin, Bytes::from_static(b"0123456789")),
            ControlMessage::new(FunctionCode::CloseChannel, Bytes::new()),
        ];
        let mut buf = bytes::BytesMut::new();
        encode_control_region(&items, false, &mut buf);
        let total_len = buf.len();
        let mut src = buf.freeze();
        let decoded = decode_control_region(false, total_len, &mut src);
        assert_eq!(decoded, items);
    }
}
