// src/wire/descriptor.rs

//! The fixed 8-byte descriptor layout: `{type ∈ {DATA, FREE}, channel:15,
//! sequence_number:16, length:32}` (spec.md §3).

use super::header::{get_u16, get_u32, put_u16, put_u32};
use bytes::{Buf, BufMut};

pub const DESCRIPTOR_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorType {
    Data,
    Free,
}

/// One element of the descriptor vector at the head of a cluster message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub kind: DescriptorType,
    /// 15-bit channel id; the top bit of the packed word carries `kind`.
    pub channel: u16,
    pub sequence_number: u16,
    pub length: u32,
}

const TYPE_BIT: u16 = 1 << 15;
const CHANNEL_MASK: u16 = 0x7FFF;

impl Descriptor {
    pub fn encode(&self, swap: bool, dst: &mut impl BufMut) {
        let packed = (self.channel & CHANNEL_MASK)
            | match self.kind {
                DescriptorType::Data => 0,
                DescriptorType::Free => TYPE_BIT,
            };
        put_u16(dst, packed, swap);
        put_u16(dst, self.sequence_number, swap);
        put_u32(dst, self.length, swap);
    }

    pub fn decode(swap: bool, src: &mut impl Buf) -> Self {
        let packed = get_u16(src, swap);
        let sequence_number = get_u16(src, swap);
        let length = get_u32(src, swap);
        let kind = if packed & TYPE_BIT != 0 {
            DescriptorType::Free
        } else {
            DescriptorType::Data
        };
        Self {
            kind,
            channel: packed & CHANNEL_MASK,
            sequence_number,
            length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_data_descriptor() {
        let d = Descriptor {
            kind: DescriptorType::Data,
            channel: 4095,
            sequence_number: 77,
            length: 65536,
        };
        let mut buf = bytes::BytesMut::new();
        d.encode(false, &mut buf);
        assert_eq!(buf.len(), DESCRIPTOR_LEN);
        let mut src = buf.freeze();
        assert_eq!(Descriptor::decode(false, &mut src), d);
    }

    #[test]
    fn round_trips_free_descriptor_with_swap() {
        let d = Descriptor {
            kind: DescriptorType::Free,
            channel: 1,
            sequence_number: 3,
            length: 4096,
        };
        let mut buf = bytes::BytesMut::new();
        d.encode(true, &mut buf);
        let mut src = buf.freeze();
        assert_eq!(Descriptor::decode(true, &mut src), d);
    }

    #[test]
    fn channel_zero_is_representable_but_reserved_elsewhere() {
        // The descriptor layer itself does not forbid channel 0; the
        // channel table is the layer that reserves it (spec.md §4.2).
        let d = Descriptor {
            kind: DescriptorType::Data,
            channel: 0,
            sequence_number: 0,
            length: 0,
        };
        let mut buf = bytes::BytesMut::new();
        d.encode(false, &mut buf);
        let mut src = buf.freeze();
        assert_eq!(Descriptor::decode(false, &mut src).channel, 0);
    }
}
