// src/wire/codec.rs

//! Assembles the header, descriptor vector, inline control region and
//! trailing payloads into one framed message, and implements the
//! `tokio_util::codec` `Encoder`/`Decoder` pair used by the session pump.
//! Grounded on `spineldb::core::protocol::resp_frame::RespFrameCodec`
//! (same `Encoder<Item>`/`Decoder` shape), generalized to this binary
//! framing instead of RESP.

use super::control::{ControlMessage, decode_control_region, encode_control_region};
use super::descriptor::{DESCRIPTOR_LEN, Descriptor};
use super::header::{MessageHeader, additive_checksum};
use crate::error::ClusterError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// One fully assembled cluster frame: descriptors, inline control items,
/// and the payload bytes for each DATA descriptor in order.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterFrame {
    pub sequence_number: u16,
    pub descriptors: Vec<Descriptor>,
    pub control: Vec<ControlMessage>,
    /// Payload for each DATA descriptor, in the same order as `descriptors`
    /// (FREE descriptors carry no payload).
    pub payloads: Vec<Bytes>,
}

impl ClusterFrame {
    pub fn new(sequence_number: u16) -> Self {
        Self {
            sequence_number,
            descriptors: Vec::new(),
            control: Vec::new(),
            payloads: Vec::new(),
        }
    }
}

/// Stateful codec: once the byte order is known (from the hello exchange)
/// it stays fixed for the lifetime of the session.
#[derive(Debug)]
pub struct ClusterFrameCodec {
    pub swap: bool,
}

impl ClusterFrameCodec {
    pub fn new(swap: bool) -> Self {
        Self { swap }
    }
}

impl Encoder<ClusterFrame> for ClusterFrameCodec {
    type Error = ClusterError;

    fn encode(&mut self, item: ClusterFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut descriptor_bytes = BytesMut::with_capacity(item.descriptors.len() * DESCRIPTOR_LEN);
        for d in &item.descriptors {
            d.encode(self.swap, &mut descriptor_bytes);
        }

        let mut control_bytes = BytesMut::new();
        encode_control_region(&item.control, self.swap, &mut control_bytes);

        let descriptor_cksum = additive_checksum(&descriptor_bytes);
        let control_cksum = additive_checksum(&control_bytes);

        let header = MessageHeader::new(
            item.descriptors.len() as u16,
            descriptor_cksum,
            control_cksum,
            control_bytes.len() as u16,
            item.sequence_number,
        );

        header.encode(self.swap, dst);
        dst.extend_from_slice(&descriptor_bytes);
        dst.extend_from_slice(&control_bytes);
        for (d, payload) in item.descriptors.iter().zip(item.payloads.iter()) {
            debug_assert_eq!(d.length as usize, payload.len());
            dst.extend_from_slice(payload);
        }
        Ok(())
    }
}

impl Decoder for ClusterFrameCodec {
    type Item = ClusterFrame;
    type Error = ClusterError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        use super::header::HEADER_LEN;

        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Peek the header without consuming, so a short read leaves `src`
        // untouched for the next poll.
        let mut peek = &src[..HEADER_LEN];
        let header = MessageHeader::decode(self.swap, &mut peek);

        if !header.is_valid() {
            return Err(ClusterError::WireCorruption(
                "count_check mismatch: corrupted or malicious header".into(),
            ));
        }

        let descriptor_region_len = header.count as usize * DESCRIPTOR_LEN;
        let control_region_len = header.control_bytes as usize;

        let body_start = HEADER_LEN;
        let control_start = body_start + descriptor_region_len;
        let payload_start = control_start + control_region_len;

        if src.len() < payload_start {
            return Ok(None);
        }

        // Validate checksums before even looking at payload lengths.
        let descriptor_slice = &src[body_start..control_start];
        if additive_checksum(descriptor_slice) != header.descriptor_cksum {
            return Err(ClusterError::WireCorruption(
                "descriptor checksum mismatch".into(),
            ));
        }
        let control_slice = &src[control_start..payload_start];
        if additive_checksum(control_slice) != header.control_bytes_cksum {
            return Err(ClusterError::WireCorruption(
                "control checksum mismatch".into(),
            ));
        }

        let mut descriptor_cursor = &src[body_start..control_start];
        let mut descriptors = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            descriptors.push(Descriptor::decode(self.swap, &mut descriptor_cursor));
        }

        let mut control_cursor = &src[control_start..payload_start];
        let control = decode_control_region(self.swap, control_region_len, &mut control_cursor);

        let total_payload_len: usize = descriptors
            .iter()
            .map(|d| d.length as usize)
            .sum();
        let frame_end = payload_start + total_payload_len;
        if src.len() < frame_end {
            return Ok(None);
        }

        let mut frame_bytes = src.split_to(frame_end);
        frame_bytes.advance(payload_start);
        let mut payloads = Vec::with_capacity(descriptors.len());
        for d in &descriptors {
            payloads.push(frame_bytes.split_to(d.length as usize).freeze());
        }

        Ok(Some(ClusterFrame {
            sequence_number: header.sequence_number,
            descriptors,
            control,
            payloads,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::super::control::FunctionCode;
    use super::super::descriptor::DescriptorType;
    use super::*;

    fn sample_frame() -> ClusterFrame {
        let mut frame = ClusterFrame::new(5);
        frame.descriptors.push(Descriptor {
            kind: DescriptorType::Data,
            channel: 3,
            sequence_number: 1,
            length: 5,
        });
        frame.payloads.push(Bytes::from_static(b"hello"));
        frame.descriptors.push(Descriptor {
            kind: DescriptorType::Free,
            channel: 3,
            sequence_number: 2,
            length: 0,
        });
        frame
            .control
            .push(ControlMessage::new(FunctionCode::Ping, Bytes::from_static(b"p")));
        frame
    }

    #[test]
    fn encode_then_decode_round_trips_no_swap() {
        let mut codec = ClusterFrameCodec::new(false);
        let frame = sample_frame();
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn encode_then_decode_round_trips_with_swap() {
        let mut codec = ClusterFrameCodec::new(true);
        let frame = sample_frame();
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn partial_frame_returns_none() {
        let mut codec = ClusterFrameCodec::new(false);
        let frame = sample_frame();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        let mut truncated = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(codec.decode(&mut truncated).unwrap().is_none());
    }

    #[test]
    fn corrupted_descriptor_checksum_is_fatal() {
        let mut codec = ClusterFrameCodec::new(false);
        let frame = sample_frame();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        // Flip a byte inside the descriptor region (right after the header).
        buf[super::super::header::HEADER_LEN] ^= 0xFF;
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ClusterError::WireCorruption(_)));
    }

    #[test]
    fn two_frames_back_to_back_decode_independently() {
        let mut codec = ClusterFrameCodec::new(false);
        let frame = sample_frame();
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first, frame);
        assert_eq!(second, frame);
        assert!(buf.is_empty());
    }
}
