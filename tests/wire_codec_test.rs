// tests/wire_codec_test.rs

//! Integration coverage for the cluster wire codec's encode/decode round
//! trip across a real `BytesMut` buffer, beyond the inline unit tests in
//! `src/wire/codec.rs`.

use bytes::{Bytes, BytesMut};
use clustercache::wire::{ClusterFrame, ClusterFrameCodec, ControlMessage, Descriptor, DescriptorType, FunctionCode};
use tokio_util::codec::{Decoder, Encoder};

#[test]
fn round_trips_a_frame_with_mixed_descriptors_and_control() {
    let mut codec = ClusterFrameCodec::new(false);
    let frame = ClusterFrame {
        sequence_number: 42,
        descriptors: vec![
            Descriptor { kind: DescriptorType::Data, channel: 3, sequence_number: 1, length: 5 },
            Descriptor { kind: DescriptorType::Free, channel: 3, sequence_number: 0, length: 1024 },
        ],
        control: vec![ControlMessage::new(FunctionCode::Ping, Bytes::new())],
        payloads: vec![Bytes::from_static(b"hello")],
    };

    let mut buf = BytesMut::new();
    codec.encode(frame.clone(), &mut buf).unwrap();

    let decoded = codec.decode(&mut buf).unwrap().expect("a full frame should decode");
    assert_eq!(decoded.sequence_number, frame.sequence_number);
    assert_eq!(decoded.descriptors.len(), 2);
    assert_eq!(decoded.payloads, frame.payloads);
    assert!(buf.is_empty());
}

#[test]
fn decode_returns_none_until_enough_bytes_arrive() {
    let mut codec = ClusterFrameCodec::new(false);
    let frame = ClusterFrame {
        sequence_number: 1,
        descriptors: vec![Descriptor { kind: DescriptorType::Data, channel: 1, sequence_number: 1, length: 3 }],
        control: vec![],
        payloads: vec![Bytes::from_static(b"abc")],
    };
    let mut full = BytesMut::new();
    codec.encode(frame, &mut full).unwrap();

    let mut partial = BytesMut::from(&full[..full.len() - 1]);
    assert!(codec.decode(&mut partial).unwrap().is_none());
}
