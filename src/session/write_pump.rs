// src/session/write_pump.rs

//! The write pump: builds one outgoing cluster frame per cycle from
//! writable VCs, FREE-space advertisements, and queued control messages
//! (spec.md §4.4 "Write pump states").

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::ChannelTable;
use crate::vc::VirtualConnection;
use crate::wire::{ClusterFrame, ControlMessage, Descriptor, DescriptorType, MAX_CLUSTER_SEND_LENGTH};

/// Two outgoing priority classes: intrinsic protocol control (pings,
/// close, set-data) goes first, plugin/user control follows
/// (spec.md §4.4 "Emit queued outgoing control messages by priority
/// class").
#[derive(Default)]
pub struct ControlOutQueues {
    pub high: VecDeque<ControlMessage>,
    pub normal: VecDeque<ControlMessage>,
}

impl ControlOutQueues {
    pub fn drain_into(&mut self, out: &mut Vec<ControlMessage>) {
        out.extend(self.high.drain(..));
        out.extend(self.normal.drain(..));
    }
}

/// Round-robin cursor over channel ids, used to give every writable VC a
/// fair shot across cycles instead of always starting from channel 1
/// (spec.md §4.4 "scan one bucket of the write-VCs circular scheduler").
pub struct WriteCursor {
    next: u16,
}

impl WriteCursor {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    fn advance(&mut self, capacity: u16) {
        self.next = if self.next + 1 >= capacity { 1 } else { self.next + 1 };
    }
}

impl Default for WriteCursor {
    fn default() -> Self {
        Self::new()
    }
}

/// WRITE_SETUP / WRITE_INITIATE: assembles one frame's worth of DATA and
/// FREE descriptors plus queued control, bounded by `MAX_CLUSTER_SEND_LENGTH`
/// per descriptor. Returns `None` if there is nothing to send this cycle.
pub fn build_frame(
    channels: &mut ChannelTable<Arc<Mutex<VirtualConnection>>>,
    cursor: &mut WriteCursor,
    control_out: &mut ControlOutQueues,
    sequence: &mut u16,
) -> Option<ClusterFrame> {
    let capacity = channels.capacity() as u16;
    if capacity == 0 {
        return None;
    }

    let mut frame = ClusterFrame::new(*sequence);
    control_out.drain_into(&mut frame.control);

    let start = cursor.next;
    let mut scanned = 0u16;
    while scanned < capacity {
        let id = cursor.next;
        cursor.advance(capacity);
        scanned += 1;

        if id == start && scanned > 1 {
            break;
        }

        let Some(vc) = channels.get(id) else {
            continue;
        };
        let Some(mut guard) = vc.try_lock() else {
            continue;
        };

        // Descriptors carry the owning VC's token sequence number, not the
        // frame-level counter, so the receiver can reject a descriptor
        // misdelivered to a channel id that was freed and reused
        // (spec.md §4.3/§4.4; `P_ClusterHandler.h`'s `CLUSTER_SEQUENCE_NUMBER`).
        let vc_sequence_number = guard.token.sequence_number as u16;

        if guard.is_data_eligible() {
            if let Some(payload) = guard.take_for_descriptor(MAX_CLUSTER_SEND_LENGTH) {
                frame.descriptors.push(Descriptor {
                    kind: DescriptorType::Data,
                    channel: id,
                    sequence_number: vc_sequence_number,
                    length: payload.len() as u32,
                });
                frame.payloads.push(payload);
            }
        }

        // Read side: advertise newly available free space for this VC.
        let advertisable = guard.advertisable_free_space();
        if advertisable > 0 {
            guard.advertise_free(advertisable);
            frame.descriptors.push(Descriptor {
                kind: DescriptorType::Free,
                channel: id,
                sequence_number: vc_sequence_number,
                length: advertisable,
            });
        }
    }

    if frame.descriptors.is_empty() && frame.control.is_empty() {
        return None;
    }

    *sequence = sequence.wrapping_add(1);
    Some(frame)
}

/// Called once the framed write to the socket has completed: releases
/// in-transit byte accounting for every VC whose payload shipped
/// (spec.md §4.4 "when the write completes").
pub fn on_write_complete(frame: &ClusterFrame, channels: &mut ChannelTable<Arc<Mutex<VirtualConnection>>>) {
    let mut offset = 0usize;
    for descriptor in &frame.descriptors {
        if descriptor.kind != DescriptorType::Data {
            continue;
        }
        let len = frame.payloads.get(offset).map(|p| p.len() as u64).unwrap_or(0);
        offset += 1;
        if let Some(vc) = channels.get(descriptor.channel) {
            vc.lock().ack_shipped(len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LinkRole;
    use crate::vc::VcToken;
    use bytes::Bytes;
    use std::net::{IpAddr, Ipv4Addr};

    fn token() -> VcToken {
        VcToken {
            creator_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            session_id: 1,
            sequence_number: 1,
        }
    }

    #[test]
    fn builds_data_descriptor_within_remote_free_budget() {
        let mut channels: ChannelTable<Arc<Mutex<VirtualConnection>>> = ChannelTable::new(LinkRole::Initiator);
        let (mut vc, _rx) = VirtualConnection::new(0, token());
        vc.do_io_write(5, Bytes::from_static(b"hello")).unwrap();
        vc.apply_remote_free(5);
        let id = channels.alloc(Arc::new(Mutex::new(vc)), None).unwrap();

        let mut cursor = WriteCursor::new();
        let mut control_out = ControlOutQueues::default();
        let mut seq = 1u16;
        let frame = build_frame(&mut channels, &mut cursor, &mut control_out, &mut seq).unwrap();

        assert_eq!(frame.descriptors.len(), 1);
        assert_eq!(frame.descriptors[0].channel, id);
        assert_eq!(frame.payloads[0], Bytes::from_static(b"hello"));
    }

    #[test]
    fn no_writable_vcs_yields_none() {
        let mut channels: ChannelTable<Arc<Mutex<VirtualConnection>>> = ChannelTable::new(LinkRole::Initiator);
        let mut cursor = WriteCursor::new();
        let mut control_out = ControlOutQueues::default();
        let mut seq = 1u16;
        assert!(build_frame(&mut channels, &mut cursor, &mut control_out, &mut seq).is_none());
    }

    #[test]
    fn write_complete_releases_in_transit_bytes() {
        let mut channels: ChannelTable<Arc<Mutex<VirtualConnection>>> = ChannelTable::new(LinkRole::Initiator);
        let (mut vc, _rx) = VirtualConnection::new(0, token());
        vc.do_io_write(5, Bytes::from_static(b"hello")).unwrap();
        vc.apply_remote_free(5);
        let id = channels.alloc(Arc::new(Mutex::new(vc)), None).unwrap();

        let mut cursor = WriteCursor::new();
        let mut control_out = ControlOutQueues::default();
        let mut seq = 1u16;
        let frame = build_frame(&mut channels, &mut cursor, &mut control_out, &mut seq).unwrap();
        assert_eq!(channels.get(id).unwrap().lock().write_bytes_in_transit(), 5);

        on_write_complete(&frame, &mut channels);
        assert_eq!(channels.get(id).unwrap().lock().write_bytes_in_transit(), 0);
    }
}
