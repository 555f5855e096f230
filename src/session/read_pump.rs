// src/session/read_pump.rs

//! The read pump: validates an inbound frame's descriptors, applies FREE
//! credit, and delivers DATA payloads to their owning VC, deferring to the
//! byte bank on lock contention (spec.md §4.4).
//!
//! The state names below annotate which spec.md §4.4 read-pump state each
//! branch corresponds to; the fixed-layout parsing itself (READ_HEADER,
//! READ_DESCRIPTOR) already happened inside `wire::ClusterFrameCodec`, so
//! this pump begins at the equivalent of READ_SETUP_DATA.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::channel::ChannelTable;
use crate::session::byte_bank::ByteBank;
use crate::vc::{VcEvent, VirtualConnection};
use crate::wire::{ClusterFrame, ControlMessage, Descriptor, DescriptorType, FunctionCode};

/// How many times the pump spins attempting a VC's mutex before deferring
/// the block to the byte bank (spec.md §4.4, §5 "bounded spin").
pub const DEFAULT_LOCK_SPIN_ATTEMPTS: u32 = 8;

/// Outcome of processing one inbound frame, handed back to the session so
/// it can run set-data-aware control dispatch and post VC events.
pub struct ReadPumpOutcome {
    /// Intrinsic and non-cluster control messages, set-data messages
    /// already filtered out and applied (spec.md §4.4).
    pub control: Vec<ControlMessage>,
    pub events: Vec<(u16, VcEvent)>,
}

fn try_lock_spin(vc: &Arc<Mutex<VirtualConnection>>, attempts: u32) -> Option<parking_lot::MutexGuard<'_, VirtualConnection>> {
    for _ in 0..attempts {
        if let Some(guard) = vc.try_lock() {
            return Some(guard);
        }
        std::hint::spin_loop();
    }
    None
}

/// READ_SETUP_DATA / READ_DATA / READ_AWAIT_DATA / READ_POST_COMPLETE,
/// collapsed into one pass over a fully decoded frame (spec.md §4.4).
pub fn process_frame(
    frame: ClusterFrame,
    channels: &mut ChannelTable<Arc<Mutex<VirtualConnection>>>,
    byte_bank: &mut ByteBank,
    spin_attempts: u32,
) -> ReadPumpOutcome {
    // Set-data control messages are applied before anything else in this
    // frame, per spec.md §4.4/§5.
    let (set_data, other_control): (Vec<_>, Vec<_>) = frame
        .control
        .into_iter()
        .partition(|c| c.function_code.is_set_data());

    for msg in &set_data {
        apply_set_data(msg, channels);
    }

    let mut events = Vec::new();
    let mut offset = 0usize;
    for descriptor in &frame.descriptors {
        match descriptor.kind {
            DescriptorType::Free => {
                apply_free_descriptor(descriptor, channels);
            }
            DescriptorType::Data => {
                let payload = frame
                    .payloads
                    .get(offset)
                    .cloned()
                    .unwrap_or_default();
                offset += 1;
                deliver_data(descriptor, payload, channels, byte_bank, spin_attempts, &mut events);
            }
        }
    }

    ReadPumpOutcome {
        control: other_control,
        events,
    }
}

fn apply_set_data(msg: &ControlMessage, channels: &mut ChannelTable<Arc<Mutex<VirtualConnection>>>) {
    let Some(channel) = set_data_channel(msg) else {
        return;
    };
    if let Some(vc) = channels.get(channel) {
        vc.lock().ack_set_data();
    } else {
        warn!(channel, "set-data control message for unknown channel");
    }
}

/// The channel a set-data message targets is carried as the first two
/// bytes of its body (big-endian), matching the inline-control body
/// layout used by the other typed control messages in this module.
fn set_data_channel(msg: &ControlMessage) -> Option<u16> {
    if msg.body.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([msg.body[0], msg.body[1]]))
}

/// A descriptor only applies to the VC that currently owns its channel id
/// if its sequence number matches the low 16 bits of that VC's token
/// (spec.md §4.3/§4.4). Channel ids are freed and reused near-immediately
/// (`channel.rs`'s free list), so a stale in-flight descriptor for a
/// since-freed channel must not be misdelivered to whatever new VC now
/// occupies that slot (`P_ClusterHandler.h`'s `CLUSTER_SEQUENCE_NUMBER`
/// gate).
fn sequence_matches(vc: &VirtualConnection, descriptor: &Descriptor) -> bool {
    vc.token.sequence_number as u16 == descriptor.sequence_number
}

fn apply_free_descriptor(descriptor: &Descriptor, channels: &mut ChannelTable<Arc<Mutex<VirtualConnection>>>) {
    if let Some(vc) = channels.get(descriptor.channel) {
        let mut guard = vc.lock();
        if !sequence_matches(&guard, descriptor) {
            warn!(channel = descriptor.channel, "free descriptor sequence number stale, dropping");
            return;
        }
        guard.apply_remote_free(descriptor.length);
    }
}

fn deliver_data(
    descriptor: &Descriptor,
    payload: Bytes,
    channels: &mut ChannelTable<Arc<Mutex<VirtualConnection>>>,
    byte_bank: &mut ByteBank,
    spin_attempts: u32,
    events: &mut Vec<(u16, VcEvent)>,
) {
    let Some(vc) = channels.get(descriptor.channel) else {
        debug!(channel = descriptor.channel, "data for unknown channel dropped");
        return;
    };
    match try_lock_spin(vc, spin_attempts) {
        Some(mut guard) => {
            if !sequence_matches(&guard, descriptor) {
                warn!(channel = descriptor.channel, "data descriptor sequence number stale, dropping");
                return;
            }
            let event = guard.deliver(&payload);
            events.push((descriptor.channel, event));
        }
        None => {
            byte_bank.defer(descriptor.channel, descriptor.sequence_number, payload);
        }
    }
}

/// Called once per tick before the read pump runs new I/O, to retry
/// anything the byte bank deferred on a previous pass (spec.md §4.4).
pub fn drain_byte_bank(
    channels: &mut ChannelTable<Arc<Mutex<VirtualConnection>>>,
    byte_bank: &mut ByteBank,
    events: &mut Vec<(u16, VcEvent)>,
) {
    let mut delivered = Vec::new();
    byte_bank.drain_retry(|channel, sequence_number, data| {
        let Some(vc) = channels.get(channel) else {
            return true; // channel gone; drop the stale block
        };
        match vc.try_lock() {
            Some(mut guard) => {
                if guard.token.sequence_number as u16 != sequence_number {
                    warn!(channel, "deferred data descriptor sequence number stale, dropping");
                    return true;
                }
                delivered.push((channel, guard.deliver(data)));
                true
            }
            None => false,
        }
    });
    events.extend(delivered);
}

/// Recognizes whether a control message is an intrinsic protocol message
/// (run on the session thread) vs. a non-cluster message pushed to the
/// worker callout queue (spec.md §4.4).
pub fn is_cluster_thread_only(msg: &ControlMessage) -> bool {
    FunctionCode::is_intrinsic(msg.function_code)
}
