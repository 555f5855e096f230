// src/vc.rs

//! The virtual connection: one logical duplex stream multiplexed over a
//! session (spec.md §4.3). Grounded on `spineldb::connection::handler`'s
//! read/write side split and on `ClusterVConnection`/`ClusterVCToken` from
//! `examples/original_source/iocore/cluster/P_ClusterInternal.h`.

use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::error::{ClusterError, Result};

/// `remote_closed == FORCE_CLOSE_ON_OPEN_CHANNEL` means the peer reported
/// that no such channel was ever open on its end (spec.md §4.3).
pub const FORCE_CLOSE_ON_OPEN_CHANNEL: i32 = i32::MIN;

/// Default local receive-window capacity advertised to the peer for a
/// freshly created VC's read side.
pub const DEFAULT_READ_WINDOW: u32 = 64 * 1024;

/// Identifies one VC uniquely across the cluster for the lifetime of the
/// session that created it (spec.md §3, "token").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VcToken {
    pub creator_ip: std::net::IpAddr,
    pub session_id: u64,
    pub sequence_number: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcEvent {
    ReadReady,
    ReadComplete,
    Eos,
    WriteReady,
    WriteComplete,
    Error,
}

/// Read or write side bookkeeping shared by both halves of a VC
/// (spec.md §4.3, "state discipline").
#[derive(Debug, Default)]
struct SideState {
    enabled: bool,
    nbytes: u64,
    ndone: u64,
    /// Set once a fatal error or timeout has hit this side.
    errno: Option<i32>,
}

impl SideState {
    fn is_satisfied(&self) -> bool {
        self.ndone >= self.nbytes
    }
}

/// One logical duplex stream over a session, addressed on the wire by a
/// channel id (spec.md §4.3).
pub struct VirtualConnection {
    pub channel: u16,
    pub token: VcToken,

    read: SideState,
    write: SideState,

    /// Bytes accepted from the local writer but not yet shipped, in order.
    write_list: Vec<Bytes>,
    write_list_bytes: u64,
    /// Bytes handed to the session's write pump but not yet acknowledged
    /// as shipped.
    write_bytes_in_transit: u64,

    /// Peer-advertised credit this VC may still spend on DATA descriptors.
    remote_free: u32,
    /// Free space this end has advertised to the peer most recently.
    last_advertised_free: u32,
    /// Total local receive-window capacity for this VC's read side.
    local_free_capacity: u32,

    /// Counts outstanding "set-data" control messages (HTTP info, pin,
    /// priority) that must reach the peer before the first data byte
    /// (spec.md §4.3/§5).
    pending_set_data: u32,

    closed: i32,
    remote_closed: i32,
    close_disabled: bool,
    remote_close_disabled: bool,

    inactivity_timeout: Option<Duration>,
    active_timeout: Option<Duration>,

    events_tx: mpsc::UnboundedSender<VcEvent>,
}

impl VirtualConnection {
    pub fn new(channel: u16, token: VcToken) -> (Self, mpsc::UnboundedReceiver<VcEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                channel,
                token,
                read: SideState::default(),
                write: SideState::default(),
                write_list: Vec::new(),
                write_list_bytes: 0,
                write_bytes_in_transit: 0,
                remote_free: 0,
                last_advertised_free: 0,
                local_free_capacity: DEFAULT_READ_WINDOW,
                pending_set_data: 0,
                closed: 0,
                remote_closed: 0,
                close_disabled: false,
                remote_close_disabled: false,
                inactivity_timeout: None,
                active_timeout: None,
                events_tx,
            },
            events_rx,
        )
    }

    /// Registers a reader and enables the read side (spec.md §4.3).
    pub fn do_io_read(&mut self, nbytes: u64) {
        self.read.enabled = true;
        self.read.nbytes = nbytes;
        self.read.ndone = 0;
    }

    /// Registers a writer and enables the write side. Refuses while
    /// set-data messages are still pending delivery (spec.md §4.3).
    pub fn do_io_write(&mut self, nbytes: u64, data: Bytes) -> Result<()> {
        if self.pending_set_data > 0 {
            return Err(ClusterError::Internal(
                "do_io_write called before pending set-data messages were sent".into(),
            ));
        }
        self.write.enabled = true;
        self.write.nbytes = nbytes;
        self.write_list_bytes += data.len() as u64;
        self.write_list.push(data);
        Ok(())
    }

    /// `errno >= 0` is a graceful close (drain pending writes first);
    /// `errno < 0` is an abort (discard pending writes) (spec.md §4.3).
    pub fn do_io_close(&mut self, errno: i32) {
        self.closed = if errno < 0 { errno } else { 1 };
        self.read.enabled = false;
        if errno < 0 {
            self.write_list.clear();
            self.write_list_bytes = 0;
            self.write.enabled = false;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed != 0
    }

    pub fn is_aborted(&self) -> bool {
        self.closed < 0
    }

    /// Invariant 5 (spec.md §8): a closed VC with no pending set-data
    /// counters, no in-transit bytes, and no write-list bytes left is
    /// eligible to be freed.
    pub fn is_freeable(&self) -> bool {
        self.is_closed()
            && self.pending_set_data == 0
            && self.write_bytes_in_transit == 0
            && self.write_list_bytes == 0
    }

    pub fn set_remote_closed(&mut self, errno: i32) {
        self.remote_closed = errno;
    }

    /// Peer reported that this channel was never open on its end
    /// (spec.md §4.3).
    pub fn remote_reports_unknown_channel(&mut self) {
        self.remote_closed = FORCE_CLOSE_ON_OPEN_CHANNEL;
    }

    /// Marks the read/write side as wanting attention; the session's
    /// pump picks this VC back up on its next scan (spec.md §4.3).
    pub fn reenable(&mut self, event: VcEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn set_inactivity_timeout(&mut self, d: Option<Duration>) {
        self.inactivity_timeout = d;
    }

    pub fn set_active_timeout(&mut self, d: Option<Duration>) {
        self.active_timeout = d;
    }

    /// Each of these enqueues a typed control message for the peer and
    /// bumps the pending-set-data counter; callable only before the first
    /// `do_io_write` (spec.md §4.3).
    pub fn mark_set_data_pending(&mut self) -> Result<()> {
        if self.write.enabled {
            return Err(ClusterError::Internal(
                "set-data control messages must precede do_io_write".into(),
            ));
        }
        self.pending_set_data += 1;
        Ok(())
    }

    /// Called when the peer has acknowledged delivery of one set-data
    /// message (spec.md §5).
    pub fn ack_set_data(&mut self) {
        self.pending_set_data = self.pending_set_data.saturating_sub(1);
    }

    pub fn is_data_eligible(&self) -> bool {
        self.pending_set_data == 0
    }

    /// `remote_free` is an absolute cumulative watermark the peer reports,
    /// not an incrementable credit pool — each FREE descriptor overwrites
    /// it rather than adding to it (spec.md §4.3/§4.4).
    pub fn apply_remote_free(&mut self, credit: u32) {
        self.remote_free = credit;
    }

    pub fn remote_free(&self) -> u32 {
        self.remote_free
    }

    pub fn advertise_free(&mut self, free: u32) {
        self.last_advertised_free = free;
    }

    /// How much additional receive-window credit this end could still
    /// grant the peer on this VC's read side beyond what was last
    /// advertised (spec.md §4.4 "advertise new free space").
    pub fn advertisable_free_space(&self) -> u32 {
        if !self.read.enabled || self.closed != 0 {
            return 0;
        }
        self.local_free_capacity.saturating_sub(self.last_advertised_free)
    }

    /// Consumes up to `max_len` bytes (bounded further by `remote_free`)
    /// from the front of `write_list`, moving them into the in-transit
    /// count (spec.md §4.4 write pump build policy).
    pub fn take_for_descriptor(&mut self, max_len: u32) -> Option<Bytes> {
        let budget = max_len.min(self.remote_free) as usize;
        if budget == 0 || self.write_list.is_empty() {
            return None;
        }
        let mut chunk = BytesMut::new();
        while let Some(front) = self.write_list.first() {
            if chunk.len() + front.len() > budget {
                break;
            }
            let piece = self.write_list.remove(0);
            self.write_list_bytes -= piece.len() as u64;
            chunk.extend_from_slice(&piece);
        }
        if chunk.is_empty() {
            return None;
        }
        self.remote_free -= chunk.len() as u32;
        self.write_bytes_in_transit += chunk.len() as u64;
        Some(chunk.freeze())
    }

    /// The session's write pump calls this once the bytes previously
    /// taken via `take_for_descriptor` have actually been shipped.
    pub fn ack_shipped(&mut self, len: u64) {
        self.write_bytes_in_transit = self.write_bytes_in_transit.saturating_sub(len);
    }

    pub fn write_list_bytes(&self) -> u64 {
        self.write_list_bytes
    }

    pub fn write_bytes_in_transit(&self) -> u64 {
        self.write_bytes_in_transit
    }

    /// Delivers `data` into the read side, advancing `ndone`. Returns the
    /// event the caller should post: `ReadComplete` once `nbytes` bytes
    /// have arrived, `Eos` if the remote closed before that, else
    /// `ReadReady` (spec.md §4.3).
    pub fn deliver(&mut self, data: &[u8]) -> VcEvent {
        self.read.ndone += data.len() as u64;
        if self.remote_closed != 0 && !self.read.is_satisfied() {
            VcEvent::Eos
        } else if self.read.is_satisfied() {
            VcEvent::ReadComplete
        } else {
            VcEvent::ReadReady
        }
    }
}

/// A read or write completion handle returned by `do_io_read`/`do_io_write`,
/// analogous to a VIO (spec.md §4.3).
pub struct Vio {
    pub nbytes: u64,
    pub completion: oneshot::Receiver<VcEvent>,
}
