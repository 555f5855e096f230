// src/api.rs

//! The cluster API / RPC plugin dispatch table and the status-callback
//! registry (spec.md §4.7). Grounded on `spineldb::core::cluster::client`
//! (small typed request/response calls against shared cluster state) and
//! `original_source/iocore/cluster/ClusterAPI.cc`.

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::wire::{ControlMessage, FunctionCode};

/// Which worker runs a dispatch-table entry's handler (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePriority {
    High,
    Normal,
}

pub type Handler = Arc<dyn Fn(&ControlMessage) + Send + Sync>;
/// Runs once the message has actually been queued for send, used for
/// visibility invariants like "set-data has shipped, data may now flow"
/// (spec.md §4.7).
pub type PostSendHook = Arc<dyn Fn(&ControlMessage) + Send + Sync>;

pub struct DispatchEntry {
    pub cluster_thread_only: bool,
    pub queue_priority: QueuePriority,
    pub handler: Handler,
    pub post_send_hook: Option<PostSendHook>,
}

/// Fixed-size function dispatch table indexed by cluster function code
/// (spec.md §4.7). Plugin codes (`FunctionCode::Plugin`) are the intended
/// extension surface; intrinsic codes are pre-registered by the session
/// layer.
#[derive(Default)]
pub struct Dispatcher {
    entries: DashMap<u32, DispatchEntry>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, code: FunctionCode, entry: DispatchEntry) {
        self.entries.insert(code.to_u32(), entry);
    }

    pub fn dispatch(&self, msg: &ControlMessage) -> bool {
        match self.entries.get(&msg.function_code.to_u32()) {
            Some(entry) => {
                (entry.handler)(msg);
                true
            }
            None => {
                debug!(code = ?msg.function_code, "no handler registered for function code");
                false
            }
        }
    }

    pub fn run_post_send_hook(&self, msg: &ControlMessage) {
        if let Some(entry) = self.entries.get(&msg.function_code.to_u32()) {
            if let Some(hook) = &entry.post_send_hook {
                hook(msg);
            }
        }
    }

    pub fn is_cluster_thread_only(&self, code: FunctionCode) -> bool {
        self.entries
            .get(&code.to_u32())
            .map(|e| e.cluster_thread_only)
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatusEvent {
    Up,
    Down,
}

pub type StatusCallback = Arc<dyn Fn(IpAddr, PeerStatusEvent) + Send + Sync>;

/// Maps a user status-callback handle to its slot; events are delivered
/// for peer up/down, and a newly-registered handler receives an initial
/// fan-out of the currently online peer list (spec.md §4.7).
#[derive(Default)]
pub struct StatusRegistry {
    callbacks: DashMap<u64, StatusCallback>,
    next_handle: std::sync::atomic::AtomicU64,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback`, immediately fanning out `online_peers` as a
    /// synthetic `Up` event per peer so the new handler sees current state
    /// (spec.md §4.7).
    pub fn register(&self, callback: StatusCallback, online_peers: &[IpAddr]) -> u64 {
        let handle = self.next_handle.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        for peer in online_peers {
            callback(*peer, PeerStatusEvent::Up);
        }
        self.callbacks.insert(handle, callback);
        handle
    }

    pub fn unregister(&self, handle: u64) {
        self.callbacks.remove(&handle);
    }

    pub fn broadcast(&self, peer: IpAddr, event: PeerStatusEvent) {
        for entry in self.callbacks.iter() {
            (entry.value())(peer, event);
        }
    }
}
