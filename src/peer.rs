// src/peer.rs

//! Peer entity: identity plus the live state of its connection slots
//! (spec.md §3 "Peer"). Grounded on
//! `spineldb::core::cluster::state::ClusterNode` /
//! `NodeRuntimeState`'s split between gossiped static identity and
//! locally-observed runtime state.

use std::net::IpAddr;

use crate::session::SessionHandle;

/// Static identity, stable for the peer's lifetime (spec.md §3 "identity
/// (ip, port, id)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    pub ip: IpAddr,
    pub port: u16,
    pub id: u16,
}

/// Negotiated cluster protocol version for this peer's link (spec.md §4.1
/// hello exchange).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

/// One connection slot: an established session's handle, or empty if
/// that slot has never connected or has been torn down (spec.md §3
/// "a fixed-size array of sessions, one per connection slot").
#[derive(Clone, Default)]
pub struct ConnectionSlot {
    pub session: Option<SessionHandle>,
}

/// A cluster peer: its static identity plus the locally-observed runtime
/// state — negotiated version, connection slots, and liveness (spec.md
/// §3 "Peer"). Created on discovery, destroyed after a long settle
/// interval once all references drain (spec.md §3 lifecycle; the settle
/// itself is `Topology`'s job, see `topology.rs`).
pub struct Peer {
    pub identity: PeerIdentity,
    pub protocol: ProtocolVersion,
    slots: Vec<ConnectionSlot>,
    dead: bool,
}

impl Peer {
    pub fn new(identity: PeerIdentity, slot_count: usize) -> Self {
        Self {
            identity,
            protocol: ProtocolVersion::default(),
            slots: vec![ConnectionSlot::default(); slot_count],
            dead: false,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Marks every slot empty and flags the peer dead, mirroring
    /// `Session::machine_down`'s effect at the peer level (spec.md §4.4
    /// "Cancellation / failure").
    pub fn mark_dead(&mut self) {
        self.dead = true;
        for slot in self.slots.iter_mut() {
            slot.session = None;
        }
    }

    pub fn mark_alive(&mut self) {
        self.dead = false;
    }

    pub fn attach_session(&mut self, slot: usize, session: SessionHandle, protocol: ProtocolVersion) -> bool {
        let Some(entry) = self.slots.get_mut(slot) else {
            return false;
        };
        entry.session = Some(session);
        self.protocol = protocol;
        self.dead = false;
        true
    }

    pub fn detach_session(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            entry.session = None;
        }
    }

    pub fn session(&self, slot: usize) -> Option<&SessionHandle> {
        self.slots.get(slot).and_then(|s| s.session.as_ref())
    }

    pub fn any_session(&self) -> Option<&SessionHandle> {
        self.slots.iter().find_map(|s| s.session.as_ref())
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn active_slot_count(&self) -> usize {
        self.slots.iter().filter(|s| s.session.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> PeerIdentity {
        PeerIdentity { ip: IpAddr::from([10, 0, 0, 1]), port: 8086, id: 1 }
    }

    #[test]
    fn new_peer_has_no_active_slots() {
        let peer = Peer::new(identity(), 4);
        assert_eq!(peer.active_slot_count(), 0);
        assert!(!peer.is_dead());
    }

    fn test_handle() -> SessionHandle {
        let (commands, _rx) = tokio::sync::mpsc::unbounded_channel();
        SessionHandle::for_test(commands)
    }

    #[test]
    fn mark_dead_clears_every_slot() {
        let mut peer = Peer::new(identity(), 2);
        peer.attach_session(0, test_handle(), ProtocolVersion { major: 1, minor: 0 });
        assert_eq!(peer.active_slot_count(), 1);
        peer.mark_dead();
        assert_eq!(peer.active_slot_count(), 0);
        assert!(peer.is_dead());
    }

    #[test]
    fn attach_session_on_out_of_range_slot_returns_false() {
        let mut peer = Peer::new(identity(), 1);
        assert!(!peer.attach_session(5, test_handle(), ProtocolVersion::default()));
    }
}
