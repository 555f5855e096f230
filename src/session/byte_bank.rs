// src/session/byte_bank.rs

//! Deferred-delivery queue for reads whose receiver-side VC mutex could
//! not be acquired during the read pump's try-lock window (spec.md §4.4,
//! §9 "fine-grained try-lock / spin loops"). Grounded on
//! `spineldb::core::replication::backlog`'s buffered-block-list shape.

use bytes::Bytes;

/// One read that missed its VC's lock and must be retried at the next
/// tick.
pub struct DeferredBlock {
    pub channel: u16,
    pub sequence_number: u16,
    pub data: Bytes,
}

/// Per-session list of deferred blocks, drained at the start of each tick
/// before the read pump runs (spec.md §4.4: "finish deferred reads").
#[derive(Default)]
pub struct ByteBank {
    blocks: Vec<DeferredBlock>,
}

impl ByteBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer(&mut self, channel: u16, sequence_number: u16, data: Bytes) {
        self.blocks.push(DeferredBlock { channel, sequence_number, data });
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Attempts redelivery of every deferred block via `try_deliver`,
    /// which returns `true` once it successfully acquired the VC's lock
    /// and delivered the data. Blocks that miss the lock again stay in
    /// the bank for the next tick, in their original order.
    pub fn drain_retry(&mut self, mut try_deliver: impl FnMut(u16, u16, &Bytes) -> bool) {
        let mut remaining = Vec::with_capacity(self.blocks.len());
        for block in self.blocks.drain(..) {
            if try_deliver(block.channel, block.sequence_number, &block.data) {
                continue;
            }
            remaining.push(block);
        }
        self.blocks = remaining;
    }
}
