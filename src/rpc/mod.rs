// src/rpc/mod.rs

//! The cluster RPC layer: cache-operation continuations, the
//! sequence-numbered pending table, message shapes, the write-VC cache,
//! and the readahead tunnel (spec.md §4.5).

pub mod continuation;
pub mod messages;
pub mod tunnel;
pub mod write_vc_cache;

pub use continuation::{Continuation, OpOutcome, PendingTable, next_sequence_number};
pub use tunnel::{ReadaheadSource, ReadaheadTunnel};
pub use write_vc_cache::WriteVcCache;
