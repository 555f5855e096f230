// src/backend.rs

//! Seam to the local cache engine that actually reads and writes objects
//! to disk: out of scope for this crate (spec.md §1), but the cache-op
//! RPC layer (spec.md §4.5) needs something to call against a `Lookup`,
//! `OpenRead`, `OpenWrite`, `Update`/`Remove`/`Deref`, or `Link` request
//! once it has decoded one off the wire. Modeled as a plain trait object
//! rather than an async trait: this stack has no async-trait methods by
//! design, matching `DESIGN.md`'s note that handlers here are plain
//! closures/structs.

use crate::rpc::messages::{CacheKey, CacheOpFlags, CacheOpcode, FragType};

/// Outcome of a `Lookup` against the local cache (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupOutcome {
    pub found: bool,
}

/// Outcome of an `OpenRead`/`OpenReadLong` against the local cache.
/// `Hit` carries the already-available initial bytes; the caller is
/// responsible for arranging delivery over the VC the request allocated.
#[derive(Debug, Clone)]
pub enum OpenReadOutcome {
    Hit { cache_info: Option<bytes::Bytes>, initial_data_bytes: u32, is_ram_cache_hit: bool },
    Miss,
}

/// Outcome of an `OpenWrite`/`OpenWriteLong` against the local cache.
#[derive(Debug, Clone, Copy)]
pub struct OpenWriteOutcome {
    pub accepted: bool,
}

/// The local cache engine's request-facing surface, called from the
/// session thread once a cache-op control message has been decoded. Every
/// method runs synchronously on the session thread and must not block —
/// a real backend queues the work and answers from whatever result is
/// already on hand, the same contract the session's VC mutex try-locks
/// already assume (spec.md §4.4/§4.5).
pub trait CacheBackend: Send + Sync {
    fn lookup(&self, key: CacheKey, frag_type: FragType) -> LookupOutcome;

    fn open_read(&self, key: CacheKey, frag_type: FragType, opcode: CacheOpcode) -> OpenReadOutcome;

    fn open_write(&self, key: CacheKey, frag_type: FragType, flags: CacheOpFlags, opcode: CacheOpcode) -> OpenWriteOutcome;

    /// `Update`, `Remove`, `Deref` (spec.md §4.5): returns whether the op
    /// succeeded against the local cache.
    fn key_op(&self, opcode: CacheOpcode, key: CacheKey, frag_type: FragType, flags: CacheOpFlags) -> bool;

    fn link(&self, from_key: CacheKey, to_key: CacheKey, frag_type: FragType) -> bool;
}

/// Default backend for nodes that haven't wired a real cache engine in
/// yet: every lookup misses and every write is rejected, matching the
/// original's behavior when the local cache subsystem itself is down
/// (spec.md §9, "the cache is unavailable").
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCacheBackend;

impl CacheBackend for NullCacheBackend {
    fn lookup(&self, _key: CacheKey, _frag_type: FragType) -> LookupOutcome {
        LookupOutcome { found: false }
    }

    fn open_read(&self, _key: CacheKey, _frag_type: FragType, _opcode: CacheOpcode) -> OpenReadOutcome {
        OpenReadOutcome::Miss
    }

    fn open_write(&self, _key: CacheKey, _frag_type: FragType, _flags: CacheOpFlags, _opcode: CacheOpcode) -> OpenWriteOutcome {
        OpenWriteOutcome { accepted: false }
    }

    fn key_op(&self, _opcode: CacheOpcode, _key: CacheKey, _frag_type: FragType, _flags: CacheOpFlags) -> bool {
        false
    }

    fn link(&self, _from_key: CacheKey, _to_key: CacheKey, _frag_type: FragType) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CacheKey {
        CacheKey([1; 16])
    }

    #[test]
    fn null_backend_misses_every_lookup() {
        let backend = NullCacheBackend;
        assert!(!backend.lookup(key(), FragType::Http).found);
    }

    #[test]
    fn null_backend_rejects_writes_and_key_ops() {
        let backend = NullCacheBackend;
        assert!(!backend.open_write(key(), FragType::Http, CacheOpFlags::empty(), CacheOpcode::OpenWrite).accepted);
        assert!(!backend.key_op(CacheOpcode::Remove, key(), FragType::Http, CacheOpFlags::empty()));
        assert!(!backend.link(key(), key(), FragType::Http));
    }
}
