// src/error.rs

//! Defines the primary error type for the cluster transport and reload
//! subsystems, covering the taxonomy in spec.md §7.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum for the crate.
///
/// Wraps `std::io::Error` in an `Arc` so that `ClusterError` stays `Clone`,
/// which the session pump and RPC layer need when the same error is fanned
/// out to many VCs during `machine_down`.
#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// No peer is known for the hashed key, the only candidate is this
    /// node, or the candidate is currently overloaded.
    #[error("no route to a peer for this key")]
    NoRoute,

    /// The session's channel table has no free id of the caller's parity.
    #[error("channel table exhausted")]
    ChannelExhausted,

    /// The peer-chosen remote channel id collided with an existing mapping.
    #[error("channel id already in use")]
    ChannelInUse,

    /// A remote op's sequence number never matched a reply within the
    /// configured window.
    #[error("transport timed out waiting for a reply")]
    TransportTimeout,

    /// A reply arrived for a sequence number this session has no pending
    /// entry for (already timed out, or never sent).
    #[error("reply received for unknown or expired sequence number {0}")]
    ReplyTimeout(u32),

    /// Checksum or version mismatch: fatal for the owning session.
    #[error("wire corruption detected: {0}")]
    WireCorruption(String),

    /// The session has transitioned to dead; every VC on it surfaces this.
    #[error("peer session is down")]
    PeerDown,

    /// Returned transparently from the (external) local cache engine.
    #[error("cache miss")]
    CacheMiss,

    #[error("cache operation failed: {0}")]
    CacheOpFailure(String),

    /// Internal-only: a try-lock on a VC or stripe was missed. Callers
    /// convert this into a retry, never surface it to a caller.
    #[error("lock not acquired, retry")]
    LocalLockMiss,

    /// A second reload was attempted while the current one is non-terminal
    /// and `force` was not set.
    #[error("reload already in progress for token: {0}")]
    ReloadInProgress(String),

    /// A registered handler returned an error; carries the message that is
    /// also appended to the owning task's log.
    #[error("reload handler failed: {0}")]
    ReloadHandlerFailed(String),

    /// Surfaced only to introspection APIs; never aborts the process.
    #[error("reload task {0} timed out")]
    ReloadTimeout(String),

    #[error("duplicate registry key: {0}")]
    DuplicateConfigKey(String),

    #[error("unknown registry key: {0}")]
    UnknownConfigKey(String),

    #[error("protocol version mismatch: no common major version")]
    VersionMismatch,

    #[error("invalid duration string: {0}")]
    InvalidDuration(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        ClusterError::Io(Arc::new(e))
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
