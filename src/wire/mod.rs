// src/wire/mod.rs

//! The cluster wire codec: byte-order negotiation, the fixed message
//! header, the descriptor vector, the inline small-control region, and the
//! trailing per-descriptor payloads. Grounded on
//! `examples/original_source/iocore/cluster/P_ClusterInternal.h` and
//! `ClusterHandlerBase.cc`.

mod codec;
mod control;
mod descriptor;
mod header;
mod hello;

pub use codec::{ClusterFrame, ClusterFrameCodec};
pub use control::{ControlMessage, FunctionCode};
pub use descriptor::{Descriptor, DescriptorType};
pub use header::{MessageHeader, NATIVE_BYTE_ORDER_SENTINEL};
pub use hello::{HELLO_LEN, HelloMessage, negotiate_version};

/// No single DATA descriptor may request more than this many bytes in one
/// cluster frame (spec.md §8, invariant 3).
pub const MAX_CLUSTER_SEND_LENGTH: u32 = 1024 * 1024;

/// Channel 0 is reserved for control messages and is never handed out by
/// the channel table (spec.md §3/§4.2).
pub const CONTROL_CHANNEL: u16 = 0;
