// src/reload/mod.rs

//! The reload coordinator and config registry (spec.md §4.9). Mirrors the
//! original's `mgmt/config` tree: `registry.rs` maps keys to handlers,
//! `coordinator.rs` tracks the current reload's task tree plus history,
//! `task.rs` is the task state machine, and `progress.rs` watches for
//! stuck reloads.

pub mod coordinator;
pub mod progress;
pub mod registry;
pub mod task;

pub use coordinator::{Coordinator, MAX_HISTORY_SIZE};
pub use progress::ProgressChecker;
pub use registry::{ConfigType, Handler, Registry, ReloadContext};
pub use task::{ReloadTask, TaskState};
