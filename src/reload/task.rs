// src/reload/task.rs

//! Reload task tree: a main task plus handler-created subtasks, with
//! state aggregation from children to parent (spec.md §3 "Reload task",
//! §4.9 "Task semantics"). Grounded directly on
//! `original_source/include/mgmt/config/ConfigReloadTrace.h`, translated
//! per DESIGN NOTES §9: `shared_ptr` tree → `Arc` tree with `Weak` parent
//! pointers to avoid cycles, lock-free last-updated timestamp kept as an
//! `AtomicU64`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    InProgress,
    Success,
    Fail,
    Timeout,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Fail | TaskState::Timeout)
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct TaskInner {
    state: TaskState,
    log: Vec<String>,
    children: Vec<Arc<ReloadTask>>,
}

/// One node in the reload task tree. `token`/`description`/`filename` and
/// the `main_task` flag are immutable after creation; `state` and `log`
/// are guarded by a per-task lock, while `last_updated_ms` is a
/// lock-free atomic so the progress checker can poll it without
/// contending with an in-flight handler (spec.md §4.9 "Concurrency").
pub struct ReloadTask {
    pub token: String,
    pub description: String,
    pub filename: Option<String>,
    pub main_task: bool,
    pub supplied_yaml: Option<String>,
    parent: Option<Weak<ReloadTask>>,
    created_at_ms: u64,
    last_updated_ms: AtomicU64,
    inner: RwLock<TaskInner>,
}

impl ReloadTask {
    pub fn new_main(token: String, description: String) -> Arc<Self> {
        Arc::new(Self {
            token,
            description,
            filename: None,
            main_task: true,
            supplied_yaml: None,
            parent: None,
            created_at_ms: now_ms(),
            last_updated_ms: AtomicU64::new(now_ms()),
            inner: RwLock::new(TaskInner {
                state: TaskState::Created,
                log: Vec::new(),
                children: Vec::new(),
            }),
        })
    }

    /// Creates a subtask hung off `parent` and registers it as a child
    /// (spec.md §4.9 `create_config_context`).
    pub fn new_child(
        parent: &Arc<ReloadTask>,
        description: String,
        filename: Option<String>,
        supplied_yaml: Option<String>,
    ) -> Arc<Self> {
        let child = Arc::new(Self {
            token: format!("{}/{}", parent.token, parent.inner.read().children.len()),
            description,
            filename,
            main_task: false,
            supplied_yaml,
            parent: Some(Arc::downgrade(parent)),
            created_at_ms: now_ms(),
            last_updated_ms: AtomicU64::new(now_ms()),
            inner: RwLock::new(TaskInner {
                state: TaskState::Created,
                log: Vec::new(),
                children: Vec::new(),
            }),
        });
        parent.inner.write().children.push(child.clone());
        child
    }

    pub fn state(&self) -> TaskState {
        self.inner.read().state
    }

    pub fn children(&self) -> Vec<Arc<ReloadTask>> {
        self.inner.read().children.clone()
    }

    pub fn has_child_with_description(&self, description: &str) -> bool {
        self.inner
            .read()
            .children
            .iter()
            .any(|c| c.description == description)
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.inner.read().log.clone()
    }

    pub fn log(&self, line: impl Into<String>) {
        self.inner.write().log.push(line.into());
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    /// Lock-free "own" last-updated time, without walking children
    /// (spec.md §9 Open Questions #3 decision).
    pub fn own_last_updated_ms(&self) -> u64 {
        self.last_updated_ms.load(Ordering::Acquire)
    }

    /// Last-updated time considering subtasks: the max of this task's own
    /// timestamp and every descendant's (spec.md §9 decision #3; used by
    /// the progress checker per spec.md §4.9).
    pub fn effective_last_updated_ms(&self) -> u64 {
        let mut latest = self.own_last_updated_ms();
        for child in self.inner.read().children.iter() {
            latest = latest.max(child.effective_last_updated_ms());
        }
        latest
    }

    fn touch(&self) {
        self.last_updated_ms.store(now_ms(), Ordering::Release);
    }

    /// Absorbing terminal states: once FAIL/SUCCESS/TIMEOUT, later
    /// transitions are logged and ignored (spec.md §4.9).
    pub fn transition(&self, next: TaskState) {
        let mut inner = self.inner.write();
        if inner.state.is_terminal() {
            inner
                .log
                .push(format!("ignored transition to {next:?}: task already terminal"));
            return;
        }
        inner.state = next;
        drop(inner);
        self.touch();
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.recompute_from_children();
        }
    }

    pub fn mark_timeout(&self, reason: impl Into<String>) {
        self.log(format!("marked TIMEOUT: {}", reason.into()));
        self.transition(TaskState::Timeout);
    }

    /// Parent state = priority rule over children's states (spec.md §4.9
    /// "Parent aggregation"). A parent with no children keeps whatever
    /// state it was explicitly given.
    fn recompute_from_children(self: &Arc<Self>) {
        let children = self.children();
        if children.is_empty() {
            return;
        }
        let states: Vec<TaskState> = children.iter().map(|c| c.state()).collect();
        let aggregated = if states.iter().any(|s| matches!(s, TaskState::Fail | TaskState::Timeout)) {
            TaskState::Fail
        } else if states.iter().any(|s| matches!(s, TaskState::InProgress | TaskState::Created)) {
            TaskState::InProgress
        } else if states.iter().all(|s| matches!(s, TaskState::Success)) {
            TaskState::Success
        } else {
            TaskState::InProgress
        };

        let mut inner = self.inner.write();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = aggregated;
        drop(inner);
        self.touch();
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.recompute_from_children();
        }
    }
}
