// src/reload/coordinator.rs

//! Reload coordinator: owns the current reload's main task, a bounded
//! history of past reloads, and the dedup rule that keeps one handler
//! from running twice per reload round (spec.md §4.9 "Coordinator
//! operations"). Grounded directly on
//! `original_source/include/mgmt/config/ConfigReloadCoordinator.h` + `.cc`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{ClusterError, Result};
use crate::reload::registry::ReloadContext;
use crate::reload::task::{ReloadTask, TaskState};

/// Oldest entries are evicted once history exceeds this (spec.md §3
/// "Reload task" lifecycle, "history buffer keeps the last N").
pub const MAX_HISTORY_SIZE: usize = 100;

#[derive(Default)]
pub struct Coordinator {
    current: RwLock<Option<Arc<ReloadTask>>>,
    history: RwLock<VecDeque<Arc<ReloadTask>>>,
    next_token: AtomicU64,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates a token if `token` is `None`; fails with
    /// `ReloadInProgress` if a non-terminal reload is already running and
    /// `force` is false; otherwise marks the running one TIMEOUT with
    /// reason "superseded" and proceeds (spec.md §4.9 `prepare_reload`).
    pub fn prepare_reload(&self, token: &mut Option<String>, prefix: &str, force: bool) -> Result<Arc<ReloadTask>> {
        if let Some(current) = self.current.read().clone() {
            if !current.state().is_terminal() {
                if !force {
                    return Err(ClusterError::ReloadInProgress(current.token.clone()));
                }
                current.mark_timeout("superseded");
            }
        }

        let tok = token.take().unwrap_or_else(|| {
            let n = self.next_token.fetch_add(1, Ordering::Relaxed);
            format!("{prefix}-{n}")
        });
        *token = Some(tok.clone());

        let task = ReloadTask::new_main(tok, format!("reload[{prefix}]"));
        *self.current.write() = Some(task.clone());
        self.push_history(task.clone());
        Ok(task)
    }

    fn push_history(&self, task: Arc<ReloadTask>) {
        let mut history = self.history.write();
        history.push_back(task);
        while history.len() > MAX_HISTORY_SIZE {
            history.pop_front();
        }
    }

    /// Creates a subtask hung off the current main task for `key`; `None`
    /// if `key` was already handled this round (spec.md §4.9
    /// `create_config_context`, dedup rule).
    pub fn create_config_context(
        &self,
        key: &str,
        description: &str,
        filename: &str,
        supplied_yaml: Option<String>,
    ) -> Option<ReloadContext> {
        let main_task = self.current.read().clone()?;
        if main_task.has_child_with_description(key) {
            return None;
        }
        let child = ReloadTask::new_child(&main_task, key.to_string(), Some(filename.to_string()), supplied_yaml.clone());
        child.log(format!("subtask for {description} ({filename})"));
        Some(ReloadContext {
            key: key.to_string(),
            filename: filename.to_string(),
            supplied_yaml,
            task: child,
        })
    }

    pub fn get_all(&self, n: usize) -> Vec<Arc<ReloadTask>> {
        let history = self.history.read();
        history.iter().rev().take(n).cloned().collect()
    }

    pub fn find_by_token(&self, token: &str) -> Option<Arc<ReloadTask>> {
        self.history.read().iter().find(|t| t.token == token).cloned()
    }

    pub fn has_token(&self, token: &str) -> bool {
        self.history.read().iter().any(|t| t.token == token)
    }

    /// Advances a non-terminal task to TIMEOUT without interrupting a
    /// running handler (spec.md §4.9 `mark_task_as_stale`).
    pub fn mark_task_as_stale(&self, token: &str, reason: &str) -> Result<()> {
        let task = self
            .find_by_token(token)
            .ok_or_else(|| ClusterError::ReloadHandlerFailed(format!("unknown reload token: {token}")))?;
        if !task.state().is_terminal() {
            task.mark_timeout(reason);
        }
        Ok(())
    }

    pub fn current_main_task(&self) -> Option<Arc<ReloadTask>> {
        self.current.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_reload_rejects_concurrent_without_force() {
        let coordinator = Coordinator::new();
        let mut t1 = None;
        coordinator.prepare_reload(&mut t1, "p", false).unwrap();
        let mut t2 = None;
        let err = coordinator.prepare_reload(&mut t2, "p", false).unwrap_err();
        assert!(matches!(err, ClusterError::ReloadInProgress(_)));
    }

    #[test]
    fn prepare_reload_with_force_supersedes_current() {
        let coordinator = Coordinator::new();
        let mut t1 = None;
        let first = coordinator.prepare_reload(&mut t1, "p", false).unwrap();
        let mut t2 = None;
        coordinator.prepare_reload(&mut t2, "p", true).unwrap();
        assert_eq!(first.state(), TaskState::Timeout);
    }

    #[test]
    fn create_config_context_dedups_by_key_on_current_main_task() {
        let coordinator = Coordinator::new();
        let mut token = None;
        coordinator.prepare_reload(&mut token, "p", false).unwrap();
        let first = coordinator.create_config_context("records", "records", "records.yaml", None);
        assert!(first.is_some());
        let second = coordinator.create_config_context("records", "records", "records.yaml", None);
        assert!(second.is_none());
    }

    #[test]
    fn history_is_bounded() {
        let coordinator = Coordinator::new();
        for _ in 0..(MAX_HISTORY_SIZE + 10) {
            let mut token = None;
            let task = coordinator.prepare_reload(&mut token, "p", true).unwrap();
            task.transition(TaskState::Success);
        }
        assert_eq!(coordinator.get_all(usize::MAX).len(), MAX_HISTORY_SIZE);
    }

    #[test]
    fn mark_task_as_stale_times_out_non_terminal_task() {
        let coordinator = Coordinator::new();
        let mut token = None;
        let task = coordinator.prepare_reload(&mut token, "p", false).unwrap();
        task.transition(TaskState::InProgress);
        coordinator.mark_task_as_stale(&task.token, "watchdog").unwrap();
        assert_eq!(task.state(), TaskState::Timeout);
    }
}
