// src/reload/progress.rs

//! Progress checker: watches exactly the current main task, on an
//! interval no shorter than 1s, and times it out if it goes stale
//! (spec.md §4.9 "Progress checker"). Grounded on
//! `original_source/include/mgmt/config/ConfigReloadTrace.h`'s
//! `ConfigReloadTrace::mark_as_bad_state` watchdog and modeled as a
//! `tokio::select!` timer+shutdown loop after
//! `spineldb::core::tasks::cache_gc::OnDiskCacheGCTask`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::config::ReloadConfig;
use crate::reload::coordinator::Coordinator;
use crate::reload::task::{ReloadTask, TaskState};

/// A timeout of `Duration::ZERO` (spec.md `proxy.config.admin.reload.timeout = "0"`)
/// means "disabled": the task may run indefinitely, but the checker keeps
/// rescheduling so it can observe eventual completion (spec.md §4.9).
pub struct ProgressChecker {
    coordinator: Arc<Coordinator>,
    config: ReloadConfig,
    shutdown: watch::Receiver<bool>,
}

impl ProgressChecker {
    pub fn new(coordinator: Arc<Coordinator>, config: ReloadConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self { coordinator, config, shutdown }
    }

    pub async fn run(mut self) {
        let mut ticker = interval(self.config.effective_check_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_once(),
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        debug!("progress checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Attached exactly once, only to the main task, and only while it is
    /// IN_PROGRESS (spec.md §4.9). Called directly by tests and by `run`'s
    /// ticker.
    pub fn check_once(&self) {
        let Some(task) = self.coordinator.current_main_task() else {
            return;
        };
        if task.state() != TaskState::InProgress {
            return;
        }
        let Some(timeout) = self.config.effective_timeout() else {
            return;
        };
        check_task_timeout(&task, timeout);
    }
}

fn check_task_timeout(task: &Arc<ReloadTask>, timeout: Duration) {
    let now = crate::reload::task::now_ms();
    let elapsed = now.saturating_sub(task.effective_last_updated_ms());
    if elapsed > timeout.as_millis() as u64 {
        warn!(token = %task.token, elapsed_ms = elapsed, "reload task exceeded timeout, marking TIMEOUT");
        task.mark_timeout(format!("no progress for {elapsed}ms"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reload::task::ReloadTask;

    #[test]
    fn disabled_timeout_never_fires() {
        let (_tx, rx) = watch::channel(false);
        let coordinator = Arc::new(Coordinator::new());
        let mut token = None;
        let task = coordinator.prepare_reload(&mut token, "p", false).unwrap();
        task.transition(TaskState::InProgress);

        let mut config = ReloadConfig::default();
        config.timeout = Duration::ZERO;
        let checker = ProgressChecker::new(coordinator, config, rx);
        checker.check_once();
        assert_eq!(task.state(), TaskState::InProgress);
    }

    #[test]
    fn stale_in_progress_task_is_timed_out() {
        let task = ReloadTask::new_main("t".into(), "main".into());
        task.transition(TaskState::InProgress);
        std::thread::sleep(Duration::from_millis(5));
        check_task_timeout(&task, Duration::from_millis(1));
        assert_eq!(task.state(), TaskState::Timeout);
    }

    #[test]
    fn fresh_in_progress_task_is_left_alone() {
        let task = ReloadTask::new_main("t".into(), "main".into());
        task.transition(TaskState::InProgress);
        check_task_timeout(&task, Duration::from_secs(3600));
        assert_eq!(task.state(), TaskState::InProgress);
    }

    #[test]
    fn terminal_main_task_is_not_rechecked() {
        let (_tx, rx) = watch::channel(false);
        let coordinator = Arc::new(Coordinator::new());
        let mut token = None;
        let task = coordinator.prepare_reload(&mut token, "p", false).unwrap();
        task.transition(TaskState::InProgress);
        task.transition(TaskState::Success);

        let mut config = ReloadConfig::default();
        config.timeout = Duration::from_millis(0);
        let checker = ProgressChecker::new(coordinator, config, rx);
        checker.check_once();
        assert_eq!(task.state(), TaskState::Success);
    }
}
