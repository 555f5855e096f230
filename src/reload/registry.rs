// src/reload/registry.rs

//! Config-key registry: maps reload keys to handlers and the records that
//! trigger them (spec.md §3 "Registry entry", §4.9 "Registry operations").
//! Grounded on `original_source/include/mgmt/config/ConfigRegistry.h` +
//! `.cc`, the literal source this module distills.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{ClusterError, Result};
use crate::reload::coordinator::Coordinator;
use crate::reload::task::ReloadTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigType {
    Yaml,
    Legacy,
}

fn infer_type(filename: &str) -> ConfigType {
    if filename.ends_with(".yaml") || filename.ends_with(".yml") {
        ConfigType::Yaml
    } else {
        ConfigType::Legacy
    }
}

/// What a handler receives: the filename to load (or RPC-supplied YAML to
/// read from memory instead), and the subtask it must drive to a terminal
/// state (spec.md §4.9 "Failure surface").
pub struct ReloadContext {
    pub key: String,
    pub filename: String,
    pub supplied_yaml: Option<String>,
    pub task: Arc<ReloadTask>,
}

pub type Handler = Arc<dyn Fn(&ReloadContext) -> Result<()> + Send + Sync>;

struct RegistryEntry {
    key: String,
    default_filename: String,
    filename_record: Option<String>,
    config_type: ConfigType,
    handler: Handler,
    trigger_records: Vec<String>,
    passed_yaml: RwLock<Option<String>>,
}

impl RegistryEntry {
    /// Record-backed value if present, else the default (spec.md §4.9
    /// `execute_reload` "resolve filename").
    fn resolve_filename(&self, record_value: Option<&str>) -> String {
        record_value
            .map(str::to_owned)
            .or_else(|| self.filename_record.clone())
            .unwrap_or_else(|| self.default_filename.clone())
    }
}

/// Keys are unique; each key's trigger records fan in to a reload of that
/// key (spec.md §3 "Registry entry", §4.9 "Registry operations").
#[derive(Default)]
pub struct Registry {
    entries: DashMap<String, RegistryEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_config(
        &self,
        key: impl Into<String>,
        default_filename: impl Into<String>,
        filename_record: Option<String>,
        handler: Handler,
        trigger_records: Vec<String>,
    ) -> Result<()> {
        let key = key.into();
        let default_filename = default_filename.into();
        if self.entries.contains_key(&key) {
            return Err(ClusterError::ReloadHandlerFailed(format!(
                "duplicate registry key: {key}"
            )));
        }
        let config_type = infer_type(&default_filename);
        self.entries.insert(
            key.clone(),
            RegistryEntry {
                key,
                default_filename,
                filename_record,
                config_type,
                handler,
                trigger_records,
                passed_yaml: RwLock::new(None),
            },
        );
        Ok(())
    }

    pub fn attach(&self, key: &str, record: impl Into<String>) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| ClusterError::ReloadHandlerFailed(format!("unknown registry key: {key}")))?;
        entry.trigger_records.push(record.into());
        Ok(())
    }

    pub fn set_passed_config(&self, key: &str, yaml: impl Into<String>) -> Result<()> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| ClusterError::ReloadHandlerFailed(format!("unknown registry key: {key}")))?;
        *entry.passed_yaml.write() = Some(yaml.into());
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn config_type(&self, key: &str) -> Option<ConfigType> {
        self.entries.get(key).map(|e| e.config_type)
    }

    /// Resolves the filename, creates a subtask via `coordinator`, and
    /// invokes the handler. Dedup (same key already handled under the
    /// current main task) is delegated to
    /// `Coordinator::create_config_context` (spec.md §4.9).
    pub fn execute_reload(&self, key: &str, coordinator: &Coordinator) -> Result<()> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| ClusterError::ReloadHandlerFailed(format!("unknown registry key: {key}")))?;

        let supplied_yaml = entry.passed_yaml.write().take();
        let filename = entry.resolve_filename(None);

        let context = match coordinator.create_config_context(key, &entry.key, &filename, supplied_yaml) {
            Some(context) => context,
            None => {
                debug!(key, "reload skipped: key already handled this round");
                return Ok(());
            }
        };

        context.task.transition(crate::reload::task::TaskState::InProgress);
        match (entry.handler)(&context) {
            Ok(()) => context.task.transition(crate::reload::task::TaskState::Success),
            Err(err) => {
                context.task.log(err.to_string());
                context.task.transition(crate::reload::task::TaskState::Fail);
                warn!(key, error = %err, "reload handler failed");
            }
        }
        Ok(())
    }

    /// Posts a reload for `key` to run on the worker pool. In this core
    /// the "worker pool" is the caller's async runtime; callers `spawn`
    /// the returned future (spec.md §4.9 `schedule_reload`).
    pub fn schedule_reload<'a>(&'a self, key: &'a str, coordinator: &'a Coordinator) -> Result<()> {
        self.execute_reload(key, coordinator)
    }

    pub fn trigger_records_for(&self, key: &str) -> Vec<String> {
        self.entries
            .get(key)
            .map(|e| e.trigger_records.clone())
            .unwrap_or_default()
    }
}
