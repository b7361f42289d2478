#![allow(dead_code)]

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use shield::errors::{Result, ShieldError};
use shield::model::{Id, Job, Task};
use shield::schedule::Schedule;
use shield::types::{Operation, PluginConfig};
use uuid::Uuid;

/// Schedule that fires a fixed interval after whatever "now" it is given.
#[derive(Debug, Clone, Copy)]
pub struct FixedSchedule {
    pub interval: Duration,
}

impl FixedSchedule {
    pub fn every(interval: Duration) -> Self {
        Self { interval }
    }
}

impl fmt::Display for FixedSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fixed {:?}", self.interval)
    }
}

impl Schedule for FixedSchedule {
    fn next_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let step = chrono::Duration::from_std(self.interval)
            .map_err(|e| ShieldError::Schedule(e.to_string()))?;
        Ok(now + step)
    }
}

/// Schedule that can never produce a next occurrence.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrokenSchedule;

impl fmt::Display for BrokenSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("broken")
    }
}

impl Schedule for BrokenSchedule {
    fn next_after(&self, _now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        Err(ShieldError::Schedule("schedule is exhausted".to_string()))
    }
}

/// Schedule that answers with `now` itself, which a job must refuse.
#[derive(Debug, Clone, Copy, Default)]
pub struct StuckSchedule;

impl fmt::Display for StuckSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("stuck")
    }
}

impl Schedule for StuckSchedule {
    fn next_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        Ok(now)
    }
}

/// Builder for `Job` to simplify test setup.
pub struct JobBuilder {
    id: Id,
    name: String,
    target: PluginConfig,
    store: PluginConfig,
    agent: Option<String>,
    schedule: Arc<dyn Schedule>,
    paused: bool,
}

impl JobBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            target: PluginConfig::new("fs", r#"{"base_dir":"/data"}"#),
            store: PluginConfig::new("webdav", r#"{"url":"http://store"}"#),
            agent: None,
            schedule: Arc::new(FixedSchedule::every(Duration::from_secs(3600))),
            paused: false,
        }
    }

    pub fn id(mut self, id: Id) -> Self {
        self.id = id;
        self
    }

    pub fn target(mut self, plugin: &str, endpoint: &str) -> Self {
        self.target = PluginConfig::new(plugin, endpoint);
        self
    }

    pub fn store(mut self, plugin: &str, endpoint: &str) -> Self {
        self.store = PluginConfig::new(plugin, endpoint);
        self
    }

    pub fn agent(mut self, addr: &str) -> Self {
        self.agent = Some(addr.to_string());
        self
    }

    pub fn schedule(mut self, schedule: impl Schedule + 'static) -> Self {
        self.schedule = Arc::new(schedule);
        self
    }

    pub fn paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    pub fn build(self) -> Job {
        let mut job = Job::new(self.id, self.name, self.target, self.store, self.schedule);
        job.paused = self.paused;
        if let Some(agent) = self.agent {
            job = job.with_agent(agent);
        }
        job
    }
}

/// A pending backup task with throwaway plugin configs.
pub fn backup_task(target: &str, store: &str) -> Task {
    Task::new(
        Operation::Backup,
        PluginConfig::new(target, "target-endpoint"),
        PluginConfig::new(store, "store-endpoint"),
    )
}

/// A pending restore task with throwaway plugin configs.
pub fn restore_task(target: &str, store: &str, key: &str) -> Task {
    let mut task = Task::new(
        Operation::Restore,
        PluginConfig::new(target, "target-endpoint"),
        PluginConfig::new(store, "store-endpoint"),
    );
    task.restore_key = Some(key.to_string());
    task
}

/// Write an executable bash plugin script into `dir` and return its path.
///
/// The script is invoked as `<plugin> <action>` where action is one of
/// `backup`, `store`, `retrieve`, `restore`.
pub fn write_plugin(dir: &Path, name: &str, body: &str) -> std::io::Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/usr/bin/env bash\n{body}\n"))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}
