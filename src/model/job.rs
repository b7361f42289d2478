// src/model/job.rs

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::{Result, ShieldError};
use crate::model::{Id, Task};
use crate::schedule::Schedule;
use crate::types::{Operation, PluginConfig};

/// A recurring backup definition.
///
/// `next_run` only moves through [`Job::reschedule`]. A freshly built job has
/// never been rescheduled and is considered due immediately.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Id,
    pub name: String,
    pub target: PluginConfig,
    pub store: PluginConfig,
    /// Address (`host:port`) of the agent that runs this job's pipeline.
    /// `None` runs it on the supervisor host.
    pub agent: Option<String>,
    pub schedule: Arc<dyn Schedule>,
    pub paused: bool,
    next_run: DateTime<Utc>,
}

impl Job {
    pub fn new(
        id: Id,
        name: impl Into<String>,
        target: PluginConfig,
        store: PluginConfig,
        schedule: Arc<dyn Schedule>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            target,
            store,
            agent: None,
            schedule,
            paused: false,
            next_run: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn next_run(&self) -> DateTime<Utc> {
        self.next_run
    }

    /// True iff the job is not paused and its next run is not in the future.
    pub fn runnable(&self, now: DateTime<Utc>) -> bool {
        !self.paused && self.next_run <= now
    }

    /// Advance `next_run` to the schedule's first occurrence strictly after
    /// `now`.
    ///
    /// On error `next_run` is left untouched so the stale value stays
    /// visible to whoever reports the misconfiguration.
    pub fn reschedule(&mut self, now: DateTime<Utc>) -> Result<()> {
        let next = self.schedule.next_after(now)?;
        if next <= now {
            return Err(ShieldError::Schedule(format!(
                "schedule '{}' returned {next}, which is not after {now}",
                self.schedule
            )));
        }
        self.next_run = next;
        Ok(())
    }

    /// Build a fresh BACKUP task from this job's current plugin configs.
    pub fn task(&self) -> Task {
        let mut task = Task::new(Operation::Backup, self.target.clone(), self.store.clone());
        task.job_id = Some(self.id);
        task.agent = self.agent.clone();
        task
    }

    /// Build a RESTORE task that replays `restore_key` from this job's store
    /// into its target.
    pub fn restore_task(&self, restore_key: impl Into<String>) -> Task {
        let mut task = Task::new(Operation::Restore, self.target.clone(), self.store.clone());
        task.job_id = Some(self.id);
        task.agent = self.agent.clone();
        task.restore_key = Some(restore_key.into());
        task
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn unpause(&mut self) {
        self.paused = false;
    }
}

/// Stable job identifier derived from the job's configured name.
pub fn job_id_for_name(name: &str) -> Id {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("shield:job:{name}").as_bytes())
}
