// src/model/task.rs

//! Concrete execution units and their status state machine.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::{Result, ShieldError};
use crate::model::Id;
use crate::types::{Operation, PluginConfig, TaskStatus};

/// How a task's execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed { code: Option<i32>, reason: String },
    Canceled,
}

impl TaskOutcome {
    /// Terminal status that this outcome maps to.
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Canceled => TaskStatus::Canceled,
            TaskOutcome::Succeeded | TaskOutcome::Failed { .. } => TaskStatus::Done,
        }
    }

    /// Classify the result of an execution.
    pub fn from_result(res: &Result<()>) -> Self {
        match res {
            Ok(()) => TaskOutcome::Succeeded,
            Err(e) if e.is_cancellation() => TaskOutcome::Canceled,
            Err(e) => TaskOutcome::Failed {
                code: match e {
                    ShieldError::ProcessFailed { code } => *code,
                    _ => None,
                },
                reason: e.to_string(),
            },
        }
    }
}

/// One concrete, non-recurring execution.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Id,
    /// Job this task was derived from, if any.
    pub job_id: Option<Id>,
    pub op: Operation,
    pub target: PluginConfig,
    pub store: PluginConfig,
    /// Archive key to restore from (restore tasks only).
    pub restore_key: Option<String>,
    /// Remote agent address; `None` runs locally.
    pub agent: Option<String>,
    status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub outcome: Option<TaskOutcome>,
    /// Archive key reported by the store plugin after a backup.
    pub archive_key: Option<String>,
    output: Vec<String>,
}

impl Task {
    /// New pending task with a freshly generated ID and empty output.
    pub fn new(op: Operation, target: PluginConfig, store: PluginConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: None,
            op,
            target,
            store,
            restore_key: None,
            agent: None,
            status: TaskStatus::Pending,
            started_at: None,
            stopped_at: None,
            outcome: None,
            archive_key: None,
            output: Vec::new(),
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn append_output(&mut self, line: impl Into<String>) {
        self.output.push(line.into());
    }

    /// PENDING -> RUNNING.
    pub fn start(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Running)?;
        self.started_at = Some(at);
        Ok(())
    }

    /// RUNNING -> DONE / CANCELED depending on `outcome`.
    pub fn finish(&mut self, outcome: TaskOutcome, at: DateTime<Utc>) -> Result<()> {
        if self.status != TaskStatus::Running {
            return Err(ShieldError::InvalidTransition {
                from: self.status,
                to: outcome.status(),
            });
        }
        self.transition(outcome.status())?;
        self.stopped_at = Some(at);
        self.outcome = Some(outcome);
        Ok(())
    }

    /// PENDING -> CANCELED, for tasks that never reached a worker.
    pub fn cancel_pending(&mut self, at: DateTime<Utc>) -> Result<()> {
        if self.status != TaskStatus::Pending {
            return Err(ShieldError::InvalidTransition {
                from: self.status,
                to: TaskStatus::Canceled,
            });
        }
        self.transition(TaskStatus::Canceled)?;
        self.stopped_at = Some(at);
        self.outcome = Some(TaskOutcome::Canceled);
        Ok(())
    }

    fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ShieldError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Short human-readable description for logs.
    pub fn details(&self) -> String {
        match self.op {
            Operation::Backup => format!(
                "backup of target '{}' to store '{}'",
                self.target.plugin, self.store.plugin
            ),
            Operation::Restore => format!(
                "restore of [{}] from store '{}' to target '{}'",
                self.restore_key.as_deref().unwrap_or(""),
                self.store.plugin,
                self.target.plugin
            ),
        }
    }
}
