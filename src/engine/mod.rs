// src/engine/mod.rs

//! Supervisor: scheduling and dispatch engine.
//!
//! This module ties together:
//! - the job table (which jobs are due, and when they run next)
//! - the FIFO run queue of pending tasks
//! - the worker pool hand-off
//! - the task table, folded from worker updates
//!
//! The pure state machine lives in [`core`]; the async/IO shell that owns
//! channels, the tick source and worker hand-off is in [`runtime`].
//! Nothing outside the supervisor loop reads or writes the run queue or the
//! task table; workers only publish [`Update`]s and callers only send
//! [`ControlRequest`]s.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::model::{Id, Job, Task, TaskOutcome};

/// Event published by a worker about the task it is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// The task's pipeline ended.
    Stopped {
        task: Id,
        stopped_at: DateTime<Utc>,
        outcome: TaskOutcome,
    },
    /// One line of output (stdout or stderr).
    Output { task: Id, line: String },
    /// The store plugin reported the key of the archive it wrote.
    RestoreKey { task: Id, key: String },
}

impl Update {
    pub fn task(&self) -> Id {
        match self {
            Update::Stopped { task, .. }
            | Update::Output { task, .. }
            | Update::RestoreKey { task, .. } => *task,
        }
    }
}

/// Requests accepted by a running supervisor.
#[derive(Debug)]
pub enum ControlRequest {
    /// Enqueue an immediate backup of a job without touching its schedule.
    RunJob(Id),
    /// Enqueue a restore of `restore_key` using the job's plugins.
    Restore { job: Id, restore_key: String },
    /// Enqueue an already-built pending task.
    Submit(Task),
    /// Cancel a pending or running task.
    Cancel(Id),
    Pause(Id),
    Unpause(Id),
    /// Replace the job table.
    Resync(Vec<Job>),
    /// Reply with a copy of the task table.
    Snapshot(oneshot::Sender<Vec<Task>>),
    Shutdown,
}

/// Runtime options for the supervisor shell.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    /// How often due jobs are re-evaluated. Independent of any job schedule.
    pub tick_interval: Duration,
    /// Number of workers in the pool.
    pub workers: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(200),
            workers: 4,
        }
    }
}

pub mod core;
pub mod event_handlers;
pub mod queue;
pub mod runtime;

pub use self::core::{CoreEvent, SupervisorCore};
pub use event_handlers::{CoreCommand, CoreStep};
pub use queue::RunQueue;
pub use runtime::{Supervisor, SupervisorHandle};
