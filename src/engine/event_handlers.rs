// src/engine/event_handlers.rs

//! Event handling logic for the supervisor core.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::engine::queue::RunQueue;
use crate::engine::{ControlRequest, Update};
use crate::model::{Id, Job, Task};
use crate::types::TaskStatus;

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreCommand {
    /// Signal the worker running this task to kill its pipeline.
    CancelRunning(Id),
}

/// Decision returned by the core after handling a single event.
#[derive(Debug, Clone, Default)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
}

impl CoreStep {
    fn none() -> Self {
        Self::default()
    }

    fn one(command: CoreCommand) -> Self {
        Self {
            commands: vec![command],
        }
    }
}

/// Put a pending task into the task table and at the tail of the run queue.
pub fn enqueue(runq: &mut RunQueue, tasks: &mut HashMap<Id, Task>, task: Task) {
    debug!(task = %task.id, details = %task.details(), "enqueuing task");
    runq.push(task.id);
    tasks.insert(task.id, task);
}

/// Handle a scheduler tick.
///
/// Every runnable job gets one BACKUP task appended to the run queue and is
/// then rescheduled. A job whose schedule fails keeps its stale `next_run`
/// and is paused, so it is not enqueued again on every tick; a resync or an
/// explicit unpause brings it back.
pub fn handle_tick(
    jobs: &mut [Job],
    runq: &mut RunQueue,
    tasks: &mut HashMap<Id, Task>,
    now: DateTime<Utc>,
) -> CoreStep {
    for job in jobs.iter_mut() {
        if !job.runnable(now) {
            continue;
        }

        let task = job.task();
        info!(job = %job.name, task = %task.id, "job is due; scheduling backup");
        enqueue(runq, tasks, task);

        match job.reschedule(now) {
            Ok(()) => debug!(job = %job.name, next_run = %job.next_run(), "job rescheduled"),
            Err(e) => {
                error!(
                    job = %job.name,
                    stale_next_run = %job.next_run(),
                    error = %e,
                    "failed to reschedule job; pausing it"
                );
                job.pause();
            }
        }
    }

    CoreStep::none()
}

/// Fold one worker update into the task table.
pub fn handle_update(tasks: &mut HashMap<Id, Task>, update: Update) -> CoreStep {
    let Some(task) = tasks.get_mut(&update.task()) else {
        warn!(task = %update.task(), ?update, "update for unknown task; ignoring");
        return CoreStep::none();
    };

    match update {
        Update::Output { line, .. } => {
            task.append_output(line);
        }
        Update::RestoreKey { key, .. } => {
            info!(task = %task.id, key = %key, "store reported archive key");
            task.archive_key = Some(key);
        }
        Update::Stopped {
            stopped_at,
            outcome,
            ..
        } => {
            if let Err(e) = task.finish(outcome.clone(), stopped_at) {
                warn!(task = %task.id, error = %e, "ignoring stop update");
            } else {
                info!(task = %task.id, ?outcome, "task finished");
            }
        }
    }

    CoreStep::none()
}

/// Handle a control request.
///
/// `Snapshot` and `Shutdown` need the IO shell and never reach this function.
pub fn handle_control(
    jobs: &mut Vec<Job>,
    runq: &mut RunQueue,
    tasks: &mut HashMap<Id, Task>,
    request: ControlRequest,
    now: DateTime<Utc>,
) -> CoreStep {
    match request {
        ControlRequest::RunJob(job_id) => {
            match jobs.iter().find(|j| j.id == job_id) {
                Some(job) => {
                    info!(job = %job.name, "running job on demand");
                    enqueue(runq, tasks, job.task());
                }
                None => warn!(job = %job_id, "run requested for unknown job"),
            }
            CoreStep::none()
        }
        ControlRequest::Restore { job, restore_key } => {
            match jobs.iter().find(|j| j.id == job) {
                Some(found) => {
                    info!(job = %found.name, key = %restore_key, "restore requested");
                    enqueue(runq, tasks, found.restore_task(restore_key));
                }
                None => warn!(job = %job, "restore requested for unknown job"),
            }
            CoreStep::none()
        }
        ControlRequest::Submit(task) => {
            if task.status() != TaskStatus::Pending || tasks.contains_key(&task.id) {
                warn!(task = %task.id, status = ?task.status(), "refusing to submit task");
                return CoreStep::none();
            }
            enqueue(runq, tasks, task);
            CoreStep::none()
        }
        ControlRequest::Cancel(task_id) => cancel_task(runq, tasks, task_id, now),
        ControlRequest::Pause(job_id) => {
            set_paused(jobs, job_id, true);
            CoreStep::none()
        }
        ControlRequest::Unpause(job_id) => {
            set_paused(jobs, job_id, false);
            CoreStep::none()
        }
        ControlRequest::Resync(new_jobs) => {
            *jobs = new_jobs;
            resync_jobs(jobs, now);
            CoreStep::none()
        }
        ControlRequest::Snapshot(_) | ControlRequest::Shutdown => CoreStep::none(),
    }
}

/// Reschedule every job relative to `now`.
pub fn resync_jobs(jobs: &mut [Job], now: DateTime<Utc>) {
    for job in jobs.iter_mut() {
        if let Err(e) = job.reschedule(now) {
            warn!(job = %job.name, error = %e, "failed to schedule job");
            continue;
        }
        info!(job = %job.name, schedule = %job.schedule, next_run = %job.next_run(), "job scheduled");
    }
}

fn cancel_task(
    runq: &mut RunQueue,
    tasks: &mut HashMap<Id, Task>,
    task_id: Id,
    now: DateTime<Utc>,
) -> CoreStep {
    let Some(task) = tasks.get_mut(&task_id) else {
        warn!(task = %task_id, "cancel requested for unknown task");
        return CoreStep::none();
    };

    match task.status() {
        TaskStatus::Pending => {
            runq.remove(task_id);
            if let Err(e) = task.cancel_pending(now) {
                warn!(task = %task_id, error = %e, "failed to cancel pending task");
            } else {
                info!(task = %task_id, "pending task canceled");
            }
            CoreStep::none()
        }
        TaskStatus::Running => {
            info!(task = %task_id, "canceling running task");
            CoreStep::one(CoreCommand::CancelRunning(task_id))
        }
        status => {
            debug!(task = %task_id, ?status, "cancel requested for finished task");
            CoreStep::none()
        }
    }
}

fn set_paused(jobs: &mut [Job], job_id: Id, paused: bool) {
    match jobs.iter_mut().find(|j| j.id == job_id) {
        Some(job) if paused => {
            job.pause();
            info!(job = %job.name, "job paused");
        }
        Some(job) => {
            job.unpause();
            info!(job = %job.name, "job unpaused");
        }
        None => warn!(job = %job_id, "pause state change for unknown job"),
    }
}
