// src/engine/core.rs

//! Pure supervisor state machine.
//!
//! [`SupervisorCore`] consumes [`CoreEvent`]s and returns [`CoreStep`]s
//! describing what the IO shell should do next. It has no channels and does
//! no IO, so it can be driven step by step in tests with explicit clocks.
//!
//! The async shell (`engine::runtime::Supervisor`) is responsible for:
//! - reading ticks, updates, idle-worker notices and control requests
//! - handing tasks to workers and delivering cancellation signals
//! - answering snapshots and handling shutdown

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::engine::event_handlers::{
    handle_control, handle_tick, handle_update, resync_jobs, CoreStep,
};
use crate::engine::queue::RunQueue;
use crate::engine::{ControlRequest, Update};
use crate::exec::WorkerId;
use crate::model::{Id, Job, Task};

/// Input to [`SupervisorCore::step`].
#[derive(Debug)]
pub enum CoreEvent {
    Tick,
    Update(Update),
    Control(ControlRequest),
}

/// Supervisor state: job table, run queue, task table and idle workers.
#[derive(Debug, Default)]
pub struct SupervisorCore {
    jobs: Vec<Job>,
    runq: RunQueue,
    tasks: HashMap<Id, Task>,
    idle: VecDeque<WorkerId>,
}

impl SupervisorCore {
    pub fn new(jobs: Vec<Job>) -> Self {
        Self {
            jobs,
            ..Self::default()
        }
    }

    /// Reschedule every job relative to `now`.
    pub fn resync(&mut self, now: DateTime<Utc>) {
        resync_jobs(&mut self.jobs, now);
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn task(&self, id: Id) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// IDs of pending tasks in dispatch order.
    pub fn queued(&self) -> Vec<Id> {
        self.runq.iter().copied().collect()
    }

    pub fn idle_workers(&self) -> usize {
        self.idle.len()
    }

    /// Handle a single event, updating state and returning commands for the
    /// IO shell.
    pub fn step(&mut self, event: CoreEvent, now: DateTime<Utc>) -> CoreStep {
        match event {
            CoreEvent::Tick => handle_tick(&mut self.jobs, &mut self.runq, &mut self.tasks, now),
            CoreEvent::Update(update) => handle_update(&mut self.tasks, update),
            CoreEvent::Control(request) => handle_control(
                &mut self.jobs,
                &mut self.runq,
                &mut self.tasks,
                request,
                now,
            ),
        }
    }

    /// Record that a worker is waiting for work.
    pub fn worker_idle(&mut self, worker: WorkerId) {
        if !self.idle.contains(&worker) {
            self.idle.push_back(worker);
        }
    }

    /// Pair the head of the run queue with an idle worker.
    ///
    /// The task leaves the queue but stays PENDING until the shell confirms
    /// the hand-off with [`SupervisorCore::assignment_accepted`] or undoes it
    /// with [`SupervisorCore::assignment_rejected`].
    pub fn next_assignment(&mut self) -> Option<(WorkerId, Task)> {
        if self.idle.is_empty() {
            return None;
        }

        while let Some(id) = self.runq.pop() {
            let Some(task) = self.tasks.get(&id) else {
                warn!(task = %id, "queued task missing from task table; dropping");
                continue;
            };
            let worker = self.idle.pop_front()?;
            return Some((worker, task.clone()));
        }

        None
    }

    /// The worker took the task: mark it RUNNING.
    pub fn assignment_accepted(&mut self, task_id: Id, now: DateTime<Utc>) {
        if let Some(task) = self.tasks.get_mut(&task_id) {
            match task.start(now) {
                Ok(()) => debug!(task = %task_id, "task dispatched"),
                Err(e) => warn!(task = %task_id, error = %e, "dispatched task was not pending"),
            }
        }
    }

    /// The hand-off failed: the task goes back to the head of the queue. The
    /// worker is not returned to the idle set; it announces itself again if
    /// it is still alive.
    pub fn assignment_rejected(&mut self, task_id: Id) {
        self.runq.requeue_front(task_id);
    }
}
