// src/engine/runtime.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::errors::{Result, ShieldError};
use crate::exec::{spawn_workers, Assignment, TaskExecutor, WorkerId};
use crate::model::{Id, Job, Task};

use super::core::{CoreEvent, SupervisorCore};
use super::{ControlRequest, CoreCommand, CoreStep, SupervisorOptions, Update};

const UPDATE_BUFFER: usize = 256;
const CONTROL_BUFFER: usize = 32;

/// Async shell around [`SupervisorCore`].
///
/// The run loop is the only owner of the run queue and task table. It waits
/// on ticks, worker updates, idle-worker notices and control requests, and
/// after every event hands queued tasks to whichever workers are idle.
pub struct Supervisor {
    core: SupervisorCore,
    options: SupervisorOptions,
    executor: Arc<dyn TaskExecutor>,
    control_rx: mpsc::Receiver<ControlRequest>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("core", &self.core)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(
        jobs: Vec<Job>,
        options: SupervisorOptions,
        executor: Arc<dyn TaskExecutor>,
    ) -> (Self, SupervisorHandle) {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_BUFFER);
        let supervisor = Self {
            core: SupervisorCore::new(jobs),
            options,
            executor,
            control_rx,
        };
        (supervisor, SupervisorHandle { tx: control_tx })
    }

    /// Main loop. Returns after a `Shutdown` request or once every handle
    /// has been dropped; running tasks are signalled to cancel on the way
    /// out.
    pub async fn run(mut self) -> Result<()> {
        let workers = self.options.workers.max(1);
        info!(workers, tick = ?self.options.tick_interval, "supervisor starting");

        let (updates_tx, mut updates_rx) = mpsc::channel::<Update>(UPDATE_BUFFER);
        let (idle_tx, mut idle_rx) = mpsc::channel::<WorkerId>(workers);
        let mut handoffs = spawn_workers(workers, Arc::clone(&self.executor), updates_tx, idle_tx);
        let mut cancels: HashMap<Id, oneshot::Sender<()>> = HashMap::new();

        self.core.resync(Utc::now());

        let mut ticker = interval(self.options.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.dispatch_ready(&mut handoffs, &mut cancels);

            tokio::select! {
                _ = ticker.tick() => {
                    let step = self.core.step(CoreEvent::Tick, Utc::now());
                    execute_step(step, &mut cancels);
                }
                Some(update) = updates_rx.recv() => {
                    if let Update::Stopped { task, .. } = &update {
                        cancels.remove(task);
                    }
                    let step = self.core.step(CoreEvent::Update(update), Utc::now());
                    execute_step(step, &mut cancels);
                }
                Some(worker) = idle_rx.recv() => {
                    debug!(worker, "worker idle");
                    self.core.worker_idle(worker);
                }
                request = self.control_rx.recv() => match request {
                    None => {
                        info!("all supervisor handles dropped; stopping");
                        break;
                    }
                    Some(ControlRequest::Shutdown) => {
                        info!("shutdown requested");
                        break;
                    }
                    Some(ControlRequest::Snapshot(reply)) => {
                        let tasks: Vec<Task> = self.core.tasks().cloned().collect();
                        if reply.send(tasks).is_err() {
                            debug!("snapshot requester went away");
                        }
                    }
                    Some(request) => {
                        debug!(?request, "control request");
                        let step = self.core.step(CoreEvent::Control(request), Utc::now());
                        execute_step(step, &mut cancels);
                    }
                },
            }
        }

        for (task, cancel) in cancels.drain() {
            debug!(task = %task, "canceling running task on shutdown");
            let _ = cancel.send(());
        }

        info!("supervisor stopped");
        Ok(())
    }

    /// Hand queued tasks to idle workers until one side runs out.
    ///
    /// `try_send` into a capacity-1 slot of a worker that announced itself
    /// idle never blocks. If it fails anyway, the task goes back to the head
    /// of the queue; a closed worker is removed from the pool.
    fn dispatch_ready(
        &mut self,
        handoffs: &mut HashMap<WorkerId, mpsc::Sender<Assignment>>,
        cancels: &mut HashMap<Id, oneshot::Sender<()>>,
    ) {
        while let Some((worker, task)) = self.core.next_assignment() {
            let task_id = task.id;
            let Some(handoff) = handoffs.get(&worker) else {
                warn!(worker, "idle notice from unknown worker");
                self.core.assignment_rejected(task_id);
                continue;
            };

            let (cancel_tx, cancel_rx) = oneshot::channel();
            match handoff.try_send(Assignment {
                task,
                cancel: cancel_rx,
            }) {
                Ok(()) => {
                    debug!(worker, task = %task_id, "handed task to worker");
                    self.core.assignment_accepted(task_id, Utc::now());
                    cancels.insert(task_id, cancel_tx);
                }
                Err(TrySendError::Full(_)) => {
                    debug!(worker, task = %task_id, "worker busy; requeueing task");
                    self.core.assignment_rejected(task_id);
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(worker, task = %task_id, "worker is gone; removing it from the pool");
                    handoffs.remove(&worker);
                    self.core.assignment_rejected(task_id);
                }
            }
        }
    }
}

fn execute_step(step: CoreStep, cancels: &mut HashMap<Id, oneshot::Sender<()>>) {
    for command in step.commands {
        match command {
            CoreCommand::CancelRunning(task) => match cancels.remove(&task) {
                Some(cancel) => {
                    if cancel.send(()).is_err() {
                        debug!(task = %task, "task already finished before cancel");
                    }
                }
                None => debug!(task = %task, "no cancel signal registered for task"),
            },
        }
    }
}

/// Cloneable message-passing handle to a running [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<ControlRequest>,
}

impl SupervisorHandle {
    async fn send(&self, request: ControlRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| ShieldError::Other(anyhow::anyhow!("supervisor is not running")))
    }

    pub async fn run_job(&self, job: Id) -> Result<()> {
        self.send(ControlRequest::RunJob(job)).await
    }

    pub async fn restore(&self, job: Id, restore_key: impl Into<String>) -> Result<()> {
        self.send(ControlRequest::Restore {
            job,
            restore_key: restore_key.into(),
        })
        .await
    }

    pub async fn submit(&self, task: Task) -> Result<()> {
        self.send(ControlRequest::Submit(task)).await
    }

    pub async fn cancel(&self, task: Id) -> Result<()> {
        self.send(ControlRequest::Cancel(task)).await
    }

    pub async fn pause(&self, job: Id) -> Result<()> {
        self.send(ControlRequest::Pause(job)).await
    }

    pub async fn unpause(&self, job: Id) -> Result<()> {
        self.send(ControlRequest::Unpause(job)).await
    }

    pub async fn resync(&self, jobs: Vec<Job>) -> Result<()> {
        self.send(ControlRequest::Resync(jobs)).await
    }

    /// Copy of the supervisor's task table.
    pub async fn snapshot(&self) -> Result<Vec<Task>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ControlRequest::Snapshot(reply_tx)).await?;
        reply_rx
            .await
            .map_err(|_| ShieldError::Other(anyhow::anyhow!("supervisor dropped snapshot request")))
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(ControlRequest::Shutdown).await
    }
}
