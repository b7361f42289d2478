// src/exec/worker_pool.rs

//! Fixed-size pool of workers.
//!
//! Each worker owns a capacity-1 hand-off channel. A worker announces itself
//! on the shared `idle` channel only while that hand-off slot is empty and it
//! is waiting for work, so the supervisor's `try_send` to an idle worker
//! either moves the task into that worker or fails without side effects.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::engine::Update;
use crate::exec::backend::TaskExecutor;
use crate::exec::task_runner::run_assignment;
use crate::model::Task;

pub type WorkerId = usize;

/// A task handed to a worker, together with its cancellation signal.
#[derive(Debug)]
pub struct Assignment {
    pub task: Task,
    pub cancel: oneshot::Receiver<()>,
}

/// Spawn `count` workers and return their hand-off senders keyed by ID.
///
/// Workers publish to `updates` and announce availability on `idle`. A
/// worker exits when either its hand-off sender or the idle receiver is
/// dropped.
pub fn spawn_workers(
    count: usize,
    executor: Arc<dyn TaskExecutor>,
    updates: mpsc::Sender<Update>,
    idle: mpsc::Sender<WorkerId>,
) -> HashMap<WorkerId, mpsc::Sender<Assignment>> {
    let mut senders = HashMap::with_capacity(count);

    for id in 0..count {
        let (tx, rx) = mpsc::channel::<Assignment>(1);
        let executor = Arc::clone(&executor);
        let updates = updates.clone();
        let idle = idle.clone();

        tokio::spawn(worker_loop(id, rx, executor, updates, idle));
        senders.insert(id, tx);
    }

    info!(workers = count, "worker pool started");
    senders
}

async fn worker_loop(
    id: WorkerId,
    mut rx: mpsc::Receiver<Assignment>,
    executor: Arc<dyn TaskExecutor>,
    updates: mpsc::Sender<Update>,
    idle: mpsc::Sender<WorkerId>,
) {
    loop {
        if idle.send(id).await.is_err() {
            debug!(worker = id, "idle channel closed; worker exiting");
            break;
        }

        let Some(assignment) = rx.recv().await else {
            debug!(worker = id, "hand-off channel closed; worker exiting");
            break;
        };

        run_assignment(id, assignment, Arc::clone(&executor), &updates).await;
    }
}
