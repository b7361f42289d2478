// src/exec/task_runner.rs

//! Execution of a single assignment on a worker.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::engine::Update;
use crate::exec::backend::TaskExecutor;
use crate::exec::pipeline::{OutputLine, OutputStream};
use crate::exec::worker_pool::{Assignment, WorkerId};
use crate::model::TaskOutcome;
use crate::types::Operation;

/// Run one assignment, publishing `Output`, `RestoreKey` and finally exactly
/// one `Stopped` update.
///
/// The executor runs in its own Tokio task so a panic inside it is reported
/// as a failed task instead of taking the worker down with a task stuck in
/// RUNNING.
pub async fn run_assignment(
    worker: WorkerId,
    assignment: Assignment,
    executor: Arc<dyn TaskExecutor>,
    updates: &mpsc::Sender<Update>,
) {
    let Assignment { task, cancel } = assignment;
    let task_id = task.id;
    let op = task.op;

    info!(worker, task = %task_id, details = %task.details(), "worker picked up task");

    let (line_tx, mut line_rx) = mpsc::channel::<OutputLine>(64);
    let handle = tokio::spawn(async move { executor.execute(&task, line_tx, cancel).await });

    while let Some(line) = line_rx.recv().await {
        if op == Operation::Backup && line.stream == OutputStream::Stdout {
            if let Some(key) = restore_key_from(&line.text) {
                publish(updates, Update::RestoreKey { task: task_id, key }).await;
            }
        }
        publish(
            updates,
            Update::Output {
                task: task_id,
                line: line.text,
            },
        )
        .await;
    }

    let outcome = match handle.await {
        Ok(res) => {
            if let Err(e) = &res {
                warn!(worker, task = %task_id, error = %e, "task execution failed");
            }
            TaskOutcome::from_result(&res)
        }
        Err(join_err) => {
            error!(worker, task = %task_id, error = %join_err, "worker crashed while executing task");
            TaskOutcome::Failed {
                code: None,
                reason: format!("worker crashed: {join_err}"),
            }
        }
    };

    info!(worker, task = %task_id, ?outcome, "task stopped");
    publish(
        updates,
        Update::Stopped {
            task: task_id,
            stopped_at: Utc::now(),
            outcome,
        },
    )
    .await;
}

async fn publish(updates: &mpsc::Sender<Update>, update: Update) {
    if updates.send(update).await.is_err() {
        warn!("supervisor update channel closed; dropping update");
    }
}

/// A store plugin reports where it put the archive by printing a JSON
/// object with a `key` field on stdout.
fn restore_key_from(line: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    value.get("key")?.as_str().map(str::to_string)
}
