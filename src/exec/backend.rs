// src/exec/backend.rs

//! Pluggable task executor abstraction.
//!
//! Workers talk to a [`TaskExecutor`] instead of spawning processes
//! directly. This makes it easy to swap in a fake executor in tests while
//! keeping the production implementation in [`Runner`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::agent::client::RemoteRunner;
use crate::errors::{Result, ShieldError};
use crate::exec::pipeline::{run_pipeline, OutputLine, Pipeline};
use crate::model::Task;

pub type ExecFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Trait abstracting how a task's pipeline is executed.
///
/// Implementations must:
/// - forward every output line on `output` as it is produced
/// - stop and return [`ShieldError::Canceled`] when `cancel` fires
/// - return an error when the pipeline fails; output already forwarded stays
///   forwarded
pub trait TaskExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        task: &'a Task,
        output: mpsc::Sender<OutputLine>,
        cancel: oneshot::Receiver<()>,
    ) -> ExecFuture<'a>;
}

/// Production executor.
///
/// Tasks without an agent run through the local shell pipeline; tasks with
/// an agent address are forwarded to that agent over SSH.
#[derive(Debug, Default)]
pub struct Runner {
    timeout: Option<Duration>,
    remote: Option<RemoteRunner>,
}

impl Runner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: RemoteRunner) -> Self {
        self.remote = Some(remote);
        self
    }
}

impl TaskExecutor for Runner {
    fn execute<'a>(
        &'a self,
        task: &'a Task,
        output: mpsc::Sender<OutputLine>,
        cancel: oneshot::Receiver<()>,
    ) -> ExecFuture<'a> {
        Box::pin(async move {
            match task.agent.as_deref() {
                None => {
                    debug!(task = %task.id, "executing pipeline locally");
                    let pipeline = Pipeline::for_task(task)?;
                    run_pipeline(&pipeline, output, cancel, self.timeout).await
                }
                Some(addr) => {
                    let remote = self.remote.as_ref().ok_or_else(|| {
                        ShieldError::ConfigError(format!(
                            "task {} targets agent {addr} but no [supervisor].private_key_file is configured",
                            task.id
                        ))
                    })?;
                    debug!(task = %task.id, agent = %addr, "forwarding pipeline to agent");
                    remote.run(addr, task, output, cancel, self.timeout).await
                }
            }
        })
    }
}
