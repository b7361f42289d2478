use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shield::errors::ShieldError;
use shield::exec::{ExecFuture, OutputLine, TaskExecutor};
use shield::model::{Id, Task};
use tokio::sync::{mpsc, oneshot};

/// What the fake does with every task it is asked to run.
#[derive(Debug, Clone)]
pub enum FakeBehavior {
    /// Emit `lines` on stdout, wait `delay`, succeed.
    Succeed { lines: Vec<String>, delay: Duration },
    /// Emit `lines` on stderr, then fail with the given exit code.
    Fail { lines: Vec<String>, code: i32 },
    /// Run until canceled.
    BlockUntilCanceled,
    /// Panic inside the executor.
    Panic,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        FakeBehavior::Succeed {
            lines: Vec::new(),
            delay: Duration::ZERO,
        }
    }
}

/// A fake executor that:
/// - records which tasks were started, in order
/// - tracks how many tasks run at the same time
/// - reacts to each task as configured by [`FakeBehavior`]
#[derive(Debug, Default)]
pub struct FakeExecutor {
    behavior: FakeBehavior,
    started: Mutex<Vec<Id>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl FakeExecutor {
    pub fn new(behavior: FakeBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            ..Self::default()
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::new(FakeBehavior::default())
    }

    /// Task IDs in the order execution started.
    pub fn started(&self) -> Vec<Id> {
        self.started.lock().expect("started lock poisoned").clone()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    async fn run(
        &self,
        output: mpsc::Sender<OutputLine>,
        cancel: oneshot::Receiver<()>,
    ) -> shield::errors::Result<()> {
        match &self.behavior {
            FakeBehavior::Succeed { lines, delay } => {
                for line in lines {
                    let _ = output.send(OutputLine::stdout(line.clone())).await;
                }
                tokio::select! {
                    _ = tokio::time::sleep(*delay) => Ok(()),
                    Ok(()) = cancel => Err(ShieldError::Canceled),
                }
            }
            FakeBehavior::Fail { lines, code } => {
                for line in lines {
                    let _ = output.send(OutputLine::stderr(line.clone())).await;
                }
                Err(ShieldError::ProcessFailed { code: Some(*code) })
            }
            FakeBehavior::BlockUntilCanceled => match cancel.await {
                Ok(()) => Err(ShieldError::Canceled),
                Err(_) => std::future::pending().await,
            },
            FakeBehavior::Panic => panic!("fake executor asked to panic"),
        }
    }
}

impl TaskExecutor for FakeExecutor {
    fn execute<'a>(
        &'a self,
        task: &'a Task,
        output: mpsc::Sender<OutputLine>,
        cancel: oneshot::Receiver<()>,
    ) -> ExecFuture<'a> {
        Box::pin(async move {
            self.started
                .lock()
                .expect("started lock poisoned")
                .push(task.id);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);

            let res = self.run(output, cancel).await;

            self.running.fetch_sub(1, Ordering::SeqCst);
            res
        })
    }
}
