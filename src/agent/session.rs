// src/agent/session.rs

//! Transport-independent handling of one agent channel.
//!
//! A channel moves through `AwaitingRequest -> Executing -> Closed`. The SSH
//! layer feeds the exec payload to [`prepare`], acknowledges the request only
//! if that succeeds, then relays the [`ChannelFrame`]s produced by
//! [`spawn_execution`] to the client.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::agent::plugins::PluginResolver;
use crate::agent::request::AgentCommand;
use crate::errors::Result;
use crate::exec::{run_pipeline, OutputLine, Pipeline};
use crate::model::Task;

/// Something to write to the client's channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    /// A framed output line (`O:...\n` or `E:...\n`).
    Data(String),
    /// Terminal notification; always the last frame.
    ExitStatus(u32),
}

/// Per-channel protocol state.
#[derive(Debug)]
pub enum ChannelState {
    AwaitingRequest,
    /// Holds the signal that kills the running pipeline.
    Executing(oneshot::Sender<()>),
    /// Answering a status request; nothing to cancel.
    Reporting,
}

/// An accepted exec request, ready to run.
#[derive(Debug, Clone)]
pub enum Prepared {
    /// Pipeline task with plugin names resolved to executables.
    Pipeline(Task),
    Status,
}

impl Prepared {
    pub fn into_task(self) -> Option<Task> {
        match self {
            Prepared::Pipeline(task) => Some(task),
            Prepared::Status => None,
        }
    }
}

/// Validate an exec payload. Pipeline requests get their plugin names
/// resolved to executables. Any error rejects the request before it is
/// acknowledged.
pub fn prepare(payload: &[u8], resolver: &PluginResolver) -> Result<Prepared> {
    let request = match AgentCommand::parse(payload)? {
        AgentCommand::Run(request) => request,
        AgentCommand::Status => return Ok(Prepared::Status),
    };
    let mut task = request.into_task();

    task.target.plugin = resolver.resolve(&task.target.plugin)?.display().to_string();
    task.store.plugin = resolver.resolve(&task.store.plugin)?.display().to_string();

    Ok(Prepared::Pipeline(task))
}

/// Health report returned by the `status` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub name: String,
    pub version: String,
    pub health: String,
    /// Plugin name to the executable it resolves to.
    pub plugins: BTreeMap<String, String>,
}

impl AgentStatus {
    pub fn collect(name: &str, resolver: &PluginResolver) -> Self {
        Self {
            name: name.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            health: "ok".to_string(),
            plugins: resolver
                .available()
                .into_iter()
                .map(|(name, path)| (name, path.display().to_string()))
                .collect(),
        }
    }
}

/// Frames answering a status request: a log line, the report as a single
/// `O:` JSON line, then exit status 0.
pub fn status_frames(status: &AgentStatus) -> mpsc::Receiver<ChannelFrame> {
    let (tx, rx) = mpsc::channel(3);
    let banner = OutputLine::stderr(format!(
        "running shield agent {} health checks",
        status.version
    ));

    let frames = match serde_json::to_string(status) {
        Ok(json) => [
            ChannelFrame::Data(banner.to_wire()),
            ChannelFrame::Data(OutputLine::stdout(json).to_wire()),
            ChannelFrame::ExitStatus(0),
        ],
        Err(e) => [
            ChannelFrame::Data(banner.to_wire()),
            ChannelFrame::Data(OutputLine::stderr(format!("failed to encode status: {e}")).to_wire()),
            ChannelFrame::ExitStatus(1),
        ],
    };
    for frame in frames {
        // Capacity matches the frame count.
        let _ = tx.try_send(frame);
    }
    rx
}

/// Run `task`'s pipeline in the background.
///
/// Every output line becomes a `Data` frame as soon as it is read, and the
/// stream always ends with exactly one `ExitStatus` frame carrying the
/// pipeline's real exit code. Firing `cancel` kills the pipeline.
pub fn spawn_execution(
    task: Task,
    deadline: Option<Duration>,
    cancel: oneshot::Receiver<()>,
) -> mpsc::Receiver<ChannelFrame> {
    let (frames_tx, frames_rx) = mpsc::channel(64);

    tokio::spawn(async move {
        info!(task = %task.id, details = %task.details(), "agent executing task");
        let code = match execute(&task, &frames_tx, deadline, cancel).await {
            Ok(()) => 0,
            Err(e) => {
                warn!(task = %task.id, error = %e, "agent task failed");
                e.exit_code()
            }
        };
        info!(task = %task.id, exit_code = code, "agent task finished");
        let _ = frames_tx.send(ChannelFrame::ExitStatus(code)).await;
    });

    frames_rx
}

async fn execute(
    task: &Task,
    frames: &mpsc::Sender<ChannelFrame>,
    deadline: Option<Duration>,
    cancel: oneshot::Receiver<()>,
) -> Result<()> {
    let pipeline = Pipeline::for_task(task)?;
    let (line_tx, mut line_rx) = mpsc::channel::<OutputLine>(64);

    let forward = async {
        while let Some(line) = line_rx.recv().await {
            // Keep draining even if the client went away.
            let _ = frames.send(ChannelFrame::Data(line.to_wire())).await;
        }
    };

    let (result, ()) = tokio::join!(run_pipeline(&pipeline, line_tx, cancel, deadline), forward);
    result
}
