// src/exec/pipeline.rs

//! Plugin pipeline construction and execution.

use std::future::pending;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::errors::{Result, ShieldError};
use crate::model::Task;
use crate::types::Operation;

pub const ENV_OP: &str = "SHIELD_OP";
pub const ENV_TARGET_PLUGIN: &str = "SHIELD_TARGET_PLUGIN";
pub const ENV_TARGET_ENDPOINT: &str = "SHIELD_TARGET_ENDPOINT";
pub const ENV_STORE_PLUGIN: &str = "SHIELD_STORE_PLUGIN";
pub const ENV_STORE_ENDPOINT: &str = "SHIELD_STORE_ENDPOINT";
pub const ENV_RESTORE_KEY: &str = "SHIELD_RESTORE_KEY";

/// How long output readers may outlive the shell before being abandoned.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Which pipe of the process a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of pipeline output, without its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

impl OutputLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            text: text.into(),
        }
    }

    /// Channel framing used by the agent protocol: `O:` / `E:` prefix plus
    /// a terminating newline.
    pub fn to_wire(&self) -> String {
        let prefix = match self.stream {
            OutputStream::Stdout => "O:",
            OutputStream::Stderr => "E:",
        };
        format!("{prefix}{}\n", self.text)
    }

    /// Inverse of [`OutputLine::to_wire`] for a single line (newline already
    /// stripped). Returns `None` for lines without a known prefix.
    pub fn from_wire(line: &str) -> Option<Self> {
        if let Some(text) = line.strip_prefix("O:") {
            Some(Self::stdout(text))
        } else {
            line.strip_prefix("E:").map(Self::stderr)
        }
    }
}

/// A composed shell pipeline plus the environment its plugins expect.
#[derive(Debug, Clone)]
pub struct Pipeline {
    script: String,
    env: Vec<(&'static str, String)>,
}

impl Pipeline {
    /// Build the pipeline for a task:
    ///
    /// - backup:  `<target> backup | <store> store`
    /// - restore: `<store> retrieve | <target> restore`
    pub fn for_task(task: &Task) -> Result<Self> {
        let target = quote(&task.target.plugin)?;
        let store = quote(&task.store.plugin)?;

        let script = match task.op {
            Operation::Backup => format!("{target} backup | {store} store"),
            Operation::Restore => format!("{store} retrieve | {target} restore"),
        };

        let mut env = vec![
            (ENV_OP, task.op.as_str().to_string()),
            (ENV_TARGET_PLUGIN, task.target.plugin.clone()),
            (ENV_TARGET_ENDPOINT, task.target.endpoint.as_str().to_string()),
            (ENV_STORE_PLUGIN, task.store.plugin.clone()),
            (ENV_STORE_ENDPOINT, task.store.endpoint.as_str().to_string()),
        ];
        if let Some(key) = &task.restore_key {
            env.push((ENV_RESTORE_KEY, key.clone()));
        }

        Ok(Self { script, env })
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn env(&self) -> &[(&'static str, String)] {
        &self.env
    }
}

fn quote(plugin: &str) -> Result<String> {
    shlex::try_quote(plugin)
        .map(|q| q.into_owned())
        .map_err(|e| ShieldError::Validation(format!("unusable plugin name '{plugin}': {e}")))
}

/// Run a pipeline to completion.
///
/// Every stdout/stderr line is forwarded on `output` as soon as it is read.
/// The two pipes are drained independently, so lines from different pipes
/// carry no ordering guarantee relative to each other. All output is
/// forwarded before this function returns, including on failure.
///
/// - `cancel` firing kills the whole process group and yields
///   [`ShieldError::Canceled`]. A dropped sender is not a cancellation.
/// - `deadline` expiring does the same and yields [`ShieldError::TimedOut`].
///
/// When the shell exits, whatever it left running in its process group is
/// killed too, so background stragglers cannot keep the task alive.
pub async fn run_pipeline(
    pipeline: &Pipeline,
    output: mpsc::Sender<OutputLine>,
    cancel: oneshot::Receiver<()>,
    deadline: Option<Duration>,
) -> Result<()> {
    debug!(script = %pipeline.script, "starting plugin pipeline");

    let mut cmd = Command::new("bash");
    cmd.arg("-o")
        .arg("pipefail")
        .arg("-c")
        .arg(&pipeline.script)
        .envs(pipeline.env.iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own process group so cancellation reaches every stage of the pipe.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| ShieldError::ProcessSpawn(format!("spawning '{}': {e}", pipeline.script)))?;
    // `Child::id` is gone once the shell has been reaped.
    let pgid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ShieldError::ProcessSpawn("stdout pipe unavailable".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ShieldError::ProcessSpawn("stderr pipe unavailable".to_string()))?;

    let mut stdout_drain = tokio::spawn(drain(stdout, OutputStream::Stdout, output.clone()));
    let mut stderr_drain = tokio::spawn(drain(stderr, OutputStream::Stderr, output));

    let cancelled = async {
        if cancel.await.is_err() {
            pending::<()>().await;
        }
    };
    let expired = async {
        match deadline {
            Some(d) => sleep(d).await,
            None => pending::<()>().await,
        }
    };

    let result = tokio::select! {
        status = child.wait() => {
            let status = status?;
            let code = status.code();
            info!(exit_code = ?code, success = status.success(), "plugin pipeline exited");
            // Stragglers a plugin left in the background would otherwise hold
            // the output pipes open past the shell's exit.
            kill_group(pgid);
            if status.success() {
                Ok(())
            } else {
                Err(ShieldError::ProcessFailed { code })
            }
        }

        _ = cancelled => {
            info!("cancellation requested; killing plugin pipeline");
            kill_group(pgid);
            reap(&mut child).await;
            Err(ShieldError::Canceled)
        }

        _ = expired => {
            let limit = deadline.unwrap_or_default();
            warn!(?limit, "plugin pipeline exceeded its deadline; killing it");
            kill_group(pgid);
            reap(&mut child).await;
            Err(ShieldError::TimedOut(limit))
        }
    };

    // Pipes close once every process in the group has exited. Anything that
    // left the group (setsid) gets a bounded grace period, then is abandoned.
    let drained = timeout(DRAIN_GRACE, async {
        let _ = (&mut stdout_drain).await;
        let _ = (&mut stderr_drain).await;
    })
    .await;
    if drained.is_err() {
        warn!(grace = ?DRAIN_GRACE, "pipeline output still open after exit; abandoning it");
        stdout_drain.abort();
        stderr_drain.abort();
    }

    result
}

/// SIGKILL every process left in the pipeline's process group.
fn kill_group(pgid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pgid) = pgid {
            // SAFETY: plain syscall on a process group we created.
            let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
            if rc != 0 {
                debug!(pgid, "killpg found nothing left to kill");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
}

async fn reap(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "child already gone while killing");
    }
}

async fn drain<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut receiver_gone = false;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if receiver_gone {
                    // Keep reading so the pipe never fills and stalls the plugin.
                    continue;
                }
                let text = String::from_utf8_lossy(&buf);
                let text = text.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(OutputLine { stream, text }).await.is_err() {
                    receiver_gone = true;
                }
            }
            Err(e) => {
                warn!(?stream, error = %e, "error reading pipeline output");
                break;
            }
        }
    }
}
