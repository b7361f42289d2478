// src/agent/client.rs

//! Supervisor-side SSH client that runs a task on a remote agent.

use std::fmt;
use std::future::pending;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::agent::keys::load_private_key;
use crate::agent::request::AgentRequest;
use crate::errors::{Result, ShieldError};
use crate::exec::OutputLine;
use crate::model::Task;

struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = ShieldError;

    // TODO: verify agent host keys against a known_hosts file once agents
    // register their keys with the supervisor.
    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Runs tasks on remote agents over SSH.
pub struct RemoteRunner {
    key: Arc<KeyPair>,
    user: String,
    config: Arc<client::Config>,
}

impl fmt::Debug for RemoteRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteRunner")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl RemoteRunner {
    pub fn new(key: KeyPair, user: impl Into<String>) -> Self {
        Self {
            key: Arc::new(key),
            user: user.into(),
            config: Arc::new(client::Config::default()),
        }
    }

    pub fn from_key_file(path: &Path, user: impl Into<String>) -> Result<Self> {
        Ok(Self::new(load_private_key(path)?, user))
    }

    /// Run `task` on the agent at `addr`, forwarding its output lines.
    ///
    /// The agent's `exit-status` decides the result: 0 is success, anything
    /// else is [`ShieldError::ProcessFailed`]. A rejected exec request is a
    /// [`ShieldError::Validation`] error.
    pub async fn run(
        &self,
        addr: &str,
        task: &Task,
        output: mpsc::Sender<OutputLine>,
        cancel: oneshot::Receiver<()>,
        deadline: Option<Duration>,
    ) -> Result<()> {
        let payload = AgentRequest::from_task(task).to_json()?;

        let mut session = client::connect(Arc::clone(&self.config), addr, AcceptAnyHostKey).await?;
        if !session
            .authenticate_publickey(&self.user, Arc::clone(&self.key))
            .await?
        {
            return Err(ShieldError::Protocol(format!(
                "agent {addr} refused public key for user '{}'",
                self.user
            )));
        }
        debug!(task = %task.id, agent = %addr, "authenticated to agent");

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
            res = exchange(&session, addr, payload, &output) => res,
            _ = cancelled => {
                info!(task = %task.id, agent = %addr, "cancellation requested; closing agent session");
                Err(ShieldError::Canceled)
            }
            _ = expired => {
                let limit = deadline.unwrap_or_default();
                warn!(task = %task.id, agent = %addr, ?limit, "remote task exceeded its deadline");
                Err(ShieldError::TimedOut(limit))
            }
        };

        close_session(&mut session).await;
        result
    }
}

async fn exchange(
    session: &Handle<AcceptAnyHostKey>,
    addr: &str,
    payload: String,
    output: &mpsc::Sender<OutputLine>,
) -> Result<()> {
    let mut channel = session.channel_open_session().await?;
    channel.exec(true, payload).await?;

    let mut pending_line: Vec<u8> = Vec::new();
    let mut exit_status = None;

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Failure => {
                return Err(ShieldError::Validation(format!(
                    "agent {addr} rejected the request"
                )));
            }
            ChannelMsg::Success => debug!(agent = %addr, "agent accepted request"),
            ChannelMsg::Data { data } => {
                pending_line.extend_from_slice(&data);
                forward_complete_lines(&mut pending_line, output).await;
            }
            ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    if !pending_line.is_empty() {
        pending_line.push(b'\n');
        forward_complete_lines(&mut pending_line, output).await;
    }

    match exit_status {
        Some(0) => Ok(()),
        Some(code) => Err(ShieldError::ProcessFailed {
            code: i32::try_from(code).ok(),
        }),
        None => Err(ShieldError::Protocol(format!(
            "agent {addr} closed the channel without an exit status"
        ))),
    }
}

/// Split off every complete line in `buf` and forward it, leaving any
/// trailing partial line in place.
async fn forward_complete_lines(buf: &mut Vec<u8>, output: &mpsc::Sender<OutputLine>) {
    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
        let raw: Vec<u8> = buf.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&raw);
        let text = text.trim_end_matches(['\n', '\r']);
        match OutputLine::from_wire(text) {
            Some(line) => {
                let _ = output.send(line).await;
            }
            None => debug!(line = %text, "ignoring unframed agent output"),
        }
    }
}

async fn close_session(session: &mut Handle<AcceptAnyHostKey>) {
    if let Err(e) = session
        .disconnect(Disconnect::ByApplication, "", "en")
        .await
    {
        debug!(error = %e, "error disconnecting from agent");
    }
}
