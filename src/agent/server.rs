// src/agent/server.rs

//! SSH front end of the agent.
//!
//! Each accepted TCP connection gets its own [`AgentConnection`] handler.
//! Authentication is public-key only. Only `session` channels are accepted
//! (russh answers any other channel type with an open failure), and on
//! those only `exec` is serviced; the exec data russh hands us is already
//! the unwrapped payload string.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::server::{run_stream, Auth, Config, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::agent::keys::AuthorizedKeys;
use crate::agent::plugins::PluginResolver;
use crate::agent::session::{
    prepare, spawn_execution, status_frames, AgentStatus, ChannelFrame, ChannelState, Prepared,
};
use crate::errors::{Result, ShieldError};

/// Everything a connection handler needs, shared across connections.
#[derive(Debug)]
pub struct AgentContext {
    pub name: String,
    pub authorized: AuthorizedKeys,
    pub resolver: PluginResolver,
    pub task_timeout: Option<Duration>,
}

pub struct AgentServer {
    context: Arc<AgentContext>,
    config: Arc<Config>,
}

impl AgentServer {
    pub fn new(context: AgentContext, host_key: KeyPair) -> Self {
        let config = Config {
            keys: vec![host_key],
            methods: MethodSet::PUBLICKEY,
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_millis(0)),
            ..Default::default()
        };

        Self {
            context: Arc::new(context),
            config: Arc::new(config),
        }
    }

    /// Accept connections forever, one handler task per connection.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(
            agent = %self.context.name,
            addr = %listener.local_addr()?,
            plugin_paths = ?self.context.resolver.paths(),
            "agent listening"
        );

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "accepted connection");

            let handler = AgentConnection::new(Arc::clone(&self.context), peer);
            let config = Arc::clone(&self.config);

            tokio::spawn(async move {
                match run_stream(config, stream, handler).await {
                    Ok(running) => {
                        if let Err(e) = running.await {
                            debug!(%peer, error = %e, "connection ended with error");
                        }
                    }
                    Err(e) => warn!(%peer, error = %e, "SSH handshake failed"),
                }
                debug!(%peer, "connection closed");
            });
        }
    }
}

/// Per-connection protocol handler.
pub struct AgentConnection {
    context: Arc<AgentContext>,
    peer: SocketAddr,
    channels: HashMap<ChannelId, ChannelState>,
}

impl AgentConnection {
    pub fn new(context: Arc<AgentContext>, peer: SocketAddr) -> Self {
        Self {
            context,
            peer,
            channels: HashMap::new(),
        }
    }

    fn reject(&self, channel: ChannelId, session: &mut Session, reason: &str) {
        warn!(peer = %self.peer, ?channel, reason, "rejecting channel request");
        session.channel_failure(channel);
    }
}

#[async_trait]
impl Handler for AgentConnection {
    type Error = ShieldError;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        if self.context.authorized.is_authorized(public_key) {
            info!(peer = %self.peer, user, "client authenticated");
            Ok(Auth::Accept)
        } else {
            warn!(
                peer = %self.peer,
                user,
                fingerprint = %public_key.fingerprint(),
                "unknown public key"
            );
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        debug!(peer = %self.peer, channel = ?channel.id(), "session channel opened");
        self.channels.insert(channel.id(), ChannelState::AwaitingRequest);
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if !matches!(self.channels.get(&channel), Some(ChannelState::AwaitingRequest)) {
            self.reject(channel, session, "channel is single-use");
            return Ok(());
        }

        let prepared = match prepare(data, &self.context.resolver) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.reject(channel, session, &e.to_string());
                // Without want_reply the failure is never sent; closing is
                // the only signal the client gets.
                self.channels.remove(&channel);
                session.close(channel);
                return Ok(());
            }
        };

        session.channel_success(channel);

        let mut frames = match prepared {
            Prepared::Pipeline(task) => {
                let (cancel_tx, cancel_rx) = oneshot::channel();
                self.channels.insert(channel, ChannelState::Executing(cancel_tx));
                spawn_execution(task, self.context.task_timeout, cancel_rx)
            }
            Prepared::Status => {
                info!(peer = %self.peer, ?channel, "status requested");
                self.channels.insert(channel, ChannelState::Reporting);
                status_frames(&AgentStatus::collect(&self.context.name, &self.context.resolver))
            }
        };
        let handle = session.handle();
        let peer = self.peer;

        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let sent = match frame {
                    ChannelFrame::Data(text) => handle
                        .data(channel, CryptoVec::from_slice(text.as_bytes()))
                        .await
                        .is_ok(),
                    ChannelFrame::ExitStatus(code) => {
                        handle.exit_status_request(channel, code).await.is_ok()
                    }
                };
                if !sent {
                    debug!(%peer, ?channel, "client channel gone; discarding output");
                }
            }
            let _ = handle.eof(channel).await;
            if handle.close(channel).await.is_err() {
                debug!(%peer, ?channel, "channel already closed");
            }
        });

        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        self.reject(channel, session, "shell requests are not supported");
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        debug!(subsystem = name, "subsystem requested");
        self.reject(channel, session, "subsystem requests are not supported");
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        debug!(variable = variable_name, "env requested");
        self.reject(channel, session, "env requests are not supported");
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if let Some(ChannelState::Executing(cancel)) = self.channels.remove(&channel) {
            if cancel.send(()).is_ok() {
                info!(peer = %self.peer, ?channel, "channel closed by client; canceling pipeline");
            }
        }
        Ok(())
    }
}

impl Drop for AgentConnection {
    fn drop(&mut self) {
        for (channel, state) in self.channels.drain() {
            if let ChannelState::Executing(cancel) = state {
                if cancel.send(()).is_ok() {
                    warn!(peer = %self.peer, ?channel, "connection dropped mid-execution; canceling pipeline");
                }
            }
        }
    }
}
