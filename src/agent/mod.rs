// src/agent/mod.rs

//! Remote agent: an SSH service that runs plugin pipelines on behalf of a
//! supervisor, and the client the supervisor uses to reach it.
//!
//! - [`request`]: the JSON exec payload and its validation
//! - [`plugins`]: plugin name to executable resolution
//! - [`keys`]: host key and authorized client keys
//! - [`session`]: per-channel execution, independent of the transport
//! - [`server`]: the russh server handler and accept loop
//! - [`client`]: [`RemoteRunner`], used by the supervisor's executor

pub mod client;
pub mod keys;
pub mod plugins;
pub mod request;
pub mod server;
pub mod session;

pub use client::RemoteRunner;
pub use keys::{load_private_key, AuthorizedKeys};
pub use plugins::PluginResolver;
pub use request::{AgentCommand, AgentRequest};
pub use server::{AgentContext, AgentServer};
pub use session::{
    prepare, spawn_execution, status_frames, AgentStatus, ChannelFrame, ChannelState, Prepared,
};
