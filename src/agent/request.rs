// src/agent/request.rs

//! The JSON payload carried by an `exec` request to the agent.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{Result, ShieldError};
use crate::model::Task;
use crate::types::{Endpoint, Operation, PluginConfig};

/// Payload exactly as it arrives on the wire; every field is optional so
/// that missing values are reported in a fixed order rather than by serde.
#[derive(Debug, Default, Deserialize)]
struct RawAgentRequest {
    operation: Option<String>,
    target_plugin: Option<String>,
    target_endpoint: Option<String>,
    store_plugin: Option<String>,
    store_endpoint: Option<String>,
    restore_key: Option<String>,
    task_uuid: Option<Uuid>,
}

/// Operation name of the agent health check.
pub const STATUS_OPERATION: &str = "status";

/// Anything an exec payload can ask the agent to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCommand {
    /// Run a backup or restore pipeline.
    Run(AgentRequest),
    /// Report the agent's name, version and plugins; needs no plugin fields.
    Status,
}

impl AgentCommand {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let raw = parse_raw(payload)?;
        if raw.operation.as_deref() == Some(STATUS_OPERATION) {
            return Ok(AgentCommand::Status);
        }
        AgentRequest::try_from(raw).map(AgentCommand::Run)
    }
}

/// A validated request to run one pipeline on the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentRequest {
    pub operation: Operation,
    pub target_plugin: String,
    pub target_endpoint: Endpoint,
    pub store_plugin: String,
    pub store_endpoint: Endpoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_uuid: Option<Uuid>,
}

impl AgentRequest {
    /// Parse and validate an exec payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Self::try_from(parse_raw(payload)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Request that replays `task` on an agent.
    pub fn from_task(task: &Task) -> Self {
        Self {
            operation: task.op,
            target_plugin: task.target.plugin.clone(),
            target_endpoint: task.target.endpoint.clone(),
            store_plugin: task.store.plugin.clone(),
            store_endpoint: task.store.endpoint.clone(),
            restore_key: match task.op {
                Operation::Restore => task.restore_key.clone(),
                Operation::Backup => None,
            },
            task_uuid: Some(task.id),
        }
    }

    /// Pending task that runs this request locally. Keeps the caller's task
    /// ID when one was sent so logs on both sides line up.
    pub fn into_task(self) -> Task {
        let mut task = Task::new(
            self.operation,
            PluginConfig::new(self.target_plugin, self.target_endpoint),
            PluginConfig::new(self.store_plugin, self.store_endpoint),
        );
        if let Some(id) = self.task_uuid {
            task.id = id;
        }
        task.restore_key = self.restore_key;
        task
    }
}

impl TryFrom<RawAgentRequest> for AgentRequest {
    type Error = ShieldError;

    fn try_from(raw: RawAgentRequest) -> Result<Self> {
        let operation = required(raw.operation, "operation")?
            .parse::<Operation>()
            .map_err(ShieldError::Validation)?;

        let target_plugin = required(raw.target_plugin, "target_plugin")?;
        let target_endpoint = required(raw.target_endpoint, "target_endpoint")?;
        let store_plugin = required(raw.store_plugin, "store_plugin")?;
        let store_endpoint = required(raw.store_endpoint, "store_endpoint")?;

        let restore_key = match operation {
            Operation::Restore => Some(required(raw.restore_key, "restore_key").map_err(|_| {
                ShieldError::Validation(
                    "missing required 'restore_key' value in payload (for restore operation)"
                        .to_string(),
                )
            })?),
            Operation::Backup => None,
        };

        Ok(Self {
            operation,
            target_plugin,
            target_endpoint: Endpoint::new(target_endpoint),
            store_plugin,
            store_endpoint: Endpoint::new(store_endpoint),
            restore_key,
            task_uuid: raw.task_uuid,
        })
    }
}

fn parse_raw(payload: &[u8]) -> Result<RawAgentRequest> {
    serde_json::from_slice(payload)
        .map_err(|e| ShieldError::Validation(format!("malformed agent command: {e}")))
}

/// Empty strings count as missing.
fn required(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ShieldError::Validation(format!(
            "missing required '{field}' value in payload"
        ))),
    }
}
