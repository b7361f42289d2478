// src/types.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What a task does with its plugins.
///
/// - `Backup`: `<target> backup | <store> store`
/// - `Restore`: `<store> retrieve | <target> restore`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Backup,
    Restore,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Backup => "backup",
            Operation::Restore => "restore",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backup" => Ok(Operation::Backup),
            "restore" | "shield-restore" => Ok(Operation::Restore),
            other => Err(format!("unsupported operation: '{other}'")),
        }
    }
}

/// Lifecycle of a task.
///
/// Transitions only ever move forward:
/// `Pending -> Running -> {Done, Canceled}`. A pending task may also be
/// canceled before it ever reaches a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Canceled,
    Done,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Canceled | TaskStatus::Done)
    }

    /// Whether moving from `self` to `next` respects the forward-only order.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Canceled)
                | (TaskStatus::Running, TaskStatus::Done)
                | (TaskStatus::Running, TaskStatus::Canceled)
        )
    }
}

/// Opaque, plugin-defined endpoint configuration.
///
/// The core never parses this; it is handed to plugins verbatim through
/// `SHIELD_TARGET_ENDPOINT` / `SHIELD_STORE_ENDPOINT`.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// Endpoints routinely carry credentials; keep them out of logs.
impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({} bytes)", self.0.len())
    }
}

impl From<&str> for Endpoint {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Endpoint {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A plugin executable plus its endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub plugin: String,
    pub endpoint: Endpoint,
}

impl PluginConfig {
    pub fn new(plugin: impl Into<String>, endpoint: impl Into<Endpoint>) -> Self {
        Self {
            plugin: plugin.into(),
            endpoint: endpoint.into(),
        }
    }
}
