// src/errors.rs

//! Crate-wide error type and helpers.
//!
//! Every failure is scoped to the smallest enclosing unit: a schedule error
//! affects one job's next cycle, a validation or protocol error one request
//! or channel, and a process error one task.

use std::time::Duration;

use thiserror::Error;

use crate::types::TaskStatus;

#[derive(Error, Debug)]
pub enum ShieldError {
    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("{0}")]
    Validation(String),

    #[error("failed to start plugin pipeline: {0}")]
    ProcessSpawn(String),

    #[error("plugin pipeline exited with {}", describe_code(*.code))]
    ProcessFailed { code: Option<i32> },

    #[error("task was canceled")]
    Canceled,

    #[error("task exceeded its deadline of {0:?}")]
    TimedOut(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("invalid task status transition {from:?} -> {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("SSH key error: {0}")]
    SshKey(#[from] russh_keys::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ShieldError {
    /// Process-style exit status for this failure, as reported to remote
    /// callers in the `exit-status` notification.
    pub fn exit_code(&self) -> u32 {
        match self {
            ShieldError::ProcessFailed { code: Some(code) } if *code > 0 => *code as u32,
            ShieldError::ProcessSpawn(_) => 127,
            ShieldError::Canceled => 130,
            ShieldError::TimedOut(_) => 124,
            _ => 1,
        }
    }

    /// Whether this error represents a cancellation (explicit or deadline).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ShieldError::Canceled | ShieldError::TimedOut(_))
    }
}

fn describe_code(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, ShieldError>;
