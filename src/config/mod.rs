// src/config/mod.rs

//! Configuration loading and validation for shield.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk and overlay environment variables
//!   (`loader.rs`).
//! - Validate it and build the job table (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{apply_env_overrides, load_and_validate, load_and_validate_with_env, load_from_path};
pub use model::{
    AgentSection, AgentSettings, AuthorizedKeySource, ConfigFile, JobConfig, PluginSection,
    RawConfigFile, SupervisorSection, SupervisorSettings,
};
pub use validate::{with_default_port, DEFAULT_AGENT_PORT};
