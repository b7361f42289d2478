// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::engine::SupervisorOptions;
use crate::model::Job;

/// Configuration exactly as read from a TOML file.
///
/// ```toml
/// [supervisor]
/// workers = 4
/// task_timeout = "2h"
/// private_key_file = "/etc/shield/id_ed25519"
///
/// [job.nightly-db]
/// schedule = "daily at 3:00"
/// agent = "db01.internal:5444"
///
/// [job.nightly-db.target]
/// plugin = "postgres"
/// endpoint = '{"pg_host":"localhost"}'
///
/// [job.nightly-db.store]
/// plugin = "fs"
/// endpoint = '{"base_dir":"/backups"}'
///
/// [agent]
/// name = "db01"
/// listen_address = "0.0.0.0:5444"
/// host_key_file = "/etc/shield/host_key"
/// authorized_keys_file = "/etc/shield/authorized_keys"
/// plugin_paths = ["/var/vcap/packages/shield/plugins"]
/// ```
///
/// All sections are optional. Semantic checks happen when converting into
/// [`ConfigFile`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub supervisor: SupervisorSection,

    /// All jobs from `[job.<name>]`, keyed by job name.
    #[serde(default)]
    pub job: BTreeMap<String, JobConfig>,

    #[serde(default)]
    pub agent: Option<AgentSection>,
}

/// `[supervisor]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Duration string such as `"2h"` or `"45s"`. No limit when absent.
    #[serde(default)]
    pub task_timeout: Option<String>,

    /// SSH identity used to reach agents.
    #[serde(default)]
    pub private_key_file: Option<PathBuf>,

    #[serde(default = "default_agent_user")]
    pub agent_user: String,
}

fn default_tick_interval_ms() -> u64 {
    200
}

fn default_workers() -> usize {
    4
}

fn default_agent_user() -> String {
    "shield".to_string()
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            workers: default_workers(),
            task_timeout: None,
            private_key_file: None,
            agent_user: default_agent_user(),
        }
    }
}

/// `[job.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    /// Timespec such as `"daily at 4:00"` or `"every 30m"`.
    pub schedule: String,

    #[serde(default)]
    pub paused: bool,

    /// `host:port` of the agent that runs this job. Runs locally if absent.
    #[serde(default)]
    pub agent: Option<String>,

    /// Fixed job ID. Derived from the job name when absent.
    #[serde(default)]
    pub uuid: Option<Uuid>,

    pub target: PluginSection,
    pub store: PluginSection,
}

/// `[job.<name>.target]` / `[job.<name>.store]`.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginSection {
    pub plugin: String,
    pub endpoint: String,
}

/// `[agent]` section. Every field may also come from a `SHIELD_AGENT_*`
/// environment variable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub listen_address: Option<String>,

    #[serde(default)]
    pub host_key_file: Option<PathBuf>,

    #[serde(default)]
    pub authorized_keys_file: Option<PathBuf>,

    /// Inline `authorized_keys` content; wins over `authorized_keys_file`.
    #[serde(default)]
    pub authorized_key: Option<String>,

    #[serde(default)]
    pub plugin_paths: Vec<PathBuf>,

    #[serde(default)]
    pub task_timeout: Option<String>,
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub supervisor: SupervisorSettings,
    /// Jobs in name order.
    pub jobs: Vec<Job>,
    pub agent: Option<AgentSettings>,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub tick_interval: Duration,
    pub workers: usize,
    pub task_timeout: Option<Duration>,
    pub private_key_file: Option<PathBuf>,
    pub agent_user: String,
}

impl SupervisorSettings {
    pub fn options(&self) -> SupervisorOptions {
        SupervisorOptions {
            tick_interval: self.tick_interval,
            workers: self.workers,
        }
    }
}

/// Where the agent's authorized client keys come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizedKeySource {
    Inline(String),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub name: String,
    /// Always `host:port`.
    pub listen_address: String,
    pub host_key_file: PathBuf,
    pub authorized_keys: AuthorizedKeySource,
    pub plugin_paths: Vec<PathBuf>,
    pub task_timeout: Option<Duration>,
}
