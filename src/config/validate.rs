// src/config/validate.rs

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::model::{
    AgentSection, AgentSettings, AuthorizedKeySource, ConfigFile, JobConfig, PluginSection,
    RawConfigFile, SupervisorSection, SupervisorSettings,
};
use crate::errors::{Result, ShieldError};
use crate::model::job::job_id_for_name;
use crate::model::Job;
use crate::schedule::{parse_duration, Timespec};
use crate::types::PluginConfig;

/// Port the agent listens on when the configured address has none.
pub const DEFAULT_AGENT_PORT: u16 = 5444;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = ShieldError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        let supervisor = validate_supervisor(&raw.supervisor)?;
        let jobs = build_jobs(&raw)?;
        let agent = raw.agent.as_ref().map(validate_agent).transpose()?;

        Ok(ConfigFile {
            supervisor,
            jobs,
            agent,
        })
    }
}

fn validate_supervisor(section: &SupervisorSection) -> Result<SupervisorSettings> {
    if section.workers == 0 {
        return Err(ShieldError::ConfigError(
            "[supervisor].workers must be >= 1 (got 0)".to_string(),
        ));
    }
    if section.tick_interval_ms == 0 {
        return Err(ShieldError::ConfigError(
            "[supervisor].tick_interval_ms must be >= 1 (got 0)".to_string(),
        ));
    }
    if section.agent_user.is_empty() {
        return Err(ShieldError::ConfigError(
            "[supervisor].agent_user must not be empty".to_string(),
        ));
    }

    Ok(SupervisorSettings {
        tick_interval: Duration::from_millis(section.tick_interval_ms),
        workers: section.workers,
        task_timeout: timeout(section.task_timeout.as_deref(), "[supervisor].task_timeout")?,
        private_key_file: section.private_key_file.clone(),
        agent_user: section.agent_user.clone(),
    })
}

fn timeout(raw: Option<&str>, field: &str) -> Result<Option<Duration>> {
    raw.map(|s| {
        parse_duration(s)
            .map_err(|e| ShieldError::ConfigError(format!("{field}: invalid duration '{s}': {e}")))
    })
    .transpose()
}

fn build_jobs(cfg: &RawConfigFile) -> Result<Vec<Job>> {
    let mut seen: HashMap<uuid::Uuid, &str> = HashMap::new();
    let mut jobs = Vec::with_capacity(cfg.job.len());

    for (name, job_cfg) in cfg.job.iter() {
        let job = build_job(name, job_cfg)?;
        if let Some(other) = seen.insert(job.id, name) {
            return Err(ShieldError::ConfigError(format!(
                "jobs '{other}' and '{name}' share the id {}",
                job.id
            )));
        }
        jobs.push(job);
    }

    Ok(jobs)
}

fn build_job(name: &str, cfg: &JobConfig) -> Result<Job> {
    let schedule: Timespec = cfg.schedule.parse().map_err(|e| {
        ShieldError::ConfigError(format!(
            "job '{name}' has an invalid schedule '{}': {e}",
            cfg.schedule
        ))
    })?;

    let target = plugin_config(name, "target", &cfg.target)?;
    let store = plugin_config(name, "store", &cfg.store)?;
    let id = cfg.uuid.unwrap_or_else(|| job_id_for_name(name));

    let mut job = Job::new(id, name, target, store, Arc::new(schedule));
    job.paused = cfg.paused;

    if let Some(agent) = &cfg.agent {
        if agent.trim().is_empty() {
            return Err(ShieldError::ConfigError(format!(
                "job '{name}' has an empty agent address"
            )));
        }
        job = job.with_agent(with_default_port(agent)?);
    }

    Ok(job)
}

fn plugin_config(job: &str, role: &str, section: &PluginSection) -> Result<PluginConfig> {
    if section.plugin.trim().is_empty() {
        return Err(ShieldError::ConfigError(format!(
            "job '{job}' has an empty {role} plugin name"
        )));
    }
    if section.endpoint.is_empty() {
        return Err(ShieldError::ConfigError(format!(
            "job '{job}' has an empty {role} endpoint"
        )));
    }
    Ok(PluginConfig::new(section.plugin.clone(), section.endpoint.clone()))
}

fn validate_agent(section: &AgentSection) -> Result<AgentSettings> {
    let name = non_empty(section.name.as_deref())
        .ok_or_else(|| ShieldError::ConfigError("no agent name specified".to_string()))?;

    let listen = non_empty(section.listen_address.as_deref()).ok_or_else(|| {
        ShieldError::ConfigError("no agent listen address supplied".to_string())
    })?;

    let authorized_keys = match (
        non_empty(section.authorized_key.as_deref()),
        section.authorized_keys_file.as_ref(),
    ) {
        (Some(inline), _) => AuthorizedKeySource::Inline(inline.to_string()),
        (None, Some(path)) => AuthorizedKeySource::File(path.clone()),
        (None, None) => {
            return Err(ShieldError::ConfigError(
                "no authorized keys supplied for the agent".to_string(),
            ));
        }
    };

    let host_key_file = section
        .host_key_file
        .clone()
        .ok_or_else(|| ShieldError::ConfigError("no agent host_key_file supplied".to_string()))?;

    if section.plugin_paths.is_empty() {
        return Err(ShieldError::ConfigError(
            "no agent plugin path supplied".to_string(),
        ));
    }

    Ok(AgentSettings {
        name: name.to_string(),
        listen_address: with_default_port(listen)?,
        host_key_file,
        authorized_keys,
        plugin_paths: section.plugin_paths.clone(),
        task_timeout: timeout(section.task_timeout.as_deref(), "[agent].task_timeout")?,
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Normalise a `host[:port]` address, appending the agent port when missing.
pub fn with_default_port(addr: &str) -> Result<String> {
    let addr = addr.trim();
    match addr.split(':').count() {
        1 => Ok(format!("{addr}:{DEFAULT_AGENT_PORT}")),
        2 => {
            let (host, port) = addr.rsplit_once(':').unwrap_or((addr, ""));
            port.parse::<u16>().map_err(|e| {
                ShieldError::ConfigError(format!(
                    "'{addr}' does not look like a valid address: bad port '{port}': {e}"
                ))
            })?;
            Ok(format!("{host}:{port}"))
        }
        _ => Err(ShieldError::ConfigError(format!(
            "'{addr}' does not look like a valid address"
        ))),
    }
}
