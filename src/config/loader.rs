// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{AgentSection, ConfigFile, RawConfigFile};
use crate::errors::{Result, ShieldError};

pub const ENV_AGENT_NAME: &str = "SHIELD_AGENT_NAME";
pub const ENV_AGENT_LISTEN_ADDRESS: &str = "SHIELD_AGENT_LISTEN_ADDRESS";
pub const ENV_AGENT_HOST_KEY_FILE: &str = "SHIELD_AGENT_HOST_KEY_FILE";
pub const ENV_AGENT_AUTHORIZED_KEYS_FILE: &str = "SHIELD_AGENT_AUTHORIZED_KEYS_FILE";
pub const ENV_AGENT_AUTHORIZED_KEY: &str = "SHIELD_AGENT_AUTHORIZED_KEY";
pub const ENV_AGENT_PLUGIN_PATHS: &str = "SHIELD_AGENT_PLUGIN_PATHS";

/// Load a configuration file and return the raw, unvalidated
/// [`RawConfigFile`]. Use [`load_and_validate`] for the checked form.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|e| {
        ShieldError::ConfigError(format!("reading config file {}: {e}", path.display()))
    })?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a configuration file, apply `SHIELD_AGENT_*` overrides from the
/// process environment and validate it.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    load_and_validate_with_env(path, |key| std::env::var(key).ok())
}

/// Same as [`load_and_validate`] with an explicit environment lookup.
pub fn load_and_validate_with_env<F>(path: impl AsRef<Path>, env: F) -> Result<ConfigFile>
where
    F: Fn(&str) -> Option<String>,
{
    let mut raw = load_from_path(&path)?;
    apply_env_overrides(&mut raw, env);
    ConfigFile::try_from(raw)
}

/// Overlay `SHIELD_AGENT_*` variables on the `[agent]` section, creating the
/// section if any of them is set.
///
/// `SHIELD_AGENT_PLUGIN_PATHS` is colon-separated and is searched before
/// the paths from the file.
pub fn apply_env_overrides<F>(raw: &mut RawConfigFile, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| env(key).filter(|v| !v.is_empty());

    let name = var(ENV_AGENT_NAME);
    let listen = var(ENV_AGENT_LISTEN_ADDRESS);
    let host_key = var(ENV_AGENT_HOST_KEY_FILE);
    let keys_file = var(ENV_AGENT_AUTHORIZED_KEYS_FILE);
    let key = var(ENV_AGENT_AUTHORIZED_KEY);
    let paths = var(ENV_AGENT_PLUGIN_PATHS);

    let any_set = [&name, &listen, &host_key, &keys_file, &key, &paths]
        .iter()
        .any(|v| v.is_some());
    if raw.agent.is_none() && !any_set {
        return;
    }

    let agent = raw.agent.get_or_insert_with(AgentSection::default);

    if name.is_some() {
        agent.name = name;
    }
    if listen.is_some() {
        agent.listen_address = listen;
    }
    if let Some(path) = host_key {
        agent.host_key_file = Some(PathBuf::from(path));
    }
    if let Some(path) = keys_file {
        agent.authorized_keys_file = Some(PathBuf::from(path));
    }
    if key.is_some() {
        agent.authorized_key = key;
    }
    if let Some(paths) = paths {
        let mut merged: Vec<PathBuf> = paths
            .split(':')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();
        merged.append(&mut agent.plugin_paths);
        agent.plugin_paths = merged;
    }
}
