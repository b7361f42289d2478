// src/agent/plugins.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::{Result, ShieldError};

/// Finds plugin executables in the agent's configured search paths.
#[derive(Debug, Clone, Default)]
pub struct PluginResolver {
    paths: Vec<PathBuf>,
}

impl PluginResolver {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Resolve a plugin name to an executable.
    ///
    /// Bare names are looked up in each search path in order; the first
    /// executable regular file wins. Names containing `/` are taken as paths,
    /// and are accepted only if they resolve (symlinks and `..` included) to
    /// an executable inside one of the search paths.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        if name.contains('/') {
            let path = PathBuf::from(name);
            if !self.contains(&path) {
                return Err(ShieldError::Validation(format!(
                    "plugin '{name}' is outside the plugin paths {:?}",
                    self.paths
                )));
            }
            return if is_executable_file(&path) {
                Ok(path)
            } else {
                Err(ShieldError::Validation(format!(
                    "plugin '{name}' is not an executable file"
                )))
            };
        }

        for dir in &self.paths {
            let candidate = dir.join(name);
            if is_executable_file(&candidate) {
                debug!(plugin = %name, path = %candidate.display(), "resolved plugin");
                return Ok(candidate);
            }
        }

        Err(ShieldError::Validation(format!(
            "plugin '{name}' not found in plugin paths {:?}",
            self.paths
        )))
    }

    /// Every plugin name visible to [`PluginResolver::resolve`], with the
    /// path it resolves to. Earlier search paths shadow later ones.
    pub fn available(&self) -> BTreeMap<String, PathBuf> {
        let mut found = BTreeMap::new();
        for dir in &self.paths {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if !found.contains_key(&name) && is_executable_file(&path) {
                    found.insert(name, path);
                }
            }
        }
        found
    }

    fn contains(&self, path: &Path) -> bool {
        let Ok(real) = path.canonicalize() else {
            return false;
        };
        self.paths
            .iter()
            .filter_map(|dir| dir.canonicalize().ok())
            .any(|dir| real.starts_with(dir))
    }
}

fn is_executable_file(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
