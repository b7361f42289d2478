// src/agent/keys.rs

//! SSH key material for the agent: host key and authorized client keys.

use std::collections::HashSet;
use std::path::Path;

use russh_keys::key::{KeyPair, PublicKey};
use tracing::{debug, info};

use crate::errors::{Result, ShieldError};

/// Set of client public keys allowed to connect, compared by fingerprint.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeys {
    fingerprints: HashSet<String>,
}

impl AuthorizedKeys {
    /// Parse OpenSSH `authorized_keys` content. Blank lines, comments and
    /// lines that do not hold a parseable key are skipped.
    pub fn parse(content: &str) -> Self {
        let mut fingerprints = HashSet::new();

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_authorized_line(line) {
                Some(key) => {
                    fingerprints.insert(key.fingerprint());
                }
                None => debug!(line = lineno + 1, "ignoring malformed authorized_keys line"),
            }
        }

        Self { fingerprints }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ShieldError::ConfigError(format!(
                "reading authorized keys {}: {e}",
                path.display()
            ))
        })?;
        let keys = Self::parse(&content);
        info!(path = %path.display(), keys = keys.len(), "loaded authorized keys");
        Ok(keys)
    }

    pub fn is_authorized(&self, key: &PublicKey) -> bool {
        self.fingerprints.contains(&key.fingerprint())
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

/// `[options] <type> <base64> [comment]`: the key blob is the token after
/// the first token that names a key type.
fn parse_authorized_line(line: &str) -> Option<PublicKey> {
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        if is_key_type(token) {
            let blob = tokens.next()?;
            return russh_keys::parse_public_key_base64(blob).ok();
        }
    }
    None
}

fn is_key_type(token: &str) -> bool {
    token.starts_with("ssh-") || token.starts_with("ecdsa-") || token.starts_with("sk-")
}

/// Load a private key in OpenSSH or PEM format. Encrypted keys are not
/// supported.
pub fn load_private_key(path: &Path) -> Result<KeyPair> {
    russh_keys::load_secret_key(path, None).map_err(|e| {
        ShieldError::ConfigError(format!("loading private key {}: {e}", path.display()))
    })
}
