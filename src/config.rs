// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use crate::{error::IpcError, registry::LaunchDescriptor};

/// Fixed prefix of every transport address; the peer name is appended
/// verbatim.
pub const SOCKET_PREFIX: &str = "NeverLiie_";

/// Name of the per-user runtime directory under the home directory.
pub const BASE_DIR_NAME: &str = ".neverliie";

/// Configuration for one peer node.
#[derive(Debug)]
pub struct NodeConfig {
    /// Directory holding the registry file and the peer sockets.
    /// Defaults to `~/.neverliie`; created on demand.
    pub base_dir: PathBuf,

    /// Launch descriptor recorded in the registry at boot.
    ///
    /// `None` self-describes the running image via
    /// [`LaunchDescriptor::for_current_process`]. Peers that need flags to
    /// come back up (a `--name`, a profile) record their full command line
    /// here instead.
    pub launch: Option<LaunchDescriptor>,
}

impl NodeConfig {
    pub fn new() -> Self {
        Self {
            base_dir: default_base_dir(),
            launch: None,
        }
    }

    /// Config rooted at an explicit directory instead of the home default.
    pub fn with_base_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: dir.into(),
            launch: None,
        }
    }

    pub fn launch_descriptor(mut self, descriptor: LaunchDescriptor) -> Self {
        self.launch = Some(descriptor);
        self
    }

    /// Path of the shared peer registry file.
    pub fn registry_path(&self) -> PathBuf {
        self.base_dir.join("registry.json")
    }

    /// Socket path for `name`: `<base_dir>/NeverLiie_<name>`.
    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{SOCKET_PREFIX}{name}"))
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// `~/.neverliie`, falling back to the system temp directory for
/// homeless environments (containers, CI).
pub fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(BASE_DIR_NAME)
}

/// A peer name doubles as a socket filename and a registry key: it must be
/// non-empty and printable, with no separators or control characters.
pub fn validate_peer_name(name: &str) -> Result<(), IpcError> {
    if name.is_empty() {
        return Err(IpcError::InvalidName("name is empty".into()));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.'))
    {
        return Err(IpcError::InvalidName(format!(
            "'{name}' contains unsupported character {c:?}"
        )));
    }
    Ok(())
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_embeds_the_name_verbatim() {
        let cfg = NodeConfig::with_base_dir("/run/x");
        assert_eq!(
            cfg.socket_path("launcher"),
            PathBuf::from("/run/x/NeverLiie_launcher")
        );
    }

    #[test]
    fn registry_lives_next_to_the_sockets() {
        let cfg = NodeConfig::with_base_dir("/run/x");
        assert_eq!(cfg.registry_path(), PathBuf::from("/run/x/registry.json"));
    }

    #[test]
    fn plain_names_validate() {
        for name in ["launcher", "status-bar", "term_0", "a.b"] {
            assert!(validate_peer_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn empty_and_unprintable_names_are_rejected() {
        for name in ["", "a/b", "a b", "ctl\n", "..\\x"] {
            assert!(
                matches!(validate_peer_name(name), Err(IpcError::InvalidName(_))),
                "{name:?}"
            );
        }
    }
}
