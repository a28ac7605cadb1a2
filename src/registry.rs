// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The shared on-disk peer registry.
//!
//! One JSON file maps peer names to launch descriptors so that any peer can
//! relaunch any other. Writers race: each write takes an advisory lock on a
//! sidecar file (bounded retries, then give up: every peer re-asserts its
//! own entry on boot, so last-writer-wins is acceptable). Readers never lock
//! and treat a missing or malformed file as empty.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::IpcError;

/// How a peer process is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    /// `cmd = [interpreter, script, …]`; the script is the launch target.
    Script,
    /// `cmd = [executable, …]`; the executable is the launch target.
    Binary,
}

/// How to spawn one peer, as persisted in the registry.
///
/// Unknown fields written by other (possibly newer) peers survive a
/// read-modify-write through `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchDescriptor {
    #[serde(rename = "type")]
    pub mode: LaunchMode,
    pub cmd: Vec<String>,
    pub cwd: PathBuf,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LaunchDescriptor {
    pub fn binary(cmd: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            mode: LaunchMode::Binary,
            cmd,
            cwd: cwd.into(),
            extra: Map::new(),
        }
    }

    pub fn script(cmd: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            mode: LaunchMode::Script,
            cmd,
            cwd: cwd.into(),
            extra: Map::new(),
        }
    }

    /// Describe the running image.
    ///
    /// A compiled image is always `binary`: the command is the executable
    /// itself and the working directory is its parent. Interpreter-hosted
    /// peers build a [`LaunchDescriptor::script`] descriptor explicitly.
    pub fn for_current_process() -> Result<Self, IpcError> {
        let exe = std::env::current_exe().map_err(|e| IpcError::Io(e.to_string()))?;
        let cwd = exe
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        Ok(Self::binary(vec![exe.display().to_string()], cwd))
    }

    /// The filesystem object that must exist for a launch to make sense:
    /// the executable for `binary`, the script for `script`.
    pub fn launch_target(&self) -> Option<&str> {
        match self.mode {
            LaunchMode::Binary => self.cmd.first(),
            LaunchMode::Script => self.cmd.get(1),
        }
        .map(String::as_str)
    }
}

const WRITE_ATTEMPTS: u32 = 5;
const WRITE_BACKOFF: Duration = Duration::from_millis(40);

/// Handle on the registry file. Cheap to construct; every operation opens
/// the file afresh so concurrent processes always see the latest state.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up one peer. Missing file and malformed content both read as
    /// an empty registry.
    pub fn get(&self, name: &str) -> Result<Option<LaunchDescriptor>, IpcError> {
        Ok(self.read_map()?.remove(name))
    }

    /// The full name → descriptor map.
    pub fn list(&self) -> Result<BTreeMap<String, LaunchDescriptor>, IpcError> {
        self.read_map()
    }

    /// Upsert `name`. Failures are logged and swallowed: the entry is
    /// re-asserted on every boot, so a lost write heals itself.
    pub fn put(&self, name: &str, descriptor: &LaunchDescriptor) {
        let name = name.to_string();
        let descriptor = descriptor.clone();
        if let Err(e) = self.mutate(move |map| {
            map.insert(name, descriptor);
        }) {
            warn!(path = %self.path.display(), "registry write failed: {e}");
        }
    }

    /// Remove `name` under the same retry discipline as [`put`](Self::put).
    pub fn prune(&self, name: &str) {
        let name = name.to_string();
        if let Err(e) = self.mutate(move |map| {
            map.remove(&name);
        }) {
            warn!(path = %self.path.display(), "registry prune failed: {e}");
        }
    }

    fn read_map(&self) -> Result<BTreeMap<String, LaunchDescriptor>, IpcError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(IpcError::LocalIo(e.to_string())),
        };
        match serde_json::from_str(&text) {
            Ok(map) => Ok(map),
            Err(e) => {
                debug!(path = %self.path.display(), "unreadable registry treated as empty: {e}");
                Ok(BTreeMap::new())
            }
        }
    }

    /// Read → mutate → write under an advisory writer lock with bounded
    /// retries. The replacement itself is atomic (temp file + rename) so
    /// readers never observe a torn file.
    fn mutate(
        &self,
        apply: impl FnOnce(&mut BTreeMap<String, LaunchDescriptor>),
    ) -> Result<(), IpcError> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| IpcError::LocalIo("registry path has no parent".into()))?;
        fs::create_dir_all(dir).map_err(|e| IpcError::LocalIo(e.to_string()))?;

        let _lock = self.acquire_write_lock()?;

        let mut map = self.read_map()?;
        apply(&mut map);

        let text = serde_json::to_string_pretty(&map)
            .map_err(|e| IpcError::LocalIo(e.to_string()))?;
        let tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| IpcError::LocalIo(e.to_string()))?;
        fs::write(tmp.path(), text).map_err(|e| IpcError::LocalIo(e.to_string()))?;
        tmp.persist(&self.path)
            .map_err(|e| IpcError::LocalIo(e.to_string()))?;
        Ok(())
    }

    fn acquire_write_lock(&self) -> Result<fs::File, IpcError> {
        let lock_path = self.path.with_extension("json.lock");
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| IpcError::LocalIo(e.to_string()))?;

        for attempt in 1..=WRITE_ATTEMPTS {
            match file.try_lock_exclusive() {
                Ok(true) => return Ok(file),
                Ok(false) => {
                    debug!(attempt, "registry lock contended, backing off");
                }
                Err(e) => {
                    debug!(attempt, "registry lock attempt failed: {e}");
                }
            }
            std::thread::sleep(WRITE_BACKOFF);
        }
        Err(IpcError::LocalIo(format!(
            "could not lock {} after {WRITE_ATTEMPTS} attempts",
            lock_path.display()
        )))
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> RegistryStore {
        RegistryStore::new(dir.path().join("registry.json"))
    }

    fn descriptor() -> LaunchDescriptor {
        LaunchDescriptor::binary(vec!["/usr/bin/true".into()], "/tmp")
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let reg = store(&dir);
        reg.put("launcher", &descriptor());
        let back = reg.get("launcher").unwrap().unwrap();
        assert_eq!(back, descriptor());
    }

    #[test]
    fn get_on_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir).get("nope").unwrap().is_none());
    }

    #[test]
    fn malformed_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let reg = store(&dir);
        fs::write(reg.path(), "{not json").unwrap();
        assert!(reg.get("x").unwrap().is_none());
        assert!(reg.list().unwrap().is_empty());
    }

    #[test]
    fn put_recovers_a_malformed_file() {
        let dir = TempDir::new().unwrap();
        let reg = store(&dir);
        fs::write(reg.path(), "garbage").unwrap();
        reg.put("a", &descriptor());
        assert!(reg.get("a").unwrap().is_some());
    }

    #[test]
    fn prune_removes_only_the_target() {
        let dir = TempDir::new().unwrap();
        let reg = store(&dir);
        reg.put("a", &descriptor());
        reg.put("b", &descriptor());
        reg.prune("a");
        assert!(reg.get("a").unwrap().is_none());
        assert!(reg.get("b").unwrap().is_some());
    }

    #[test]
    fn unknown_descriptor_fields_survive_rewrite() {
        let dir = TempDir::new().unwrap();
        let reg = store(&dir);
        fs::write(
            reg.path(),
            json!({
                "term": {
                    "type": "script",
                    "cmd": ["/usr/bin/python3", "/opt/term.py"],
                    "cwd": "/opt",
                    "display": ":1"
                }
            })
            .to_string(),
        )
        .unwrap();

        // A write for a different peer must not disturb term's entry.
        reg.put("bar", &descriptor());

        let raw: Value = serde_json::from_str(&fs::read_to_string(reg.path()).unwrap()).unwrap();
        assert_eq!(raw["term"]["display"], ":1");
        assert_eq!(raw["term"]["type"], "script");
        assert!(raw["bar"].is_object());

        let term = reg.get("term").unwrap().unwrap();
        assert_eq!(term.mode, LaunchMode::Script);
        assert_eq!(term.extra["display"], json!(":1"));
    }

    #[test]
    fn updating_a_peer_keeps_its_extra_fields_when_rewritten_whole() {
        let dir = TempDir::new().unwrap();
        let reg = store(&dir);
        let mut d = descriptor();
        d.extra.insert("profile".into(), json!("dev"));
        reg.put("a", &d);
        let back = reg.get("a").unwrap().unwrap();
        assert_eq!(back.extra["profile"], json!("dev"));
    }

    #[test]
    fn launch_target_depends_on_mode() {
        let b = LaunchDescriptor::binary(vec!["/bin/x".into(), "--flag".into()], "/");
        assert_eq!(b.launch_target(), Some("/bin/x"));
        let s = LaunchDescriptor::script(vec!["/bin/sh".into(), "/opt/run.sh".into()], "/");
        assert_eq!(s.launch_target(), Some("/opt/run.sh"));
        let empty = LaunchDescriptor::binary(vec![], "/");
        assert_eq!(empty.launch_target(), None);
    }

    #[test]
    fn for_current_process_points_at_a_real_binary() {
        let d = LaunchDescriptor::for_current_process().unwrap();
        assert_eq!(d.mode, LaunchMode::Binary);
        assert!(Path::new(d.launch_target().unwrap()).exists());
    }

    #[test]
    fn descriptor_serializes_with_wire_field_names() {
        let v = serde_json::to_value(descriptor()).unwrap();
        assert_eq!(v["type"], "binary");
        assert!(v["cmd"].is_array());
        assert!(v["cwd"].is_string());
    }
}
