//! Durable version-to-port state persisted as `meta.json` in the managed root

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Name of the state file kept at the managed root
pub const META_FILE: &str = "meta.json";

/// Name of the marker file holding the pinned default version
pub const CURRENT_FILE: &str = "current";

/// One discovered version: folder name, location, and its sticky port.
///
/// `port` is 0 until the allocator assigns one; once assigned it never
/// changes for the lifetime of the instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub name: String,
    pub path: PathBuf,
    pub port: u16,
    /// Pid of the most recently spawned worker, for inspection only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pid: Option<u32>,
    /// Generated nginx location config for this version, once written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nginx_conf: Option<PathBuf>,
}

impl Instance {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            port: 0,
            last_pid: None,
            nginx_conf: None,
        }
    }
}

/// Durable aggregate rewritten after every successful reconciliation.
///
/// A `BTreeMap` keeps iteration order stable so repeated reconciliations
/// allocate ports deterministically.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetaState {
    #[serde(default)]
    pub instances: BTreeMap<String, Instance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
}

impl MetaState {
    /// Read persisted state, or start empty when no meta file exists yet
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| Error::fs(path, e))?;
        serde_json::from_str(&content).map_err(|source| Error::MetaParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Rewrite the meta file in full
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|source| Error::MetaParse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, content).map_err(|e| Error::fs(path, e))
    }

    /// All ports currently committed to live instances
    pub fn used_ports(&self) -> BTreeSet<u16> {
        self.instances
            .values()
            .filter(|i| i.port != 0)
            .map(|i| i.port)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = MetaState::load(&dir.path().join(META_FILE)).unwrap();

        assert!(state.instances.is_empty());
        assert!(state.default_instance.is_none());
        assert!(state.current_version.is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let meta_path = dir.path().join(META_FILE);

        let mut state = MetaState::default();
        let mut v1 = Instance::new("v1", dir.path().join("v1"));
        v1.port = 9000;
        v1.last_pid = Some(4242);
        state.instances.insert("v1".to_string(), v1);
        state.current_version = Some("v1".to_string());

        state.save(&meta_path).unwrap();
        let reloaded = MetaState::load(&meta_path).unwrap();

        assert_eq!(reloaded, state);
        assert_eq!(reloaded.instances["v1"].port, 9000);
    }

    #[test]
    fn test_meta_file_uses_original_field_names() {
        let mut state = MetaState::default();
        state
            .instances
            .insert("v1".to_string(), Instance::new("v1", "/srv/versions/v1"));
        state.default_instance = Some("v1".to_string());

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"instances\""));
        assert!(json.contains("\"defaultInstance\""));
    }

    #[test]
    fn test_corrupt_meta_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let meta_path = dir.path().join(META_FILE);
        std::fs::write(&meta_path, "{not json").unwrap();

        match MetaState::load(&meta_path) {
            Err(Error::MetaParse { path, .. }) => assert_eq!(path, meta_path),
            other => panic!("expected MetaParse, got {:?}", other),
        }
    }

    #[test]
    fn test_used_ports_skips_unallocated() {
        let mut state = MetaState::default();
        let mut v1 = Instance::new("v1", "/v1");
        v1.port = 9000;
        let v2 = Instance::new("v2", "/v2");
        let mut v3 = Instance::new("v3", "/v3");
        v3.port = 9002;
        state.instances.insert("v1".to_string(), v1);
        state.instances.insert("v2".to_string(), v2);
        state.instances.insert("v3".to_string(), v3);

        let used: Vec<u16> = state.used_ports().into_iter().collect();
        assert_eq!(used, vec![9000, 9002]);
    }
}
