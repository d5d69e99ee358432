//! The instance registry: named Herald instances and their backends.
//!
//! Persisted as `instances.json` under the user's config directory so the
//! migration CLI can resolve an instance name to its storage settings.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use herald_config::BackendType;

/// Storage settings for one named instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceEntry {
    /// Which backend the instance currently uses.
    pub backend: BackendType,
    /// Data directory (file backend; also where exports land).
    pub data_path: PathBuf,
    /// Server URL for the remote backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub couch_url: Option<String>,
    /// Database-name prefix for the remote backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub couch_prefix: Option<String>,
}

/// All registered instances, keyed by name.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InstanceRegistry {
    instances: BTreeMap<String, InstanceEntry>,
}

impl InstanceRegistry {
    /// Default registry location: `<config dir>/herald/instances.json`.
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir().context("could not determine the user config directory")?;
        Ok(base.join("herald").join("instances.json"))
    }

    /// Load the registry, returning an empty one if the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("malformed instance registry at {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        }
    }

    /// Write the registry back to disk, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn get(&self, name: &str) -> Option<&InstanceEntry> {
        self.instances.get(name)
    }

    /// Add or replace an entry.
    pub fn insert(&mut self, name: impl Into<String>, entry: InstanceEntry) {
        self.instances.insert(name.into(), entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &InstanceEntry)> {
        self.instances.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
