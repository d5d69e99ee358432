//! File-backed JSON driver.
//!
//! One document per owner at `<root>/<owner>/settings.json`, shaped
//! `{category: {joined_key_path: {field: value}}}` with the global
//! document under the empty-string key path. The full document set is
//! cached in memory; every committed mutation rewrites the owner's file
//! through a temp file in the same directory followed by an atomic rename,
//! so a crash mid-write never leaves a half-written file visible.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::driver::{ExportBlob, StorageDriver, validate_blob_depths};
use crate::error::{ConfigError, ConfigResult};
use crate::identifier::{Category, Identifier, escape_key, unescape_key};
use crate::value::{get_path, remove_path, set_path};

const SETTINGS_FILE: &str = "settings.json";

/// File-backed document store, one JSON file per owner.
pub struct JsonDriver {
    root: PathBuf,
    // owner -> {category: {joined_key: doc}}
    cache: Arc<Mutex<HashMap<String, Value>>>,
}

impl JsonDriver {
    /// Create a driver rooted at `root`. Owner directories are created
    /// lazily on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        info!(path = %root.display(), "json driver opened");
        Self {
            root,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Owners that have data on disk, discovered by scanning the root
    /// directory for per-owner `settings.json` files.
    pub async fn list_owners(&self) -> ConfigResult<Vec<String>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> ConfigResult<Vec<String>> {
            let mut owners = Vec::new();
            let entries = match std::fs::read_dir(&root) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(owners),
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                if entry.path().join(SETTINGS_FILE).is_file() {
                    owners.push(unescape_key(&entry.file_name().to_string_lossy()));
                }
            }
            owners.sort();
            Ok(owners)
        })
        .await?
    }

    fn owner_file(&self, owner: &str) -> PathBuf {
        self.root.join(escape_key(owner)).join(SETTINGS_FILE)
    }

    /// Load `owner`'s document into the cache if not already present.
    async fn ensure_loaded(
        &self,
        cache: &mut HashMap<String, Value>,
        owner: &str,
    ) -> ConfigResult<()> {
        if cache.contains_key(owner) {
            return Ok(());
        }
        let path = self.owner_file(owner);
        let doc = tokio::task::spawn_blocking(move || -> ConfigResult<Value> {
            match std::fs::read_to_string(&path) {
                Ok(raw) => Ok(serde_json::from_str(&raw)?),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Ok(Value::Object(Map::new()))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await??;
        cache.insert(owner.to_string(), doc);
        Ok(())
    }

    /// Persist `owner`'s document: serialize, write to a temp file in the
    /// owner's directory, fsync, then rename over `settings.json`.
    async fn save_owner(&self, owner: &str, doc: &Value) -> ConfigResult<()> {
        let dir = self.root.join(escape_key(owner));
        let raw = serde_json::to_vec_pretty(doc)?;
        tokio::task::spawn_blocking(move || -> ConfigResult<()> {
            std::fs::create_dir_all(&dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&raw)?;
            tmp.as_file().sync_all()?;
            tmp.persist(dir.join(SETTINGS_FILE))
                .map_err(|e| ConfigError::Io(e.error))?;
            Ok(())
        })
        .await??;
        debug!(owner = %owner, "owner document persisted");
        Ok(())
    }
}

/// Whether `key` falls under the joined key-path `prefix`, and if so the
/// remaining joined path below it.
fn strip_prefix<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        Some(key)
    } else if key == prefix {
        Some("")
    } else {
        key.strip_prefix(prefix)?.strip_prefix('/')
    }
}

#[async_trait]
impl StorageDriver for JsonDriver {
    async fn get(&self, id: &Identifier) -> ConfigResult<Value> {
        let mut cache = self.cache.lock().await;
        self.ensure_loaded(&mut cache, id.owner()).await?;
        let doc = cache
            .get(id.owner())
            .ok_or_else(|| ConfigError::backend("owner vanished from cache"))?;

        let not_found = || ConfigError::NotFound {
            ident: id.to_string(),
        };
        let category = get_path(doc, &[id.category().as_str()]).ok_or_else(not_found)?;
        let documents = category.as_object().ok_or_else(|| {
            ConfigError::schema(format!("category {} is not a mapping", id.category()))
        })?;

        if id.is_full_depth() {
            let stored = documents.get(&id.joined_key()).ok_or_else(not_found)?;
            return get_path(stored, id.fields()).cloned().ok_or_else(not_found);
        }

        // Partial key path: collect every document under the prefix, keyed
        // by the remaining joined path.
        let prefix = id.joined_key();
        let mut matches = Map::new();
        for (key, stored) in documents {
            if let Some(remaining) = strip_prefix(key, &prefix) {
                matches.insert(remaining.to_string(), stored.clone());
            }
        }
        if matches.is_empty() {
            return Err(not_found());
        }
        Ok(Value::Object(matches))
    }

    async fn set(&self, id: &Identifier, value: Value) -> ConfigResult<()> {
        if !id.is_full_depth() {
            return Err(ConfigError::schema(format!(
                "cannot set at partial key path: {id}"
            )));
        }

        let mut cache = self.cache.lock().await;
        self.ensure_loaded(&mut cache, id.owner()).await?;
        let doc = cache
            .get_mut(id.owner())
            .ok_or_else(|| ConfigError::backend("owner vanished from cache"))?;

        let mut path: Vec<String> = vec![id.category().as_str().to_string(), id.joined_key()];
        path.extend(id.fields().iter().cloned());
        set_path(doc, &path, value)?;

        let snapshot = doc.clone();
        self.save_owner(id.owner(), &snapshot).await
    }

    async fn clear(&self, id: &Identifier) -> ConfigResult<()> {
        let mut cache = self.cache.lock().await;
        self.ensure_loaded(&mut cache, id.owner()).await?;
        let doc = cache
            .get_mut(id.owner())
            .ok_or_else(|| ConfigError::backend("owner vanished from cache"))?;

        let changed = if id.is_full_depth() {
            let mut path: Vec<String> = vec![id.category().as_str().to_string(), id.joined_key()];
            path.extend(id.fields().iter().cloned());
            remove_path(doc, &path)
        } else {
            // Partial key path: drop every document under the prefix.
            let prefix = id.joined_key();
            match doc
                .as_object_mut()
                .and_then(|m| m.get_mut(id.category().as_str()))
                .and_then(Value::as_object_mut)
            {
                Some(documents) => {
                    let before = documents.len();
                    documents.retain(|key, _| strip_prefix(key, &prefix).is_none());
                    documents.len() != before
                }
                None => false,
            }
        };

        if !changed {
            return Ok(());
        }
        let snapshot = doc.clone();
        self.save_owner(id.owner(), &snapshot).await
    }

    async fn clear_all(&self, owner: &str, category: Option<&Category>) -> ConfigResult<()> {
        let mut cache = self.cache.lock().await;
        match category {
            Some(category) => {
                self.ensure_loaded(&mut cache, owner).await?;
                let doc = cache
                    .get_mut(owner)
                    .ok_or_else(|| ConfigError::backend("owner vanished from cache"))?;
                if !remove_path(doc, &[category.as_str()]) {
                    return Ok(());
                }
                let snapshot = doc.clone();
                self.save_owner(owner, &snapshot).await
            }
            None => {
                cache.remove(owner);
                let dir = self.root.join(escape_key(owner));
                tokio::task::spawn_blocking(move || -> ConfigResult<()> {
                    match std::fs::remove_dir_all(&dir) {
                        Ok(()) => Ok(()),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                        Err(e) => Err(e.into()),
                    }
                })
                .await??;
                info!(owner = %owner, "owner data wiped");
                Ok(())
            }
        }
    }

    async fn export_data(&self, owner: &str) -> ConfigResult<ExportBlob> {
        let mut cache = self.cache.lock().await;
        self.ensure_loaded(&mut cache, owner).await?;
        // The on-disk document is already the export shape.
        match cache.get(owner) {
            Some(Value::Object(map)) => Ok(map.clone()),
            _ => Err(ConfigError::schema(format!(
                "owner `{owner}` document is not a mapping"
            ))),
        }
    }

    async fn import_data(
        &self,
        owner: &str,
        blob: ExportBlob,
        custom_groups: &HashMap<String, usize>,
    ) -> ConfigResult<()> {
        validate_blob_depths(&blob, custom_groups)?;

        let mut cache = self.cache.lock().await;
        self.ensure_loaded(&mut cache, owner).await?;
        let doc = cache
            .get_mut(owner)
            .ok_or_else(|| ConfigError::backend("owner vanished from cache"))?;

        // Replace semantics per category, so re-importing is idempotent.
        for (category, documents) in blob {
            set_path(doc, &[category], documents)?;
        }
        let snapshot = doc.clone();
        self.save_owner(owner, &snapshot).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
