//! Storage driver abstraction.
//!
//! A [`StorageDriver`] persists documents addressed by [`Identifier`]s for
//! any number of owners. The store talks to one driver through this trait
//! and never inspects the concrete backend at runtime; the backend is
//! chosen once at process start via [`BackendType`] and [`build_driver`].
//!
//! Export/import use a backend-agnostic blob shape so a value written via
//! one driver can be imported verbatim into the other.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, ConfigResult};
use crate::identifier::{Category, Identifier, category_depth, split_key};

mod couch;
mod json;

pub use couch::CouchDriver;
pub use json::JsonDriver;

// ---------------------------------------------------------------------------
// Export blob
// ---------------------------------------------------------------------------

/// Backend-agnostic dump of one owner's data.
///
/// Shape: `{category: {joined_key_path: {field: value, ...}, ...}, ...}`.
/// The global document sits under the empty-string key path. The blob is a
/// plain JSON mapping so it can be serialized for transport between
/// drivers; [`StorageDriver::import_data`] on either backend accepts the
/// blob produced by [`StorageDriver::export_data`] on the other.
pub type ExportBlob = serde_json::Map<String, Value>;

/// Validate that every key path in `blob` matches the depth declared for
/// its category. Depth mismatches (including undeclared custom groups) are
/// fatal: the store never coerces a key path to a different depth.
pub(crate) fn validate_blob_depths(
    blob: &ExportBlob,
    custom_groups: &HashMap<String, usize>,
) -> ConfigResult<()> {
    for (category, documents) in blob {
        let depth = category_depth(category, custom_groups)?;
        let documents = documents.as_object().ok_or_else(|| {
            ConfigError::schema(format!("category `{category}` in blob is not a mapping"))
        })?;
        for joined in documents.keys() {
            let actual = split_key(joined).len();
            if actual != depth {
                return Err(ConfigError::schema(format!(
                    "key path `{joined}` in category `{category}` has depth {actual}, declared {depth}"
                )));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Driver trait
// ---------------------------------------------------------------------------

/// The capability set every storage backend implements.
///
/// `get` on a full-depth identifier returns the document (or the subtree at
/// the identifier's field path); on a partial-depth identifier it returns a
/// mapping from the remaining joined key path to each matching document,
/// which the store uses for bulk category reads. A missing value is
/// [`ConfigError::NotFound`]; transient backend failures surface as their
/// own error variants and are never folded into `NotFound`.
///
/// `set` and `clear` apply entirely or not at all. `clear` of an absent
/// value is a no-op.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Read the value addressed by `id`.
    async fn get(&self, id: &Identifier) -> ConfigResult<Value>;

    /// Write `value` at `id`, creating the document if necessary.
    async fn set(&self, id: &Identifier, value: Value) -> ConfigResult<()>;

    /// Remove the value at `id`. No-op if nothing is stored there.
    async fn clear(&self, id: &Identifier) -> ConfigResult<()>;

    /// Remove every document in `category` for `owner`, or all of the
    /// owner's data when `category` is `None`.
    async fn clear_all(&self, owner: &str, category: Option<&Category>) -> ConfigResult<()>;

    /// Dump all of `owner`'s stored data as an [`ExportBlob`].
    async fn export_data(&self, owner: &str) -> ConfigResult<ExportBlob>;

    /// Replace `owner`'s data with `blob`, category by category.
    ///
    /// Categories present in the blob are overwritten wholesale (replace
    /// semantics, so re-importing after a partial failure never
    /// accumulates duplicates). `custom_groups` supplies the declared key
    /// depth for custom categories; a blob whose key paths do not match
    /// the declared depth is rejected with `SchemaMismatch` before any
    /// write.
    async fn import_data(
        &self,
        owner: &str,
        blob: ExportBlob,
        custom_groups: &HashMap<String, usize>,
    ) -> ConfigResult<()>;
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// The storage backends a process can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// File-backed JSON documents, one per owner.
    Json,
    /// Remote CouchDB-compatible document store, one database per owner.
    Couch,
}

impl FromStr for BackendType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "couch" | "couchdb" => Ok(Self::Couch),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Couch => write!(f, "couch"),
        }
    }
}

/// Connection settings for [`build_driver`]. Each backend reads only the
/// fields it needs.
#[derive(Debug, Clone, Default)]
pub struct DriverConfig {
    /// Root data directory for the file driver.
    pub data_path: Option<PathBuf>,
    /// Base URL of the remote document store, credentials included.
    pub couch_url: Option<url::Url>,
    /// Database-name prefix for the remote driver. Defaults to `herald`.
    pub couch_prefix: Option<String>,
}

/// Construct the configured driver.
pub fn build_driver(
    backend: BackendType,
    config: &DriverConfig,
) -> ConfigResult<Arc<dyn StorageDriver>> {
    match backend {
        BackendType::Json => {
            let path = config.data_path.clone().ok_or_else(|| {
                ConfigError::backend("json backend requires a data path")
            })?;
            Ok(Arc::new(JsonDriver::new(path)))
        }
        BackendType::Couch => {
            let url = config.couch_url.clone().ok_or_else(|| {
                ConfigError::backend("couch backend requires a server url")
            })?;
            Ok(Arc::new(CouchDriver::new(
                url,
                config.couch_prefix.as_deref().unwrap_or("herald"),
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backend_names_parse_case_insensitively() {
        assert_eq!("json".parse::<BackendType>().unwrap(), BackendType::Json);
        assert_eq!("COUCH".parse::<BackendType>().unwrap(), BackendType::Couch);
        assert_eq!(
            "couchdb".parse::<BackendType>().unwrap(),
            BackendType::Couch
        );
        assert!(matches!(
            "mysql".parse::<BackendType>(),
            Err(ConfigError::UnknownBackend(_))
        ));
    }

    #[test]
    fn build_driver_rejects_missing_settings() {
        let empty = DriverConfig::default();
        assert!(build_driver(BackendType::Json, &empty).is_err());
        assert!(build_driver(BackendType::Couch, &empty).is_err());
    }

    #[test]
    fn blob_depth_validation() {
        let blob: ExportBlob = json!({
            "GLOBAL": {"": {"a": 1}},
            "MEMBER": {"g1/u1": {"balance": 5}},
        })
        .as_object()
        .cloned()
        .unwrap();
        let groups = HashMap::new();
        validate_blob_depths(&blob, &groups).unwrap();

        let bad: ExportBlob = json!({"MEMBER": {"g1": {"balance": 5}}})
            .as_object()
            .cloned()
            .unwrap();
        assert!(matches!(
            validate_blob_depths(&bad, &groups),
            Err(ConfigError::SchemaMismatch { .. })
        ));

        let undeclared: ExportBlob = json!({"Sessions": {"a/b": {}}})
            .as_object()
            .cloned()
            .unwrap();
        assert!(matches!(
            validate_blob_depths(&undeclared, &groups),
            Err(ConfigError::SchemaMismatch { .. })
        ));
    }
}
