//! Offline migration of all stored data between storage backends.
//!
//! The [`Migrator`] walks every known owner, exports the owner's data from
//! the source driver and imports it into the target driver. Import uses
//! replace semantics per category, so re-running a migration for an owner
//! that partially succeeded overwrites rather than accumulates.
//!
//! Custom-group declarations are only known to the process that registered
//! them, so they are persisted in the core owner's global document (see
//! [`record_custom_groups`]) and read back at migration time to reconcile
//! declared key depths on import.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::core_owner::CORE_OWNER;
use crate::driver::StorageDriver;
use crate::error::ConfigResult;
use crate::store::Config;

/// Field in the core owner's global document holding each owner's declared
/// custom groups: `{owner: {group_name: key_depth}}`.
const CUSTOM_GROUPS_FIELD: &str = "custom_groups";

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Outcome of one migration run.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Owners whose data was fully replayed into the target.
    pub migrated: Vec<String>,
    /// Owners whose migration failed, with the failure message. Completed
    /// owners are not rolled back; re-run for the failed owners only.
    pub failed: Vec<(String, String)>,
}

impl MigrationReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Migrator
// ---------------------------------------------------------------------------

/// Replays every owner's data from one driver into another.
pub struct Migrator {
    source: Arc<dyn StorageDriver>,
    target: Arc<dyn StorageDriver>,
}

impl Migrator {
    pub fn new(source: Arc<dyn StorageDriver>, target: Arc<dyn StorageDriver>) -> Self {
        Self { source, target }
    }

    /// Migrate `owners`, core owner first, using `custom_groups` to
    /// resolve the declared depth of each owner's custom categories.
    ///
    /// Each owner is one logical unit: export from the source, import into
    /// the target. A failure is recorded and the run continues with the
    /// remaining owners; nothing already migrated is rolled back.
    #[instrument(skip_all, fields(owners = owners.len()))]
    pub async fn migrate(
        &self,
        owners: &[String],
        custom_groups: &HashMap<String, HashMap<String, usize>>,
    ) -> MigrationReport {
        let mut report = MigrationReport::default();

        // The core owner's data (including the custom-group registry)
        // lands first; everything else has no cross-owner dependency.
        let mut ordered: Vec<&String> = owners.iter().collect();
        ordered.sort_by_key(|owner| (owner.as_str() != CORE_OWNER, owner.as_str()));

        let empty = HashMap::new();
        for owner in ordered {
            let groups = custom_groups.get(owner).unwrap_or(&empty);
            match self.migrate_owner(owner, groups).await {
                Ok(()) => {
                    info!(owner = %owner, "owner migrated");
                    report.migrated.push(owner.clone());
                }
                Err(e) => {
                    error!(owner = %owner, error = %e, "owner migration failed");
                    report.failed.push((owner.clone(), e.to_string()));
                }
            }
        }
        report
    }

    async fn migrate_owner(
        &self,
        owner: &str,
        custom_groups: &HashMap<String, usize>,
    ) -> ConfigResult<()> {
        let blob = self.source.export_data(owner).await?;
        self.target.import_data(owner, blob, custom_groups).await
    }
}

// ---------------------------------------------------------------------------
// Custom-group registry
// ---------------------------------------------------------------------------

/// Record `owner`'s declared custom groups in the core owner's global
/// document so later migrations can reconcile key depths.
pub async fn record_custom_groups(
    core: &Config,
    owner: &str,
    groups: &HashMap<String, usize>,
) -> ConfigResult<()> {
    let mut ctx = core.global().scoped(CUSTOM_GROUPS_FIELD).await?;
    let registry = ctx.value_mut();
    if !registry.is_object() {
        *registry = json!({});
    }
    if let Some(map) = registry.as_object_mut() {
        map.insert(owner.to_string(), serde_json::to_value(groups)?);
    }
    ctx.commit().await
}

/// Read back the per-owner custom-group declarations recorded by
/// [`record_custom_groups`]. Owners with no custom groups are absent.
pub async fn load_custom_groups(
    core: &Config,
) -> ConfigResult<HashMap<String, HashMap<String, usize>>> {
    let registry: Value = core.global().value(CUSTOM_GROUPS_FIELD).await?;
    Ok(serde_json::from_value(registry)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_owner::core_config;
    use crate::driver::JsonDriver;
    use crate::identifier::Category;
    use serde_json::json;

    fn drivers() -> (
        tempfile::TempDir,
        tempfile::TempDir,
        Arc<dyn StorageDriver>,
        Arc<dyn StorageDriver>,
    ) {
        let source_dir = tempfile::TempDir::new().unwrap();
        let target_dir = tempfile::TempDir::new().unwrap();
        let source: Arc<dyn StorageDriver> = Arc::new(JsonDriver::new(source_dir.path()));
        let target: Arc<dyn StorageDriver> = Arc::new(JsonDriver::new(target_dir.path()));
        (source_dir, target_dir, source, target)
    }

    #[tokio::test]
    async fn migrated_reads_match_source_reads() {
        let (_s, _t, source, target) = drivers();

        let bank = Config::new("Bank", Arc::clone(&source));
        bank.register_member(json!({"balance": 0})).unwrap();
        bank.member("g1", "u1").set("balance", json!(42)).await.unwrap();
        bank.global().set("is_global", json!(false)).await.unwrap();

        let migrator = Migrator::new(Arc::clone(&source), Arc::clone(&target));
        let report = migrator
            .migrate(&["Bank".to_string()], &HashMap::new())
            .await;
        assert!(report.is_success());
        assert_eq!(report.migrated, vec!["Bank"]);

        let migrated = Config::new("Bank", target);
        migrated.register_member(json!({"balance": 0})).unwrap();
        assert_eq!(
            migrated.member("g1", "u1").value("balance").await.unwrap(),
            json!(42)
        );
        assert_eq!(
            migrated.global().value("is_global").await.unwrap(),
            json!(false)
        );
    }

    #[tokio::test]
    async fn rerunning_migration_replaces_target_data() {
        let (_s, _t, source, target) = drivers();

        let cfg = Config::new("Bank", Arc::clone(&source));
        cfg.register_member(json!({"balance": 0})).unwrap();
        cfg.member("g1", "u1").set("balance", json!(10)).await.unwrap();

        // Stale data on the target from an earlier partial run.
        let stale = Config::new("Bank", Arc::clone(&target));
        stale.register_member(json!({"balance": 0})).unwrap();
        stale
            .member("g9", "u9")
            .set("balance", json!(999))
            .await
            .unwrap();

        let migrator = Migrator::new(source, Arc::clone(&target));
        let owners = ["Bank".to_string()];
        assert!(migrator.migrate(&owners, &HashMap::new()).await.is_success());
        assert!(migrator.migrate(&owners, &HashMap::new()).await.is_success());

        let members = stale.all_members().await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members["g1"]["u1"], json!({"balance": 10}));
    }

    #[tokio::test]
    async fn custom_group_registry_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let driver: Arc<dyn StorageDriver> = Arc::new(JsonDriver::new(dir.path()));
        let core = core_config(Arc::clone(&driver)).unwrap();

        let mut groups = HashMap::new();
        groups.insert("Sessions".to_string(), 2usize);
        record_custom_groups(&core, "Audio", &groups).await.unwrap();

        let loaded = load_custom_groups(&core).await.unwrap();
        assert_eq!(loaded["Audio"]["Sessions"], 2);
    }

    #[tokio::test]
    async fn custom_group_data_migrates_with_declared_depth() {
        let (_s, _t, source, target) = drivers();

        let cfg = Config::new("Audio", Arc::clone(&source));
        cfg.init_custom("Sessions", 2).unwrap();
        cfg.register_custom("Sessions", json!({"open": false}))
            .unwrap();
        cfg.custom("Sessions", ["g1", "s1"])
            .unwrap()
            .set("open", json!(true))
            .await
            .unwrap();

        let mut custom = HashMap::new();
        custom.insert("Audio".to_string(), cfg.custom_groups());

        let migrator = Migrator::new(source, Arc::clone(&target));
        let report = migrator.migrate(&["Audio".to_string()], &custom).await;
        assert!(report.is_success());

        let migrated = Config::new("Audio", target);
        migrated.init_custom("Sessions", 2).unwrap();
        migrated.register_custom("Sessions", json!({"open": false})).unwrap();
        assert_eq!(
            migrated
                .custom("Sessions", ["g1", "s1"])
                .unwrap()
                .value("open")
                .await
                .unwrap(),
            json!(true)
        );
    }

    #[tokio::test]
    async fn undeclared_custom_group_fails_that_owner_only() {
        let (_s, _t, source, target) = drivers();

        let audio = Config::new("Audio", Arc::clone(&source));
        audio.init_custom("Sessions", 2).unwrap();
        audio
            .custom("Sessions", ["g1", "s1"])
            .unwrap()
            .set("open", json!(true))
            .await
            .unwrap();

        let bank = Config::new("Bank", Arc::clone(&source));
        bank.register_global(json!({"is_global": false})).unwrap();
        bank.global().set("is_global", json!(true)).await.unwrap();

        // No custom-group declarations supplied at all: Audio's depth
        // cannot be resolved and that owner fails; Bank still migrates.
        let migrator = Migrator::new(source, target);
        let owners = ["Audio".to_string(), "Bank".to_string()];
        let report = migrator.migrate(&owners, &HashMap::new()).await;

        assert_eq!(report.migrated, vec!["Bank"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "Audio");
    }

    #[tokio::test]
    async fn core_owner_migrates_first() {
        let (_s, _t, source, target) = drivers();

        for owner in ["Alias", CORE_OWNER, "Bank"] {
            let cfg = Config::new(owner, Arc::clone(&source));
            cfg.register_global(json!({"x": 0})).unwrap();
            cfg.global().set("x", json!(1)).await.unwrap();
        }

        let migrator = Migrator::new(source, target);
        let owners: Vec<String> = ["Alias", CORE_OWNER, "Bank"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let report = migrator.migrate(&owners, &HashMap::new()).await;

        assert_eq!(report.migrated[0], CORE_OWNER);
        assert_eq!(report.migrated.len(), 3);
    }

    #[tokio::test]
    async fn migrating_custom_data_under_global_category_is_checked() {
        // A blob containing the GLOBAL category always passes the depth
        // check regardless of custom declarations.
        let (_s, _t, source, target) = drivers();
        let cfg = Config::new("Thing", source.clone());
        cfg.register_global(json!({"a": 1})).unwrap();
        cfg.global().set("a", json!(2)).await.unwrap();

        let migrator = Migrator::new(source, target);
        let report = migrator
            .migrate(&["Thing".to_string()], &HashMap::new())
            .await;
        assert!(report.is_success());
    }
}
