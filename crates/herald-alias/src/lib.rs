//! # herald-alias
//!
//! Command alias registry for the Herald platform: global aliases plus
//! per-guild aliases, both stored as lists in the scoped configuration
//! store. List mutations run inside scoped mutation contexts, so two
//! concurrent additions can never drop each other's entry.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::instrument;

use herald_config::{Config, ConfigError, Scope, StorageDriver};

/// Owner name the registry registers under.
pub const ALIAS_OWNER: &str = "Alias";

const ENTRIES_FIELD: &str = "entries";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Alias for `Result<T, AliasError>`.
pub type AliasResult<T> = Result<T, AliasError>;

/// Errors raised by alias operations.
#[derive(Debug, Error)]
pub enum AliasError {
    /// Alias names must be printable and contain no whitespace.
    #[error("invalid alias name: `{0}`")]
    InvalidName(String),

    /// An alias with this name already exists in the scope.
    #[error("alias `{0}` already exists")]
    AliasExists(String),

    /// No alias with this name exists in the scope.
    #[error("alias `{0}` does not exist")]
    AliasNotFound(String),

    /// Underlying store failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// One stored alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasEntry {
    /// Invocation name, unique within its scope.
    pub name: String,
    /// The command text the alias expands to.
    pub command: String,
    /// User id of whoever created the alias.
    pub creator: String,
    /// Guild the alias belongs to; `None` for a global alias.
    pub guild: Option<String>,
    /// How many times the alias has been invoked.
    pub uses: u64,
}

impl AliasEntry {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        creator: impl Into<String>,
        guild: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            creator: creator.into(),
            guild,
            uses: 0,
        }
    }
}

/// A valid alias name is non-empty, printable, and free of whitespace.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| !c.is_whitespace() && !c.is_control())
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Handle to the alias registry. Cheap to clone.
#[derive(Clone)]
pub struct AliasRegistry {
    config: Config,
}

impl AliasRegistry {
    /// Create the registry over `driver` and register its schemas.
    pub fn new(driver: Arc<dyn StorageDriver>) -> AliasResult<Self> {
        let config = Config::new(ALIAS_OWNER, driver);
        config.register_global(json!({"enabled": true, "entries": []}))?;
        config.register_guild(json!({"enabled": false, "entries": []}))?;
        Ok(Self { config })
    }

    fn scope(&self, guild: Option<&str>) -> Scope {
        match guild {
            Some(guild) => self.config.guild(guild),
            None => self.config.global(),
        }
    }

    /// Whether aliases are enabled in this scope.
    pub async fn is_enabled(&self, guild: Option<&str>) -> AliasResult<bool> {
        let value = self.scope(guild).value("enabled").await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    pub async fn set_enabled(&self, guild: Option<&str>, enabled: bool) -> AliasResult<()> {
        Ok(self.scope(guild).set("enabled", json!(enabled)).await?)
    }

    /// All aliases in this scope.
    pub async fn list(&self, guild: Option<&str>) -> AliasResult<Vec<AliasEntry>> {
        let value = self.scope(guild).value(ENTRIES_FIELD).await?;
        Ok(serde_json::from_value(value).map_err(ConfigError::from)?)
    }

    /// Look up one alias by name (case-insensitive).
    pub async fn get(&self, guild: Option<&str>, name: &str) -> AliasResult<Option<AliasEntry>> {
        Ok(self
            .list(guild)
            .await?
            .into_iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name)))
    }

    /// Add an alias to the scope.
    ///
    /// Rejects names containing whitespace or non-printable characters,
    /// and names already taken within the scope.
    #[instrument(skip(self, entry), fields(name = %entry.name))]
    pub async fn add(&self, guild: Option<&str>, entry: AliasEntry) -> AliasResult<()> {
        if !is_valid_name(&entry.name) {
            return Err(AliasError::InvalidName(entry.name));
        }

        let mut ctx = self.scope(guild).scoped(ENTRIES_FIELD).await?;
        let mut entries: Vec<AliasEntry> =
            serde_json::from_value(ctx.value().clone()).map_err(ConfigError::from)?;
        if entries
            .iter()
            .any(|e| e.name.eq_ignore_ascii_case(&entry.name))
        {
            return Err(AliasError::AliasExists(entry.name));
        }
        entries.push(entry);
        ctx.replace(serde_json::to_value(&entries).map_err(ConfigError::from)?);
        ctx.commit().await?;
        Ok(())
    }

    /// Remove an alias by name.
    #[instrument(skip(self))]
    pub async fn remove(&self, guild: Option<&str>, name: &str) -> AliasResult<AliasEntry> {
        let mut ctx = self.scope(guild).scoped(ENTRIES_FIELD).await?;
        let mut entries: Vec<AliasEntry> =
            serde_json::from_value(ctx.value().clone()).map_err(ConfigError::from)?;
        let index = entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| AliasError::AliasNotFound(name.to_string()))?;
        let removed = entries.remove(index);
        ctx.replace(serde_json::to_value(&entries).map_err(ConfigError::from)?);
        ctx.commit().await?;
        Ok(removed)
    }

    /// Record one invocation of an alias.
    pub async fn record_use(&self, guild: Option<&str>, name: &str) -> AliasResult<()> {
        let mut ctx = self.scope(guild).scoped(ENTRIES_FIELD).await?;
        let mut entries: Vec<AliasEntry> =
            serde_json::from_value(ctx.value().clone()).map_err(ConfigError::from)?;
        let entry = entries
            .iter_mut()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| AliasError::AliasNotFound(name.to_string()))?;
        entry.uses += 1;
        ctx.replace(serde_json::to_value(&entries).map_err(ConfigError::from)?);
        ctx.commit().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
