//! The scoped store: per-owner facade over a storage driver.
//!
//! A [`Config`] is created once per owning component at startup, registers
//! its category schemas before first use, and lives for the process
//! lifetime. Reads merge stored documents over the registered defaults;
//! writes go straight through to the driver. [`Scope`] values address one
//! (category, key path) and carry the read/write/mutate surface.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::instrument;

use crate::driver::StorageDriver;
use crate::error::{ConfigError, ConfigResult};
use crate::identifier::{Category, Identifier, split_key, unescape_key};
use crate::scoped::{LockRegistry, ScopedValue};
use crate::value::merge_defaults;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Per-owner handle to the scoped configuration store.
///
/// Cheap to clone; all clones share the registered defaults, the custom
/// group declarations, and the per-identifier lock registry.
#[derive(Clone)]
pub struct Config {
    inner: Arc<ConfigInner>,
}

struct ConfigInner {
    owner: String,
    driver: Arc<dyn StorageDriver>,
    defaults: DashMap<Category, Value>,
    custom_groups: DashMap<String, usize>,
    locks: LockRegistry,
}

impl Config {
    /// Create a store handle for `owner` over `driver`.
    pub fn new(owner: impl Into<String>, driver: Arc<dyn StorageDriver>) -> Self {
        Self {
            inner: Arc::new(ConfigInner {
                owner: owner.into(),
                driver,
                defaults: DashMap::new(),
                custom_groups: DashMap::new(),
                locks: LockRegistry::new(),
            }),
        }
    }

    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    /// The driver backing this store.
    pub fn driver(&self) -> Arc<dyn StorageDriver> {
        Arc::clone(&self.inner.driver)
    }

    // -----------------------------------------------------------------------
    // Schema registration
    // -----------------------------------------------------------------------

    /// Register default fields for the global scope. Calling again replaces
    /// the default map; stored data is untouched.
    pub fn register_global(&self, defaults: Value) -> ConfigResult<()> {
        self.register(Category::Global, defaults)
    }

    /// Register default fields for per-guild scopes.
    pub fn register_guild(&self, defaults: Value) -> ConfigResult<()> {
        self.register(Category::Guild, defaults)
    }

    /// Register default fields for per-user scopes.
    pub fn register_user(&self, defaults: Value) -> ConfigResult<()> {
        self.register(Category::User, defaults)
    }

    /// Register default fields for per-member (guild, user) scopes.
    pub fn register_member(&self, defaults: Value) -> ConfigResult<()> {
        self.register(Category::Member, defaults)
    }

    /// Declare a custom group and its key depth. Redeclaring with the same
    /// depth is a no-op; a different depth for a group that may already
    /// hold data is fatal, never coerced.
    pub fn init_custom(&self, name: impl Into<String>, depth: usize) -> ConfigResult<()> {
        let name = name.into();
        if let Some(existing) = self.inner.custom_groups.get(&name) {
            if *existing != depth {
                return Err(ConfigError::schema(format!(
                    "custom group `{name}` already declared with depth {}, got {depth}",
                    *existing
                )));
            }
            return Ok(());
        }
        self.inner.custom_groups.insert(name, depth);
        Ok(())
    }

    /// Register default fields for a declared custom group.
    pub fn register_custom(&self, name: &str, defaults: Value) -> ConfigResult<()> {
        if !self.inner.custom_groups.contains_key(name) {
            return Err(ConfigError::schema(format!(
                "custom group `{name}` must be declared via init_custom before registration"
            )));
        }
        self.register(Category::custom(name), defaults)
    }

    fn register(&self, category: Category, defaults: Value) -> ConfigResult<()> {
        if !defaults.is_object() {
            return Err(ConfigError::schema(format!(
                "defaults for {category} must be a mapping"
            )));
        }
        self.inner.defaults.insert(category, defaults);
        Ok(())
    }

    /// The custom groups declared on this store, as (name, depth) pairs.
    pub fn custom_groups(&self) -> HashMap<String, usize> {
        self.inner
            .custom_groups
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    fn depth(&self, category: &Category) -> ConfigResult<usize> {
        match category.builtin_depth() {
            Some(depth) => Ok(depth),
            None => self
                .inner
                .custom_groups
                .get(category.as_str())
                .map(|d| *d)
                .ok_or_else(|| {
                    ConfigError::schema(format!("custom group `{category}` is not declared"))
                }),
        }
    }

    // -----------------------------------------------------------------------
    // Scope accessors
    // -----------------------------------------------------------------------

    /// The owner-wide global scope.
    pub fn global(&self) -> Scope {
        self.scope(Category::Global, Vec::new())
    }

    /// The scope for one guild.
    pub fn guild(&self, guild_id: impl Into<String>) -> Scope {
        self.scope(Category::Guild, vec![guild_id.into()])
    }

    /// The scope for one user, independent of guild.
    pub fn user(&self, user_id: impl Into<String>) -> Scope {
        self.scope(Category::User, vec![user_id.into()])
    }

    /// The scope for one member: a (guild, user) pair.
    pub fn member(&self, guild_id: impl Into<String>, user_id: impl Into<String>) -> Scope {
        self.scope(Category::Member, vec![guild_id.into(), user_id.into()])
    }

    /// The partial scope covering every member row of one guild.
    ///
    /// Supports [`Scope::clear_scope`] (drops the whole sub-tree); field
    /// reads and writes require a full member scope and fail with
    /// `SchemaMismatch`.
    pub fn members_of(&self, guild_id: impl Into<String>) -> Scope {
        Scope {
            config: self.clone(),
            id: Identifier::prefix(self.owner(), Category::Member, vec![guild_id.into()], 2),
        }
    }

    /// The scope for one key path of a declared custom group.
    ///
    /// The number of keys must match the depth declared at
    /// [`init_custom`](Self::init_custom) exactly.
    pub fn custom<S: Into<String>>(
        &self,
        name: &str,
        keys: impl IntoIterator<Item = S>,
    ) -> ConfigResult<Scope> {
        let category = Category::custom(name);
        let depth = self.depth(&category)?;
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if keys.len() != depth {
            return Err(ConfigError::schema(format!(
                "custom group `{name}` takes {depth} keys, got {}",
                keys.len()
            )));
        }
        Ok(self.scope(category, keys))
    }

    fn scope(&self, category: Category, keys: Vec<String>) -> Scope {
        Scope {
            config: self.clone(),
            id: Identifier::exact(self.owner(), category, keys),
        }
    }

    // -----------------------------------------------------------------------
    // Bulk reads
    // -----------------------------------------------------------------------

    /// Every stored guild document, merged with the guild defaults and
    /// keyed by guild id. Guilds with no stored row are not materialized.
    pub async fn all_guilds(&self) -> ConfigResult<HashMap<String, Value>> {
        self.all_flat(Category::Guild).await
    }

    /// Every stored user document, merged with the user defaults.
    pub async fn all_users(&self) -> ConfigResult<HashMap<String, Value>> {
        self.all_flat(Category::User).await
    }

    /// Every stored member document, merged with the member defaults and
    /// grouped by guild id, then user id.
    pub async fn all_members(&self) -> ConfigResult<HashMap<String, HashMap<String, Value>>> {
        let stored = self.all_stored(&Category::Member).await?;
        let default = self.inner.defaults.get(&Category::Member).map(|d| d.value().clone());

        let mut grouped: HashMap<String, HashMap<String, Value>> = HashMap::new();
        for (joined, doc) in stored {
            let keys = split_key(&joined);
            let [guild, user] = keys.as_slice() else {
                return Err(ConfigError::schema(format!(
                    "member key path `{joined}` does not have depth 2"
                )));
            };
            grouped
                .entry(guild.clone())
                .or_default()
                .insert(user.clone(), apply_default(default.as_ref(), doc));
        }
        Ok(grouped)
    }

    /// Every stored document of a custom group, merged with the group's
    /// defaults and keyed by the escaped, `/`-joined key path.
    pub async fn all_custom(&self, name: &str) -> ConfigResult<HashMap<String, Value>> {
        let category = Category::custom(name);
        self.depth(&category)?;
        let stored = self.all_stored(&category).await?;
        let default = self.inner.defaults.get(&category).map(|d| d.value().clone());
        Ok(stored
            .into_iter()
            .map(|(joined, doc)| (joined, apply_default(default.as_ref(), doc)))
            .collect())
    }

    async fn all_flat(&self, category: Category) -> ConfigResult<HashMap<String, Value>> {
        let stored = self.all_stored(&category).await?;
        let default = self.inner.defaults.get(&category).map(|d| d.value().clone());
        Ok(stored
            .into_iter()
            .map(|(key, doc)| (unescape_key(&key), apply_default(default.as_ref(), doc)))
            .collect())
    }

    /// Raw stored documents for a category, keyed by remaining joined key
    /// path. An owner or category with no data yields an empty map.
    async fn all_stored(&self, category: &Category) -> ConfigResult<Map<String, Value>> {
        let depth = self.depth(category)?;
        let id = Identifier::new(self.owner(), category.clone(), Vec::new(), depth)?;
        match self.inner.driver.get(&id).await {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(ConfigError::schema(format!(
                "bulk read of {category} did not return a mapping"
            ))),
            Err(ConfigError::NotFound { .. }) => Ok(Map::new()),
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Clearing
    // -----------------------------------------------------------------------

    /// Remove every stored document in one category for this owner.
    #[instrument(skip(self), fields(owner = %self.owner()))]
    pub async fn clear_category(&self, category: &Category) -> ConfigResult<()> {
        self.inner
            .driver
            .clear_all(self.owner(), Some(category))
            .await
    }

    /// Remove all of this owner's stored data across every category.
    #[instrument(skip(self), fields(owner = %self.owner()))]
    pub async fn clear_all(&self) -> ConfigResult<()> {
        self.inner.driver.clear_all(self.owner(), None).await
    }

    // -----------------------------------------------------------------------
    // Merge plumbing
    // -----------------------------------------------------------------------

    /// Registered default subtree at a field path, if any.
    fn default_at(&self, category: &Category, fields: &[String]) -> Option<Value> {
        let defaults = self.inner.defaults.get(category)?;
        crate::value::get_path(&defaults, fields).cloned()
    }

    /// Resolve `id` to its merged value, reporting whether the result came
    /// entirely from defaults (no stored row).
    pub(crate) async fn merged_with_source(&self, id: &Identifier) -> ConfigResult<(Value, bool)> {
        let default = self.default_at(id.category(), id.fields());
        let stored = match self.inner.driver.get(id).await {
            Ok(value) => Some(value),
            Err(ConfigError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        match (stored, default) {
            (Some(stored), Some(default)) => Ok((merge_defaults(&default, stored), false)),
            (Some(stored), None) => Ok((stored, false)),
            (None, Some(default)) => Ok((default, true)),
            (None, None) => Err(ConfigError::NotFound {
                ident: id.to_string(),
            }),
        }
    }

    pub(crate) async fn acquire_scoped(&self, id: Identifier) -> ConfigResult<ScopedValue> {
        let guard = self.inner.locks.acquire(&id).await;
        // Read under the lock so the context starts from the committed
        // state of any previous holder.
        let (value, is_default) = self.merged_with_source(&id).await?;
        Ok(ScopedValue::new(
            self.driver(),
            id,
            value,
            is_default,
            guard,
        ))
    }
}

fn apply_default(default: Option<&Value>, stored: Value) -> Value {
    match default {
        Some(default) => merge_defaults(default, stored),
        None => stored,
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// One (category, key path) address within an owner's namespace.
#[derive(Clone)]
pub struct Scope {
    config: Config,
    id: Identifier,
}

impl Scope {
    /// The identifier this scope addresses.
    pub fn id(&self) -> &Identifier {
        &self.id
    }

    /// Read one field, merged with its registered default.
    pub async fn value(&self, field: &str) -> ConfigResult<Value> {
        self.get_attr([field]).await
    }

    /// Read a nested field path, merged with its registered default.
    pub async fn get_attr<S: Into<String>>(
        &self,
        fields: impl IntoIterator<Item = S>,
    ) -> ConfigResult<Value> {
        let id = self.id.clone().with_fields(fields)?;
        let (value, _) = self.config.merged_with_source(&id).await?;
        Ok(value)
    }

    /// Read the whole document at this scope, merged with defaults.
    pub async fn all(&self) -> ConfigResult<Value> {
        self.get_attr(Vec::<String>::new()).await
    }

    /// Write one field straight through to the driver.
    #[instrument(skip(self, value), fields(id = %self.id))]
    pub async fn set(&self, field: &str, value: Value) -> ConfigResult<()> {
        self.set_attr([field], value).await
    }

    /// Write a nested field path straight through to the driver.
    pub async fn set_attr<S: Into<String>>(
        &self,
        fields: impl IntoIterator<Item = S>,
        value: Value,
    ) -> ConfigResult<()> {
        let id = self.id.clone().with_fields(fields)?;
        self.config.inner.driver.set(&id, value).await
    }

    /// Acquire a mutation context for one field.
    ///
    /// Suspends while another context on the same identifier is open. The
    /// yielded value is the current merged value; nothing persists unless
    /// the context is committed.
    #[instrument(skip(self), fields(id = %self.id))]
    pub async fn scoped(&self, field: &str) -> ConfigResult<ScopedValue> {
        let id = self.id.clone().with_fields([field])?;
        self.config.acquire_scoped(id).await
    }

    /// Acquire a mutation context for the whole document at this scope.
    #[instrument(skip(self), fields(id = %self.id))]
    pub async fn scoped_all(&self) -> ConfigResult<ScopedValue> {
        self.config.acquire_scoped(self.id.clone()).await
    }

    /// Remove one stored field. Reads fall back to the default afterwards.
    #[instrument(skip(self), fields(id = %self.id))]
    pub async fn clear(&self, field: &str) -> ConfigResult<()> {
        let id = self.id.clone().with_fields([field])?;
        self.config.inner.driver.clear(&id).await
    }

    /// Remove every stored field at this scope's key path.
    #[instrument(skip(self), fields(id = %self.id))]
    pub async fn clear_scope(&self) -> ConfigResult<()> {
        self.config.inner.driver.clear(&self.id).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
