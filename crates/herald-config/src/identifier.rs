//! The identifier model: pure value types addressing one stored value.
//!
//! An [`Identifier`] names a value by (owner, category, primary key path,
//! field path). The owner partitions the namespace per registering
//! component, the [`Category`] fixes the primary-key depth, and the field
//! path addresses a location inside the stored document. Identifiers are
//! `Eq + Hash` and double as keys for the per-value lock registry.
//!
//! Primary-key components are escaped before joining so a caller-supplied
//! id containing `/` can never collide with the path separator.

use std::fmt;

use crate::error::{ConfigError, ConfigResult};

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// The scope category of a stored document.
///
/// Each category has a fixed primary-key depth: `Global` takes no keys,
/// `Guild` and `User` take one, `Member` takes two (guild id, user id), and
/// a `Custom` group takes whatever depth was declared at registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Category {
    Global,
    Guild,
    User,
    Member,
    Custom(String),
}

impl Category {
    /// Construct a custom category from a group name.
    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom(name.into())
    }

    /// The fixed key depth for built-in categories. Custom groups carry
    /// their depth in the registration, not in the category itself.
    pub fn builtin_depth(&self) -> Option<usize> {
        match self {
            Self::Global => Some(0),
            Self::Guild | Self::User => Some(1),
            Self::Member => Some(2),
            Self::Custom(_) => None,
        }
    }

    /// The document key this category uses in persisted layouts.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Global => "GLOBAL",
            Self::Guild => "GUILD",
            Self::User => "USER",
            Self::Member => "MEMBER",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve the key depth for a category name as it appears in a persisted
/// layout or export blob. Custom group depths come from the caller's
/// declarations; an undeclared custom name is a schema fault.
pub fn category_depth(
    name: &str,
    custom_groups: &std::collections::HashMap<String, usize>,
) -> ConfigResult<usize> {
    match name {
        "GLOBAL" => Ok(0),
        "GUILD" | "USER" => Ok(1),
        "MEMBER" => Ok(2),
        custom => custom_groups.get(custom).copied().ok_or_else(|| {
            ConfigError::schema(format!("custom group `{custom}` has no declared key depth"))
        }),
    }
}

// ---------------------------------------------------------------------------
// Key escaping
// ---------------------------------------------------------------------------

/// Escape a single primary-key component so it can be joined with `/`.
pub fn escape_key(component: &str) -> String {
    component.replace('%', "%25").replace('/', "%2F")
}

/// Reverse [`escape_key`].
pub fn unescape_key(component: &str) -> String {
    component.replace("%2F", "/").replace("%25", "%")
}

/// Join primary-key components into the flat document key, escaping each
/// component. An empty key path joins to the empty string.
pub fn join_key<S: AsRef<str>>(components: &[S]) -> String {
    components
        .iter()
        .map(|c| escape_key(c.as_ref()))
        .collect::<Vec<_>>()
        .join("/")
}

/// Split a flat document key back into unescaped components. The empty
/// string splits to an empty path.
pub fn split_key(joined: &str) -> Vec<String> {
    if joined.is_empty() {
        return Vec::new();
    }
    joined.split('/').map(unescape_key).collect()
}

// ---------------------------------------------------------------------------
// Identifier
// ---------------------------------------------------------------------------

/// Address of one value in the store.
///
/// `primary_keys` may be shorter than `key_depth`, in which case the
/// identifier addresses the whole sub-tree under that key prefix (used for
/// bulk reads and prefix clears). A field path is only meaningful when the
/// key path is at full depth.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    owner: String,
    category: Category,
    primary_keys: Vec<String>,
    fields: Vec<String>,
    key_depth: usize,
}

impl Identifier {
    /// Create an identifier addressing a key path within `category`.
    ///
    /// Fails with [`ConfigError::SchemaMismatch`] if more keys are supplied
    /// than the category's declared depth allows.
    pub fn new(
        owner: impl Into<String>,
        category: Category,
        primary_keys: Vec<String>,
        key_depth: usize,
    ) -> ConfigResult<Self> {
        if primary_keys.len() > key_depth {
            return Err(ConfigError::schema(format!(
                "category {category} takes at most {key_depth} primary keys, got {}",
                primary_keys.len()
            )));
        }
        Ok(Self {
            owner: owner.into(),
            category,
            primary_keys,
            fields: Vec::new(),
            key_depth,
        })
    }

    /// Construct an identifier whose key-path length is already known to
    /// match the declared depth. Used by the store's scope accessors, which
    /// validate depth against the registration before building identifiers.
    pub(crate) fn exact(
        owner: impl Into<String>,
        category: Category,
        primary_keys: Vec<String>,
    ) -> Self {
        let key_depth = primary_keys.len();
        Self {
            owner: owner.into(),
            category,
            primary_keys,
            fields: Vec::new(),
            key_depth,
        }
    }

    /// Construct a partial-depth identifier addressing the whole sub-tree
    /// under a key prefix. Callers must guarantee `primary_keys.len()` is
    /// at most `key_depth`.
    pub(crate) fn prefix(
        owner: impl Into<String>,
        category: Category,
        primary_keys: Vec<String>,
        key_depth: usize,
    ) -> Self {
        debug_assert!(primary_keys.len() <= key_depth);
        Self {
            owner: owner.into(),
            category,
            primary_keys,
            fields: Vec::new(),
            key_depth,
        }
    }

    /// Narrow this identifier to a field path inside the stored document.
    ///
    /// Only a full-depth identifier addresses a single document, so a field
    /// path on a partial key path is a schema fault.
    pub fn with_fields<S: Into<String>>(
        mut self,
        fields: impl IntoIterator<Item = S>,
    ) -> ConfigResult<Self> {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if !fields.is_empty() && !self.is_full_depth() {
            return Err(ConfigError::schema(format!(
                "field path requires a full key path: {} of {} keys given",
                self.primary_keys.len(),
                self.key_depth
            )));
        }
        self.fields = fields;
        Ok(self)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn category(&self) -> &Category {
        &self.category
    }

    pub fn primary_keys(&self) -> &[String] {
        &self.primary_keys
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Declared key depth of the category this identifier addresses.
    pub fn key_depth(&self) -> usize {
        self.key_depth
    }

    /// Whether the key path addresses exactly one document.
    pub fn is_full_depth(&self) -> bool {
        self.primary_keys.len() == self.key_depth
    }

    /// Key levels still missing below this identifier's key path.
    pub fn remaining_depth(&self) -> usize {
        self.key_depth - self.primary_keys.len()
    }

    /// The escaped, `/`-joined form of the key path used by the persisted
    /// layouts. Empty for a zero-depth (global) document.
    pub fn joined_key(&self) -> String {
        join_key(&self.primary_keys)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.owner, self.category, self.joined_key())?;
        if !self.fields.is_empty() {
            write!(f, ":{}", self.fields.join("."))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_depths() {
        assert_eq!(Category::Global.builtin_depth(), Some(0));
        assert_eq!(Category::Guild.builtin_depth(), Some(1));
        assert_eq!(Category::User.builtin_depth(), Some(1));
        assert_eq!(Category::Member.builtin_depth(), Some(2));
        assert_eq!(Category::custom("Sessions").builtin_depth(), None);
    }

    #[test]
    fn key_escaping_round_trips() {
        for raw in ["plain", "with/slash", "with%percent", "%2F", "a/b%c/d"] {
            assert_eq!(unescape_key(&escape_key(raw)), raw);
        }
    }

    #[test]
    fn escaped_keys_never_collide_with_separator() {
        let joined = join_key(&["a/b", "c"]);
        assert_eq!(joined, "a%2Fb/c");
        assert_eq!(split_key(&joined), vec!["a/b".to_string(), "c".to_string()]);
    }

    #[test]
    fn empty_key_path_joins_to_empty_string() {
        let empty: [&str; 0] = [];
        assert_eq!(join_key(&empty), "");
        assert!(split_key("").is_empty());
    }

    #[test]
    fn too_many_keys_is_a_schema_fault() {
        let result = Identifier::new(
            "Core",
            Category::Guild,
            vec!["g1".into(), "extra".into()],
            1,
        );
        assert!(matches!(result, Err(ConfigError::SchemaMismatch { .. })));
    }

    #[test]
    fn fields_require_full_depth() {
        let partial = Identifier::new("Core", Category::Member, vec!["g1".into()], 2).unwrap();
        let result = partial.with_fields(["balance"]);
        assert!(matches!(result, Err(ConfigError::SchemaMismatch { .. })));

        let full = Identifier::new(
            "Core",
            Category::Member,
            vec!["g1".into(), "u1".into()],
            2,
        )
        .unwrap()
        .with_fields(["balance"])
        .unwrap();
        assert!(full.is_full_depth());
        assert_eq!(full.fields(), ["balance"]);
    }

    #[test]
    fn category_depth_resolution() {
        let mut groups = std::collections::HashMap::new();
        groups.insert("Sessions".to_string(), 2usize);

        assert_eq!(category_depth("GLOBAL", &groups).unwrap(), 0);
        assert_eq!(category_depth("MEMBER", &groups).unwrap(), 2);
        assert_eq!(category_depth("Sessions", &groups).unwrap(), 2);
        assert!(matches!(
            category_depth("Unknown", &groups),
            Err(ConfigError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn display_includes_fields() {
        let id = Identifier::new("Bank", Category::Member, vec!["g1".into(), "u1".into()], 2)
            .unwrap()
            .with_fields(["balance"])
            .unwrap();
        assert_eq!(id.to_string(), "Bank:MEMBER:g1/u1:balance");
    }
}
