//! # herald-config
//!
//! Scoped configuration store for the Herald platform: a hierarchical,
//! identifier-addressed persistence layer that every other subsystem uses
//! as its single source of truth.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Config (per owner: defaults, scopes, locks) │
//! ├──────────────────────────────────────────────┤
//! │  Scope / ScopedValue (read-merge / RMW)      │
//! ├──────────────────────────────────────────────┤
//! │  StorageDriver (trait)                       │
//! │    JsonDriver   — file per owner, atomic     │
//! │    CouchDriver  — database per owner, HTTP   │
//! ├──────────────────────────────────────────────┤
//! │  Migrator — export/import between drivers    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use herald_config::{Config, JsonDriver};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let driver = Arc::new(JsonDriver::new("data"));
//! let cfg = Config::new("Bank", driver);
//! cfg.register_member(json!({"balance": 0}))?;
//!
//! let account = cfg.member("guild-1", "user-1");
//! let mut ctx = account.scoped("balance").await?;
//! let balance = ctx.value().as_u64().unwrap_or(0);
//! ctx.replace(json!(balance + 10));
//! ctx.commit().await?;
//! ```

pub mod core_owner;
pub mod driver;
pub mod error;
pub mod identifier;
pub mod migration;
pub mod scoped;
pub mod store;
pub mod value;

// ── re-exports ───────────────────────────────────────────────────────

pub use core_owner::{CORE_OWNER, core_config};
pub use driver::{
    BackendType, CouchDriver, DriverConfig, ExportBlob, JsonDriver, StorageDriver, build_driver,
};
pub use error::{ConfigError, ConfigResult};
pub use identifier::{Category, Identifier};
pub use migration::{MigrationReport, Migrator, load_custom_groups, record_custom_groups};
pub use scoped::ScopedValue;
pub use store::{Config, Scope};
