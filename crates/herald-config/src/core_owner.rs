//! The platform core's own schema registration.
//!
//! The core owner holds process-wide settings (prefixes, embed policy,
//! help limits) and the persisted custom-group registry the migration
//! tool reads. Shared by the CLI and tests so there is exactly one
//! definition of the core schema.

use std::sync::Arc;

use serde_json::json;

use crate::driver::StorageDriver;
use crate::error::ConfigResult;
use crate::store::Config;

/// Owner name of the platform core. Migrations replay this owner first.
pub const CORE_OWNER: &str = "Core";

/// Build the core owner's store handle with its schema registered.
pub fn core_config(driver: Arc<dyn StorageDriver>) -> ConfigResult<Config> {
    let cfg = Config::new(CORE_OWNER, driver);

    cfg.register_global(json!({
        "prefix": [],
        "token": null,
        "locale": "en",
        "embeds": true,
        "color": 15158332,
        "fuzzy": false,
        "help__max_pages_in_guild": 2,
        "invite_public": false,
        "invite_perm": 0,
        "whitelist": [],
        "blacklist": [],
        "custom_groups": {},
    }))?;

    cfg.register_guild(json!({
        "prefix": [],
        "admin_role": null,
        "mod_role": null,
        "embeds": null,
        "ignored": false,
        "whitelist": [],
        "blacklist": [],
    }))?;

    cfg.register_user(json!({
        "embeds": null,
    }))?;

    Ok(cfg)
}
