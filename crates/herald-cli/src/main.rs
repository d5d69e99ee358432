//! CLI entry point for Herald instance management and backend migration.
//!
//! Provides the `herald` command with subcommands for listing and
//! registering instances and for converting an instance's stored data
//! between storage backends.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use herald_config::{
    BackendType, CouchDriver, JsonDriver, Migrator, StorageDriver, core_config,
    load_custom_groups,
};

mod instances;

use instances::{InstanceEntry, InstanceRegistry};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Herald — instance registry and storage migration.
#[derive(Parser)]
#[command(
    name = "herald",
    version,
    about = "Herald instance registry and storage migration",
    long_about = "Manage named Herald instances and migrate all of an instance's stored \
                  data between storage backends (json files or a CouchDB-compatible server)."
)]
struct Cli {
    /// Override the instance registry file location.
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered instances.
    Instances,

    /// Register a new instance (or replace an existing entry).
    Register {
        /// Instance name.
        name: String,

        /// Storage backend the instance uses.
        #[arg(long, default_value = "json")]
        backend: BackendType,

        /// Data directory for the instance.
        #[arg(long)]
        data_path: PathBuf,

        /// Server URL for the couch backend.
        #[arg(long)]
        couch_url: Option<String>,

        /// Database-name prefix for the couch backend.
        #[arg(long)]
        couch_prefix: Option<String>,
    },

    /// Migrate all of an instance's stored data to another backend.
    Convert {
        /// Instance name.
        name: String,

        /// Target backend (`json` or `couch`).
        target: BackendType,

        /// Server URL when the target is couch.
        #[arg(long)]
        couch_url: Option<String>,

        /// Database-name prefix when the target is couch.
        #[arg(long)]
        couch_prefix: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info");

    let cli = Cli::parse();
    let registry_path = match cli.registry {
        Some(path) => path,
        None => InstanceRegistry::default_path()?,
    };

    match cli.command {
        Commands::Instances => cmd_instances(&registry_path),
        Commands::Register {
            name,
            backend,
            data_path,
            couch_url,
            couch_prefix,
        } => cmd_register(&registry_path, name, backend, data_path, couch_url, couch_prefix),
        Commands::Convert {
            name,
            target,
            couch_url,
            couch_prefix,
        } => cmd_convert(&registry_path, &name, target, couch_url, couch_prefix).await,
    }
}

fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// ---------------------------------------------------------------------------
// Subcommand: instances
// ---------------------------------------------------------------------------

fn cmd_instances(registry_path: &std::path::Path) -> Result<()> {
    let registry = InstanceRegistry::load(registry_path)?;
    if registry.is_empty() {
        println!("no instances registered");
        return Ok(());
    }
    for (name, entry) in registry.iter() {
        println!("{name}: {} ({})", entry.backend, entry.data_path.display());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: register
// ---------------------------------------------------------------------------

fn cmd_register(
    registry_path: &std::path::Path,
    name: String,
    backend: BackendType,
    data_path: PathBuf,
    couch_url: Option<String>,
    couch_prefix: Option<String>,
) -> Result<()> {
    if backend == BackendType::Couch && couch_url.is_none() {
        bail!("--couch-url is required for the couch backend");
    }

    let mut registry = InstanceRegistry::load(registry_path)?;
    registry.insert(
        name.clone(),
        InstanceEntry {
            backend,
            data_path,
            couch_url,
            couch_prefix,
        },
    );
    registry.save(registry_path)?;
    info!(instance = %name, backend = %backend, "instance registered");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: convert
// ---------------------------------------------------------------------------

async fn cmd_convert(
    registry_path: &std::path::Path,
    name: &str,
    target_backend: BackendType,
    couch_url: Option<String>,
    couch_prefix: Option<String>,
) -> Result<()> {
    let mut registry = InstanceRegistry::load(registry_path)?;
    let entry = registry
        .get(name)
        .with_context(|| format!("unknown instance `{name}`"))?
        .clone();

    if entry.backend == target_backend {
        bail!("instance `{name}` already uses the {target_backend} backend");
    }

    // 1. Open the source backend and discover its owners.
    let (source, owners) = open_with_owners(
        entry.backend,
        &entry.data_path,
        entry.couch_url.as_deref(),
        entry.couch_prefix.as_deref(),
    )
    .await
    .context("failed to open the source backend")?;
    info!(owners = owners.len(), "source backend opened");

    // 2. Open the target backend.
    let target = open_driver(
        target_backend,
        &entry.data_path,
        couch_url.as_deref(),
        couch_prefix.as_deref(),
    )
    .context("failed to open the target backend")?;

    // 3. Custom-group declarations are recorded under the core owner;
    //    the target needs them to reconcile declared key depths.
    let core = core_config(Arc::clone(&source))?;
    let custom_groups = load_custom_groups(&core)
        .await
        .context("failed to read the custom-group registry")?;

    // 4. Replay every owner, core first.
    let report = Migrator::new(source, target)
        .migrate(&owners, &custom_groups)
        .await;
    info!(
        migrated = report.migrated.len(),
        failed = report.failed.len(),
        "migration finished"
    );

    if !report.is_success() {
        for (owner, error) in &report.failed {
            warn!(owner = %owner, error = %error, "owner left unmigrated");
        }
        bail!(
            "migration failed for {} owner(s): {}; re-run convert after fixing the cause",
            report.failed.len(),
            report
                .failed
                .iter()
                .map(|(owner, _)| owner.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    // 5. Point the instance at its new backend.
    registry.insert(
        name.to_string(),
        InstanceEntry {
            backend: target_backend,
            data_path: entry.data_path,
            couch_url: couch_url.or(entry.couch_url),
            couch_prefix: couch_prefix.or(entry.couch_prefix),
        },
    );
    registry.save(registry_path)?;
    info!(instance = %name, backend = %target_backend, "instance converted");
    Ok(())
}

// ---------------------------------------------------------------------------
// Driver construction
// ---------------------------------------------------------------------------

fn open_driver(
    backend: BackendType,
    data_path: &std::path::Path,
    couch_url: Option<&str>,
    couch_prefix: Option<&str>,
) -> Result<Arc<dyn StorageDriver>> {
    match backend {
        BackendType::Json => Ok(Arc::new(JsonDriver::new(data_path))),
        BackendType::Couch => {
            let url = couch_url.context("--couch-url is required for the couch backend")?;
            let url = Url::parse(url).with_context(|| format!("invalid couch url `{url}`"))?;
            Ok(Arc::new(CouchDriver::new(
                url,
                couch_prefix.unwrap_or("herald"),
            )))
        }
    }
}

/// Open a backend and enumerate the owners that hold data in it.
async fn open_with_owners(
    backend: BackendType,
    data_path: &std::path::Path,
    couch_url: Option<&str>,
    couch_prefix: Option<&str>,
) -> Result<(Arc<dyn StorageDriver>, Vec<String>)> {
    match backend {
        BackendType::Json => {
            let driver = JsonDriver::new(data_path);
            let owners = driver.list_owners().await?;
            Ok((Arc::new(driver), owners))
        }
        BackendType::Couch => {
            let url = couch_url.context("instance has no couch url on record")?;
            let url = Url::parse(url).with_context(|| format!("invalid couch url `{url}`"))?;
            let driver = CouchDriver::new(url, couch_prefix.unwrap_or("herald"));
            let owners = driver.list_owners().await?;
            Ok((Arc::new(driver), owners))
        }
    }
}
