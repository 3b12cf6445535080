//! storehook - plugin runtime for multi-tenant storefronts.
//!
//! Usage:
//!   storehook install <DIR>               Register a plugin bundle
//!   storehook list                        List registered plugins
//!   storehook activate <ID>               Mark a plugin active
//!   storehook load [ID]                   Load one or every active plugin
//!   storehook hook <NAME> [JSON]...       Run a hook across loaded plugins
//!   storehook emit <NAME> <JSON>          Emit an event
//!   storehook data get <ID> <KEY>         Inspect plugin data
//!   storehook --help                      Show help

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Context, Result, bail, eyre};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use storehook_core::{PluginStatus, Registry};
use storehook_plugin::{Bundle, Dispatcher, PluginLoader, RuntimeConfig};
use storehook_sqlite::SqliteStore;

#[derive(Parser)]
#[command(
    name = "storehook",
    version,
    about = "Plugin runtime for multi-tenant storefronts",
    long_about = "storehook installs, loads and dispatches storefront plugins.\n\n\
                  Plugins live in a SQLite database; hooks and events run their \
                  Rhai handlers in priority order."
)]
struct Cli {
    /// Plugin database (defaults to the configured database)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Tenant whose overrides filter loading
    #[arg(long, global = true)]
    tenant: Option<String>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a plugin bundle directory containing plugin.toml
    Install {
        /// Bundle directory
        dir: PathBuf,
    },

    /// List registered plugins
    List,

    /// Mark a plugin active
    Activate { id: String },

    /// Mark a plugin inactive
    Deactivate { id: String },

    /// Switch a plugin on or off for one tenant
    Tenant {
        id: String,
        tenant: String,

        /// Switch the plugin off for the tenant
        #[arg(long, conflicts_with = "enable")]
        disable: bool,

        /// Switch the plugin back on for the tenant
        #[arg(long)]
        enable: bool,
    },

    /// Load one plugin, or every active plugin
    Load { id: Option<String> },

    /// Load active plugins and run a hook
    Hook {
        name: String,

        /// Hook arguments as JSON values
        args: Vec<String>,
    },

    /// Load active plugins and emit an event
    Emit {
        name: String,

        /// Event payload as JSON
        #[arg(default_value = "null")]
        data: String,
    },

    /// Read or write plugin data
    Data {
        #[command(subcommand)]
        action: DataAction,
    },
}

#[derive(Subcommand)]
enum DataAction {
    /// Print one entry
    Get { id: String, key: String },

    /// Store one entry
    Set {
        id: String,
        key: String,

        /// Value as JSON
        value: String,

        /// Advisory expiry, in seconds from now
        #[arg(long)]
        ttl: Option<i64>,
    },

    /// Delete one entry
    Delete { id: String, key: String },
}

fn initialize_tracing(verbose: u8) {
    let fallback_filter = match verbose {
        0 => "warn,plugin=info",
        1 => "info",
        2 => "storehook=debug,storehook_plugin=debug,storehook_sqlite=debug,plugin=debug,info",
        _ => "trace",
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback_filter.into()),
        )
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    initialize_tracing(cli.verbose);

    let mut config =
        RuntimeConfig::load_or_default(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(db) = cli.db {
        config = config.with_database(db);
    }
    if let Some(tenant) = cli.tenant {
        config = config.with_tenant(tenant);
    }

    let store = SqliteStore::open(&config.database)
        .with_context(|| format!("Failed to open {}", config.database.display()))?;
    let registry = Registry::new(Arc::new(store));

    match cli.command {
        Command::Install { dir } => {
            let report = Bundle::open(&dir)
                .and_then(|bundle| bundle.install(&registry))
                .with_context(|| format!("Failed to install {}", dir.display()))?;
            println!(
                "Installed {}: {} module(s), {} dependency(ies), {} hook(s), {} event(s)",
                report.plugin_id, report.modules, report.dependencies, report.hooks, report.events
            );
        }
        Command::List => run_list(&registry)?,
        Command::Activate { id } => set_status(&registry, &id, PluginStatus::Active)?,
        Command::Deactivate { id } => set_status(&registry, &id, PluginStatus::Inactive)?,
        Command::Tenant {
            id,
            tenant,
            disable,
            enable: _,
        } => {
            registry.set_tenant_override(&id, &tenant, !disable)?;
            println!(
                "{id} is {} for tenant {tenant}",
                if disable { "disabled" } else { "enabled" }
            );
        }
        Command::Load { id } => run_load(registry, config, id).await?,
        Command::Hook { name, args } => {
            let args = args
                .iter()
                .map(|arg| parse_json(arg))
                .collect::<Result<Vec<_>>>()?;
            let dispatcher = load_all(registry, config).await?;
            let outputs = dispatcher.execute_hook(&name, args).await;
            println!("{}", serde_json::to_string_pretty(&outputs)?);
        }
        Command::Emit { name, data } => {
            let data = parse_json(&data)?;
            let dispatcher = load_all(registry, config).await?;
            let summary = dispatcher.emit_event(&name, data).await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Data { action } => run_data(&registry, action)?,
    }

    Ok(())
}

fn parse_json(text: &str) -> Result<Value> {
    serde_json::from_str(text).with_context(|| format!("Invalid JSON: {text}"))
}

fn run_list(registry: &Registry) -> Result<()> {
    let plugins = registry.list_all()?;
    if plugins.is_empty() {
        println!("No plugins registered");
        return Ok(());
    }

    println!("{:<24} {:<10} {:<9} {:<10} NAME", "ID", "VERSION", "STATUS", "LEVEL");
    for plugin in plugins {
        println!(
            "{:<24} {:<10} {:<9} {:<10} {}",
            plugin.id, plugin.version, plugin.status, plugin.security_level, plugin.name
        );
    }
    Ok(())
}

fn set_status(registry: &Registry, id: &str, status: PluginStatus) -> Result<()> {
    if !registry.set_status(id, status)? {
        bail!("Plugin not found: {id}");
    }
    println!("{id} is now {status}");
    Ok(())
}

async fn run_load(registry: Registry, config: RuntimeConfig, id: Option<String>) -> Result<()> {
    let loader = PluginLoader::new(registry, config);

    if let Some(id) = id {
        let context = loader.load_plugin(&id).await?;
        println!(
            "Loaded {id}: {} hook(s), {} event(s)",
            context.hook_names().len(),
            context.event_names().len()
        );
        return Ok(());
    }

    let report = loader.load_all_plugins().await?;
    for id in &report.loaded {
        println!("loaded   {id}");
    }
    for id in &report.skipped {
        println!("skipped  {id}");
    }
    for (id, err) in &report.failed {
        println!("failed   {id}: {err}");
    }
    if !report.is_clean() {
        bail!("{} plugin(s) failed to load", report.failed.len());
    }
    Ok(())
}

async fn load_all(registry: Registry, config: RuntimeConfig) -> Result<Dispatcher> {
    let loader = Arc::new(PluginLoader::new(registry, config));
    let report = loader.load_all_plugins().await?;
    for (id, err) in &report.failed {
        eprintln!("warning: {id} not loaded: {err}");
    }
    Ok(Dispatcher::new(loader))
}

fn run_data(registry: &Registry, action: DataAction) -> Result<()> {
    match action {
        DataAction::Get { id, key } => match registry.get_data(&id, &key)? {
            Some(entry) => {
                println!("{}", serde_json::to_string_pretty(&entry.value)?);
                if let Some(at) = entry.expires_at {
                    eprintln!("expires at {at}");
                }
            }
            None => bail!("No entry {key} for {id}"),
        },
        DataAction::Set { id, key, value, ttl } => {
            let value = parse_json(&value)?;
            let expires_at = ttl.map(expiry_after).transpose()?;
            registry.set_data(&id, &key, value, expires_at)?;
        }
        DataAction::Delete { id, key } => {
            if !registry.delete_data(&id, &key)? {
                bail!("No entry {key} for {id}");
            }
        }
    }
    Ok(())
}

/// Expiry timestamp `secs` seconds from now.
fn expiry_after(secs: i64) -> Result<DateTime<Utc>> {
    TimeDelta::try_seconds(secs)
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .ok_or_else(|| eyre!("TTL of {secs}s is out of range"))
}
