//! # templar
//!
//! Builds cloud-image VM templates on a Proxmox host and keeps them current
//! without breaking the linked clones created from them.
//!
//! ## Usage
//! ```bash
//! templar provision --storage local-lvm
//! templar --config /etc/templar/templar.yaml provision --only ubuntu-24.04-standard --yes
//! templar dependents 9000
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use templar_common::LogFormat;
use templar_hypervisor::{StorageResolver, VmId};
use templar_lifecycle::{LinkedCloneResolver, Orchestrator};

mod cli;
mod config;
mod host;
mod prompt;
mod summary;

use cli::{Args, Command, ProvisionArgs};
use config::{Config, DEFAULT_CONFIG_PATH};
use host::Host;
use prompt::PromptDecisions;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let format = if args.json_logs { LogFormat::Json } else { LogFormat::Pretty };
    format.init(&args.log_level)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting templar");

    let config = load_config(&args)?.with_cli_overrides(&args);
    let host = Host::from_config(&config)?;

    match &args.command {
        Command::Provision(provision) => run_provision(&config, &host, provision).await,
        Command::ListTemplates => {
            print!("{}", summary::render_templates(&config.templates));
            Ok(ExitCode::SUCCESS)
        }
        Command::Storage => {
            let resolver = StorageResolver::new(
                host.client.list_storage().await.context("Failed to list storage")?,
            );
            let selected = resolver.auto_select();
            print!("{}", summary::render_storage(&resolver.pools(), selected.as_ref()));
            Ok(ExitCode::SUCCESS)
        }
        Command::Dependents { vm_id } => {
            let template = VmId(*vm_id);
            let clones = LinkedCloneResolver::new(host.client.clone())
                .resolve(template)
                .await
                .with_context(|| format!("Failed to resolve linked clones of {}", template))?;
            print!("{}", summary::render_dependents(template, &clones));
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Load the explicit config file, or the default one if it exists.
fn load_config(args: &Args) -> Result<Config> {
    match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => {
                info!(config_path = %config_path, "Configuration loaded");
                Ok(cfg)
            }
            Err(e) => {
                error!(error = %e, path = %config_path, "Failed to load configuration");
                Err(e)
            }
        },
        None if std::path::Path::new(DEFAULT_CONFIG_PATH).exists() => {
            let cfg = Config::load(DEFAULT_CONFIG_PATH)?;
            info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
            Ok(cfg)
        }
        None => {
            info!("No config file found, using CLI arguments and defaults");
            Ok(Config::default())
        }
    }
}

async fn run_provision(config: &Config, host: &Host, args: &ProvisionArgs) -> Result<ExitCode> {
    let templates = config
        .templates
        .select(&args.only)
        .context("Invalid template selection")?;

    let decisions = PromptDecisions {
        update_existing: args.yes.then_some(true),
        convert_clones: args.convert_answer(),
        allow_unknown_storage: args.allow_unknown_storage.then_some(true),
    };

    let orchestrator = Orchestrator::new(
        host.client.clone(),
        host.images.clone(),
        host.tools.clone(),
        host.mounter.clone(),
        Arc::new(decisions),
    )
    .with_vm_settings(config.vm.clone())
    .with_attach_settings(config.attach.clone())
    .with_repair_settings(config.repair.clone());

    let pool = orchestrator
        .resolve_storage(config.storage.pool.as_deref())
        .await
        .context("Failed to resolve storage pool")?;

    info!(templates = templates.len(), pool = %pool.name, "Provisioning templates");
    let report = orchestrator.run(&templates, &pool).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", summary::render_report(&report));
    }

    if report.has_failures() {
        error!("One or more templates failed");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
