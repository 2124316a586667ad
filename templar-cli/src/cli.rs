//! Command-line argument parsing.

use clap::{Args as ClapArgs, Parser, Subcommand};

/// templar - VM template lifecycle for Proxmox hosts
#[derive(Parser, Debug)]
#[command(name = "templar")]
#[command(about = "templar - build and update cloud-image VM templates")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Development mode: in-memory hypervisor, no devices or mounts touched
    #[arg(long, global = true)]
    pub dev: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build missing templates and update existing ones
    Provision(ProvisionArgs),

    /// Print the configured template catalog
    ListTemplates,

    /// Print storage pools, their resolved kinds and the default pool
    Storage,

    /// Print the linked clones of a template
    Dependents {
        /// VM id of the template
        vm_id: u32,
    },
}

#[derive(ClapArgs, Debug, Default)]
pub struct ProvisionArgs {
    /// Only process these templates (repeatable)
    #[arg(long = "only", value_name = "NAME")]
    pub only: Vec<String>,

    /// Storage pool for template disks (auto-selected if not set)
    #[arg(long, value_name = "POOL")]
    pub storage: Option<String>,

    /// Replace existing templates without asking
    #[arg(short, long)]
    pub yes: bool,

    /// Convert linked clones to full clones without asking
    #[arg(long, conflicts_with = "no_convert_clones")]
    pub convert_clones: bool,

    /// Never convert linked clones; templates with clones are skipped
    #[arg(long)]
    pub no_convert_clones: bool,

    /// Accept a storage pool whose layout cannot be determined
    #[arg(long)]
    pub allow_unknown_storage: bool,

    /// Print the batch report as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

impl ProvisionArgs {
    /// Fixed answer for clone conversion, if a flag gave one.
    pub fn convert_answer(&self) -> Option<bool> {
        if self.convert_clones {
            Some(true)
        } else if self.no_convert_clones {
            Some(false)
        } else {
            None
        }
    }
}
