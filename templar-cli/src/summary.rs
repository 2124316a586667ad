//! Human readable output.

use std::fmt::Write;

use templar_hypervisor::{StoragePool, VmId};
use templar_lifecycle::{BatchReport, LinkedClone, Outcome, TemplateRegistry};

/// Render the batch report as a table followed by any leaked resources.
pub fn render_report(report: &BatchReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<28} {:>6}  {:<10} DETAIL", "TEMPLATE", "VMID", "STATUS");
    for template in &report.templates {
        let (status, detail) = match &template.outcome {
            Outcome::Templated { repair } if repair.is_noop() => ("templated", "boot config already clean".to_string()),
            Outcome::Templated { repair } => ("templated", format!("repaired {}", repair.files_changed.join(", "))),
            Outcome::Skipped { reason } => ("skipped", reason.clone()),
            Outcome::Failed { stage, error } => ("failed", format!("during {}: {}", stage, error)),
        };
        let _ = writeln!(
            out,
            "{:<28} {:>6}  {:<10} {}",
            template.name, template.vm_id.0, status, detail
        );
    }

    let (templated, skipped, failed) = report.counts();
    let _ = writeln!(out, "\n{} templated, {} skipped, {} failed", templated, skipped, failed);

    if !report.leaked.is_empty() {
        let _ = writeln!(out, "\nResources left behind (clean up manually):");
        for leak in &report.leaked {
            let _ = writeln!(out, "  {:<7} {}: {}", leak.kind.to_string(), leak.target, leak.cause);
        }
    }
    out
}

pub fn render_templates(registry: &TemplateRegistry) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<28} {:>6}  {:<40} URL", "TEMPLATE", "VMID", "IMAGE");
    for spec in registry.templates() {
        let _ = writeln!(out, "{:<28} {:>6}  {:<40} {}", spec.name, spec.vm_id.0, spec.image_filename, spec.url);
    }
    out
}

pub fn render_storage(pools: &[StoragePool], selected: Option<&StoragePool>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<20} {:<10} KIND", "POOL", "BACKEND");
    for pool in pools {
        let backend = pool.backend.map(|b| b.as_str()).unwrap_or("-");
        let _ = writeln!(out, "{:<20} {:<10} {}", pool.name, backend, pool.kind);
    }
    match selected {
        Some(pool) => {
            let _ = writeln!(out, "\nDefault pool for templates: {}", pool.name);
        }
        None => {
            let _ = writeln!(out, "\nNo pool qualifies as default; pass --storage");
        }
    }
    out
}

pub fn render_dependents(template: VmId, clones: &[LinkedClone]) -> String {
    if clones.is_empty() {
        return format!("Template {} has no linked clones\n", template);
    }
    let mut out = String::new();
    let _ = writeln!(out, "{:>6}  {:<24} {:<8} DISKS", "VMID", "NAME", "STATE");
    for clone in clones {
        let state = if clone.run_state.is_running() { "running" } else { "stopped" };
        let disks: Vec<String> = clone
            .disk_keys
            .iter()
            .map(|d| format!("{}@{}", d.key, d.pool))
            .collect();
        let _ = writeln!(out, "{:>6}  {:<24} {:<8} {}", clone.vm_id.0, clone.name, state, disks.join(" "));
    }
    out
}
