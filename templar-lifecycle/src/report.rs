//! Batch results.
//!
//! The orchestrator threads one [`BatchReport`] through the template loop and
//! hands it back to the caller; nothing about a run is kept in shared state.

use std::fmt;

use serde::Serialize;

use templar_hypervisor::VmId;

use crate::repair::RepairReport;

/// Lifecycle state of a template within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Absent,
    Importing,
    Repairing,
    Templated,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Absent => "absent",
            LifecycleState::Importing => "importing",
            LifecycleState::Repairing => "repairing",
            LifecycleState::Templated => "templated",
            LifecycleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a template's run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Outcome {
    /// Built and converted. `repair` describes what the boot repair changed.
    Templated { repair: RepairReport },
    /// Left untouched on purpose.
    Skipped { reason: String },
    /// Failed while in `stage`.
    Failed { stage: LifecycleState, error: String },
}

/// Result for one template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateReport {
    pub name: String,
    pub vm_id: VmId,
    pub outcome: Outcome,
}

impl TemplateReport {
    /// Final lifecycle state; skipped templates stay where they were.
    pub fn final_state(&self) -> Option<LifecycleState> {
        match self.outcome {
            Outcome::Templated { .. } => Some(LifecycleState::Templated),
            Outcome::Failed { .. } => Some(LifecycleState::Failed),
            Outcome::Skipped { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, Outcome::Failed { .. })
    }
}

/// What kind of host resource could not be cleaned up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeakKind {
    /// Loop, NBD or device-mapper attachment
    Device,
    /// Mounted root filesystem
    Mount,
    /// Partially created VM
    Vm,
}

impl fmt::Display for LeakKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LeakKind::Device => "device",
            LeakKind::Mount => "mount",
            LeakKind::Vm => "vm",
        };
        f.write_str(s)
    }
}

/// A resource left behind by a failed cleanup step. Needs operator attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakedResource {
    pub kind: LeakKind,
    pub target: String,
    pub cause: String,
}

impl LeakedResource {
    pub fn new(kind: LeakKind, target: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self {
            kind,
            target: target.into(),
            cause: cause.to_string(),
        }
    }
}

/// Accumulated results of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub templates: Vec<TemplateReport>,
    pub leaked: Vec<LeakedResource>,
}

impl BatchReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, report: TemplateReport) {
        self.templates.push(report);
    }

    /// True if any template ended `Failed`.
    pub fn has_failures(&self) -> bool {
        self.templates.iter().any(TemplateReport::is_failed)
    }

    /// Report for a template by name.
    pub fn get(&self, name: &str) -> Option<&TemplateReport> {
        self.templates.iter().find(|t| t.name == name)
    }

    /// `(templated, skipped, failed)` counts.
    pub fn counts(&self) -> (usize, usize, usize) {
        self.templates.iter().fold((0, 0, 0), |(t, s, f), r| match r.outcome {
            Outcome::Templated { .. } => (t + 1, s, f),
            Outcome::Skipped { .. } => (t, s + 1, f),
            Outcome::Failed { .. } => (t, s, f + 1),
        })
    }
}
