//! Operator decisions.

use templar_hypervisor::{StoragePool, VmSummary};

use crate::clones::LinkedClone;
use crate::registry::TemplateSpec;

/// Answers the questions the orchestrator cannot decide on its own.
pub trait DecisionStrategy: Send + Sync {
    /// A VM already occupies the template's id. Destroy and rebuild it?
    fn should_update(&self, spec: &TemplateSpec, existing: &VmSummary) -> bool;

    /// Convert these linked clones to full clones so the template can go?
    fn should_convert_clones(&self, spec: &TemplateSpec, clones: &[LinkedClone]) -> bool;

    /// Use a pool whose layout could not be determined?
    fn confirm_unknown_storage(&self, pool: &StoragePool) -> bool;
}

/// Answers fixed up front, e.g. from command line flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedDecisions {
    pub update_existing: bool,
    pub convert_clones: bool,
    pub allow_unknown_storage: bool,
}

impl FixedDecisions {
    /// Say yes to everything.
    pub fn assume_yes() -> Self {
        Self {
            update_existing: true,
            convert_clones: true,
            allow_unknown_storage: true,
        }
    }

    /// Say no to everything.
    pub fn decline_all() -> Self {
        Self::default()
    }
}

impl DecisionStrategy for FixedDecisions {
    fn should_update(&self, _spec: &TemplateSpec, _existing: &VmSummary) -> bool {
        self.update_existing
    }

    fn should_convert_clones(&self, _spec: &TemplateSpec, _clones: &[LinkedClone]) -> bool {
        self.convert_clones
    }

    fn confirm_unknown_storage(&self, _pool: &StoragePool) -> bool {
        self.allow_unknown_storage
    }
}
