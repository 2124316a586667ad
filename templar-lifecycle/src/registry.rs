//! Template registry.
//!
//! Every template has a fixed VM id. The registry is the only place ids and
//! image sources are declared; nothing is inferred from the host.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use templar_hypervisor::VmId;

use crate::error::ConfigError;

/// Lowest VM id Proxmox hands out to guests.
pub const MIN_VM_ID: u32 = 100;

/// One template declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSpec {
    /// Template (and VM) name
    pub name: String,
    /// Fixed VM id
    pub vm_id: VmId,
    /// Download URL of the cloud image
    pub url: String,
    /// File name in the image cache
    pub image_filename: String,
    /// Expected SHA-256 of the image, hex encoded
    #[serde(default)]
    pub sha256: Option<String>,
}

impl TemplateSpec {
    pub fn new(name: &str, vm_id: u32, url: &str, image_filename: &str) -> Self {
        Self {
            name: name.to_string(),
            vm_id: VmId(vm_id),
            url: url.to_string(),
            image_filename: image_filename.to_string(),
            sha256: None,
        }
    }
}

/// Immutable table of templates, in processing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateRegistry {
    templates: Vec<TemplateSpec>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TemplateRegistry {
    /// Build and validate a registry.
    pub fn new(templates: Vec<TemplateSpec>) -> Result<Self, ConfigError> {
        let registry = Self { templates };
        registry.validate()?;
        Ok(registry)
    }

    /// Templates compiled into the binary.
    pub fn builtin() -> Self {
        Self {
            templates: vec![
                TemplateSpec::new(
                    "ubuntu-22.04-standard",
                    9000,
                    "https://cloud-images.ubuntu.com/jammy/current/jammy-server-cloudimg-amd64.img",
                    "jammy-server-cloudimg-amd64.img",
                ),
                TemplateSpec::new(
                    "ubuntu-24.04-standard",
                    9001,
                    "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img",
                    "noble-server-cloudimg-amd64.img",
                ),
                TemplateSpec::new(
                    "debian-12-standard",
                    9002,
                    "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-genericcloud-amd64.qcow2",
                    "debian-12-genericcloud-amd64.qcow2",
                ),
            ],
        }
    }

    /// Check names and ids are unique and every entry is complete.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        let mut ids: HashMap<VmId, &str> = HashMap::new();

        for spec in &self.templates {
            if spec.name.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    name: format!("#{}", spec.vm_id),
                    field: "name",
                });
            }
            if !names.insert(spec.name.as_str()) {
                return Err(ConfigError::DuplicateName(spec.name.clone()));
            }
            if spec.vm_id.0 < MIN_VM_ID {
                return Err(ConfigError::ReservedVmId {
                    name: spec.name.clone(),
                    vm_id: spec.vm_id,
                });
            }
            if let Some(first) = ids.insert(spec.vm_id, &spec.name) {
                return Err(ConfigError::DuplicateVmId {
                    vm_id: spec.vm_id,
                    first: first.to_string(),
                    second: spec.name.clone(),
                });
            }
            if spec.url.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    name: spec.name.clone(),
                    field: "url",
                });
            }
            if spec.image_filename.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    name: spec.name.clone(),
                    field: "image_filename",
                });
            }
        }
        Ok(())
    }

    pub fn templates(&self) -> &[TemplateSpec] {
        &self.templates
    }

    pub fn get(&self, name: &str) -> Option<&TemplateSpec> {
        self.templates.iter().find(|t| t.name == name)
    }

    /// Templates to process: all of them, or only the named ones in registry
    /// order.
    pub fn select(&self, only: &[String]) -> Result<Vec<TemplateSpec>, ConfigError> {
        if only.is_empty() {
            return Ok(self.templates.clone());
        }
        if let Some(unknown) = only.iter().find(|n| self.get(n).is_none()) {
            return Err(ConfigError::UnknownTemplate(unknown.clone()));
        }
        Ok(self
            .templates
            .iter()
            .filter(|t| only.contains(&t.name))
            .cloned()
            .collect())
    }
}
