//! # templar Lifecycle
//!
//! Builds cloud-image VM templates and keeps them up to date without breaking
//! the linked clones that depend on them.
//!
//! ## Flow
//!
//! ```text
//!  TemplateRegistry ──▶ Orchestrator ──▶ BatchReport
//!                            │
//!        ┌──────────┬────────┼───────────┬──────────────┐
//!        ▼          ▼        ▼           ▼              ▼
//!   ImageCache  Hypervisor  Device    BootConfig   LinkedClone
//!   (download)  (qm/pvesm)  Attacher  Repairer     Resolver/Converter
//! ```
//!
//! Every host-touching step sits behind a trait so the whole state machine
//! runs against the in-memory stand-ins in [`mock`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use templar_hypervisor::MockBackend;
//! use templar_lifecycle::mock::{MockDeviceTools, MockMounter, StaticImages};
//! use templar_lifecycle::{FixedDecisions, Orchestrator, TemplateRegistry};
//!
//! let orchestrator = Orchestrator::new(
//!     Arc::new(MockBackend::new()),
//!     Arc::new(StaticImages::new("/tmp/images")),
//!     Arc::new(MockDeviceTools::new()),
//!     Arc::new(MockMounter::new("/tmp/root")),
//!     Arc::new(FixedDecisions::assume_yes()),
//! );
//! let pool = orchestrator.resolve_storage(None).await?;
//! let report = orchestrator.run(TemplateRegistry::builtin().templates(), &pool).await;
//! ```

pub mod cache;
pub mod clones;
pub mod converter;
pub mod decision;
pub mod device;
pub mod error;
pub mod mock;
pub mod orchestrator;
pub mod registry;
pub mod repair;
pub mod report;

pub use cache::{CacheEntry, CacheSettings, ImageCache, ImageProvider};
pub use clones::{LinkedClone, LinkedCloneResolver};
pub use converter::{CloneConverter, ConversionReport};
pub use decision::{DecisionStrategy, FixedDecisions};
pub use device::{AttachSettings, DeviceAttacher, DeviceTools, HostDeviceTools};
pub use error::{AttachError, ConfigError, LifecycleError, Result};
pub use orchestrator::{Orchestrator, VmSettings};
pub use registry::{TemplateRegistry, TemplateSpec};
pub use repair::{BootConfigRepairer, HostMounter, Mounter, RepairReport, RepairSettings};
pub use report::{BatchReport, LeakKind, LeakedResource, LifecycleState, Outcome, TemplateReport};
