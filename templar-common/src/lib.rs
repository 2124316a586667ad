//! # templar Common
//!
//! Shared utilities for the templar crates.
//!
//! ## Logging
//!
//! ```rust,no_run
//! use templar_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(template = "ubuntu-24.04-standard", "Provisioning template");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, LogFormat};
