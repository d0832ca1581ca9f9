// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Install and remove development CA certificates in the host trust stores,
//! keeping a registry of what was installed.
//!
//! ```rust,no_run
//! use vdcm::{perform_install, perform_uninstall, CertConfig};
//!
//! let config = CertConfig::new("/tmp/rootca.pem").with_name("local.dev");
//! let result = perform_install(&config);
//! println!("{}", serde_json::to_string(&result).unwrap_or_default());
//!
//! let result = perform_uninstall(&CertConfig::new("/tmp/rootca.pem"));
//! assert!(result.code == 0 || result.error.is_some());
//! ```

/// Settings, per-invocation configuration and file locations.
pub mod config;
/// Error types.
pub mod error;
/// Filesystem utilities.
pub mod fs;
/// Certificate fingerprints and naming.
pub mod identity;
/// Record of installed certificates.
pub mod registry;
/// Install and uninstall orchestration.
pub mod service;
/// System trust store drivers.
pub mod trust;

pub use config::{CertConfig, Paths, Settings};
pub use error::{Error, Result};
pub use identity::{
    default_name_from, fingerprint, nickname_for, CertificateIdentity, FALLBACK_NAME, MARKER,
};
pub use registry::{Registry, RegistryRecord};
pub use service::{
    perform_install, perform_uninstall, Context, InstallationService, Operation, OperationError,
    OperationResult, RemovalService,
};
pub use trust::{driver_for, CertKey, DriverOptions, Platform, TrustStoreDriver};
