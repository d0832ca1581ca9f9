// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Install and uninstall orchestration.
//!
//! Both operations validate their input, consult the registry, dispatch to
//! the trust-store driver for the host platform and report the outcome as an
//! [`OperationResult`]. Nothing here panics or returns `Err`; every failure
//! becomes a result with a stable code and error key.

use crate::config::{CertConfig, Paths, Settings};
use crate::error::Error;
use crate::fs::normalize_path;
use crate::identity::{default_name_from, fingerprint, is_fingerprint, nickname_for};
use crate::registry::{Registry, RegistryRecord};
use crate::trust::{
    driver_for, CertKey, CommandRunner, DriverOptions, Platform, SystemRunner, TrustStoreDriver,
};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Install,
    Uninstall,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Install => f.write_str("install"),
            Operation::Uninstall => f.write_str("uninstall"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationError {
    InvalidPath,
    InvalidCertificate,
    AlreadyPresent,
    UnsupportedOs,
    InstallFailed,
    NotFoundForRemoval,
    RemoveFailed,
    /// The trust store was changed but the registry could not record it
    RegistryWriteFailed(Operation),
}

impl OperationError {
    pub fn code(&self) -> i32 {
        match self {
            OperationError::InvalidPath
            | OperationError::InvalidCertificate
            | OperationError::AlreadyPresent
            | OperationError::NotFoundForRemoval => 1,
            OperationError::UnsupportedOs => 2,
            OperationError::InstallFailed => 3,
            OperationError::RemoveFailed => 4,
            OperationError::RegistryWriteFailed(Operation::Install) => 3,
            OperationError::RegistryWriteFailed(Operation::Uninstall) => 4,
        }
    }

    /// Stable machine-readable key, also used to look up messages.
    pub fn key(&self) -> &'static str {
        match self {
            OperationError::InvalidPath => "invalid_path",
            OperationError::InvalidCertificate => "invalid_certificate",
            OperationError::AlreadyPresent => "already_present",
            OperationError::UnsupportedOs => "os_unsupported",
            OperationError::InstallFailed => "install_failed",
            OperationError::NotFoundForRemoval => "not_found_for_remove",
            OperationError::RemoveFailed => "remove_failed",
            OperationError::RegistryWriteFailed(_) => "registry_write_failed",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            OperationError::InvalidPath => "Certificate file not found",
            OperationError::InvalidCertificate => "File is not a valid X.509 certificate",
            OperationError::AlreadyPresent => "Certificate is already installed",
            OperationError::UnsupportedOs => "This operating system is not supported",
            OperationError::InstallFailed => "Failed to install the certificate",
            OperationError::NotFoundForRemoval => "Certificate is not managed by vdcm",
            OperationError::RemoveFailed => "Failed to remove the certificate",
            OperationError::RegistryWriteFailed(_) => "Could not update the certificate registry",
        }
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallData {
    pub os: Platform,
    pub cert: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationResult {
    pub code: i32,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<InstallData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    #[serde(skip)]
    pub failure: Option<OperationError>,
}

impl OperationResult {
    pub fn installed(os: Platform, cert: impl Into<String>) -> Self {
        Self {
            code: 0,
            status: Status::Success,
            data: Some(InstallData {
                os,
                cert: cert.into(),
            }),
            error: None,
            failure: None,
        }
    }

    pub fn removed() -> Self {
        Self {
            code: 0,
            status: Status::Success,
            data: None,
            error: None,
            failure: None,
        }
    }

    pub fn failed(error: OperationError) -> Self {
        Self {
            code: error.code(),
            status: Status::Error,
            data: None,
            error: Some(error.key()),
            failure: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

impl From<OperationError> for OperationResult {
    fn from(error: OperationError) -> Self {
        Self::failed(error)
    }
}

type Outcome = std::result::Result<OperationResult, OperationError>;

/// Builds the trust-store driver for a platform.
pub type DriverFactory =
    dyn Fn(Platform, DriverOptions) -> Box<dyn TrustStoreDriver> + Send + Sync;

/// What both services need: the registry, the host platform and a way to
/// reach its trust store.
#[derive(Clone)]
pub struct Context {
    registry: Registry,
    platform: Option<Platform>,
    drivers: Arc<DriverFactory>,
}

impl Context {
    pub fn new(registry: Registry, platform: Option<Platform>, drivers: Arc<DriverFactory>) -> Self {
        Self {
            registry,
            platform,
            drivers,
        }
    }

    /// Real registry, detected platform and drivers backed by real commands.
    pub fn system(paths: &Paths, settings: &Settings) -> Self {
        let runner: Arc<dyn CommandRunner> =
            Arc::new(SystemRunner::new(settings.command_timeout()));
        let drivers: Arc<DriverFactory> =
            Arc::new(move |platform: Platform, options: DriverOptions| {
                driver_for(platform, options, runner.clone())
            });
        Self::new(Registry::open(paths), Platform::detect(), drivers)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn platform(&self) -> Option<Platform> {
        self.platform
    }

    fn driver(
        &self,
        config: &CertConfig,
    ) -> std::result::Result<(Platform, Box<dyn TrustStoreDriver>), OperationError> {
        let platform = self.platform.ok_or(OperationError::UnsupportedOs)?;
        let options = DriverOptions {
            manage_nss_browsers: config.manage_nss_browsers,
            manage_firefox: config.manage_firefox,
        };
        Ok((platform, (self.drivers)(platform, options)))
    }
}

pub struct InstallationService {
    ctx: Context,
}

impl InstallationService {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    pub fn install(&self, config: &CertConfig) -> OperationResult {
        match self.try_install(config) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(path = %config.cert_path.display(), error = e.key(), "install failed");
                e.into()
            }
        }
    }

    fn try_install(&self, config: &CertConfig) -> Outcome {
        let path = normalize_path(&config.cert_path);
        if config.cert_path.as_os_str().is_empty() || !path.is_file() {
            return Err(OperationError::InvalidPath);
        }

        let name = config
            .explicit_name()
            .map(String::from)
            .unwrap_or_else(|| default_name_from(&path));

        let fp = fingerprint(&path).map_err(|e| match e {
            Error::ReadFile { .. } => OperationError::InvalidPath,
            other => {
                tracing::debug!(error = %other, "certificate rejected");
                OperationError::InvalidCertificate
            }
        })?;

        if self.ctx.registry.contains(&fp) {
            return Err(OperationError::AlreadyPresent);
        }

        let (platform, driver) = self.ctx.driver(config)?;
        let key = CertKey {
            fingerprint: &fp,
            name: &name,
        };

        match driver.lookup(&key) {
            Some(true) => {
                tracing::info!(fingerprint = %fp, store = driver.name(), "certificate already in trust store");
                return Err(OperationError::AlreadyPresent);
            }
            Some(false) => {}
            None => {
                tracing::warn!(store = driver.name(), "existence check failed, treating as not installed");
            }
        }

        if !driver.install(&path, &name) {
            return Err(OperationError::InstallFailed);
        }

        let record = RegistryRecord {
            path: path.clone(),
            name: name.clone(),
            nickname: nickname_for(&name),
            os: platform.as_str().to_string(),
        };
        if let Err(e) = self.ctx.registry.track(&fp, record) {
            tracing::error!(error = %e, fingerprint = %fp, "certificate installed but not recorded");
            return Err(OperationError::RegistryWriteFailed(Operation::Install));
        }

        tracing::info!(name = %name, fingerprint = %fp, os = %platform, "certificate installed");
        Ok(OperationResult::installed(platform, name))
    }
}

pub struct RemovalService {
    ctx: Context,
}

impl RemovalService {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    pub fn uninstall(&self, config: &CertConfig) -> OperationResult {
        match self.try_uninstall(config) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(cert = %config.cert_path.display(), error = e.key(), "uninstall failed");
                e.into()
            }
        }
    }

    /// The tracked record `target` refers to: a recorded path, a tracked
    /// fingerprint, or a certificate file whose fingerprint is tracked.
    pub fn resolve(&self, target: &Path) -> Option<(String, RegistryRecord)> {
        let registry = &self.ctx.registry;

        if let Some(found) = registry.find_by_path(target) {
            return Some(found);
        }

        if let Some(candidate) = target.to_str().filter(|s| is_fingerprint(s)) {
            let fp = candidate.to_uppercase();
            if let Some(record) = registry.get(&fp) {
                return Some((fp, record));
            }
        }

        let path = normalize_path(target);
        if path.is_file() {
            if let Ok(fp) = fingerprint(&path) {
                if let Some(record) = registry.get(&fp) {
                    return Some((fp, record));
                }
            }
        }

        None
    }

    fn try_uninstall(&self, config: &CertConfig) -> Outcome {
        let (fp, record) = self
            .resolve(&config.cert_path)
            .ok_or(OperationError::NotFoundForRemoval)?;

        let (_, driver) = self.ctx.driver(config)?;
        let key = CertKey {
            fingerprint: &fp,
            name: &record.name,
        };

        if !driver.remove(&key) {
            return Err(OperationError::RemoveFailed);
        }

        if let Err(e) = self.ctx.registry.untrack(&fp) {
            tracing::error!(error = %e, fingerprint = %fp, "certificate removed but registry not updated");
            return Err(OperationError::RegistryWriteFailed(Operation::Uninstall));
        }

        tracing::info!(name = %record.name, fingerprint = %fp, "certificate uninstalled");
        Ok(OperationResult::removed())
    }
}

/// Context for this machine, falling back to default settings when
/// `config.toml` is unusable.
fn system_context() -> Option<Context> {
    let paths = match Paths::new() {
        Ok(paths) => paths,
        Err(e) => {
            tracing::error!(error = %e, "cannot locate the vdcm directory");
            return None;
        }
    };
    let settings = paths.load_settings().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "ignoring invalid config.toml");
        Settings::default()
    });
    Some(Context::system(&paths, &settings))
}

/// Install the certificate described by `config` on this machine.
pub fn perform_install(config: &CertConfig) -> OperationResult {
    match system_context() {
        Some(ctx) => InstallationService::new(ctx).install(config),
        None => OperationError::RegistryWriteFailed(Operation::Install).into(),
    }
}

/// Uninstall the certificate described by `config` from this machine.
pub fn perform_uninstall(config: &CertConfig) -> OperationResult {
    match system_context() {
        Some(ctx) => RemovalService::new(ctx).uninstall(config),
        None => OperationError::RegistryWriteFailed(Operation::Uninstall).into(),
    }
}
