// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

pub mod command;
mod linux;
mod macos;
mod windows;

pub use command::{CommandOutput, CommandRunner, SystemRunner};
pub use linux::{LinuxDistro, LinuxTrustStore};
pub use macos::{MacOsTrustStore, SYSTEM_KEYCHAIN};
pub use windows::WindowsTrustStore;

use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Host platforms with a trust-store driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Mac,
    Linux,
    Windows,
}

impl Platform {
    /// Platform this binary was built for, if it has a driver.
    pub fn detect() -> Option<Self> {
        if cfg!(target_os = "macos") {
            Some(Platform::Mac)
        } else if cfg!(target_os = "linux") {
            Some(Platform::Linux)
        } else if cfg!(windows) {
            Some(Platform::Windows)
        } else {
            None
        }
    }

    /// Identifier stored in registry records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Mac => "mac",
            Platform::Linux => "linux",
            Platform::Windows => "windows",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a managed certificate to a driver. Keychain and certificate
/// store drivers key on the fingerprint, the Linux driver on the name.
#[derive(Debug, Clone, Copy)]
pub struct CertKey<'a> {
    pub fingerprint: &'a str,
    pub name: &'a str,
}

/// Which optional stores a driver manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverOptions {
    pub manage_nss_browsers: bool,
    pub manage_firefox: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            manage_nss_browsers: true,
            manage_firefox: false,
        }
    }
}

/// How privileged steps are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Prefix privileged commands with `sudo`
    Sudo,
    /// Already elevated (root, or Windows where the shell is elevated)
    Direct,
}

impl Privilege {
    pub fn detect() -> Self {
        #[cfg(unix)]
        {
            // SAFETY: geteuid has no preconditions and cannot fail
            if unsafe { libc::geteuid() } == 0 {
                return Privilege::Direct;
            }
            Privilege::Sudo
        }

        #[cfg(not(unix))]
        {
            Privilege::Direct
        }
    }

    /// Program and argument vector for a privileged step.
    pub(crate) fn wrap<'a>(&self, program: &'a str, args: &[&'a str]) -> (&'a str, Vec<&'a str>) {
        match self {
            Privilege::Sudo => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(program);
                full.extend_from_slice(args);
                ("sudo", full)
            }
            Privilege::Direct => (program, args.to_vec()),
        }
    }
}

pub trait TrustStoreDriver {
    /// Query the store. `None` means the query itself failed, which is not
    /// the same as the certificate being absent.
    fn lookup(&self, key: &CertKey<'_>) -> Option<bool>;

    /// Best-effort existence check; a failed query reads as absent.
    fn has(&self, key: &CertKey<'_>) -> bool {
        self.lookup(key).unwrap_or(false)
    }

    /// Add the certificate at `cert_path`. False if any required step failed.
    fn install(&self, cert_path: &Path, name: &str) -> bool;

    /// Remove the certificate. True when there was nothing to remove.
    fn remove(&self, key: &CertKey<'_>) -> bool;

    fn name(&self) -> &'static str;
}

/// Build the driver for `platform` backed by `runner`.
pub fn driver_for(
    platform: Platform,
    options: DriverOptions,
    runner: Arc<dyn CommandRunner>,
) -> Box<dyn TrustStoreDriver> {
    let privilege = Privilege::detect();
    match platform {
        Platform::Mac => Box::new(MacOsTrustStore::new(runner).with_privilege(privilege)),
        Platform::Linux => {
            Box::new(LinuxTrustStore::detect(options, runner).with_privilege(privilege))
        }
        Platform::Windows => Box::new(WindowsTrustStore::new(runner)),
    }
}
