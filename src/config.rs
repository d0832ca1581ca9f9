// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use crate::fs::real_user_home;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Current settings file version. Increment when making breaking changes.
const CONFIG_VERSION: u32 = 1;

/// Hard ceiling for a single trust-store command.
pub const MAX_COMMAND_TIMEOUT_SECS: u64 = 3600;

/// Persistent settings read from `config.toml` in the vdcm directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Settings file version for future migration support
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    /// Seconds before an external trust-store command is killed
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Default for managing the personal NSS database on Linux
    #[serde(default = "default_true")]
    pub manage_nss_browsers: bool,
    /// Default for managing Firefox profiles on Linux
    #[serde(default)]
    pub manage_firefox: bool,
}

fn default_config_version() -> u32 {
    CONFIG_VERSION
}

fn default_command_timeout_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            command_timeout_secs: default_command_timeout_secs(),
            manage_nss_browsers: true,
            manage_firefox: false,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let settings: Self = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| Error::ReadFile {
                path: path.to_path_buf(),
                source: e,
            })?;
            toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?
        } else {
            Self::default()
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.config_version > CONFIG_VERSION {
            tracing::warn!(
                found = self.config_version,
                supported = CONFIG_VERSION,
                "config.toml is newer than this build; unknown settings are ignored"
            );
        }

        if self.command_timeout_secs == 0 {
            return Err(Error::Config(
                "command_timeout_secs must be at least 1".into(),
            ));
        }
        if self.command_timeout_secs > MAX_COMMAND_TIMEOUT_SECS {
            return Err(Error::Config(format!(
                "command_timeout_secs must be at most {}",
                MAX_COMMAND_TIMEOUT_SECS
            )));
        }

        Ok(())
    }

    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.command_timeout_secs)
    }
}

/// Per-invocation configuration handed over by the host integration or CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertConfig {
    pub cert_path: PathBuf,
    /// Explicit name; blank or missing means "derive from the file name"
    #[serde(default)]
    pub cert_name: Option<String>,
    /// Carried for the presentation layer; the core never reads it
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default = "default_true")]
    pub manage_nss_browsers: bool,
    #[serde(default)]
    pub manage_firefox: bool,
}

fn default_locale() -> String {
    "en".to_string()
}

impl CertConfig {
    pub fn new(cert_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            cert_name: None,
            locale: default_locale(),
            manage_nss_browsers: true,
            manage_firefox: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.cert_name = Some(name.into());
        self
    }

    /// Apply the store flags from persistent settings.
    pub fn with_settings(mut self, settings: &Settings) -> Self {
        self.manage_nss_browsers = settings.manage_nss_browsers;
        self.manage_firefox = settings.manage_firefox;
        self
    }

    /// The explicit name, if one was given and is not blank.
    pub fn explicit_name(&self) -> Option<&str> {
        self.cert_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        if self.cert_path.as_os_str().is_empty() {
            return Err(Error::Config("cert_path must be provided".into()));
        }
        if let Some(name) = &self.cert_name {
            if name.trim().is_empty() {
                return Err(Error::Config("cert_name must not be blank".into()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
    pub registry: PathBuf,
    pub registry_lock: PathBuf,
    pub config: PathBuf,
}

impl Paths {
    pub fn new() -> Result<Self> {
        Ok(Self::at(Self::base_dir()?))
    }

    /// Layout rooted at an explicit directory.
    pub fn at(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            registry: base.join("certs.json"),
            registry_lock: base.join("certs.json.lock"),
            config: base.join("config.toml"),
            base,
        }
    }

    fn base_dir() -> Result<PathBuf> {
        if let Ok(custom_root) = std::env::var("VDCM_ROOT") {
            let path = PathBuf::from(&custom_root);

            if !path.is_absolute() {
                return Err(Error::Config(format!(
                    "VDCM_ROOT must be an absolute path, got: {}",
                    custom_root
                )));
            }

            return Ok(path);
        }

        // Shared with earlier installs, so the location is fixed
        match real_user_home() {
            Some(home) => Ok(home.join(".vagrant.d").join("vdcm")),
            None => Err(Error::Config(
                "Could not determine home directory. Set VDCM_ROOT to choose a location.".into(),
            )),
        }
    }

    pub fn load_settings(&self) -> Result<Settings> {
        Settings::load(&self.config)
    }
}
