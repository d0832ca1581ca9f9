// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Persisted fingerprint -> installation record mapping.
//!
//! The file is a single pretty-printed JSON object:
//!
//! ```json
//! {
//!   "AA11...": { "path": "/tmp/rootca.pem", "name": "local.dev",
//!                "nickname": "VDCM:local.dev", "os": "linux" }
//! }
//! ```
//!
//! Reads fail open: a missing or unparsable file is an empty registry.
//! Writes never fail open. Every read-modify-write holds an in-process mutex
//! plus an exclusive advisory lock on a sidecar `.lock` file, so concurrent
//! callers (threads or processes) serialize instead of losing updates.

use crate::config::Paths;
use crate::error::{Error, Result};
use crate::fs::{atomic_write, ensure_dir, normalize_path};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRecord {
    /// Absolute path of the certificate file at install time
    pub path: PathBuf,
    pub name: String,
    /// Older registries may lack this; see [`RegistryRecord::nickname`]
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nickname: String,
    pub os: String,
}

impl RegistryRecord {
    pub fn nickname(&self) -> String {
        if self.nickname.is_empty() {
            crate::identity::nickname_for(&self.name)
        } else {
            self.nickname.clone()
        }
    }
}

pub type Records = BTreeMap<String, RegistryRecord>;

#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
    lock_path: PathBuf,
    gate: Arc<Mutex<()>>,
}

/// Advisory file lock, released on drop.
struct FileLock {
    file: File,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl Registry {
    pub fn open(paths: &Paths) -> Self {
        Self {
            path: paths.registry.clone(),
            lock_path: paths.registry_lock.clone(),
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Registry backed by an arbitrary file; the lock sits next to it.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            lock_path: PathBuf::from(lock_name),
            path,
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole mapping. Never fails; see module docs.
    pub fn load(&self) -> Records {
        let _gate = self.enter();
        let _lock = match self.acquire(false) {
            Ok(lock) => Some(lock),
            Err(e) => {
                tracing::debug!(error = %e, "reading registry without a shared lock");
                None
            }
        };
        self.read_records()
    }

    /// Replace the persisted mapping with `records`.
    pub fn save(&self, records: &Records) -> Result<()> {
        let _gate = self.enter();
        let _lock = self.acquire(true)?;
        self.write_records(records)
    }

    pub fn track(&self, fingerprint: &str, record: RegistryRecord) -> Result<()> {
        self.update(|records| {
            records.insert(fingerprint.to_string(), record);
            true
        })?;
        tracing::debug!(fingerprint, "registry record added");
        Ok(())
    }

    /// Drop the record for `fingerprint`. Returns whether one existed.
    /// The file is left untouched when there was nothing to remove.
    pub fn untrack(&self, fingerprint: &str) -> Result<bool> {
        let removed = self.update(|records| records.remove(fingerprint).is_some())?;
        if removed {
            tracing::debug!(fingerprint, "registry record removed");
        }
        Ok(removed)
    }

    pub fn get(&self, fingerprint: &str) -> Option<RegistryRecord> {
        self.load().remove(fingerprint)
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.load().contains_key(fingerprint)
    }

    /// First record whose stored path names the same location as `path`.
    pub fn find_by_path(&self, path: &Path) -> Option<(String, RegistryRecord)> {
        let wanted = normalize_path(path);
        self.load()
            .into_iter()
            .find(|(_, record)| normalize_path(&record.path) == wanted)
    }

    pub fn all(&self) -> Records {
        self.load()
    }

    /// Read-modify-write under the exclusive lock. `mutate` returns whether
    /// it changed anything; unchanged mappings are not rewritten.
    fn update<F>(&self, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut Records) -> bool,
    {
        let _gate = self.enter();
        let _lock = self.acquire(true)?;

        let mut records = self.read_records();
        let changed = mutate(&mut records);
        if changed {
            self.write_records(&records)?;
        }
        Ok(changed)
    }

    fn enter(&self) -> MutexGuard<'_, ()> {
        // A panic elsewhere cannot leave `()` inconsistent
        self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire(&self, exclusive: bool) -> Result<FileLock> {
        if let Some(parent) = self.lock_path.parent() {
            ensure_dir(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| Error::Lock {
                path: self.lock_path.clone(),
                source: e,
            })?;

        let locked = if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        };
        locked.map_err(|e| Error::Lock {
            path: self.lock_path.clone(),
            source: e,
        })?;

        Ok(FileLock { file })
    }

    fn read_records(&self) -> Records {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Records::new(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "registry unreadable, treating as empty");
                return Records::new();
            }
        };

        if content.trim().is_empty() {
            return Records::new();
        }

        match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "registry corrupt, treating as empty");
                Records::new()
            }
        }
    }

    fn write_records(&self, records: &Records) -> Result<()> {
        let json = serde_json::to_string_pretty(records).map_err(|e| Error::Registry {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        atomic_write(&self.path, json.as_bytes())
    }
}
