// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::fs::path_to_str;
use crate::trust::command::{run_step, CommandRunner};
use crate::trust::{CertKey, Privilege, TrustStoreDriver};
use std::path::Path;
use std::sync::Arc;

pub const SYSTEM_KEYCHAIN: &str = "/Library/Keychains/System.keychain";

/// The System keychain is the single authoritative store on macOS.
pub struct MacOsTrustStore {
    runner: Arc<dyn CommandRunner>,
    privilege: Privilege,
}

impl MacOsTrustStore {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            privilege: Privilege::Sudo,
        }
    }

    pub fn with_privilege(mut self, privilege: Privilege) -> Self {
        self.privilege = privilege;
        self
    }

    /// Full `find-certificate` listing with SHA-1 hashes, or None if the
    /// listing could not be produced.
    fn listing(&self) -> Option<String> {
        let result = self.runner.run(
            "security",
            &["find-certificate", "-a", "-Z", SYSTEM_KEYCHAIN],
        );
        match result {
            Ok(output) if output.success => Some(output.stdout),
            Ok(output) => {
                tracing::warn!(stderr = %output.stderr.trim(), "keychain listing failed");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "keychain listing could not run");
                None
            }
        }
    }
}

/// Whether a `security find-certificate -Z` listing has a `SHA-1 hash:` line
/// for `fingerprint`.
fn listing_contains(listing: &str, fingerprint: &str) -> bool {
    listing.lines().any(|line| {
        line.trim()
            .strip_prefix("SHA-1 hash:")
            .map(|hash| hash.trim().eq_ignore_ascii_case(fingerprint))
            .unwrap_or(false)
    })
}

impl TrustStoreDriver for MacOsTrustStore {
    fn lookup(&self, key: &CertKey<'_>) -> Option<bool> {
        self.listing()
            .map(|listing| listing_contains(&listing, key.fingerprint))
    }

    fn install(&self, cert_path: &Path, name: &str) -> bool {
        let cert_path_str = match path_to_str(cert_path) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "cannot pass certificate path to security");
                return false;
            }
        };

        let (program, args) = self.privilege.wrap(
            "security",
            &[
                "add-trusted-cert",
                "-d", // admin cert store
                "-r",
                "trustRoot",
                "-k",
                SYSTEM_KEYCHAIN,
                cert_path_str,
            ],
        );
        let ok = run_step(self.runner.as_ref(), "add-trusted-cert", program, &args);
        if ok {
            tracing::info!(name, "certificate added to System keychain");
        }
        ok
    }

    fn remove(&self, key: &CertKey<'_>) -> bool {
        // Without a listing we cannot target anything; let teardown proceed
        let Some(listing) = self.listing() else {
            tracing::warn!(
                fingerprint = key.fingerprint,
                "keychain unreadable, assuming nothing to remove"
            );
            return true;
        };

        if !listing_contains(&listing, key.fingerprint) {
            tracing::info!(fingerprint = key.fingerprint, "certificate not in keychain");
            return true;
        }

        let (program, args) = self.privilege.wrap(
            "security",
            &["delete-certificate", "-Z", key.fingerprint, SYSTEM_KEYCHAIN],
        );
        let ok = run_step(self.runner.as_ref(), "delete-certificate", program, &args);
        if ok {
            tracing::info!(fingerprint = key.fingerprint, "certificate removed from System keychain");
        }
        ok
    }

    fn name(&self) -> &'static str {
        "macOS System Keychain"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::testing::{Reply, ScriptedRunner};

    const FP: &str = "AA11BB22CC33DD44EE55FF6600112233445566AA";

    fn key() -> CertKey<'static> {
        CertKey {
            fingerprint: FP,
            name: "local.dev",
        }
    }

    fn listing_with(fp: &str) -> String {
        format!(
            "SHA-256 hash: 00FF\nSHA-1 hash: {}\nkeychain: \"{}\"\n",
            fp, SYSTEM_KEYCHAIN
        )
    }

    fn store(runner: &Arc<ScriptedRunner>) -> MacOsTrustStore {
        MacOsTrustStore::new(runner.clone()).with_privilege(Privilege::Sudo)
    }

    #[test]
    fn test_listing_contains_matches_hash_lines_only() {
        assert!(listing_contains(&listing_with(FP), FP));
        assert!(listing_contains(&listing_with(&FP.to_lowercase()), FP));
        assert!(!listing_contains(&listing_with("FFFF"), FP));
        assert!(!listing_contains(&format!("labl: \"{}\"", FP), FP));
    }

    #[test]
    fn test_has_reads_listing() {
        let runner = Arc::new(
            ScriptedRunner::new().on("find-certificate", Reply::stdout(&listing_with(FP))),
        );
        assert!(store(&runner).has(&key()));
        assert_eq!(store(&runner).lookup(&key()), Some(true));
    }

    #[test]
    fn test_has_fails_open_when_listing_fails() {
        let runner = Arc::new(ScriptedRunner::new().on("find-certificate", Reply::fail()));
        assert_eq!(store(&runner).lookup(&key()), None);
        assert!(!store(&runner).has(&key()));
    }

    #[test]
    fn test_install_adds_trusted_root_with_sudo() {
        let runner = Arc::new(ScriptedRunner::new());
        assert!(store(&runner).install(Path::new("/tmp/rootca.pem"), "local.dev"));
        assert_eq!(
            runner.calls(),
            vec![format!(
                "sudo security add-trusted-cert -d -r trustRoot -k {} /tmp/rootca.pem",
                SYSTEM_KEYCHAIN
            )]
        );
    }

    #[test]
    fn test_install_reports_failure() {
        let runner = Arc::new(ScriptedRunner::new().on("add-trusted-cert", Reply::fail()));
        assert!(!store(&runner).install(Path::new("/tmp/rootca.pem"), "local.dev"));
    }

    #[test]
    fn test_remove_deletes_by_hash() {
        let runner = Arc::new(
            ScriptedRunner::new().on("find-certificate", Reply::stdout(&listing_with(FP))),
        );
        assert!(store(&runner).remove(&key()));
        assert!(runner.called(&format!(
            "sudo security delete-certificate -Z {} {}",
            FP, SYSTEM_KEYCHAIN
        )));
    }

    #[test]
    fn test_remove_scan_failure_is_success_without_delete() {
        let runner = Arc::new(ScriptedRunner::new().on("find-certificate", Reply::Missing));
        assert!(store(&runner).remove(&key()));
        assert!(!runner.called("delete-certificate"));
    }

    #[test]
    fn test_remove_absent_is_success_without_delete() {
        let runner = Arc::new(
            ScriptedRunner::new().on("find-certificate", Reply::stdout(&listing_with("FFFF"))),
        );
        assert!(store(&runner).remove(&key()));
        assert!(!runner.called("delete-certificate"));
    }

    #[test]
    fn test_remove_delete_failure_is_failure() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("find-certificate", Reply::stdout(&listing_with(FP)))
                .on("delete-certificate", Reply::fail()),
        );
        assert!(!store(&runner).remove(&key()));
    }

    #[test]
    fn test_direct_privilege_skips_sudo() {
        let runner = Arc::new(ScriptedRunner::new());
        let direct = MacOsTrustStore::new(runner.clone()).with_privilege(Privilege::Direct);
        assert!(direct.install(Path::new("/tmp/rootca.pem"), "local.dev"));
        assert!(runner.calls()[0].starts_with("security add-trusted-cert"));
    }
}
