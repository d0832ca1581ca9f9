// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::fs::path_to_str;
use crate::identity::{fingerprint, is_fingerprint, nickname_for};
use crate::trust::command::{run_step, CommandRunner};
use crate::trust::{CertKey, TrustStoreDriver};
use std::path::Path;
use std::sync::Arc;

const ROOT_STORE: &str = "ROOT";

/// LocalMachine Trusted Root Certification Authorities. The shell is assumed
/// to be elevated already.
pub struct WindowsTrustStore {
    runner: Arc<dyn CommandRunner>,
}

impl WindowsTrustStore {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn powershell(&self, script: &str) -> Option<String> {
        let result = self.runner.run(
            "powershell",
            &["-NoProfile", "-NonInteractive", "-Command", script],
        );
        match result {
            Ok(output) if output.success => Some(output.stdout),
            Ok(output) => {
                tracing::warn!(stderr = %output.stderr.trim(), "powershell step failed");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "powershell could not run");
                None
            }
        }
    }

    /// Label the installed certificate so it can be recognized in certmgr.
    fn set_friendly_name(&self, fp: &str, name: &str) -> bool {
        let script = format!(
            "$c = Get-ChildItem Cert:\\LocalMachine\\Root | Where-Object {{ $_.Thumbprint -eq '{}' }}; \
             if ($c) {{ $c.FriendlyName = '{}' }}",
            fp,
            ps_quote(&nickname_for(name))
        );
        self.powershell(&script).is_some()
    }
}

/// Characters PowerShell accepts as single-quote delimiters.
const PS_SINGLE_QUOTES: [char; 5] = ['\'', '\u{2018}', '\u{2019}', '\u{201A}', '\u{201B}'];

/// Escape a value for a single-quoted PowerShell string by doubling every
/// quote-like character.
fn ps_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len());
    for c in value.chars() {
        if PS_SINGLE_QUOTES.contains(&c) {
            quoted.push(c);
        }
        quoted.push(c);
    }
    quoted
}

fn lookup_script(fp: &str) -> String {
    format!(
        "$c = Get-ChildItem Cert:\\LocalMachine\\Root | Where-Object {{ $_.Thumbprint -eq '{}' }}; \
         if ($c) {{ 'YES' }} else {{ 'NO' }}",
        fp
    )
}

impl TrustStoreDriver for WindowsTrustStore {
    fn lookup(&self, key: &CertKey<'_>) -> Option<bool> {
        if !is_fingerprint(key.fingerprint) {
            tracing::warn!(fingerprint = key.fingerprint, "not a SHA-1 thumbprint");
            return None;
        }
        let fp = key.fingerprint.to_uppercase();
        let stdout = self.powershell(&lookup_script(&fp))?;
        match stdout.trim() {
            "YES" => Some(true),
            "NO" => Some(false),
            other => {
                tracing::warn!(output = other, "unexpected certificate store lookup output");
                None
            }
        }
    }

    fn install(&self, cert_path: &Path, name: &str) -> bool {
        let Ok(cert_path_str) = path_to_str(cert_path) else {
            tracing::warn!(path = %cert_path.display(), "certificate path is not UTF-8");
            return false;
        };

        if !run_step(
            self.runner.as_ref(),
            "certutil addstore",
            "certutil",
            &["-addstore", "-f", ROOT_STORE, cert_path_str],
        ) {
            return false;
        }
        tracing::info!(name, "certificate added to Windows ROOT store");

        // Cosmetic; a missing label never fails the install
        match fingerprint(cert_path) {
            Ok(fp) => {
                if !self.set_friendly_name(&fp, name) {
                    tracing::warn!(name, "could not set certificate friendly name");
                }
            }
            Err(e) => tracing::warn!(error = %e, "could not fingerprint certificate for labeling"),
        }
        true
    }

    fn remove(&self, key: &CertKey<'_>) -> bool {
        if !is_fingerprint(key.fingerprint) {
            tracing::warn!(fingerprint = key.fingerprint, "not a SHA-1 thumbprint");
            return false;
        }
        let fp = key.fingerprint.to_uppercase();

        if run_step(
            self.runner.as_ref(),
            "certutil delstore",
            "certutil",
            &["-delstore", ROOT_STORE, &fp],
        ) {
            tracing::info!(fingerprint = %fp, "certificate removed from Windows ROOT store");
            return true;
        }

        // delstore fails for a certificate that is already gone
        if self.lookup(key) == Some(false) {
            tracing::info!(fingerprint = %fp, "certificate already absent from ROOT store");
            return true;
        }
        false
    }

    fn name(&self) -> &'static str {
        "Windows Certificate Store"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::tests::write_cert;
    use crate::trust::testing::{Reply, ScriptedRunner};

    const FP: &str = "AA11BB22CC33DD44EE55FF6600112233445566AA";

    fn key() -> CertKey<'static> {
        CertKey {
            fingerprint: FP,
            name: "local.dev",
        }
    }

    #[test]
    fn test_ps_quote_escapes_single_quotes() {
        assert_eq!(ps_quote("VDCM:it's"), "VDCM:it''s");
        assert_eq!(ps_quote("VDCM:plain"), "VDCM:plain");
    }

    #[test]
    fn test_ps_quote_escapes_typographic_quotes() {
        assert_eq!(
            ps_quote("VDCM:x\u{2019}; Remove-Item C:\\x; \u{2018}"),
            "VDCM:x\u{2019}\u{2019}; Remove-Item C:\\x; \u{2018}\u{2018}"
        );
        assert_eq!(ps_quote("\u{201A}\u{201B}"), "\u{201A}\u{201A}\u{201B}\u{201B}");
    }

    #[test]
    fn test_friendly_name_script_keeps_quotes_escaped() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = write_cert(dir.path(), "rootca.pem", "Dev Root");
        let runner = Arc::new(ScriptedRunner::new());
        let store = WindowsTrustStore::new(runner.clone());

        assert!(store.install(&path, "it\u{2019}s"));
        assert!(runner.calls()[1].contains("FriendlyName = 'VDCM:it\u{2019}\u{2019}s'"));
    }

    #[test]
    fn test_lookup_parses_yes_no() {
        let yes = Arc::new(ScriptedRunner::new().on("powershell", Reply::stdout("YES\r\n")));
        assert_eq!(WindowsTrustStore::new(yes).lookup(&key()), Some(true));

        let no = Arc::new(ScriptedRunner::new().on("powershell", Reply::stdout("NO\r\n")));
        assert_eq!(WindowsTrustStore::new(no).lookup(&key()), Some(false));

        let broken = Arc::new(ScriptedRunner::new().on("powershell", Reply::fail()));
        assert_eq!(WindowsTrustStore::new(broken).lookup(&key()), None);
    }

    #[test]
    fn test_lookup_rejects_non_fingerprint() {
        let runner = Arc::new(ScriptedRunner::new());
        let store = WindowsTrustStore::new(runner.clone());
        let bad = CertKey {
            fingerprint: "x'; Remove-Item C:\\",
            name: "local.dev",
        };
        assert_eq!(store.lookup(&bad), None);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_install_labels_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let (path, der) = write_cert(dir.path(), "rootca.pem", "Dev Root");
        let fp = hex::encode_upper(<sha1::Sha1 as sha1::Digest>::digest(&der));

        let runner = Arc::new(ScriptedRunner::new());
        let store = WindowsTrustStore::new(runner.clone());
        assert!(store.install(&path, "local.dev"));

        let calls = runner.calls();
        assert_eq!(
            calls[0],
            format!("certutil -addstore -f ROOT {}", path.display())
        );
        assert!(calls[1].starts_with("powershell -NoProfile -NonInteractive -Command"));
        assert!(calls[1].contains(&fp));
        assert!(calls[1].contains("FriendlyName = 'VDCM:local.dev'"));
    }

    #[test]
    fn test_install_succeeds_when_labeling_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = write_cert(dir.path(), "rootca.pem", "Dev Root");
        let runner = Arc::new(ScriptedRunner::new().on("powershell", Reply::Missing));
        assert!(WindowsTrustStore::new(runner).install(&path, "local.dev"));
    }

    #[test]
    fn test_install_fails_when_addstore_fails() {
        let runner = Arc::new(ScriptedRunner::new().on("-addstore", Reply::fail()));
        let store = WindowsTrustStore::new(runner.clone());
        assert!(!store.install(Path::new("C:/certs/rootca.pem"), "local.dev"));
        assert!(!runner.called("powershell"));
    }

    #[test]
    fn test_remove_deletes_by_thumbprint() {
        let runner = Arc::new(ScriptedRunner::new());
        assert!(WindowsTrustStore::new(runner.clone()).remove(&key()));
        assert_eq!(runner.calls(), vec![format!("certutil -delstore ROOT {}", FP)]);
    }

    #[test]
    fn test_remove_failure_for_absent_cert_is_success() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("-delstore", Reply::fail())
                .on("powershell", Reply::stdout("NO")),
        );
        assert!(WindowsTrustStore::new(runner).remove(&key()));
    }

    #[test]
    fn test_remove_failure_for_present_cert_is_failure() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("-delstore", Reply::fail())
                .on("powershell", Reply::stdout("YES")),
        );
        assert!(!WindowsTrustStore::new(runner.clone()).remove(&key()));

        let unknown = Arc::new(
            ScriptedRunner::new()
                .on("-delstore", Reply::fail())
                .on("powershell", Reply::fail()),
        );
        assert!(!WindowsTrustStore::new(unknown).remove(&key()));
    }
}
