// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::fs::{path_to_str, real_user_home};
use crate::identity::{nickname_for, MARKER};
use crate::trust::command::{run_step, CommandRunner};
use crate::trust::{CertKey, DriverOptions, Privilege, TrustStoreDriver};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// NSS trust flags: trusted CA for TLS server certificates.
const NSS_TRUST_FLAGS: &str = "C,,";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinuxDistro {
    Debian, // Ubuntu, Mint, Pop!_OS, etc.
    Fedora, // RHEL, CentOS, Rocky, Alma
    Arch,   // Manjaro, EndeavourOS
}

impl LinuxDistro {
    pub fn anchor_dir(&self) -> &'static Path {
        match self {
            LinuxDistro::Debian => Path::new("/usr/local/share/ca-certificates"),
            LinuxDistro::Fedora => Path::new("/etc/pki/ca-trust/source/anchors"),
            LinuxDistro::Arch => Path::new("/etc/ca-certificates/trust-source/anchors"),
        }
    }

    pub fn update_command(&self) -> &'static [&'static str] {
        match self {
            LinuxDistro::Debian => &["update-ca-certificates"],
            LinuxDistro::Fedora => &["update-ca-trust", "extract"],
            LinuxDistro::Arch => &["trust", "extract-compat"],
        }
    }

    /// Detect the distribution family. Unrecognized systems get the Debian
    /// layout, which most derivatives share.
    pub fn detect() -> Self {
        if let Ok(content) = std::fs::read_to_string("/etc/os-release") {
            if let Some(distro) = Self::from_os_release(&content) {
                return distro;
            }
        }

        if Path::new("/usr/sbin/update-ca-certificates").exists() {
            return LinuxDistro::Debian;
        }
        if Path::new("/usr/bin/update-ca-trust").exists() {
            return LinuxDistro::Fedora;
        }
        if Path::new("/usr/bin/trust").exists() {
            return LinuxDistro::Arch;
        }

        LinuxDistro::Debian
    }

    fn from_os_release(content: &str) -> Option<Self> {
        let content = content.to_lowercase();

        if content.contains("debian")
            || content.contains("ubuntu")
            || content.contains("mint")
            || content.contains("pop!_os")
        {
            return Some(LinuxDistro::Debian);
        }

        if content.contains("fedora")
            || content.contains("rhel")
            || content.contains("centos")
            || content.contains("rocky")
            || content.contains("alma")
        {
            return Some(LinuxDistro::Fedora);
        }

        if content.contains("arch") || content.contains("manjaro") || content.contains("endeavour")
        {
            return Some(LinuxDistro::Arch);
        }

        None
    }
}

/// System CA bundle plus the optional NSS stores (personal database and
/// Firefox profiles).
pub struct LinuxTrustStore {
    distro: LinuxDistro,
    anchor_dir: PathBuf,
    home: Option<PathBuf>,
    options: DriverOptions,
    runner: Arc<dyn CommandRunner>,
    privilege: Privilege,
}

impl LinuxTrustStore {
    pub fn new(distro: LinuxDistro, options: DriverOptions, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            distro,
            anchor_dir: distro.anchor_dir().to_path_buf(),
            home: real_user_home(),
            options,
            runner,
            privilege: Privilege::Sudo,
        }
    }

    pub fn detect(options: DriverOptions, runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(LinuxDistro::detect(), options, runner)
    }

    pub fn with_privilege(mut self, privilege: Privilege) -> Self {
        self.privilege = privilege;
        self
    }

    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    pub fn with_anchor_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.anchor_dir = dir.into();
        self
    }

    /// Where the certificate named `name` lives in the CA bundle directory.
    pub fn anchor_path(&self, name: &str) -> PathBuf {
        self.anchor_dir.join(anchor_file_name(name))
    }

    fn personal_nssdb(&self) -> Option<PathBuf> {
        self.home.as_ref().map(|home| home.join(".pki").join("nssdb"))
    }

    /// Firefox profile directories (`*.default*`) under the native, Flatpak
    /// and Snap locations.
    pub fn firefox_profiles(&self) -> Vec<PathBuf> {
        let Some(home) = &self.home else {
            return Vec::new();
        };

        let parents = [
            home.join(".mozilla").join("firefox"),
            home.join(".var")
                .join("app")
                .join("org.mozilla.firefox")
                .join(".mozilla")
                .join("firefox"),
            home.join("snap")
                .join("firefox")
                .join("common")
                .join(".mozilla")
                .join("firefox"),
        ];

        let mut profiles = Vec::new();
        for parent in parents.iter().filter(|p| p.is_dir()) {
            let Ok(entries) = std::fs::read_dir(parent) else {
                continue;
            };
            let mut found: Vec<PathBuf> = entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .filter(|path| {
                    path.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.contains(".default"))
                        .unwrap_or(false)
                })
                .collect();
            found.sort();
            profiles.extend(found);
        }
        profiles
    }

    fn privileged(&self, step: &str, program: &str, args: &[&str]) -> bool {
        let (program, args) = self.privilege.wrap(program, args);
        run_step(self.runner.as_ref(), step, program, &args)
    }

    fn rebuild_bundle(&self) -> bool {
        let (cmd, rest) = match self.distro.update_command().split_first() {
            Some(split) => split,
            None => return false,
        };
        self.privileged("rebuild CA bundle", cmd, rest)
    }

    fn nss_add(&self, db: &Path, cert_path: &str, nickname: &str) -> bool {
        let Ok(db_str) = path_to_str(db) else {
            tracing::warn!(db = %db.display(), "NSS database path is not UTF-8");
            return false;
        };
        let db_arg = format!("sql:{}", db_str);
        let ok = run_step(
            self.runner.as_ref(),
            "certutil add",
            "certutil",
            &[
                "-d",
                &db_arg,
                "-A",
                "-t",
                NSS_TRUST_FLAGS,
                "-n",
                nickname,
                "-i",
                cert_path,
            ],
        );
        if ok {
            tracing::info!(db = %db.display(), nickname, "certificate added to NSS database");
        }
        ok
    }

    fn nss_delete(&self, db: &Path, nickname: &str) {
        let Ok(db_str) = path_to_str(db) else {
            return;
        };
        let db_arg = format!("sql:{}", db_str);
        if run_step(
            self.runner.as_ref(),
            "certutil delete",
            "certutil",
            &["-d", &db_arg, "-D", "-n", nickname],
        ) {
            tracing::info!(db = %db.display(), nickname, "certificate removed from NSS database");
        }
    }
}

/// File name in the CA bundle directory. `[A-Za-z0-9.-]` pass through and
/// every other byte becomes `_XX` (uppercase hex), so the mapping is
/// injective and a name can never leave the directory.
fn anchor_file_name(name: &str) -> String {
    let mut safe = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'.' || byte == b'-' {
            safe.push(char::from(byte));
        } else {
            safe.push('_');
            safe.push_str(&hex::encode_upper([byte]));
        }
    }
    format!("{}-{}.crt", MARKER.to_lowercase(), safe)
}

impl TrustStoreDriver for LinuxTrustStore {
    fn lookup(&self, key: &CertKey<'_>) -> Option<bool> {
        self.anchor_path(key.name).try_exists().ok()
    }

    fn install(&self, cert_path: &Path, name: &str) -> bool {
        let Ok(cert_path_str) = path_to_str(cert_path) else {
            tracing::warn!(path = %cert_path.display(), "certificate path is not UTF-8");
            return false;
        };
        let dest = self.anchor_path(name);
        let Ok(dest_str) = path_to_str(&dest) else {
            return false;
        };
        let nickname = nickname_for(name);

        // Every step runs even after a failure; the result is all-or-nothing
        let copied = self.privileged("copy to CA bundle", "cp", &[cert_path_str, dest_str]);
        let rebuilt = self.rebuild_bundle();
        if copied && rebuilt {
            tracing::info!(dest = %dest.display(), "certificate added to system CA bundle");
        }

        let nss_ok = if self.options.manage_nss_browsers {
            match self.personal_nssdb() {
                Some(db) => self.nss_add(&db, cert_path_str, &nickname),
                None => {
                    tracing::warn!("home directory unknown, cannot reach personal NSS database");
                    false
                }
            }
        } else {
            true
        };

        let firefox_ok = if self.options.manage_firefox {
            let mut all = true;
            for profile in self.firefox_profiles() {
                all &= self.nss_add(&profile, cert_path_str, &nickname);
            }
            all
        } else {
            true
        };

        copied && rebuilt && nss_ok && firefox_ok
    }

    fn remove(&self, key: &CertKey<'_>) -> bool {
        let dest = self.anchor_path(key.name);
        let nickname = nickname_for(key.name);

        // Teardown must not stall on a store that is already gone
        if let Ok(dest_str) = path_to_str(&dest) {
            self.privileged("remove from CA bundle", "rm", &["-f", dest_str]);
        }
        self.rebuild_bundle();

        if self.options.manage_nss_browsers {
            if let Some(db) = self.personal_nssdb() {
                self.nss_delete(&db, &nickname);
            }
        }

        if self.options.manage_firefox {
            for profile in self.firefox_profiles() {
                self.nss_delete(&profile, &nickname);
            }
        }

        true
    }

    fn name(&self) -> &'static str {
        match self.distro {
            LinuxDistro::Debian => "Debian/Ubuntu ca-certificates",
            LinuxDistro::Fedora => "Fedora/RHEL ca-trust",
            LinuxDistro::Arch => "Arch trust",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::testing::{Reply, ScriptedRunner};

    struct Fixture {
        _temp: tempfile::TempDir,
        home: PathBuf,
        anchors: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("temp directory should be created");
        let home = temp.path().join("home");
        let anchors = temp.path().join("anchors");
        std::fs::create_dir_all(&home).unwrap();
        std::fs::create_dir_all(&anchors).unwrap();
        Fixture {
            _temp: temp,
            home,
            anchors,
        }
    }

    fn store(
        fx: &Fixture,
        runner: &Arc<ScriptedRunner>,
        options: DriverOptions,
    ) -> LinuxTrustStore {
        LinuxTrustStore::new(LinuxDistro::Debian, options, runner.clone())
            .with_home(&fx.home)
            .with_anchor_dir(&fx.anchors)
            .with_privilege(Privilege::Sudo)
    }

    fn options(nss: bool, firefox: bool) -> DriverOptions {
        DriverOptions {
            manage_nss_browsers: nss,
            manage_firefox: firefox,
        }
    }

    fn make_profile(fx: &Fixture, parent: &[&str], name: &str) -> PathBuf {
        let mut dir = fx.home.clone();
        for part in parent {
            dir = dir.join(part);
        }
        let profile = dir.join(name);
        std::fs::create_dir_all(&profile).unwrap();
        profile
    }

    #[test]
    fn test_os_release_detection() {
        assert_eq!(
            LinuxDistro::from_os_release("ID=ubuntu\nID_LIKE=debian"),
            Some(LinuxDistro::Debian)
        );
        assert_eq!(
            LinuxDistro::from_os_release("ID=\"rocky\""),
            Some(LinuxDistro::Fedora)
        );
        assert_eq!(
            LinuxDistro::from_os_release("ID=manjaro"),
            Some(LinuxDistro::Arch)
        );
        assert_eq!(LinuxDistro::from_os_release("ID=gentoo"), None);
    }

    #[test]
    fn test_anchor_file_name() {
        assert_eq!(anchor_file_name("local.dev"), "vdcm-local.dev.crt");
        assert_eq!(
            anchor_file_name("../../etc/passwd"),
            "vdcm-.._2F.._2Fetc_2Fpasswd.crt"
        );
        assert_eq!(anchor_file_name("my ca; rm"), "vdcm-my_20ca_3B_20rm.crt");
        assert_eq!(anchor_file_name(".."), "vdcm-...crt");
        assert_eq!(anchor_file_name("caf\u{e9}"), "vdcm-caf_C3_A9.crt");
    }

    #[test]
    fn test_distinct_names_get_distinct_anchor_files() {
        assert_ne!(anchor_file_name("a b"), anchor_file_name("a_b"));
        assert_eq!(anchor_file_name("a_b"), "vdcm-a_5Fb.crt");

        let fx = fixture();
        let runner = Arc::new(ScriptedRunner::new());
        let store = store(&fx, &runner, options(false, false));
        std::fs::write(store.anchor_path("a b"), "x").unwrap();

        let other = CertKey {
            fingerprint: "FP",
            name: "a_b",
        };
        assert!(!store.has(&other));
    }

    #[test]
    fn test_has_checks_anchor_file() {
        let fx = fixture();
        let runner = Arc::new(ScriptedRunner::new());
        let store = store(&fx, &runner, options(false, false));
        let key = CertKey {
            fingerprint: "FP",
            name: "local.dev",
        };

        assert!(!store.has(&key));
        std::fs::write(fx.anchors.join("vdcm-local.dev.crt"), "x").unwrap();
        assert!(store.has(&key));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_install_primary_only() {
        let fx = fixture();
        let runner = Arc::new(ScriptedRunner::new());
        let store = store(&fx, &runner, options(false, false));

        assert!(store.install(Path::new("/tmp/rootca.pem"), "local.dev"));
        let dest = fx.anchors.join("vdcm-local.dev.crt");
        assert_eq!(
            runner.calls(),
            vec![
                format!("sudo cp /tmp/rootca.pem {}", dest.display()),
                "sudo update-ca-certificates".to_string(),
            ]
        );
    }

    #[test]
    fn test_install_fails_when_rebuild_fails() {
        let fx = fixture();
        let runner = Arc::new(ScriptedRunner::new().on("update-ca-certificates", Reply::fail()));
        let store = store(&fx, &runner, options(false, false));
        assert!(!store.install(Path::new("/tmp/rootca.pem"), "local.dev"));
    }

    #[test]
    fn test_install_adds_personal_nssdb() {
        let fx = fixture();
        let runner = Arc::new(ScriptedRunner::new());
        let store = store(&fx, &runner, options(true, false));

        assert!(store.install(Path::new("/tmp/rootca.pem"), "local.dev"));
        let db = fx.home.join(".pki").join("nssdb");
        assert!(runner.called(&format!(
            "certutil -d sql:{} -A -t C,, -n VDCM:local.dev -i /tmp/rootca.pem",
            db.display()
        )));
    }

    #[test]
    fn test_install_fails_when_secondary_store_fails() {
        let fx = fixture();
        let runner = Arc::new(ScriptedRunner::new().on("certutil", Reply::fail()));
        let store = store(&fx, &runner, options(true, false));

        assert!(!store.install(Path::new("/tmp/rootca.pem"), "local.dev"));
        // Primary store was still attempted
        assert!(runner.called("sudo cp"));
        assert!(runner.called("update-ca-certificates"));
    }

    #[test]
    fn test_install_fails_when_certutil_missing() {
        let fx = fixture();
        let runner = Arc::new(ScriptedRunner::new().on("certutil", Reply::Missing));
        let store = store(&fx, &runner, options(true, false));
        assert!(!store.install(Path::new("/tmp/rootca.pem"), "local.dev"));
    }

    #[test]
    fn test_firefox_profiles_discovery() {
        let fx = fixture();
        let native = make_profile(&fx, &[".mozilla", "firefox"], "abc.default-release");
        let flatpak = make_profile(
            &fx,
            &[".var", "app", "org.mozilla.firefox", ".mozilla", "firefox"],
            "xyz.default",
        );
        let snap = make_profile(
            &fx,
            &["snap", "firefox", "common", ".mozilla", "firefox"],
            "snp.default",
        );
        make_profile(&fx, &[".mozilla", "firefox"], "Crash Reports");
        std::fs::write(
            fx.home.join(".mozilla").join("firefox").join("profiles.default.ini"),
            "",
        )
        .unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        let store = store(&fx, &runner, options(false, true));
        assert_eq!(store.firefox_profiles(), vec![native, flatpak, snap]);
    }

    #[test]
    fn test_install_updates_every_firefox_profile() {
        let fx = fixture();
        let first = make_profile(&fx, &[".mozilla", "firefox"], "a.default");
        let second = make_profile(&fx, &[".mozilla", "firefox"], "b.default-release");
        let runner = Arc::new(ScriptedRunner::new());
        let store = store(&fx, &runner, options(false, true));

        assert!(store.install(Path::new("/tmp/rootca.pem"), "local.dev"));
        assert!(runner.called(&format!("sql:{} -A", first.display())));
        assert!(runner.called(&format!("sql:{} -A", second.display())));
    }

    #[test]
    fn test_install_fails_if_one_firefox_profile_fails() {
        let fx = fixture();
        make_profile(&fx, &[".mozilla", "firefox"], "a.default");
        let broken = make_profile(&fx, &[".mozilla", "firefox"], "b.default");
        let runner = Arc::new(
            ScriptedRunner::new().on(&format!("sql:{} -A", broken.display()), Reply::fail()),
        );
        let store = store(&fx, &runner, options(false, true));

        assert!(!store.install(Path::new("/tmp/rootca.pem"), "local.dev"));
    }

    #[test]
    fn test_remove_runs_every_step_and_succeeds() {
        let fx = fixture();
        let profile = make_profile(&fx, &[".mozilla", "firefox"], "a.default");
        let runner = Arc::new(ScriptedRunner::new().on("certutil", Reply::fail()));
        let store = store(&fx, &runner, options(true, true));
        let key = CertKey {
            fingerprint: "FP",
            name: "local.dev",
        };

        assert!(store.remove(&key));
        let dest = fx.anchors.join("vdcm-local.dev.crt");
        assert!(runner.called(&format!("sudo rm -f {}", dest.display())));
        assert!(runner.called("sudo update-ca-certificates"));
        assert!(runner.called(&format!(
            "certutil -d sql:{} -D -n VDCM:local.dev",
            fx.home.join(".pki").join("nssdb").display()
        )));
        assert!(runner.called(&format!("sql:{} -D -n VDCM:local.dev", profile.display())));
    }

    #[test]
    fn test_remove_succeeds_even_if_primary_fails() {
        let fx = fixture();
        let runner = Arc::new(ScriptedRunner::new().on("sudo", Reply::Missing));
        let store = store(&fx, &runner, options(false, false));
        let key = CertKey {
            fingerprint: "FP",
            name: "local.dev",
        };
        assert!(store.remove(&key));
    }

    #[test]
    fn test_fedora_rebuild_command() {
        let fx = fixture();
        let runner = Arc::new(ScriptedRunner::new());
        let store = LinuxTrustStore::new(LinuxDistro::Fedora, options(false, false), runner.clone())
            .with_home(&fx.home)
            .with_anchor_dir(&fx.anchors)
            .with_privilege(Privilege::Direct);

        assert!(store.install(Path::new("/tmp/rootca.pem"), "local.dev"));
        assert!(runner.called("update-ca-trust extract"));
        assert!(!runner.called("sudo"));
    }
}
