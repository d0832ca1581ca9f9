// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vdcm::{
    perform_install, perform_uninstall, CertConfig, CertificateIdentity, Operation,
    OperationResult, Paths, Registry, Result, Settings,
};

#[derive(Parser)]
#[command(name = "vdcm")]
#[command(about = "Manage development CA certificates in system trust stores")]
#[command(version)]
#[command(after_help = "\
EXAMPLES:
    vdcm add certs/rootca.pem --name local.dev   # Trust a CA certificate
    vdcm list                                    # Show managed certificates
    vdcm remove certs/rootca.pem                 # Undo the install
    vdcm --json remove AA11BB...                 # Remove by fingerprint")]
struct Cli {
    /// Print the operation result as a single JSON line
    #[arg(long, global = true)]
    json: bool,

    /// Message language (accepted for compatibility, messages are English)
    #[arg(long, global = true, default_value = "en")]
    lang: String,

    /// Do not touch the personal NSS database (Linux)
    #[arg(long, global = true)]
    no_nss: bool,

    /// Also add the certificate to Firefox profiles (Linux)
    #[arg(long, global = true)]
    firefox: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Show detailed output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a CA certificate into the system trust store
    #[command(visible_alias = "install")]
    Add {
        /// Certificate file (PEM or DER)
        path: PathBuf,

        /// Name to register the certificate under (default: file name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Remove a certificate installed by vdcm
    #[command(visible_alias = "uninstall")]
    Remove {
        /// Certificate path as installed, or its SHA-1 fingerprint
        target: PathBuf,
    },

    /// List certificates installed by vdcm
    #[command(visible_alias = "status")]
    List,

    /// Show fingerprint and naming details of a certificate file
    Inspect {
        /// Certificate file (PEM or DER)
        path: PathBuf,
    },

    /// Show version information
    Version,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Output helper that respects --quiet, --verbose and --json.
#[derive(Clone, Copy)]
struct Output {
    quiet: bool,
    verbose: bool,
    json: bool,
}

impl Output {
    fn print(&self, msg: &str) {
        if !self.quiet && !self.json {
            println!("{}", msg);
        }
    }
}

fn main() {
    // Reset SIGPIPE to default behavior (exit) instead of panic
    // This prevents "broken pipe" panics when output is piped to tools like grep/head
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_logging(quiet: bool, verbose: bool) {
    let default = if verbose {
        "info"
    } else if quiet {
        "error"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_env("VDCM_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Run the CLI and return the process exit status.
fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);
    let out = Output {
        quiet: cli.quiet,
        verbose: cli.verbose,
        json: cli.json,
    };

    match &cli.command {
        Commands::Add { path, name } => {
            let mut config = cert_config(&cli, path)?;
            if let Some(name) = name {
                config = config.with_name(name.clone());
            }
            config.validate()?;
            let result = perform_install(&config);
            Ok(report(Operation::Install, &result, out))
        }
        Commands::Remove { target } => {
            let config = cert_config(&cli, target)?;
            config.validate()?;
            let result = perform_uninstall(&config);
            Ok(report(Operation::Uninstall, &result, out))
        }
        Commands::List => cmd_list(out).map(|_| 0),
        Commands::Inspect { path } => cmd_inspect(path, out).map(|_| 0),
        Commands::Version => {
            println!("vdcm {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(*shell, &mut cmd, "vdcm", &mut std::io::stdout());
            Ok(0)
        }
    }
}

/// Per-invocation configuration: settings file defaults, then flags.
fn cert_config(cli: &Cli, path: &std::path::Path) -> Result<CertConfig> {
    let settings = load_settings()?;
    let mut config = CertConfig::new(path).with_settings(&settings);
    config.locale = cli.lang.clone();
    if cli.no_nss {
        config.manage_nss_browsers = false;
    }
    if cli.firefox {
        config.manage_firefox = true;
    }
    Ok(config)
}

fn load_settings() -> Result<Settings> {
    Paths::new()?.load_settings()
}

/// Print the outcome and return the exit status.
fn report(action: Operation, result: &OperationResult, out: Output) -> i32 {
    if out.json {
        let mut value = serde_json::to_value(result).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.insert("action".into(), serde_json::json!(action));
        }
        println!("{}", value);
        return result.code;
    }

    match (&result.data, result.failure) {
        (_, Some(failure)) => {
            eprintln!("{} {} ({})", cross_mark(), failure, failure.key());
        }
        (Some(data), None) => out.print(&format!(
            "{} Installed certificate '{}' ({})",
            check_mark(),
            data.cert,
            data.os
        )),
        (None, None) => out.print(&format!("{} Certificate removed", check_mark())),
    }
    result.code
}

fn cmd_list(out: Output) -> Result<()> {
    let paths = Paths::new()?;
    let records = Registry::open(&paths).all();

    if out.json {
        let list: Vec<_> = records
            .iter()
            .map(|(fp, record)| {
                serde_json::json!({
                    "fingerprint": fp,
                    "path": record.path,
                    "name": record.name,
                    "nickname": record.nickname(),
                    "os": record.os,
                })
            })
            .collect();
        println!("{}", serde_json::json!({ "certificates": list }));
        return Ok(());
    }

    if records.is_empty() {
        println!("No certificates managed by vdcm");
        return Ok(());
    }

    for (fp, record) in &records {
        println!(
            "{} ({}) [{}] {}",
            record.name,
            fp,
            record.os,
            record.path.display()
        );
        if out.verbose {
            println!("    Common Name: {}", common_name_of(&record.path));
        }
    }
    Ok(())
}

/// Subject CN of the certificate file, or why it cannot be shown.
fn common_name_of(path: &std::path::Path) -> String {
    match CertificateIdentity::from_path(path) {
        Ok(identity) => identity
            .common_name
            .unwrap_or_else(|| "(none)".to_string()),
        Err(_) => "(certificate file unreadable)".to_string(),
    }
}

fn cmd_inspect(path: &std::path::Path, out: Output) -> Result<()> {
    let identity = CertificateIdentity::from_path(path)?;
    let tracked = Paths::new()
        .map(|paths| Registry::open(&paths).contains(&identity.fingerprint))
        .unwrap_or(false);

    if out.json {
        println!(
            "{}",
            serde_json::json!({
                "path": path,
                "fingerprint": identity.fingerprint,
                "name": identity.default_name,
                "nickname": identity.nickname(&identity.default_name),
                "common_name": identity.common_name,
                "tracked": tracked,
            })
        );
        return Ok(());
    }

    println!("Certificate: {}", path.display());
    println!("===========");
    println!();
    println!("Fingerprint: {}", identity.fingerprint);
    println!("Name:        {}", identity.default_name);
    println!("Nickname:    {}", identity.nickname(&identity.default_name));
    if let Some(cn) = &identity.common_name {
        println!("Common Name: {}", cn);
    }
    if tracked {
        println!("{} Managed by vdcm", check_mark());
    } else {
        println!("{} Not managed by vdcm", cross_mark());
    }
    Ok(())
}

fn check_mark() -> &'static str {
    "\u{2713}" // Unicode checkmark
}

fn cross_mark() -> &'static str {
    "\u{2717}" // Unicode cross mark
}
