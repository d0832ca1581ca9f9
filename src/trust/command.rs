// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! External command execution for trust-store drivers.
//!
//! Commands are always spawned from an argument vector, never through a
//! shell, so certificate names and paths cannot inject anything.

use crate::error::{Error, Result};
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Seam between drivers and the operating system.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

/// Runs real processes, killing any that outlive the timeout.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        run_command_with_timeout(program, args, self.timeout)
    }
}

/// Run a command with a timeout. stdin is inherited so sudo can prompt.
pub fn run_command_with_timeout(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput> {
    tracing::debug!(program, ?args, "running command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::CommandNotFound {
                    command: program.to_string(),
                    hint: install_hint(program),
                }
            } else {
                Error::Command {
                    command: program.to_string(),
                    stderr: e.to_string(),
                }
            }
        })?;

    // Drain pipes concurrently; a keychain listing easily fills a pipe buffer
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let start = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if start.elapsed() >= timeout {
                    // Kill and reap so no zombie is left behind
                    let _ = child.kill();
                    let _ = child.wait();
                    tracing::warn!(program, seconds = timeout.as_secs(), "command timed out");
                    return Err(Error::CommandTimeout {
                        command: program.to_string(),
                        seconds: timeout.as_secs(),
                    });
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                return Err(Error::Command {
                    command: program.to_string(),
                    stderr: e.to_string(),
                });
            }
        }
    };

    Ok(CommandOutput {
        success: status.success(),
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Get installation hint for missing commands
fn install_hint(command: &str) -> String {
    match command {
        "sudo" => {
            "Sudo is required for trust store operations. Please install sudo or run as root."
                .to_string()
        }
        "update-ca-certificates" => {
            "Install ca-certificates package: sudo apt install ca-certificates".to_string()
        }
        "update-ca-trust" => {
            "Install ca-certificates package: sudo dnf install ca-certificates".to_string()
        }
        "trust" => "Install p11-kit-trust package: sudo pacman -S p11-kit".to_string(),
        "certutil" if cfg!(windows) => "certutil ships with Windows; check your PATH".to_string(),
        "certutil" => {
            "Install certutil for browser support: sudo apt install libnss3-tools".to_string()
        }
        "powershell" => "PowerShell is required to label certificates".to_string(),
        _ => format!("Please install the '{}' command", command),
    }
}

/// Run a command and reduce the outcome to success/failure, logging why a
/// step failed. `step` names the operation in log output.
pub(crate) fn run_step(runner: &dyn CommandRunner, step: &str, program: &str, args: &[&str]) -> bool {
    match runner.run(program, args) {
        Ok(output) if output.success => true,
        Ok(output) => {
            tracing::warn!(step, program, stderr = %output.stderr.trim(), "trust store step failed");
            false
        }
        Err(e) => {
            tracing::warn!(step, program, error = %e, "trust store step could not run");
            false
        }
    }
}
