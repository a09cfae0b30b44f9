//! Command Runners - Privileged Host Command Execution
//!
//! Every privileged operation the engine performs (namespace creation,
//! interface wiring, packet-filter rules, traffic shaping) goes through a
//! [`CommandRunner`]. The controllers never spawn privileged processes
//! themselves, which keeps two execution modes behind one seam:
//!
//! - [`SystemRunner`]: executes on the host through `tokio::process`,
//!   escalating with `sudo -n` when configured and not already root.
//! - [`DryRunRunner`]: records commands, models namespace and pf-anchor
//!   existence, and injects failures on request.

mod dry_run;

pub use dry_run::DryRunRunner;

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code, `-1` when the process was killed by a signal
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock time in milliseconds
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Short failure description for error messages.
    pub fn failure_reason(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exit status {}", self.exit_code)
        } else {
            format!("exit status {}: {}", self.exit_code, stderr)
        }
    }
}

/// Executes privileged host commands on behalf of the controllers.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv` to completion with whatever privilege the runner carries.
    ///
    /// A non-zero exit is reported through [`CommandOutput::exit_code`];
    /// `Err` is reserved for failing to launch at all.
    async fn run(&self, argv: &[String]) -> Result<CommandOutput>;

    /// Turn an isolation domain's entry prefix (`ip netns exec <ns>`, ...)
    /// into the argv prefix used to launch a long-running process inside it.
    fn launch_prefix(&self, domain_prefix: Vec<String>) -> Vec<String>;

    /// Identifier used in logs.
    fn runner_type(&self) -> &str;
}

/// Runs commands on the host.
pub struct SystemRunner {
    escalate: bool,
}

impl SystemRunner {
    /// `use_sudo` only takes effect when the process is not already root.
    pub fn new(use_sudo: bool) -> Self {
        let escalate = use_sudo && !nix::unistd::geteuid().is_root();
        Self { escalate }
    }

    fn privileged_argv(&self, argv: &[String]) -> Vec<String> {
        let mut full = Vec::with_capacity(argv.len() + 2);
        if self.escalate {
            full.push("sudo".to_string());
            full.push("-n".to_string());
        }
        full.extend(argv.iter().cloned());
        full
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        let full = self.privileged_argv(argv);
        debug!(command = ?full, "Running host command");
        run_local(&full, None, &HashMap::new()).await
    }

    fn launch_prefix(&self, domain_prefix: Vec<String>) -> Vec<String> {
        if domain_prefix.is_empty() {
            return domain_prefix;
        }
        self.privileged_argv(&domain_prefix)
    }

    fn runner_type(&self) -> &str {
        if self.escalate {
            "system-sudo"
        } else {
            "system"
        }
    }
}

/// Run an unprivileged command directly on the host.
pub async fn run_local(
    argv: &[String],
    cwd: Option<&Path>,
    envs: &HashMap<String, String>,
) -> Result<CommandOutput> {
    let (program, args) = argv
        .split_first()
        .context("Cannot run an empty command")?;

    let start = Instant::now();
    let mut cmd = Command::new(program);
    cmd.args(args).envs(envs).kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .await
        .with_context(|| format!("Failed to launch `{program}`"))?;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// Build an owned argv from string slices.
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}
