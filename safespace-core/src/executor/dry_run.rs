//! Recording runner for dry-run mode and tests.
//!
//! Commands are logged and answered from a small model of host state:
//! network namespaces (`ip netns add|delete|list`) and pf anchors
//! (`pfctl -a <anchor> -f|-F|-s`). Everything else succeeds silently
//! unless a failure has been injected for it.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::{CommandOutput, CommandRunner};

#[derive(Default)]
struct DryRunState {
    commands: Vec<Vec<String>>,
    namespaces: BTreeSet<String>,
    anchors: BTreeSet<String>,
    failures: Vec<Vec<String>>,
}

/// Records privileged commands instead of executing them.
#[derive(Default)]
pub struct DryRunRunner {
    state: Mutex<DryRunState>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every command whose argv starts with `prefix` exit with status 1.
    pub fn fail_on<S: AsRef<str>>(&self, prefix: &[S]) {
        let prefix = prefix.iter().map(|s| s.as_ref().to_string()).collect();
        self.lock().failures.push(prefix);
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Every command seen so far, in order.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.lock().commands.clone()
    }

    /// Namespaces currently believed to exist.
    pub fn namespaces(&self) -> Vec<String> {
        self.lock().namespaces.iter().cloned().collect()
    }

    /// pf anchors currently believed to be loaded.
    pub fn anchors(&self) -> Vec<String> {
        self.lock().anchors.iter().cloned().collect()
    }

    /// Pretend a namespace was created outside the engine.
    pub fn seed_namespace(&self, name: &str) {
        self.lock().namespaces.insert(name.to_string());
    }

    /// Pretend a namespace vanished (host reboot, manual cleanup).
    pub fn drop_namespace(&self, name: &str) {
        self.lock().namespaces.remove(name);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DryRunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn ok(stdout: String) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout,
        ..CommandOutput::default()
    }
}

fn failed(stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 1,
        stderr: stderr.to_string(),
        ..CommandOutput::default()
    }
}

fn simulate(state: &mut DryRunState, argv: &[String]) -> CommandOutput {
    let args: Vec<&str> = argv.iter().skip(1).map(String::as_str).collect();
    match args.as_slice() {
        ["netns", "add", name] => {
            if state.namespaces.insert(name.to_string()) {
                ok(String::new())
            } else {
                failed("Cannot create namespace file: File exists")
            }
        }
        ["netns", "delete", name] | ["netns", "del", name] => {
            if state.namespaces.remove(*name) {
                ok(String::new())
            } else {
                failed("Cannot remove namespace file: No such file or directory")
            }
        }
        ["netns", "list"] => {
            let listing = state
                .namespaces
                .iter()
                .map(|ns| format!("{ns}\n"))
                .collect();
            ok(listing)
        }
        ["-a", "safespace", "-s", "Anchors"] => {
            let listing = state
                .anchors
                .iter()
                .map(|a| format!("  {a}\n"))
                .collect();
            ok(listing)
        }
        ["-a", anchor, "-f", _] => {
            state.anchors.insert(anchor.to_string());
            ok(String::new())
        }
        ["-a", anchor, "-F", "all"] => {
            state.anchors.remove(*anchor);
            ok(String::new())
        }
        ["-a", anchor, "-s", "rules"] => {
            if state.anchors.contains(*anchor) {
                ok(format!("pass quick all # {anchor}\n"))
            } else {
                ok(String::new())
            }
        }
        _ => ok(String::new()),
    }
}

#[async_trait]
impl CommandRunner for DryRunRunner {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        info!(command = %argv.join(" "), "[dry-run]");
        let mut state = self.lock();
        state.commands.push(argv.to_vec());

        let injected = state
            .failures
            .iter()
            .any(|prefix| argv.len() >= prefix.len() && argv[..prefix.len()] == prefix[..]);
        if injected {
            return Ok(failed("injected failure"));
        }

        Ok(simulate(&mut state, argv))
    }

    fn launch_prefix(&self, _domain_prefix: Vec<String>) -> Vec<String> {
        // Processes launched in dry-run mode stay on the host.
        Vec::new()
    }

    fn runner_type(&self) -> &str {
        "dry-run"
    }
}
