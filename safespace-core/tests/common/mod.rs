//! Shared fixture: a dry-run orchestrator rooted in a temp dir, with a shell
//! script standing in for the hypervisor.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use safespace_core::config::StrategyChoice;
use safespace_core::engine::{HostTopology, StaticProbe};
use safespace_core::{DryRunRunner, EnvironmentOrchestrator, Settings};
use tempfile::TempDir;

const GIB: u64 = 1024 * 1024 * 1024;

/// Exits cleanly on SIGTERM, otherwise idles.
pub const POLITE_VM: &str = "trap 'exit 0' TERM\nwhile :; do sleep 0.05; done";

pub struct Fixture {
    pub dir: TempDir,
    pub settings: Settings,
    pub runner: Arc<DryRunRunner>,
    pub orchestrator: EnvironmentOrchestrator,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_vm_script(POLITE_VM)
    }

    pub fn with_vm_script(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), body);
        let runner = Arc::new(DryRunRunner::new());
        let orchestrator = orchestrator(&settings, runner.clone());
        Self {
            dir,
            settings,
            runner,
            orchestrator,
        }
    }

    /// A second orchestrator over the same state, as after a restart.
    pub fn restarted(&self) -> EnvironmentOrchestrator {
        orchestrator(&self.settings, self.runner.clone())
    }
}

pub fn settings(dir: &Path, vm_body: &str) -> Settings {
    let script = dir.join("fake-hypervisor.sh");
    std::fs::write(&script, format!("{vm_body}\n")).unwrap();

    let mut settings = Settings::rooted_at(dir);
    settings.general.dry_run = true;
    settings.general.use_sudo = false;
    settings.general.create_timeout_secs = 30;
    settings.network.strategy = StrategyChoice::Namespace;
    settings.network.subnet_pool_size = 8;
    settings.vm.hypervisor = "/bin/sh".to_string();
    settings.vm.extra_args = vec![script.display().to_string()];
    settings.vm.image_tool = "true".to_string();
    settings.vm.use_kvm = false;
    settings.vm.stop_timeout_ms = 500;
    settings.vm.start_grace_ms = 50;
    settings
}

pub fn orchestrator(settings: &Settings, runner: Arc<DryRunRunner>) -> EnvironmentOrchestrator {
    let topology = HostTopology::from_split(4, vec![0, 1], vec![2, 3], 8 * GIB);
    EnvironmentOrchestrator::builder(settings.clone())
        .runner(runner)
        .host_probe(Arc::new(StaticProbe::new(topology, 0.1)))
        .build()
}
