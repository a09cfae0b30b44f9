//! [`LiveStateProbe`] backed by the controllers and the environments dir.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::engine::layout::EnvLayout;
use crate::engine::network::{NetworkConfig, NetworkIsolationController};
use crate::engine::registry::{LiveStateProbe, LiveVm};
use crate::engine::vm::{self, VmConfig, VmController, VmHandle, VmStatus};

pub struct HostStateProbe {
    network: Arc<NetworkIsolationController>,
    vms: Arc<VmController>,
    environments_dir: PathBuf,
}

impl HostStateProbe {
    pub fn new(
        network: Arc<NetworkIsolationController>,
        vms: Arc<VmController>,
        environments_dir: PathBuf,
    ) -> Self {
        Self {
            network,
            vms,
            environments_dir,
        }
    }
}

#[async_trait]
impl LiveStateProbe for HostStateProbe {
    async fn network_present(&self, config: &NetworkConfig) -> anyhow::Result<bool> {
        self.network.exists(config).await
    }

    async fn vm_status(&self, env_id: Uuid, config: &VmConfig) -> anyhow::Result<VmStatus> {
        let mut config = config.clone();
        if config.pid.is_none() {
            config.pid = config.vm_dir.parent().and_then(vm::read_pid_file);
        }
        Ok(self.vms.status(&VmHandle { env_id, config }).await)
    }

    async fn live_domains(&self) -> anyhow::Result<Vec<String>> {
        self.network.live_domains().await
    }

    async fn live_vms(&self) -> anyhow::Result<Vec<LiveVm>> {
        Ok(EnvLayout::scan(&self.environments_dir)
            .into_iter()
            .filter_map(|layout| {
                let pid = vm::read_pid_file(layout.root())?;
                vm::pid_alive(pid).then(|| LiveVm {
                    pid,
                    root: layout.root().to_path_buf(),
                })
            })
            .collect())
    }

    fn live_roots(&self) -> anyhow::Result<Vec<PathBuf>> {
        Ok(EnvLayout::scan(&self.environments_dir)
            .into_iter()
            .map(|layout| layout.root().to_path_buf())
            .collect())
    }
}
