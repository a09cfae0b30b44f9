//! Reverse-order cleanup of a partially built environment.
//!
//! Each step of `create` records what it acquired immediately after it
//! succeeds. If a later step fails the ledger is replayed backwards; every
//! undo is attempted even when an earlier one fails.

use std::fmt;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::layout::EnvLayout;
use crate::engine::network::{NetworkHandle, NetworkIsolationController};
use crate::engine::registry::EnvironmentRegistry;
use crate::engine::vm::{VmController, VmHandle};

/// One acquired resource.
#[derive(Debug, Clone)]
pub(crate) enum Acquired {
    Root(EnvLayout),
    /// Set when the lease was also persisted in the registry.
    Subnet(Option<EnvironmentRegistry>),
    Network(NetworkHandle),
    VmProvisioned(VmHandle),
    VmStarted(VmHandle),
}

impl fmt::Display for Acquired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root(layout) => write!(f, "root {}", layout.root().display()),
            Self::Subnet(_) => write!(f, "subnet lease"),
            Self::Network(h) => write!(f, "network domain {}", h.domain_id()),
            Self::VmProvisioned(h) => write!(f, "VM artifacts in {}", h.config.vm_dir.display()),
            Self::VmStarted(h) => write!(f, "VM process {:?}", h.config.pid),
        }
    }
}

pub(crate) struct UnwindLedger {
    env_id: Uuid,
    entries: Vec<Acquired>,
}

impl UnwindLedger {
    pub fn new(env_id: Uuid) -> Self {
        Self {
            env_id,
            entries: Vec::new(),
        }
    }

    pub fn record(&mut self, acquired: Acquired) {
        debug!(env_id = %self.env_id, resource = %acquired, "Acquired");
        self.entries.push(acquired);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Undo everything, newest first. Returns one warning per failed undo.
    pub async fn unwind(self, network: &NetworkIsolationController, vms: &VmController) -> Vec<String> {
        let env_id = self.env_id;
        let mut warnings = Vec::new();

        for acquired in self.entries.into_iter().rev() {
            debug!(%env_id, resource = %acquired, "Unwinding");
            let outcome = match &acquired {
                Acquired::VmStarted(handle) => vms.stop(handle, false).await.map(|_| ()),
                Acquired::VmProvisioned(handle) => vms.discard(handle).await,
                Acquired::Network(handle) => match network.destroy(handle).await {
                    Ok(teardown) => {
                        warnings.extend(teardown);
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                Acquired::Subnet(registry) => {
                    network.release(env_id);
                    match registry {
                        Some(registry) => registry.release_subnet(env_id).map(|_| ()),
                        None => Ok(()),
                    }
                }
                Acquired::Root(layout) => layout.remove().map(|_| ()),
            };
            if let Err(e) = outcome {
                warn!(%env_id, resource = %acquired, error = %e, "Unwind step failed");
                warnings.push(format!("{acquired}: {e}"));
            }
        }
        warnings
    }
}
