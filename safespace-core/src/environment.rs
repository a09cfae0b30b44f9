//! Environment data model: status machine, persisted record, creation
//! request and the handle returned to callers.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::layout::EnvLayout;
use crate::engine::network::{Impairment, NetworkConfig, NetworkHandle};
use crate::engine::resources::{ResourceAllocation, WorkloadHint};
use crate::engine::vm::{VmConfig, VmHandle};
use crate::error::{Error, Result};

/// Longest accepted environment name.
pub const MAX_NAME_LEN: usize = 64;

/// First eight hex digits of an id; used in interface, domain and directory names.
pub fn short_id(id: &Uuid) -> String {
    let simple = id.simple().to_string();
    simple[..8].to_string()
}

/// Lifecycle status.
///
/// ```text
/// initializing → active ⇄ degraded
///                  ↓         ↓
///               closing → closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentStatus {
    Initializing,
    Active,
    Degraded,
    Closing,
    Closed,
}

impl EnvironmentStatus {
    pub fn can_transition_to(self, next: EnvironmentStatus) -> bool {
        use EnvironmentStatus::*;
        matches!(
            (self, next),
            (Initializing, Active)
                | (Initializing, Closing)
                | (Active, Degraded)
                | (Active, Closing)
                | (Degraded, Active)
                | (Degraded, Closing)
                | (Closing, Closed)
        )
    }

    /// Checked transition.
    pub fn transition(self, next: EnvironmentStatus) -> Result<EnvironmentStatus> {
        if self == next || self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Statuses whose record still holds its name.
    pub fn holds_name(self) -> bool {
        self != EnvironmentStatus::Closed
    }
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Active => write!(f, "active"),
            Self::Degraded => write!(f, "degraded"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Persisted description of one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub id: Uuid,
    pub name: Option<String>,
    pub status: EnvironmentStatus,
    pub resource_snapshot: ResourceAllocation,
    pub network_config: Option<NetworkConfig>,
    pub vm_config: Option<VmConfig>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub template_id: Option<String>,
    pub root_path: PathBuf,
}

impl EnvironmentRecord {
    /// Cross-field consistency checks.
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let (Some(vm), Some(net)) = (&self.vm_config, &self.network_config) {
            if vm.network_domain.as_deref() != Some(net.domain_id.as_str()) {
                return Err(Error::InvalidSpec(format!(
                    "VM is attached to {:?} but the environment's domain is {}",
                    vm.network_domain, net.domain_id
                )));
            }
        }
        if let (Some(vm), None) = (&self.vm_config, &self.network_config) {
            if let Some(domain) = &vm.network_domain {
                return Err(Error::InvalidSpec(format!(
                    "VM is attached to {domain} but the environment has no network domain"
                )));
            }
        }
        Ok(())
    }

    /// Display label: the name, else the short id.
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| short_id(&self.id))
    }

    pub fn network_handle(&self) -> Option<NetworkHandle> {
        self.network_config.clone().map(|config| NetworkHandle {
            env_id: self.id,
            config,
        })
    }

    pub fn vm_handle(&self) -> Option<VmHandle> {
        self.vm_config.clone().map(|config| VmHandle {
            env_id: self.id,
            config,
        })
    }
}

/// Names are 1-64 characters of `[A-Za-z0-9._-]`.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidSpec(format!(
            "environment name must be 1-{MAX_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(Error::InvalidSpec(format!(
            "environment name `{name}` may only contain letters, digits, '.', '_' and '-'"
        )));
    }
    if Uuid::parse_str(name).is_ok() {
        return Err(Error::InvalidSpec(format!(
            "environment name `{name}` would be ambiguous with an id"
        )));
    }
    Ok(())
}

/// Network part of a creation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkRequest {
    /// Overrides the configured default impairment.
    pub impairment: Option<Impairment>,
}

/// VM part of a creation request. Unset fields fall back to settings and
/// the resource recommendation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmRequest {
    pub memory_mb: Option<u64>,
    pub cpus: Option<u32>,
    pub disk_gb: Option<u64>,
}

/// Fully resolved creation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentSpec {
    pub name: Option<String>,
    pub template_id: Option<String>,
    /// Root directory; generated under the environments dir when unset.
    pub root_dir: Option<PathBuf>,
    pub workload: WorkloadHint,
    pub network: Option<NetworkRequest>,
    pub vm: Option<VmRequest>,
}

impl EnvironmentSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn at(mut self, root: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(root.into());
        self
    }

    pub fn with_workload(mut self, hint: WorkloadHint) -> Self {
        self.workload = hint;
        self
    }

    pub fn with_network(mut self) -> Self {
        self.network = Some(NetworkRequest::default());
        self
    }

    pub fn with_impaired_network(mut self, impairment: Impairment) -> Self {
        self.network = Some(NetworkRequest {
            impairment: Some(impairment),
        });
        self
    }

    pub fn with_vm(mut self, vm: VmRequest) -> Self {
        self.vm = Some(vm);
        self
    }

    /// Reject requests that cannot succeed.
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let Some(impairment) = self.network.as_ref().and_then(|n| n.impairment.as_ref()) {
            impairment.validate()?;
        }
        Ok(())
    }
}

/// What `create` and `recall` hand back.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentHandle {
    record: EnvironmentRecord,
    persisted: bool,
}

impl EnvironmentHandle {
    pub fn new(record: EnvironmentRecord, persisted: bool) -> Self {
        Self { record, persisted }
    }

    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn name(&self) -> Option<&str> {
        self.record.name.as_deref()
    }

    pub fn status(&self) -> EnvironmentStatus {
        self.record.status
    }

    pub fn root_path(&self) -> &Path {
        &self.record.root_path
    }

    pub fn layout(&self) -> EnvLayout {
        EnvLayout::new(&self.record.root_path)
    }

    pub fn network(&self) -> Option<NetworkHandle> {
        self.record.network_handle()
    }

    pub fn vm(&self) -> Option<VmHandle> {
        self.record.vm_handle()
    }

    pub fn record(&self) -> &EnvironmentRecord {
        &self.record
    }

    /// `false` when the registry was unavailable at creation: the
    /// environment works but will not survive a restart.
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }
}
