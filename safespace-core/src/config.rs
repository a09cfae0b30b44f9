//! Runtime configuration.
//!
//! Settings are read from a YAML file (`$SAFESPACE_CONFIG`, falling back to
//! `~/.config/safespace/config.yaml`). Every field has a default, so a
//! missing file or a partial file is always valid. A handful of environment
//! variables override paths and the dry-run switch.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::network::Impairment;

/// Top-level settings container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub network: NetworkSettings,
    pub vm: VmSettings,
    pub resources: ResourceSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Parent directory for environment roots created without an explicit path.
    pub environments_dir: PathBuf,
    /// Directory holding the registry file and its lock.
    pub state_dir: PathBuf,
    /// Fallback log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Prefix privileged host commands with `sudo -n` when not running as root.
    pub use_sudo: bool,
    /// Record privileged commands instead of executing them.
    pub dry_run: bool,
    /// Upper bound on a single `create`; exceeding it unwinds like a failed step.
    pub create_timeout_secs: u64,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        let base = default_base_dir();
        Self {
            environments_dir: base.join("environments"),
            state_dir: base.join("state"),
            log_level: "info".to_string(),
            use_sudo: true,
            dry_run: false,
            create_timeout_secs: 300,
        }
    }
}

impl GeneralSettings {
    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }
}

/// Which isolation mechanism to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyChoice {
    /// Pick by host detection at startup.
    Auto,
    Namespace,
    PacketFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub strategy: StrategyChoice,
    /// First /24 of the subnet pool; each domain takes the next free /24.
    pub subnet_base: Ipv4Addr,
    /// Number of /24 subnets available to concurrent domains.
    pub subnet_pool_size: u8,
    pub enable_nat: bool,
    pub dns_servers: Vec<String>,
    /// Applied when a request asks for isolation without explicit impairment.
    pub default_impairment: Option<Impairment>,
    pub tools: NetworkTools,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            strategy: StrategyChoice::Auto,
            subnet_base: Ipv4Addr::new(192, 168, 100, 0),
            subnet_pool_size: 100,
            enable_nat: true,
            dns_servers: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
            default_impairment: None,
            tools: NetworkTools::default(),
        }
    }
}

/// Host binaries used by the isolation strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkTools {
    pub ip: String,
    pub iptables: String,
    pub tc: String,
    pub sysctl: String,
    pub pfctl: String,
    pub dnctl: String,
    pub ifconfig: String,
}

impl Default for NetworkTools {
    fn default() -> Self {
        Self {
            ip: "ip".to_string(),
            iptables: "iptables".to_string(),
            tc: "tc".to_string(),
            sysctl: "sysctl".to_string(),
            pfctl: "pfctl".to_string(),
            dnctl: "dnctl".to_string(),
            ifconfig: "ifconfig".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSettings {
    pub hypervisor: String,
    /// Inserted right after the hypervisor binary (`-machine q35`, a wrapper script, ...).
    pub extra_args: Vec<String>,
    pub image_tool: String,
    pub default_memory_mb: u64,
    /// When unset, the CPU count comes from the resource recommendation.
    pub default_cpus: Option<u32>,
    pub default_disk_gb: u64,
    pub use_kvm: bool,
    pub headless: bool,
    pub boot_image: Option<PathBuf>,
    /// Grace period between SIGTERM and SIGKILL on a graceful stop.
    pub stop_timeout_ms: u64,
    /// A hypervisor that exits within this window fails `start` instead of
    /// surfacing later as a crash.
    pub start_grace_ms: u64,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            hypervisor: "qemu-system-x86_64".to_string(),
            extra_args: Vec::new(),
            image_tool: "qemu-img".to_string(),
            default_memory_mb: 1024,
            default_cpus: None,
            default_disk_gb: 10,
            use_kvm: true,
            headless: true,
            boot_image: None,
            stop_timeout_ms: 10_000,
            start_grace_ms: 250,
        }
    }
}

impl VmSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn start_grace(&self) -> Duration {
        Duration::from_millis(self.start_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    pub sample_interval_secs: u64,
    /// Ring-buffer length for load samples.
    pub sample_history: usize,
    /// Share of host memory offered to one allocation under light load.
    pub memory_percent: u8,
    /// Cache ceiling as a share of host memory.
    pub max_cache_size_percent: u8,
    /// Eviction stops once the cache is at or below this share of the ceiling.
    pub cache_low_water_percent: u8,
    pub cache_dir: PathBuf,
    /// The load monitor enforces the cache ceiling every this many samples.
    pub cache_check_every: u32,
    /// Wrap the hypervisor launch in a CPU-affinity command.
    pub pin_vm_cores: bool,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            sample_interval_secs: 5,
            sample_history: 60,
            memory_percent: 50,
            max_cache_size_percent: 10,
            cache_low_water_percent: 80,
            cache_dir: default_base_dir().join("cache"),
            cache_check_every: 12,
            pin_vm_cores: false,
        }
    }
}

impl ResourceSettings {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs.max(1))
    }
}

impl Settings {
    /// Load settings from `path`, or from the default location when `None`.
    ///
    /// A missing file yields defaults; a malformed file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path(),
        };

        let mut settings = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            Self::from_yaml(&raw)
                .with_context(|| format!("Failed to parse settings in {}", path.display()))?
        } else {
            debug!(path = %path.display(), "No settings file, using defaults");
            Self::default()
        };

        settings.apply_env_overrides();
        Ok(settings)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(dir) = non_empty_env("SAFESPACE_STATE_DIR") {
            self.general.state_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty_env("SAFESPACE_ENVIRONMENTS_DIR") {
            self.general.environments_dir = PathBuf::from(dir);
        }
        if let Some(flag) = non_empty_env("SAFESPACE_DRY_RUN") {
            self.general.dry_run = matches!(flag.as_str(), "1" | "true" | "yes");
        }
    }

    /// Registry file location.
    pub fn registry_path(&self) -> PathBuf {
        self.general.state_dir.join("environments.json")
    }

    /// Settings rooted entirely under `base`, for tests and sandboxed runs.
    pub fn rooted_at(base: &Path) -> Self {
        let mut settings = Self::default();
        settings.general.environments_dir = base.join("environments");
        settings.general.state_dir = base.join("state");
        settings.resources.cache_dir = base.join("cache");
        settings
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn default_base_dir() -> PathBuf {
    match home::home_dir() {
        Some(home) => home.join(".local").join("share").join("safespace"),
        None => std::env::temp_dir().join("safespace"),
    }
}

/// `$SAFESPACE_CONFIG`, else `~/.config/safespace/config.yaml`.
pub fn default_config_path() -> PathBuf {
    if let Some(path) = non_empty_env("SAFESPACE_CONFIG") {
        return PathBuf::from(path);
    }
    match home::home_dir() {
        Some(home) => home.join(".config").join("safespace").join("config.yaml"),
        None => PathBuf::from("safespace.yaml"),
    }
}
