//! VM Provisioning and Supervision
//!
//! A VM lives in `<root>/vm/`:
//!
//! ```text
//!   disk.qcow2     created with the image tool
//!   start_vm.sh    launcher: `exec <domain prefix> <affinity> <hypervisor> ...`
//!   vm.json        persisted VmConfig
//!   vm.pid         pid of the running hypervisor
//!   console.log    hypervisor stdout/stderr
//!   monitor.sock   hypervisor monitor
//! ```
//!
//! The controller keeps the spawned [`Child`] so exits are observed through
//! `try_wait` rather than guessed from pid liveness. VMs adopted after a
//! restart only have a pid and are checked with signal 0.

use std::collections::HashMap;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::VmSettings;
use crate::environment::short_id;
use crate::error::{Error, Result};
use crate::executor::run_local;

pub const VM_DIR: &str = "vm";
pub const DISK_FILE: &str = "disk.qcow2";
pub const LAUNCH_SCRIPT: &str = "start_vm.sh";
pub const CONFIG_FILE: &str = "vm.json";
pub const PID_FILE: &str = "vm.pid";
pub const CONSOLE_LOG: &str = "console.log";
pub const MONITOR_SOCKET: &str = "monitor.sock";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Requested VM size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmSizing {
    pub cpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
}

impl VmSizing {
    pub fn validate(&self) -> Result<()> {
        if self.cpus == 0 {
            return Err(Error::VmProvisionFailed("cpu count must be at least 1".into()));
        }
        if self.memory_mb == 0 {
            return Err(Error::VmProvisionFailed("memory must be positive".into()));
        }
        if self.disk_gb == 0 {
            return Err(Error::VmProvisionFailed("disk size must be positive".into()));
        }
        Ok(())
    }
}

/// How a VM joins a network domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmAttachment {
    pub domain_id: String,
    /// Tap device inside the domain, when the mechanism uses one.
    pub tap: Option<String>,
    /// Argv prefix placing the hypervisor inside the domain.
    pub launch_prefix: Vec<String>,
}

/// Persisted VM description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    pub name: String,
    pub cpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub vm_dir: PathBuf,
    pub disk_path: PathBuf,
    pub mac_address: String,
    /// Domain id of the network this VM is attached to.
    pub network_domain: Option<String>,
    pub tap: Option<String>,
    pub monitor_socket: PathBuf,
    pub headless: bool,
    pub use_kvm: bool,
    pub boot_image: Option<PathBuf>,
    pub pid: Option<u32>,
}

impl VmConfig {
    pub fn pid_file(&self) -> PathBuf {
        self.vm_dir.join(PID_FILE)
    }

    pub fn launch_script(&self) -> PathBuf {
        self.vm_dir.join(LAUNCH_SCRIPT)
    }

    pub fn console_log(&self) -> PathBuf {
        self.vm_dir.join(CONSOLE_LOG)
    }

    /// Variables appended to the environment file.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        vec![
            ("VM_ENABLED".into(), "true".into()),
            ("VM_MEMORY".into(), format!("{}M", self.memory_mb)),
            ("VM_CPUS".into(), self.cpus.to_string()),
            ("VM_DISK_SIZE".into(), format!("{}G", self.disk_gb)),
            ("VM_MAC".into(), self.mac_address.clone()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VmHandle {
    pub env_id: Uuid,
    pub config: VmConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmStatus {
    /// Provisioned, never started.
    Pending,
    Running,
    /// Stopped on request.
    Stopped,
    /// Exited without being asked to.
    Crashed,
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}

struct Supervised {
    config: VmConfig,
    child: Option<Child>,
    status: VmStatus,
}

/// Provisions, starts, stops and watches hypervisor processes.
pub struct VmController {
    settings: VmSettings,
    vms: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<Supervised>>>>,
}

impl VmController {
    pub fn new(settings: VmSettings) -> Self {
        Self {
            settings,
            vms: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &VmSettings {
        &self.settings
    }

    /// Create the disk and launch artifacts. Nothing is started.
    pub async fn provision(
        &self,
        env_id: Uuid,
        vm_dir: &Path,
        sizing: VmSizing,
        attachment: Option<&VmAttachment>,
        affinity: Vec<String>,
    ) -> Result<VmHandle> {
        sizing.validate()?;
        if self.slot(env_id).is_some() {
            return Err(Error::VmProvisionFailed(format!(
                "environment {env_id} already has a VM"
            )));
        }

        tokio::fs::create_dir_all(vm_dir)
            .await
            .map_err(|e| Error::fs(vm_dir, e))?;

        let config = VmConfig {
            name: format!("safespace-{}", short_id(&env_id)),
            cpus: sizing.cpus,
            memory_mb: sizing.memory_mb,
            disk_gb: sizing.disk_gb,
            vm_dir: vm_dir.to_path_buf(),
            disk_path: vm_dir.join(DISK_FILE),
            mac_address: mac_address(&env_id),
            network_domain: attachment.map(|a| a.domain_id.clone()),
            tap: attachment.and_then(|a| a.tap.clone()),
            monitor_socket: vm_dir.join(MONITOR_SOCKET),
            headless: self.settings.headless,
            use_kvm: self.settings.use_kvm,
            boot_image: self.settings.boot_image.clone(),
            pid: None,
        };

        if let Err(e) = self.write_artifacts(&config, attachment, affinity).await {
            let _ = tokio::fs::remove_dir_all(vm_dir).await;
            return Err(e);
        }

        self.lock_vms().insert(
            env_id,
            Arc::new(tokio::sync::Mutex::new(Supervised {
                config: config.clone(),
                child: None,
                status: VmStatus::Pending,
            })),
        );

        info!(
            %env_id,
            cpus = config.cpus,
            memory_mb = config.memory_mb,
            disk_gb = config.disk_gb,
            domain = config.network_domain.as_deref().unwrap_or("-"),
            "VM provisioned"
        );
        Ok(VmHandle { env_id, config })
    }

    async fn write_artifacts(
        &self,
        config: &VmConfig,
        attachment: Option<&VmAttachment>,
        affinity: Vec<String>,
    ) -> Result<()> {
        let disk_argv = vec![
            self.settings.image_tool.clone(),
            "create".to_string(),
            "-f".to_string(),
            "qcow2".to_string(),
            config.disk_path.display().to_string(),
            format!("{}G", config.disk_gb),
        ];
        let output = run_local(&disk_argv, Some(&config.vm_dir), &HashMap::new())
            .await
            .map_err(|e| Error::VmProvisionFailed(format!("disk image creation failed: {e:#}")))?;
        if !output.success() {
            return Err(Error::VmProvisionFailed(format!(
                "disk image creation failed: {}",
                output.failure_reason()
            )));
        }

        let mut launch = attachment
            .map(|a| a.launch_prefix.clone())
            .unwrap_or_default();
        launch.extend(affinity);
        launch.extend(self.hypervisor_argv(config, attachment));

        let script = launch_script(config, &launch);
        let script_path = config.launch_script();
        tokio::fs::write(&script_path, script)
            .await
            .map_err(|e| Error::fs(&script_path, e))?;
        tokio::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(|e| Error::fs(&script_path, e))?;

        write_config(config).await
    }

    fn hypervisor_argv(&self, config: &VmConfig, attachment: Option<&VmAttachment>) -> Vec<String> {
        let mut argv = vec![self.settings.hypervisor.clone()];
        argv.extend(self.settings.extra_args.iter().cloned());
        argv.extend([
            "-name".to_string(),
            config.name.clone(),
            "-m".to_string(),
            format!("{}M", config.memory_mb),
            "-smp".to_string(),
            config.cpus.to_string(),
        ]);
        if config.use_kvm && cfg!(target_os = "linux") {
            argv.push("-enable-kvm".to_string());
        }
        argv.push("-drive".to_string());
        argv.push(format!("file={},if=virtio,format=qcow2", config.disk_path.display()));
        if let Some(image) = &config.boot_image {
            argv.push("-cdrom".to_string());
            argv.push(image.display().to_string());
            argv.push("-boot".to_string());
            argv.push("d".to_string());
        }

        let netdev = match (attachment, &config.tap) {
            (Some(_), Some(tap)) => format!("tap,id=net0,ifname={tap},script=no,downscript=no"),
            // Attached without a tap: user-mode networking with no route out of the guest.
            (Some(_), None) => "user,id=net0,restrict=on".to_string(),
            (None, _) => "user,id=net0".to_string(),
        };
        argv.push("-netdev".to_string());
        argv.push(netdev);
        argv.push("-device".to_string());
        argv.push(format!("virtio-net-pci,netdev=net0,mac={}", config.mac_address));

        if config.headless {
            argv.push("-nographic".to_string());
        }
        argv.push("-monitor".to_string());
        argv.push(format!("unix:{},server,nowait", config.monitor_socket.display()));
        argv
    }

    /// Launch a provisioned VM. Starting a running VM returns its handle.
    pub async fn start(&self, handle: &VmHandle) -> Result<VmHandle> {
        let slot = self.slot(handle.env_id).ok_or_else(|| {
            Error::VmProvisionFailed(format!("environment {} has no provisioned VM", handle.env_id))
        })?;
        let mut vm = slot.lock().await;

        if refresh(&mut vm) == VmStatus::Running {
            return Ok(VmHandle {
                env_id: handle.env_id,
                config: vm.config.clone(),
            });
        }

        let log_path = vm.config.console_log();
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| Error::fs(&log_path, e))?;
        let log_err = log.try_clone().map_err(|e| Error::fs(&log_path, e))?;

        let mut child = Command::new("sh")
            .arg(vm.config.launch_script())
            .current_dir(&vm.config.vm_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| Error::VmProvisionFailed(format!("failed to launch hypervisor: {e}")))?;
        let Some(pid) = child.id() else {
            reap(handle.env_id, &mut child).await;
            return Err(Error::VmProvisionFailed("hypervisor exited before reporting a pid".into()));
        };

        tokio::time::sleep(self.settings.start_grace()).await;
        if let Ok(Some(status)) = child.try_wait() {
            vm.status = VmStatus::Crashed;
            return Err(Error::VmProvisionFailed(format!(
                "hypervisor exited during startup ({status}), see {}",
                log_path.display()
            )));
        }

        // Nothing supervises the child until it is stored below.
        let pid_file = vm.config.pid_file();
        if let Err(e) = tokio::fs::write(&pid_file, format!("{pid}\n")).await {
            reap(handle.env_id, &mut child).await;
            vm.status = VmStatus::Crashed;
            return Err(Error::fs(&pid_file, e));
        }

        vm.config.pid = Some(pid);
        vm.child = Some(child);
        vm.status = VmStatus::Running;
        if let Err(e) = write_config(&vm.config).await {
            warn!(env_id = %handle.env_id, error = %e, "Failed to update vm.json");
        }

        info!(env_id = %handle.env_id, pid, "VM started");
        Ok(VmHandle {
            env_id: handle.env_id,
            config: vm.config.clone(),
        })
    }

    /// Stop a VM. Graceful stops send SIGTERM and escalate to SIGKILL after
    /// the configured timeout.
    pub async fn stop(&self, handle: &VmHandle, graceful: bool) -> Result<VmStatus> {
        let timeout = self.settings.stop_timeout();
        match self.slot(handle.env_id) {
            Some(slot) => {
                let mut guard = slot.lock().await;
                let vm = &mut *guard;
                match vm.child.as_mut() {
                    Some(child) => stop_child(handle.env_id, child, graceful, timeout).await,
                    None => {
                        if let Some(pid) = vm.config.pid {
                            stop_pid(handle.env_id, pid, graceful, timeout).await;
                        }
                    }
                }
                vm.child = None;
                vm.status = VmStatus::Stopped;
            }
            None => {
                if let Some(pid) = handle.config.pid {
                    stop_pid(handle.env_id, pid, graceful, timeout).await;
                }
            }
        }

        match tokio::fs::remove_file(handle.config.pid_file()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(env_id = %handle.env_id, error = %e, "Failed to remove pid file"),
        }
        Ok(VmStatus::Stopped)
    }

    /// Current status. A supervised VM that exited on its own is `Crashed`.
    pub async fn status(&self, handle: &VmHandle) -> VmStatus {
        match self.slot(handle.env_id) {
            Some(slot) => {
                let mut vm = slot.lock().await;
                let before = vm.status;
                let now = refresh(&mut vm);
                if before == VmStatus::Running && now == VmStatus::Crashed {
                    warn!(env_id = %handle.env_id, pid = ?vm.config.pid, "VM exited unexpectedly");
                }
                now
            }
            None => match handle.config.pid {
                Some(pid) if pid_alive(pid) => VmStatus::Running,
                Some(_) => VmStatus::Crashed,
                None => VmStatus::Pending,
            },
        }
    }

    /// Supervise a VM that was started by an earlier process.
    pub fn adopt(&self, handle: &VmHandle) {
        let mut vms = self.lock_vms();
        if vms.contains_key(&handle.env_id) {
            return;
        }
        let status = match handle.config.pid {
            Some(pid) if pid_alive(pid) => VmStatus::Running,
            Some(_) => VmStatus::Crashed,
            None => VmStatus::Pending,
        };
        debug!(env_id = %handle.env_id, %status, "Adopted VM");
        vms.insert(
            handle.env_id,
            Arc::new(tokio::sync::Mutex::new(Supervised {
                config: handle.config.clone(),
                child: None,
                status,
            })),
        );
    }

    /// Drop supervision state for an environment.
    pub fn forget(&self, env_id: Uuid) {
        self.lock_vms().remove(&env_id);
    }

    /// Undo `provision`: forget the VM and delete its directory.
    pub async fn discard(&self, handle: &VmHandle) -> Result<()> {
        self.forget(handle.env_id);
        match tokio::fs::remove_dir_all(&handle.config.vm_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::fs(&handle.config.vm_dir, e)),
        }
    }

    pub fn supervised_count(&self) -> usize {
        self.lock_vms().len()
    }

    fn slot(&self, env_id: Uuid) -> Option<Arc<tokio::sync::Mutex<Supervised>>> {
        self.lock_vms().get(&env_id).cloned()
    }

    fn lock_vms(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<tokio::sync::Mutex<Supervised>>>> {
        self.vms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn refresh(vm: &mut Supervised) -> VmStatus {
    if vm.status != VmStatus::Running {
        return vm.status;
    }
    let exited = match vm.child.as_mut() {
        Some(child) => match child.try_wait() {
            Ok(None) => None,
            Ok(Some(code)) if code.success() => Some(VmStatus::Stopped),
            _ => Some(VmStatus::Crashed),
        },
        // No exit code for a process we did not spawn.
        None => match vm.config.pid {
            Some(pid) if pid_alive(pid) => None,
            _ => Some(VmStatus::Crashed),
        },
    };
    if let Some(status) = exited {
        vm.status = status;
    }
    vm.status
}

async fn stop_child(env_id: Uuid, child: &mut Child, graceful: bool, timeout: Duration) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        debug!(%env_id, "VM already exited");
        return;
    }

    if graceful {
        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(%env_id, pid, error = %e, "SIGTERM failed");
            }
        }
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(_) => {
                info!(%env_id, "VM stopped");
                return;
            }
            Err(_) => warn!(
                %env_id,
                timeout_ms = timeout.as_millis() as u64,
                "VM ignored SIGTERM, killing"
            ),
        }
    }

    if let Err(e) = child.kill().await {
        warn!(%env_id, error = %e, "Failed to kill VM");
    } else {
        info!(%env_id, "VM killed");
    }
}

/// Kill and wait a hypervisor that never became supervised.
async fn reap(env_id: Uuid, child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(%env_id, error = %e, "Failed to kill half-started VM");
    }
}

async fn stop_pid(env_id: Uuid, pid: u32, graceful: bool, timeout: Duration) {
    if !pid_alive(pid) {
        return;
    }
    let target = Pid::from_raw(pid as i32);

    if graceful {
        let _ = kill(target, Signal::SIGTERM);
        if wait_for_exit(pid, timeout).await {
            info!(%env_id, pid, "VM stopped");
            return;
        }
        warn!(%env_id, pid, "VM ignored SIGTERM, killing");
    }

    let _ = kill(target, Signal::SIGKILL);
    if !wait_for_exit(pid, Duration::from_secs(1)).await {
        warn!(%env_id, pid, "VM still alive after SIGKILL");
    }
}

async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    !pid_alive(pid)
}

/// Terminate a hypervisor that no environment owns.
pub async fn kill_orphan(pid: u32, timeout: Duration) {
    stop_pid(Uuid::nil(), pid, true, timeout).await;
}

/// `true` if `pid` names a live, non-zombie process.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .is_some_and(|state| state == 'Z')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Locally administered MAC derived from the environment id.
pub fn mac_address(env_id: &Uuid) -> String {
    let b = env_id.as_bytes();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", b[13], b[14], b[15])
}

/// Read `<root>/vm/vm.pid` if present.
pub fn read_pid_file(root: &Path) -> Option<u32> {
    let raw = std::fs::read_to_string(root.join(VM_DIR).join(PID_FILE)).ok()?;
    raw.trim().parse().ok()
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=,@%+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn launch_script(config: &VmConfig, argv: &[String]) -> String {
    let command = argv
        .iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ");
    format!("#!/bin/sh\n# SafeSpace VM launcher for {}\nexec {command}\n", config.name)
}

async fn write_config(config: &VmConfig) -> Result<()> {
    let path = config.vm_dir.join(CONFIG_FILE);
    let body = serde_json::to_vec_pretty(config)
        .map_err(|e| Error::VmProvisionFailed(format!("cannot serialize vm.json: {e}")))?;
    tokio::fs::write(&path, body)
        .await
        .map_err(|e| Error::fs(&path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> VmSettings {
        VmSettings {
            image_tool: "true".to_string(),
            use_kvm: false,
            stop_timeout_ms: 300,
            start_grace_ms: 50,
            ..VmSettings::default()
        }
    }

    /// Runs `body` through `/bin/sh` in place of the hypervisor.
    fn fake_settings(dir: &Path, body: &str) -> VmSettings {
        let path = dir.join("fake-hypervisor.sh");
        std::fs::write(&path, format!("{body}\n")).unwrap();
        VmSettings {
            hypervisor: "/bin/sh".to_string(),
            extra_args: vec![path.display().to_string()],
            ..settings()
        }
    }

    const SIZING: VmSizing = VmSizing {
        cpus: 1,
        memory_mb: 256,
        disk_gb: 1,
    };

    // ── artifacts ─────────────────────────────────────────────────────

    #[test]
    fn test_mac_is_locally_administered_and_stable() {
        let id = Uuid::new_v4();
        let mac = mac_address(&id);
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.len(), 17);
        assert_eq!(mac, mac_address(&id));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("-m"), "-m");
        assert_eq!(shell_quote("file=/a b"), "'file=/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[tokio::test]
    async fn test_rejects_invalid_sizing_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = VmController::new(settings());
        let vm_dir = dir.path().join("vm");
        for sizing in [
            VmSizing { cpus: 0, ..SIZING },
            VmSizing { memory_mb: 0, ..SIZING },
            VmSizing { disk_gb: 0, ..SIZING },
        ] {
            let err = ctl
                .provision(Uuid::new_v4(), &vm_dir, sizing, None, Vec::new())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::VmProvisionFailed(_)));
        }
        assert!(!vm_dir.exists());
    }

    #[tokio::test]
    async fn test_provision_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = VmController::new(settings());
        let vm_dir = dir.path().join("vm");
        let attachment = VmAttachment {
            domain_id: "ss-12345678".into(),
            tap: Some("tap-12345678".into()),
            launch_prefix: vec!["ip".into(), "netns".into(), "exec".into(), "ss-12345678".into()],
        };

        let handle = ctl
            .provision(Uuid::new_v4(), &vm_dir, SIZING, Some(&attachment), Vec::new())
            .await
            .unwrap();

        let script = std::fs::read_to_string(vm_dir.join(LAUNCH_SCRIPT)).unwrap();
        assert!(script.contains("exec ip netns exec ss-12345678 qemu-system-x86_64"));
        assert!(script.contains("ifname=tap-12345678"));
        assert!(script.contains("-m 256M"));
        assert!(!script.contains("user,id=net0"));

        let saved: VmConfig =
            serde_json::from_slice(&std::fs::read(vm_dir.join(CONFIG_FILE)).unwrap()).unwrap();
        assert_eq!(saved, handle.config);
        assert_eq!(saved.network_domain.as_deref(), Some("ss-12345678"));
        assert_eq!(ctl.status(&handle).await, VmStatus::Pending);
    }

    #[tokio::test]
    async fn test_unattached_vm_uses_user_networking() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = VmController::new(settings());
        let vm_dir = dir.path().join("vm");
        ctl.provision(Uuid::new_v4(), &vm_dir, SIZING, None, vec!["taskset".into(), "-c".into(), "0".into()])
            .await
            .unwrap();
        let script = std::fs::read_to_string(vm_dir.join(LAUNCH_SCRIPT)).unwrap();
        assert!(script.contains("exec taskset -c 0 qemu-system-x86_64"));
        assert!(script.contains("user,id=net0"));
    }

    #[tokio::test]
    async fn test_image_tool_failure_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings();
        s.image_tool = "false".into();
        let ctl = VmController::new(s);
        let vm_dir = dir.path().join("vm");
        let err = ctl
            .provision(Uuid::new_v4(), &vm_dir, SIZING, None, Vec::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk image creation failed"));
        assert!(!vm_dir.exists());
        assert_eq!(ctl.supervised_count(), 0);
    }

    // ── supervision ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_graceful_stop() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = VmController::new(fake_settings(dir.path(), "trap 'exit 0' TERM\nwhile :; do sleep 0.05; done"));
        let handle = ctl
            .provision(Uuid::new_v4(), &dir.path().join("vm"), SIZING, None, Vec::new())
            .await
            .unwrap();

        let running = ctl.start(&handle).await.unwrap();
        let pid = running.config.pid.unwrap();
        assert!(pid_alive(pid));
        assert_eq!(read_pid_file(dir.path()), Some(pid));
        assert_eq!(ctl.status(&running).await, VmStatus::Running);

        assert_eq!(ctl.stop(&running, true).await.unwrap(), VmStatus::Stopped);
        assert!(!pid_alive(pid));
        assert_eq!(ctl.status(&running).await, VmStatus::Stopped);
        assert_eq!(read_pid_file(dir.path()), None);
    }

    #[tokio::test]
    async fn test_forced_kill_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = VmController::new(fake_settings(dir.path(), "trap '' TERM\nwhile :; do sleep 0.05; done"));
        let handle = ctl
            .provision(Uuid::new_v4(), &dir.path().join("vm"), SIZING, None, Vec::new())
            .await
            .unwrap();
        let running = ctl.start(&handle).await.unwrap();
        let pid = running.config.pid.unwrap();

        let started = std::time::Instant::now();
        assert_eq!(ctl.stop(&running, true).await.unwrap(), VmStatus::Stopped);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(!pid_alive(pid));
    }

    #[tokio::test]
    async fn test_crash_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = VmController::new(fake_settings(dir.path(), "sleep 0.3\nexit 1"));
        let handle = ctl
            .provision(Uuid::new_v4(), &dir.path().join("vm"), SIZING, None, Vec::new())
            .await
            .unwrap();
        let running = ctl.start(&handle).await.unwrap();
        assert_eq!(ctl.status(&running).await, VmStatus::Running);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(ctl.status(&running).await, VmStatus::Crashed);
    }

    #[tokio::test]
    async fn test_clean_exit_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = VmController::new(fake_settings(dir.path(), "sleep 0.3\nexit 0"));
        let handle = ctl
            .provision(Uuid::new_v4(), &dir.path().join("vm"), SIZING, None, Vec::new())
            .await
            .unwrap();
        let running = ctl.start(&handle).await.unwrap();
        assert_eq!(ctl.status(&running).await, VmStatus::Running);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(ctl.status(&running).await, VmStatus::Stopped);
    }

    #[tokio::test]
    async fn test_pid_file_failure_kills_hypervisor() {
        let dir = tempfile::tempdir().unwrap();
        // The hypervisor runs in the VM dir, so this blocks the pid file.
        let body = format!(
            "echo $$ > {}\nmkdir vm.pid\nwhile :; do sleep 0.05; done",
            dir.path().join("hypervisor.pid").display()
        );
        let ctl = VmController::new(fake_settings(dir.path(), &body));
        let handle = ctl
            .provision(Uuid::new_v4(), &dir.path().join("vm"), SIZING, None, Vec::new())
            .await
            .unwrap();

        let err = ctl.start(&handle).await.unwrap_err();
        assert!(matches!(err, Error::Filesystem { .. }), "{err}");
        let raw = std::fs::read_to_string(dir.path().join("hypervisor.pid")).unwrap();
        let pid: u32 = raw.trim().parse().unwrap();
        assert!(!pid_alive(pid));
        assert_eq!(ctl.status(&handle).await, VmStatus::Crashed);
    }

    #[tokio::test]
    async fn test_immediate_exit_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = fake_settings(dir.path(), "exit 3");
        s.start_grace_ms = 300;
        let ctl = VmController::new(s);
        let handle = ctl
            .provision(Uuid::new_v4(), &dir.path().join("vm"), SIZING, None, Vec::new())
            .await
            .unwrap();
        let err = ctl.start(&handle).await.unwrap_err();
        assert!(matches!(err, Error::VmProvisionFailed(_)));
    }

    #[tokio::test]
    async fn test_adopted_vm_is_stopped_by_pid() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake_settings(dir.path(), "trap 'exit 0' TERM\nwhile :; do sleep 0.05; done");
        let first = VmController::new(fake.clone());
        let handle = first
            .provision(Uuid::new_v4(), &dir.path().join("vm"), SIZING, None, Vec::new())
            .await
            .unwrap();
        let running = first.start(&handle).await.unwrap();
        let pid = running.config.pid.unwrap();

        // A fresh controller, as after a process restart.
        let second = VmController::new(fake);
        second.adopt(&running);
        assert_eq!(second.status(&running).await, VmStatus::Running);
        second.stop(&running, true).await.unwrap();

        // The first controller still owns the child; reap it.
        first.stop(&running, false).await.unwrap();
        assert!(!pid_alive(pid));
    }

    #[tokio::test]
    async fn test_discard_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = VmController::new(settings());
        let vm_dir = dir.path().join("vm");
        let handle = ctl
            .provision(Uuid::new_v4(), &vm_dir, SIZING, None, Vec::new())
            .await
            .unwrap();
        ctl.discard(&handle).await.unwrap();
        assert!(!vm_dir.exists());
        assert_eq!(ctl.supervised_count(), 0);
        ctl.discard(&handle).await.unwrap();
    }
}
