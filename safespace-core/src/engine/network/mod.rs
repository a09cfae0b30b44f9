//! Network Isolation Domains
//!
//! A domain confines an environment's traffic. Two mechanisms sit behind
//! [`IsolationStrategy`]:
//!
//! - [`NamespaceStrategy`]: Linux network namespace + veth pair, NAT,
//!   `tc netem` impairment
//! - [`PacketFilterStrategy`]: macOS loopback alias + pf anchor, dummynet
//!   impairment
//!
//! Each strategy turns a [`NetworkConfig`] into plain command lists; the
//! [`NetworkIsolationController`] runs them through a [`CommandRunner`],
//! tracks domain state and owns subnet leases.
//!
//! Domain lifecycle: absent → creating → ready → tearing-down → absent.

mod address;
mod namespace;
mod packet_filter;
pub mod steps;

pub use address::{AddressPlan, SubnetAllocator};
pub use namespace::NamespaceStrategy;
pub use packet_filter::PacketFilterStrategy;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{NetworkSettings, StrategyChoice};
use crate::engine::vm::VmAttachment;
use crate::environment::short_id;
use crate::error::{Error, Result};
use crate::executor::{CommandOutput, CommandRunner};
use steps::{SetupStep, StepAction};

/// Link impairment applied to a domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Impairment {
    pub latency_ms: u32,
    pub jitter_ms: u32,
    pub loss_percent: f64,
    pub bandwidth_kbit: Option<u64>,
}

impl Impairment {
    pub fn validate(&self) -> Result<()> {
        if !self.loss_percent.is_finite() || !(0.0..=100.0).contains(&self.loss_percent) {
            return Err(Error::InvalidSpec(format!(
                "packet loss must be within 0-100%, got {}",
                self.loss_percent
            )));
        }
        if self.bandwidth_kbit == Some(0) {
            return Err(Error::InvalidSpec("bandwidth must be positive".into()));
        }
        Ok(())
    }

    /// `true` when applying this would change nothing.
    pub fn is_noop(&self) -> bool {
        self.latency_ms == 0
            && self.jitter_ms == 0
            && self.loss_percent == 0.0
            && self.bandwidth_kbit.is_none()
    }

    /// Arguments following `netem`.
    pub fn netem_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.latency_ms > 0 || self.jitter_ms > 0 {
            args.push("delay".to_string());
            args.push(format!("{}ms", self.latency_ms));
            if self.jitter_ms > 0 {
                args.push(format!("{}ms", self.jitter_ms));
            }
        }
        if self.loss_percent > 0.0 {
            args.push("loss".to_string());
            args.push(format!("{}%", self.loss_percent));
        }
        if let Some(kbit) = self.bandwidth_kbit {
            args.push("rate".to_string());
            args.push(format!("{kbit}kbit"));
        }
        args
    }

    /// Arguments following `dnctl pipe N config`. Dummynet has no jitter.
    pub fn dummynet_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.latency_ms > 0 {
            args.push("delay".to_string());
            args.push(self.latency_ms.to_string());
        }
        if self.loss_percent > 0.0 {
            args.push("plr".to_string());
            args.push(format!("{}", self.loss_percent / 100.0));
        }
        if let Some(kbit) = self.bandwidth_kbit {
            args.push("bw".to_string());
            args.push(format!("{kbit}Kbit/s"));
        }
        args
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Namespace,
    PacketFilter,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespace => write!(f, "namespace"),
            Self::PacketFilter => write!(f, "packet-filter"),
        }
    }
}

/// Persisted description of a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// `ss-<8 hex>`: namespace name or pf anchor leaf.
    pub domain_id: String,
    pub strategy: StrategyKind,
    pub plan: AddressPlan,
    pub host_iface: String,
    pub guest_iface: String,
    pub nat: bool,
    pub impairment: Option<Impairment>,
    pub dns_servers: Vec<String>,
    /// Tap device created for a VM, if one was attached.
    #[serde(default)]
    pub vm_tap: Option<String>,
}

impl NetworkConfig {
    pub fn new(
        env_id: Uuid,
        strategy: StrategyKind,
        plan: AddressPlan,
        settings: &NetworkSettings,
        impairment: Option<Impairment>,
    ) -> Self {
        let short = short_id(&env_id);
        Self {
            domain_id: format!("ss-{short}"),
            strategy,
            plan,
            host_iface: format!("vh-{short}"),
            guest_iface: format!("vg-{short}"),
            nat: settings.enable_nat,
            impairment,
            dns_servers: settings.dns_servers.clone(),
            vm_tap: None,
        }
    }

    /// Variables appended to the environment file.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        vec![
            ("NETWORK_ENABLED".into(), "true".into()),
            ("NETWORK_DOMAIN".into(), self.domain_id.clone()),
            ("NETWORK_SUBNET".into(), self.plan.cidr()),
            ("NETWORK_HOST_IP".into(), self.plan.host_ip.to_string()),
            ("NETWORK_GUEST_IP".into(), self.plan.guest_ip.to_string()),
            ("NETWORK_DNS".into(), self.dns_servers.join(",")),
        ]
    }
}

/// Live reference to a domain owned by one environment.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkHandle {
    pub env_id: Uuid,
    pub config: NetworkConfig,
}

impl NetworkHandle {
    pub fn domain_id(&self) -> &str {
        &self.config.domain_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Absent,
    Creating,
    Ready,
    TearingDown,
}

/// Mechanism-specific command construction.
pub trait IsolationStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Ordered setup, each step carrying its own undo.
    fn setup_steps(&self, config: &NetworkConfig) -> Vec<SetupStep>;

    /// Best-effort removal of everything `setup_steps` created.
    fn teardown_actions(&self, config: &NetworkConfig) -> Vec<StepAction>;

    /// Steps that create a VM tap inside the domain.
    fn attach_steps(&self, config: &NetworkConfig, tap: &str) -> Vec<SetupStep>;

    /// Whether VMs attach through a tap device.
    fn wants_tap(&self) -> bool;

    /// Argv prefix that runs a command inside the domain.
    fn exec_prefix(&self, config: &NetworkConfig) -> Vec<String>;

    fn probe_command(&self, config: &NetworkConfig) -> Vec<String>;

    fn domain_present(&self, config: &NetworkConfig, output: &CommandOutput) -> bool;

    /// Command listing every domain on the host.
    fn list_command(&self) -> Vec<String>;

    fn parse_domains(&self, output: &CommandOutput) -> Vec<String>;

    /// Removal of a domain known only by its id.
    fn orphan_teardown(&self, domain_id: &str) -> Vec<StepAction>;
}

/// Prefix shared by every domain id this engine creates.
pub const DOMAIN_PREFIX: &str = "ss-";

struct DomainEntry {
    config: NetworkConfig,
    state: DomainState,
}

/// Creates, tracks and destroys isolation domains.
pub struct NetworkIsolationController {
    strategy: Box<dyn IsolationStrategy>,
    runner: Arc<dyn CommandRunner>,
    settings: NetworkSettings,
    domains: Mutex<HashMap<Uuid, DomainEntry>>,
    subnets: Mutex<SubnetAllocator>,
}

impl NetworkIsolationController {
    /// Controller using the strategy chosen by `settings.strategy`.
    pub fn new(settings: NetworkSettings, state_dir: &Path, runner: Arc<dyn CommandRunner>) -> Self {
        let strategy = select_strategy(&settings, state_dir);
        Self::with_strategy(settings, strategy, runner)
    }

    pub fn with_strategy(
        settings: NetworkSettings,
        strategy: Box<dyn IsolationStrategy>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        info!(strategy = %strategy.kind(), runner = runner.runner_type(), "Network isolation ready");
        let subnets = SubnetAllocator::new(settings.subnet_base, settings.subnet_pool_size);
        Self {
            strategy,
            runner,
            settings,
            domains: Mutex::new(HashMap::new()),
            subnets: Mutex::new(subnets),
        }
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    /// Lease a subnet for `env_id`.
    pub fn allocate(&self, env_id: Uuid) -> Result<AddressPlan> {
        self.allocate_avoiding(env_id, &BTreeSet::new())
    }

    /// Lease a subnet for `env_id` that is not in `held`.
    pub fn allocate_avoiding(&self, env_id: Uuid, held: &BTreeSet<u8>) -> Result<AddressPlan> {
        self.lock_subnets()
            .allocate_avoiding(env_id, held)
            .ok_or_else(|| Error::IsolationSetupFailed {
                step: "allocate-subnet".into(),
                reason: format!("all {} subnets are in use", self.settings.subnet_pool_size),
            })
    }

    /// Restore a lease from persisted state.
    pub fn reserve(&self, env_id: Uuid, plan: &AddressPlan) -> bool {
        self.lock_subnets().reserve(env_id, plan)
    }

    pub fn release(&self, env_id: Uuid) {
        if let Some(index) = self.lock_subnets().release(env_id) {
            debug!(%env_id, index, "Released subnet");
        }
    }

    pub fn state(&self, env_id: Uuid) -> DomainState {
        self.lock_domains()
            .get(&env_id)
            .map(|e| e.state)
            .unwrap_or(DomainState::Absent)
    }

    /// Build a domain on the leased `plan`.
    ///
    /// On failure every step that completed has been undone and the error
    /// names the step that failed.
    pub async fn create(
        &self,
        env_id: Uuid,
        plan: AddressPlan,
        impairment: Option<Impairment>,
    ) -> Result<NetworkHandle> {
        let impairment = impairment.or(self.settings.default_impairment);
        if let Some(shape) = &impairment {
            shape.validate()?;
        }

        let config = NetworkConfig::new(env_id, self.strategy.kind(), plan, &self.settings, impairment);
        {
            let mut domains = self.lock_domains();
            if domains.contains_key(&env_id) {
                return Err(Error::IsolationSetupFailed {
                    step: "reserve-domain".into(),
                    reason: format!("environment {env_id} already has a network domain"),
                });
            }
            domains.insert(
                env_id,
                DomainEntry {
                    config: config.clone(),
                    state: DomainState::Creating,
                },
            );
        }

        info!(%env_id, domain = %config.domain_id, subnet = %plan.cidr(), "Creating network domain");
        match steps::execute(self.runner.as_ref(), self.strategy.setup_steps(&config)).await {
            Ok(report) => {
                if let Some(entry) = self.lock_domains().get_mut(&env_id) {
                    entry.state = DomainState::Ready;
                }
                info!(
                    %env_id,
                    domain = %config.domain_id,
                    steps = report.results.len(),
                    ms = report.total_duration.as_millis() as u64,
                    slowest = report.slowest().map(|r| r.name.as_str()).unwrap_or("-"),
                    "Network domain ready"
                );
                Ok(NetworkHandle { env_id, config })
            }
            Err(failure) => {
                self.lock_domains().remove(&env_id);
                for w in &failure.undo_warnings {
                    warn!(%env_id, undo = %w, "Network undo step failed");
                }
                Err(Error::IsolationSetupFailed {
                    step: failure.step,
                    reason: failure.reason,
                })
            }
        }
    }

    /// Prepare the domain for a VM. Returns the updated handle and what the
    /// VM controller needs to launch inside the domain.
    pub async fn attach_vm(&self, handle: &NetworkHandle) -> Result<(NetworkHandle, VmAttachment)> {
        if !self.strategy.wants_tap() {
            let attachment = VmAttachment {
                domain_id: handle.config.domain_id.clone(),
                tap: None,
                launch_prefix: self.launch_prefix(handle),
            };
            return Ok((handle.clone(), attachment));
        }

        let tap = format!("tap-{}", short_id(&handle.env_id));
        let steps = self.strategy.attach_steps(&handle.config, &tap);
        if let Err(failure) = steps::execute(self.runner.as_ref(), steps).await {
            return Err(Error::IsolationSetupFailed {
                step: failure.step,
                reason: failure.reason,
            });
        }

        let mut updated = handle.clone();
        updated.config.vm_tap = Some(tap.clone());
        if let Some(entry) = self.lock_domains().get_mut(&handle.env_id) {
            entry.config.vm_tap = Some(tap.clone());
        }
        debug!(env_id = %handle.env_id, %tap, "VM tap attached");

        let attachment = VmAttachment {
            domain_id: updated.config.domain_id.clone(),
            tap: Some(tap),
            launch_prefix: self.launch_prefix(&updated),
        };
        Ok((updated, attachment))
    }

    /// Argv prefix for launching a long-running process inside the domain.
    pub fn launch_prefix(&self, handle: &NetworkHandle) -> Vec<String> {
        self.runner
            .launch_prefix(self.strategy.exec_prefix(&handle.config))
    }

    /// Run `argv` inside a ready domain.
    pub async fn run_in(&self, handle: &NetworkHandle, argv: &[String]) -> Result<CommandOutput> {
        if self.state(handle.env_id) != DomainState::Ready {
            return Err(Error::NotFound(format!(
                "network domain {} is not ready",
                handle.config.domain_id
            )));
        }
        let mut full = self.strategy.exec_prefix(&handle.config);
        full.extend(argv.iter().cloned());
        Ok(self.runner.run(&full).await?)
    }

    /// Tear a domain down. Idempotent: an absent domain is a no-op.
    ///
    /// Individual teardown failures do not stop the remaining actions; they
    /// are returned as warnings.
    pub async fn destroy(&self, handle: &NetworkHandle) -> Result<Vec<String>> {
        let env_id = handle.env_id;
        let known = {
            let mut domains = self.lock_domains();
            match domains.get_mut(&env_id) {
                Some(entry) if entry.state == DomainState::TearingDown => return Ok(Vec::new()),
                Some(entry) => {
                    entry.state = DomainState::TearingDown;
                    true
                }
                None => false,
            }
        };

        if !known {
            match self.exists(&handle.config).await {
                Ok(false) => {
                    self.release(env_id);
                    debug!(%env_id, domain = %handle.config.domain_id, "Domain already absent");
                    return Ok(Vec::new());
                }
                Ok(true) => {}
                Err(e) => debug!(%env_id, error = %e, "Domain probe failed, tearing down anyway"),
            }
        }

        info!(%env_id, domain = %handle.config.domain_id, "Destroying network domain");
        let mut warnings =
            steps::teardown(self.runner.as_ref(), self.strategy.teardown_actions(&handle.config)).await;

        if let Ok(true) = self.exists(&handle.config).await {
            warnings.push(format!("domain {} still present after teardown", handle.config.domain_id));
        }

        self.lock_domains().remove(&env_id);
        self.release(env_id);
        for w in &warnings {
            warn!(%env_id, warning = %w, "Network teardown incomplete");
        }
        Ok(warnings)
    }

    /// Ask the host whether the domain exists.
    pub async fn exists(&self, config: &NetworkConfig) -> anyhow::Result<bool> {
        let output = self.runner.run(&self.strategy.probe_command(config)).await?;
        if !output.success() {
            anyhow::bail!("domain probe failed: {}", output.failure_reason());
        }
        Ok(self.strategy.domain_present(config, &output))
    }

    /// Ids of every domain on the host created by this engine.
    pub async fn live_domains(&self) -> anyhow::Result<Vec<String>> {
        let output = self.runner.run(&self.strategy.list_command()).await?;
        if !output.success() {
            anyhow::bail!("domain listing failed: {}", output.failure_reason());
        }
        Ok(self
            .strategy
            .parse_domains(&output)
            .into_iter()
            .filter(|d| d.starts_with(DOMAIN_PREFIX))
            .collect())
    }

    /// Remove a domain with no registry record.
    pub async fn destroy_orphan(&self, domain_id: &str) -> Vec<String> {
        info!(domain = %domain_id, "Destroying orphaned network domain");
        steps::teardown(self.runner.as_ref(), self.strategy.orphan_teardown(domain_id)).await
    }

    /// Track a domain that already exists on the host.
    pub fn adopt(&self, handle: &NetworkHandle) {
        self.reserve(handle.env_id, &handle.config.plan);
        self.lock_domains().entry(handle.env_id).or_insert_with(|| DomainEntry {
            config: handle.config.clone(),
            state: DomainState::Ready,
        });
    }

    pub fn domain_count(&self) -> usize {
        self.lock_domains().len()
    }

    fn lock_domains(&self) -> MutexGuard<'_, HashMap<Uuid, DomainEntry>> {
        self.domains.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subnets(&self) -> MutexGuard<'_, SubnetAllocator> {
        self.subnets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn select_strategy(settings: &NetworkSettings, state_dir: &Path) -> Box<dyn IsolationStrategy> {
    let use_pf = match settings.strategy {
        StrategyChoice::Namespace => false,
        StrategyChoice::PacketFilter => true,
        StrategyChoice::Auto => cfg!(target_os = "macos"),
    };
    if use_pf {
        Box::new(PacketFilterStrategy::new(
            settings.tools.clone(),
            state_dir.join("pf"),
        ))
    } else {
        Box::new(NamespaceStrategy::new(settings.tools.clone()))
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> NetworkConfig {
    let plan = AddressPlan::for_index(std::net::Ipv4Addr::new(192, 168, 100, 0), 0)
        .expect("index 0 is always valid");
    NetworkConfig::new(
        Uuid::new_v4(),
        StrategyKind::Namespace,
        plan,
        &NetworkSettings::default(),
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::DryRunRunner;

    fn controller(choice: StrategyChoice) -> (NetworkIsolationController, Arc<DryRunRunner>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(DryRunRunner::new());
        let settings = NetworkSettings {
            strategy: choice,
            ..NetworkSettings::default()
        };
        let ctl = NetworkIsolationController::new(settings, dir.path(), runner.clone());
        (ctl, runner, dir)
    }

    // ── impairment ────────────────────────────────────────────────────

    #[test]
    fn test_netem_args() {
        let shape = Impairment {
            latency_ms: 50,
            jitter_ms: 10,
            loss_percent: 1.5,
            bandwidth_kbit: Some(10_000),
        };
        assert_eq!(
            shape.netem_args(),
            vec!["delay", "50ms", "10ms", "loss", "1.5%", "rate", "10000kbit"]
        );
        assert!(Impairment::default().is_noop());
        assert!(Impairment::default().netem_args().is_empty());
    }

    #[test]
    fn test_impairment_validation() {
        let mut shape = Impairment::default();
        shape.loss_percent = 120.0;
        assert!(matches!(shape.validate(), Err(Error::InvalidSpec(_))));
        shape.loss_percent = 5.0;
        assert!(shape.validate().is_ok());
        shape.bandwidth_kbit = Some(0);
        assert!(shape.validate().is_err());
    }

    #[test]
    fn test_config_naming() {
        let id = Uuid::new_v4();
        let plan = AddressPlan::for_index(std::net::Ipv4Addr::new(192, 168, 100, 0), 3).unwrap();
        let config = NetworkConfig::new(id, StrategyKind::Namespace, plan, &NetworkSettings::default(), None);
        let short = short_id(&id);
        assert_eq!(config.domain_id, format!("ss-{short}"));
        assert!(config.host_iface.len() <= 15);
        let vars: HashMap<_, _> = config.env_vars().into_iter().collect();
        assert_eq!(vars["NETWORK_SUBNET"], "192.168.103.0/24");
    }

    // ── controller lifecycle ──────────────────────────────────────────

    #[tokio::test]
    async fn test_create_and_destroy_namespace() {
        let (ctl, runner, _dir) = controller(StrategyChoice::Namespace);
        let id = Uuid::new_v4();
        let plan = ctl.allocate(id).unwrap();
        let handle = ctl.create(id, plan, None).await.unwrap();

        assert_eq!(ctl.state(id), DomainState::Ready);
        assert_eq!(runner.namespaces(), vec![handle.config.domain_id.clone()]);
        assert!(ctl.exists(&handle.config).await.unwrap());
        assert_eq!(ctl.live_domains().await.unwrap(), vec![handle.config.domain_id.clone()]);

        let warnings = ctl.destroy(&handle).await.unwrap();
        assert!(warnings.is_empty());
        assert_eq!(ctl.state(id), DomainState::Absent);
        assert!(runner.namespaces().is_empty());

        // Second destroy is a no-op.
        assert!(ctl.destroy(&handle).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_step_leaves_nothing() {
        let (ctl, runner, _dir) = controller(StrategyChoice::Namespace);
        runner.fail_on(&["ip", "link", "set"]);
        let id = Uuid::new_v4();
        let plan = ctl.allocate(id).unwrap();

        let err = ctl.create(id, plan, None).await.unwrap_err();
        match err {
            Error::IsolationSetupFailed { step, .. } => assert_eq!(step, "move-peer"),
            other => panic!("unexpected error {other}"),
        }
        assert!(runner.namespaces().is_empty());
        assert_eq!(ctl.state(id), DomainState::Absent);

        let cmds = runner.commands();
        let last = cmds.last().unwrap();
        assert_eq!(last[..3], ["ip", "netns", "delete"]);
    }

    #[tokio::test]
    async fn test_concurrent_domains_do_not_collide() {
        let (ctl, runner, _dir) = controller(StrategyChoice::Namespace);
        let ctl = Arc::new(ctl);
        let mut tasks = Vec::new();
        for _ in 0..3 {
            let ctl = ctl.clone();
            tasks.push(tokio::spawn(async move {
                let id = Uuid::new_v4();
                let plan = ctl.allocate(id)?;
                ctl.create(id, plan, None).await
            }));
        }
        let mut handles = Vec::new();
        for t in tasks {
            handles.push(t.await.unwrap().unwrap());
        }

        for (i, a) in handles.iter().enumerate() {
            for b in &handles[i + 1..] {
                assert_ne!(a.config.domain_id, b.config.domain_id);
                assert!(!a.config.plan.overlaps(&b.config.plan));
            }
        }
        assert_eq!(runner.namespaces().len(), 3);

        ctl.destroy(&handles[1]).await.unwrap();
        assert!(ctl.exists(&handles[0].config).await.unwrap());
        assert!(ctl.exists(&handles[2].config).await.unwrap());
        assert!(!ctl.exists(&handles[1].config).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let (ctl, _runner, _dir) = controller(StrategyChoice::Namespace);
        let id = Uuid::new_v4();
        let plan = ctl.allocate(id).unwrap();
        ctl.create(id, plan, None).await.unwrap();
        assert!(ctl.create(id, plan, None).await.is_err());
    }

    #[tokio::test]
    async fn test_run_in_requires_ready_domain() {
        let (ctl, runner, _dir) = controller(StrategyChoice::Namespace);
        let id = Uuid::new_v4();
        let plan = ctl.allocate(id).unwrap();
        let handle = ctl.create(id, plan, None).await.unwrap();

        let out = ctl
            .run_in(&handle, &["ping".to_string(), "-c1".to_string(), "1.1.1.1".to_string()])
            .await
            .unwrap();
        assert!(out.success());
        let last = runner.commands().last().cloned().unwrap();
        assert_eq!(last[..4], ["ip", "netns", "exec", handle.domain_id()]);

        ctl.destroy(&handle).await.unwrap();
        assert!(ctl.run_in(&handle, &["true".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn test_attach_vm_creates_tap_in_namespace() {
        let (ctl, runner, _dir) = controller(StrategyChoice::Namespace);
        let id = Uuid::new_v4();
        let plan = ctl.allocate(id).unwrap();
        let handle = ctl.create(id, plan, None).await.unwrap();

        let (updated, attachment) = ctl.attach_vm(&handle).await.unwrap();
        let tap = attachment.tap.clone().unwrap();
        assert_eq!(updated.config.vm_tap.as_deref(), Some(tap.as_str()));
        assert!(runner
            .commands()
            .iter()
            .any(|c| c.contains(&"tuntap".to_string()) && c.contains(&tap)));
        // Dry-run launches stay on the host.
        assert!(attachment.launch_prefix.is_empty());
    }

    #[tokio::test]
    async fn test_packet_filter_lifecycle() {
        let (ctl, runner, dir) = controller(StrategyChoice::PacketFilter);
        let id = Uuid::new_v4();
        let plan = ctl.allocate(id).unwrap();
        let handle = ctl.create(id, plan, None).await.unwrap();

        let anchor = format!("safespace/{}", handle.domain_id());
        assert_eq!(runner.anchors(), vec![anchor]);
        let rules = dir.path().join("pf").join(format!("{}.conf", handle.domain_id()));
        assert!(rules.exists());
        assert_eq!(ctl.live_domains().await.unwrap(), vec![handle.domain_id().to_string()]);

        let (_, attachment) = ctl.attach_vm(&handle).await.unwrap();
        assert!(attachment.tap.is_none());

        ctl.destroy(&handle).await.unwrap();
        assert!(runner.anchors().is_empty());
        assert!(!rules.exists());
    }

    #[tokio::test]
    async fn test_subnet_released_on_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(DryRunRunner::new());
        let settings = NetworkSettings {
            strategy: StrategyChoice::Namespace,
            subnet_pool_size: 1,
            ..NetworkSettings::default()
        };
        let ctl = NetworkIsolationController::new(settings, dir.path(), runner);

        let first = Uuid::new_v4();
        let plan = ctl.allocate(first).unwrap();
        let handle = ctl.create(first, plan, None).await.unwrap();
        assert!(ctl.allocate(Uuid::new_v4()).is_err());

        ctl.destroy(&handle).await.unwrap();
        assert!(ctl.allocate(Uuid::new_v4()).is_ok());
    }

    #[tokio::test]
    async fn test_orphan_teardown() {
        let (ctl, runner, _dir) = controller(StrategyChoice::Namespace);
        runner.seed_namespace("ss-deadbeef");
        assert_eq!(ctl.live_domains().await.unwrap(), vec!["ss-deadbeef"]);
        assert!(ctl.destroy_orphan("ss-deadbeef").await.is_empty());
        assert!(ctl.live_domains().await.unwrap().is_empty());
    }
}
