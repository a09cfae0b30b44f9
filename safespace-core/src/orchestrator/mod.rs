//! Environment Orchestrator - Lifecycle State Machine
//!
//! Sequences the controllers into create, recall and foreclose:
//!
//! ```text
//! create:    recommend → root → [subnet → network] → [VM provision → start] → register
//! foreclose: closing → stop VM → destroy network → remove root → unregister
//! ```
//!
//! Every completed create step is recorded in an [`UnwindLedger`]; a failure,
//! cancellation or timeout at any later step replays it backwards before the
//! error is returned. Operations serialize per environment id and per name
//! through [`KeyedLocks`]; no std lock is held across an await.
//!
//! # Performance-First Design:
//! - One `Arc<Inner>`; clones are cheap and share every controller
//! - Load sampling runs on its own task and is never awaited by `create`
//! - Registry reads take no lock

mod locks;
mod probe;
mod unwind;

pub use probe::HostStateProbe;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::engine::host::{HostProbe, SystemProbe};
use crate::engine::layout::EnvLayout;
use crate::engine::monitor::LoadMonitor;
use crate::engine::network::{AddressPlan, NetworkHandle, NetworkIsolationController, DOMAIN_PREFIX};
use crate::engine::registry::{
    Discrepancy, EnvironmentRegistry, LiveResource, LiveStateProbe, Lookup, MissingResource,
};
use crate::engine::resources::ResourceManager;
use crate::engine::vm::{self, VmController, VmHandle, VmSizing, VM_DIR};
use crate::environment::{
    short_id, EnvironmentHandle, EnvironmentRecord, EnvironmentSpec, EnvironmentStatus,
};
use crate::error::{Error, Result};
use crate::executor::{run_local, CommandOutput, CommandRunner, DryRunRunner, SystemRunner};
use crate::perf::{MetricsSnapshot, OrchestratorMetrics, ScopedTimer, TimedOp};
use locks::{id_key, name_key, KeyedLocks};
use unwind::{Acquired, UnwindLedger};

/// Default window for [`EnvironmentOrchestrator::purge_stale`].
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Outcome of a foreclose. Teardown problems are warnings, never errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ForecloseReport {
    pub env_id: Uuid,
    pub name: Option<String>,
    pub vm_stopped: bool,
    pub network_destroyed: bool,
    pub root_removed: bool,
    pub warnings: Vec<String>,
}

/// What a sweep found and what it did about it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub remediated: Vec<Discrepancy>,
    pub warnings: Vec<String>,
}

/// Resources of a create that has not registered yet.
#[derive(Debug, Clone)]
struct InFlight {
    domain_id: String,
    root: Option<PathBuf>,
}

struct Inner {
    settings: Settings,
    runner: Arc<dyn CommandRunner>,
    resources: Arc<ResourceManager>,
    network: Arc<NetworkIsolationController>,
    vms: Arc<VmController>,
    registry: EnvironmentRegistry,
    probe: Arc<dyn LiveStateProbe>,
    locks: KeyedLocks,
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
    /// Environments created while the registry was unusable.
    transient: Mutex<HashMap<Uuid, EnvironmentRecord>>,
    metrics: OrchestratorMetrics,
}

/// Builder for [`EnvironmentOrchestrator`]. Unset collaborators default to
/// the live host.
pub struct OrchestratorBuilder {
    settings: Settings,
    runner: Option<Arc<dyn CommandRunner>>,
    host_probe: Option<Arc<dyn HostProbe>>,
    live_probe: Option<Arc<dyn LiveStateProbe>>,
}

impl OrchestratorBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            runner: None,
            host_probe: None,
            live_probe: None,
        }
    }

    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn host_probe(mut self, probe: Arc<dyn HostProbe>) -> Self {
        self.host_probe = Some(probe);
        self
    }

    pub fn live_probe(mut self, probe: Arc<dyn LiveStateProbe>) -> Self {
        self.live_probe = Some(probe);
        self
    }

    pub fn build(self) -> EnvironmentOrchestrator {
        let settings = self.settings;
        let runner: Arc<dyn CommandRunner> = match self.runner {
            Some(runner) => runner,
            None if settings.general.dry_run => Arc::new(DryRunRunner::new()),
            None => Arc::new(SystemRunner::new(settings.general.use_sudo)),
        };
        let host = self
            .host_probe
            .unwrap_or_else(|| Arc::new(SystemProbe::new()));

        let resources = Arc::new(ResourceManager::new(settings.resources.clone(), host));
        let network = Arc::new(NetworkIsolationController::new(
            settings.network.clone(),
            &settings.general.state_dir,
            runner.clone(),
        ));
        let vms = Arc::new(VmController::new(settings.vm.clone()));
        let probe = self.live_probe.unwrap_or_else(|| {
            Arc::new(HostStateProbe::new(
                network.clone(),
                vms.clone(),
                settings.general.environments_dir.clone(),
            ))
        });
        let registry = EnvironmentRegistry::new(settings.registry_path());

        let orchestrator = EnvironmentOrchestrator {
            inner: Arc::new(Inner {
                settings,
                runner,
                resources,
                network,
                vms,
                registry,
                probe,
                locks: KeyedLocks::new(),
                in_flight: Mutex::new(HashMap::new()),
                transient: Mutex::new(HashMap::new()),
                metrics: OrchestratorMetrics::new(),
            }),
        };
        orchestrator.restore_leases();
        orchestrator
    }
}

/// Top-level lifecycle driver. Cheap to clone.
#[derive(Clone)]
pub struct EnvironmentOrchestrator {
    inner: Arc<Inner>,
}

/// Cancellation and deadline checked before each create step.
struct Checkpoint<'a> {
    cancel: &'a CancellationToken,
    deadline: Instant,
}

impl Checkpoint<'_> {
    fn check(&self, step: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled(step.to_string()));
        }
        if Instant::now() >= self.deadline {
            warn!(step, "Create timed out");
            return Err(Error::Cancelled(step.to_string()));
        }
        Ok(())
    }
}

impl EnvironmentOrchestrator {
    pub fn new(settings: Settings) -> Self {
        OrchestratorBuilder::new(settings).build()
    }

    pub fn builder(settings: Settings) -> OrchestratorBuilder {
        OrchestratorBuilder::new(settings)
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.inner.resources
    }

    pub fn registry(&self) -> &EnvironmentRegistry {
        &self.inner.registry
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn runner_type(&self) -> &str {
        self.inner.runner.runner_type()
    }

    /// Background sampler feeding this orchestrator's resource manager.
    pub fn load_monitor(&self) -> LoadMonitor {
        LoadMonitor::new(self.inner.resources.clone())
    }

    /// Re-reserve the subnets of persisted environments so new domains
    /// never overlap them.
    fn restore_leases(&self) {
        let records = match self.inner.registry.list() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Registry unreadable at startup, no subnet leases restored");
                return;
            }
        };
        let mut restored = 0;
        for record in records.iter().filter(|r| r.status.holds_name()) {
            if let Some(net) = &record.network_config {
                if self.inner.network.reserve(record.id, &net.plan) {
                    restored += 1;
                } else {
                    warn!(env_id = %record.id, subnet = %net.plan.cidr(), "Subnet lease conflicts with another record");
                }
            }
        }
        debug!(restored, "Restored subnet leases");
    }

    // ── create ────────────────────────────────────────────────────────

    /// Build an environment. On error nothing it created remains.
    pub async fn create(&self, spec: EnvironmentSpec) -> Result<EnvironmentHandle> {
        self.create_with_cancel(spec, CancellationToken::new()).await
    }

    /// [`create`](Self::create), observing `cancel` and the configured
    /// timeout before every step.
    pub async fn create_with_cancel(
        &self,
        spec: EnvironmentSpec,
        cancel: CancellationToken,
    ) -> Result<EnvironmentHandle> {
        spec.validate()?;
        let inner = &self.inner;
        let timer = ScopedTimer::new(&inner.metrics, TimedOp::Create);

        let id = Uuid::new_v4();
        let _name_guard = match &spec.name {
            Some(name) => Some(inner.locks.lock(name_key(name)).await),
            None => None,
        };
        let _id_guard = inner.locks.lock(id_key(id)).await;

        let checkpoint = Checkpoint {
            cancel: &cancel,
            deadline: Instant::now() + inner.settings.general.create_timeout(),
        };
        self.lock_in_flight().insert(
            id,
            InFlight {
                domain_id: format!("{DOMAIN_PREFIX}{}", short_id(&id)),
                root: None,
            },
        );

        info!(env_id = %id, name = spec.name.as_deref().unwrap_or("-"), "Creating environment");
        let mut ledger = UnwindLedger::new(id);
        let result = self.build(id, &spec, &checkpoint, &mut ledger).await;

        match result {
            Ok(handle) => {
                self.lock_in_flight().remove(&id);
                info!(
                    env_id = %id,
                    root = %handle.root_path().display(),
                    network = handle.network().is_some(),
                    vm = handle.vm().is_some(),
                    persisted = handle.is_persisted(),
                    "Environment active"
                );
                Ok(handle)
            }
            Err(e) => {
                timer.discard();
                let steps = ledger.len();
                let warnings = ledger.unwind(&inner.network, &inner.vms).await;
                self.lock_in_flight().remove(&id);
                inner.metrics.record_create_failure(steps);
                error!(env_id = %id, error = %e, unwound = steps, unwind_warnings = warnings.len(), "Create failed");
                Err(e)
            }
        }
    }

    async fn build(
        &self,
        id: Uuid,
        spec: &EnvironmentSpec,
        checkpoint: &Checkpoint<'_>,
        ledger: &mut UnwindLedger,
    ) -> Result<EnvironmentHandle> {
        let inner = &self.inner;
        let settings = &inner.settings;

        checkpoint.check("check-name")?;
        let mut persist = true;
        if let Some(name) = &spec.name {
            match inner.registry.name_available(name) {
                Ok(true) => {}
                Ok(false) => return Err(Error::NameInUse(name.clone())),
                Err(e) if e.is_registry_corruption() => {
                    warn!(env_id = %id, error = %e, "Registry unusable, creating without persistence");
                    persist = false;
                }
                Err(e) => return Err(e),
            }
            if self.transient_name_taken(name) {
                return Err(Error::NameInUse(name.clone()));
            }
        }

        checkpoint.check("recommend")?;
        // Short-lived processes never run the load monitor.
        let sample = inner.resources.fresh_sample(settings.resources.sample_interval());
        debug!(env_id = %id, class = %sample.class, "Sizing against load sample");
        let allocation = inner.resources.recommend(spec.workload);

        checkpoint.check("create-root")?;
        let layout = match &spec.root_dir {
            Some(root) => EnvLayout::new(root),
            None => EnvLayout::generated(&settings.general.environments_dir, &short_id(&id)),
        };
        if let Some(entry) = self.lock_in_flight().get_mut(&id) {
            entry.root = Some(layout.root().to_path_buf());
        }
        layout.create()?;
        ledger.record(Acquired::Root(layout.clone()));

        let mut network: Option<NetworkHandle> = None;
        if let Some(request) = &spec.network {
            checkpoint.check("allocate-subnet")?;
            let (plan, lease) = self.lease_subnet(id, persist)?;
            ledger.record(Acquired::Subnet(lease));

            checkpoint.check("create-network")?;
            let handle = inner.network.create(id, plan, request.impairment).await?;
            ledger.record(Acquired::Network(handle.clone()));
            layout.append_env(&handle.config.env_vars())?;
            network = Some(handle);
        }

        let mut vm_handle: Option<VmHandle> = None;
        if let Some(request) = &spec.vm {
            checkpoint.check("provision-vm")?;
            let attachment = match &network {
                Some(handle) => {
                    let (updated, attachment) = inner.network.attach_vm(handle).await?;
                    network = Some(updated);
                    Some(attachment)
                }
                None => None,
            };

            let vm_settings = &settings.vm;
            let sizing = VmSizing {
                cpus: request
                    .cpus
                    .or(vm_settings.default_cpus)
                    .unwrap_or(allocation.preferred_cores() as u32),
                memory_mb: request.memory_mb.unwrap_or_else(|| {
                    vm_settings
                        .default_memory_mb
                        .min(allocation.memory_ceiling_mb())
                        .max(1)
                }),
                disk_gb: request.disk_gb.unwrap_or(vm_settings.default_disk_gb),
            };
            let affinity = if settings.resources.pin_vm_cores {
                inner.resources.pinned_command(allocation.preferred_class, &[])
            } else {
                Vec::new()
            };

            let vm_dir = layout.root().join(VM_DIR);
            let provisioned = inner
                .vms
                .provision(id, &vm_dir, sizing, attachment.as_ref(), affinity)
                .await?;
            ledger.record(Acquired::VmProvisioned(provisioned.clone()));

            checkpoint.check("start-vm")?;
            let started = inner.vms.start(&provisioned).await?;
            ledger.record(Acquired::VmStarted(started.clone()));
            layout.append_env(&started.config.env_vars())?;
            vm_handle = Some(started);
        }

        checkpoint.check("register")?;
        let now = Utc::now();
        let record = EnvironmentRecord {
            id,
            name: spec.name.clone(),
            status: EnvironmentStatus::Initializing.transition(EnvironmentStatus::Active)?,
            resource_snapshot: allocation,
            network_config: network.map(|h| h.config),
            vm_config: vm_handle.map(|h| h.config),
            created_at: now,
            last_accessed: now,
            template_id: spec.template_id.clone(),
            root_path: layout.root().to_path_buf(),
        };
        record.validate()?;

        if persist {
            match inner.registry.register(&record) {
                Ok(()) => {}
                Err(e) if e.is_registry_corruption() => {
                    warn!(env_id = %id, error = %e, "Registry unusable, environment will not survive a restart");
                    persist = false;
                }
                Err(e) => return Err(e),
            }
        }
        if !persist {
            self.lock_transient().insert(id, record.clone());
        }
        Ok(EnvironmentHandle::new(record, persist))
    }

    /// Pick a subnet no other environment holds, in this process or any
    /// other sharing the registry. The returned registry is set when the
    /// lease was persisted and must be released on unwind.
    fn lease_subnet(&self, id: Uuid, persist: bool) -> Result<(AddressPlan, Option<EnvironmentRegistry>)> {
        let inner = &self.inner;
        if !persist {
            return Ok((inner.network.allocate(id)?, None));
        }
        let expire_after = inner.settings.general.create_timeout() * 2;
        match inner
            .registry
            .lease_subnet(id, expire_after, |held| inner.network.allocate_avoiding(id, held))
        {
            Ok(plan) => Ok((plan, Some(inner.registry.clone()))),
            Err(e) if e.is_registry_corruption() => {
                warn!(env_id = %id, error = %e, "Registry unusable, subnet lease is local only");
                Ok((inner.network.allocate(id)?, None))
            }
            Err(e) => {
                inner.network.release(id);
                Err(e)
            }
        }
    }

    // ── recall ────────────────────────────────────────────────────────

    /// Look an environment up, reconcile it against the host, re-adopt its
    /// live resources and return a handle.
    ///
    /// Anything missing or dead marks the environment degraded; a degraded
    /// environment with nothing wrong becomes active again.
    pub async fn recall(&self, lookup: impl Into<Lookup>) -> Result<EnvironmentHandle> {
        let lookup = lookup.into();
        let inner = &self.inner;
        let timer = ScopedTimer::new(&inner.metrics, TimedOp::Recall);

        let _name_guard = match &lookup {
            Lookup::Name(name) => Some(inner.locks.lock(name_key(name)).await),
            Lookup::Id(_) => None,
        };
        let (found, _) = self
            .find(&lookup)?
            .ok_or_else(|| Error::NotFound(lookup.to_string()))?;
        let id = found.id;
        let _id_guard = inner.locks.lock(id_key(id)).await;

        // Re-read under the id lock; a foreclose may have finished meanwhile.
        let (record, persisted) = self
            .find(&Lookup::Id(id))?
            .ok_or_else(|| Error::NotFound(lookup.to_string()))?;
        if matches!(record.status, EnvironmentStatus::Closing | EnvironmentStatus::Closed) {
            timer.discard();
            return Err(Error::InvalidTransition {
                from: record.status,
                to: EnvironmentStatus::Active,
            });
        }

        let discrepancies = EnvironmentRegistry::inspect(&record, inner.probe.as_ref()).await;
        for d in &discrepancies {
            warn!(env_id = %id, discrepancy = %d, "Recall found a problem");
        }

        if let Some(handle) = record.network_handle() {
            let domain_missing = discrepancies.iter().any(|d| {
                matches!(d, Discrepancy::OrphanedRecord { missing, .. }
                    if *missing == MissingResource::NetworkDomain)
            });
            if !domain_missing {
                inner.network.adopt(&handle);
            }
        }
        if let Some(handle) = record.vm_handle() {
            inner.vms.adopt(&handle);
        }

        let status = if discrepancies.is_empty() {
            EnvironmentStatus::Active
        } else {
            EnvironmentStatus::Degraded
        };
        let updated = self.apply(&record, persisted, |r| {
            r.status = r.status.transition(status)?;
            r.last_accessed = Utc::now();
            Ok(())
        })?;

        info!(env_id = %id, status = %updated.status, "Environment recalled");
        Ok(EnvironmentHandle::new(updated, persisted))
    }

    // ── foreclose ─────────────────────────────────────────────────────

    /// Tear an environment down: stop its VM, destroy its network, remove its
    /// root and its record, in that order.
    ///
    /// Runs on its own task, so dropping the returned future does not stop
    /// a foreclose once started. A second call reports `NotFound`.
    pub async fn foreclose(&self, id: Uuid) -> Result<ForecloseReport> {
        let this = self.clone();
        tokio::spawn(async move { this.foreclose_inner(id).await })
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("foreclose task failed: {e}")))?
    }

    async fn foreclose_inner(&self, id: Uuid) -> Result<ForecloseReport> {
        let inner = &self.inner;
        let started = std::time::Instant::now();
        let _id_guard = inner.locks.lock(id_key(id)).await;

        let (record, persisted) = self
            .find(&Lookup::Id(id))?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        info!(env_id = %id, name = record.name.as_deref().unwrap_or("-"), "Foreclosing environment");

        let mut report = ForecloseReport {
            env_id: id,
            name: record.name.clone(),
            ..ForecloseReport::default()
        };

        if record.status.can_transition_to(EnvironmentStatus::Closing) {
            if let Err(e) = self.apply(&record, persisted, |r| {
                r.status = r.status.transition(EnvironmentStatus::Closing)?;
                Ok(())
            }) {
                report.warnings.push(format!("mark closing: {e}"));
            }
        }

        if let Some(mut handle) = record.vm_handle() {
            if handle.config.pid.is_none() {
                handle.config.pid = vm::read_pid_file(&record.root_path);
            }
            match inner.vms.stop(&handle, true).await {
                Ok(_) => report.vm_stopped = true,
                Err(e) => report.warnings.push(format!("stop VM: {e}")),
            }
            inner.vms.forget(id);
        }

        if let Some(handle) = record.network_handle() {
            match inner.network.destroy(&handle).await {
                Ok(warnings) => {
                    report.network_destroyed = warnings.is_empty();
                    report.warnings.extend(warnings);
                }
                Err(e) => report.warnings.push(format!("destroy network: {e}")),
            }
        }

        match EnvLayout::new(&record.root_path).remove() {
            Ok(removed) => report.root_removed = removed,
            Err(e) => report.warnings.push(format!("remove root: {e}")),
        }

        if persisted {
            if let Err(e) = inner.registry.remove(id) {
                report.warnings.push(format!("remove record: {e}"));
            }
        }
        self.lock_transient().remove(&id);

        for w in &report.warnings {
            warn!(env_id = %id, warning = %w, "Foreclose incomplete");
        }
        inner
            .metrics
            .record_foreclose(started.elapsed(), report.warnings.len());
        info!(env_id = %id, warnings = report.warnings.len(), "Environment closed");
        Ok(report)
    }

    /// Foreclose every environment not accessed within `max_age`.
    pub async fn purge_stale(&self, max_age: Duration) -> Result<Vec<ForecloseReport>> {
        let stale = self.inner.registry.stale(max_age)?;
        let mut reports = Vec::with_capacity(stale.len());
        for record in stale {
            match self.foreclose(record.id).await {
                Ok(report) => reports.push(report),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        info!(purged = reports.len(), "Purged stale environments");
        Ok(reports)
    }

    // ── reconciliation ────────────────────────────────────────────────

    /// Registry-vs-host discrepancies, excluding creates still in progress.
    pub async fn reconcile(&self) -> Result<Vec<Discrepancy>> {
        let found = self.inner.registry.reconcile(self.inner.probe.as_ref()).await?;
        let in_flight: Vec<InFlight> = self.lock_in_flight().values().cloned().collect();
        Ok(found
            .into_iter()
            .filter(|d| !touches_in_flight(d, &in_flight))
            .collect())
    }

    /// Reconcile, then remediate: orphaned resources are destroyed and
    /// records whose host state diverged are marked degraded.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let inner = &self.inner;
        let mut discrepancies = self.reconcile().await?;
        // VMs first, then domains, then roots: reverse of creation.
        discrepancies.sort_by_key(|d| match d {
            Discrepancy::OrphanedResource { resource: LiveResource::VmProcess { .. } } => 0,
            Discrepancy::OrphanedResource { resource: LiveResource::NetworkDomain(_) } => 1,
            Discrepancy::OrphanedResource { resource: LiveResource::FilesystemRoot(_) } => 2,
            _ => 3,
        });

        let mut report = SweepReport::default();
        for discrepancy in discrepancies {
            match &discrepancy {
                Discrepancy::OrphanedResource { resource } => match resource {
                    LiveResource::VmProcess { pid, root } => {
                        info!(pid, root = %root.display(), "Killing orphaned VM");
                        vm::kill_orphan(*pid, inner.settings.vm.stop_timeout()).await;
                    }
                    LiveResource::NetworkDomain(domain) => {
                        report
                            .warnings
                            .extend(inner.network.destroy_orphan(domain).await);
                    }
                    LiveResource::FilesystemRoot(root) => {
                        if let Err(e) = EnvLayout::new(root).remove() {
                            report.warnings.push(format!("remove {}: {e}", root.display()));
                        }
                    }
                },
                Discrepancy::OrphanedRecord { env_id, .. }
                | Discrepancy::StatusMismatch { env_id, .. } => {
                    if let Err(e) = self.degrade(*env_id).await {
                        report.warnings.push(format!("degrade {env_id}: {e}"));
                    }
                }
            }
            report.remediated.push(discrepancy);
        }

        inner.metrics.record_sweep(report.remediated.len());
        info!(
            remediated = report.remediated.len(),
            warnings = report.warnings.len(),
            "Sweep complete"
        );
        Ok(report)
    }

    async fn degrade(&self, id: Uuid) -> Result<()> {
        let _id_guard = self.inner.locks.lock(id_key(id)).await;
        let Some((record, persisted)) = self.find(&Lookup::Id(id))? else {
            return Ok(());
        };
        if record.status == EnvironmentStatus::Active {
            self.apply(&record, persisted, |r| {
                r.status = r.status.transition(EnvironmentStatus::Degraded)?;
                Ok(())
            })?;
            warn!(env_id = %id, "Environment degraded");
        }
        Ok(())
    }

    /// Check one environment against the host; an active environment whose
    /// VM crashed or whose resources vanished becomes degraded.
    pub async fn refresh_status(&self, id: Uuid) -> Result<EnvironmentStatus> {
        let _id_guard = self.inner.locks.lock(id_key(id)).await;
        let (record, persisted) = self
            .find(&Lookup::Id(id))?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if record.status != EnvironmentStatus::Active {
            return Ok(record.status);
        }
        let found = EnvironmentRegistry::inspect(&record, self.inner.probe.as_ref()).await;
        if found.is_empty() {
            return Ok(record.status);
        }
        for d in &found {
            warn!(env_id = %id, discrepancy = %d, "Environment degraded");
        }
        let updated = self.apply(&record, persisted, |r| {
            r.status = r.status.transition(EnvironmentStatus::Degraded)?;
            Ok(())
        })?;
        Ok(updated.status)
    }

    /// Layout problems plus host-state discrepancies, as messages.
    pub async fn check_health(&self, lookup: impl Into<Lookup>) -> Result<Vec<String>> {
        let lookup = lookup.into();
        let (record, _) = self
            .find(&lookup)?
            .ok_or_else(|| Error::NotFound(lookup.to_string()))?;
        let mut issues = EnvLayout::new(&record.root_path).check_health();
        issues.extend(
            EnvironmentRegistry::inspect(&record, self.inner.probe.as_ref())
                .await
                .iter()
                .map(ToString::to_string),
        );
        Ok(issues)
    }

    // ── queries ───────────────────────────────────────────────────────

    /// Every environment, most recently accessed first. Fails on a corrupt
    /// registry even when unpersisted environments exist.
    pub fn list(&self) -> Result<Vec<EnvironmentRecord>> {
        let mut records = self.inner.registry.list()?;
        records.extend(self.lock_transient().values().cloned());
        records.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        Ok(records)
    }

    pub fn get(&self, lookup: impl Into<Lookup>) -> Result<Option<EnvironmentRecord>> {
        Ok(self.find(&lookup.into())?.map(|(record, _)| record))
    }

    /// Run `argv` inside the environment: in its network domain when it has
    /// one, otherwise on the host from its root with the `.env` variables set.
    pub async fn run_in(&self, handle: &EnvironmentHandle, argv: &[String]) -> Result<CommandOutput> {
        if let Some(network) = handle.network() {
            return self.inner.network.run_in(&network, argv).await;
        }
        let layout = handle.layout();
        let envs: HashMap<String, String> = layout.read_env()?.into_iter().collect();
        Ok(run_local(argv, Some(layout.root()), &envs).await?)
    }

    // ── internals ─────────────────────────────────────────────────────

    /// Registry first, then registry-less environments. Registry corruption
    /// is only an error when no transient record matches.
    fn find(&self, lookup: &Lookup) -> Result<Option<(EnvironmentRecord, bool)>> {
        let transient = self
            .lock_transient()
            .values()
            .find(|r| match lookup {
                Lookup::Id(id) => r.id == *id,
                Lookup::Name(name) => r.name.as_deref() == Some(name.as_str()),
            })
            .cloned();
        match self.inner.registry.get(lookup) {
            Ok(Some(record)) => Ok(Some((record, true))),
            Ok(None) => Ok(transient.map(|r| (r, false))),
            Err(e) => match transient {
                Some(record) => Ok(Some((record, false))),
                None => Err(e),
            },
        }
    }

    /// Persist a record mutation in whichever store owns the record.
    fn apply<F>(&self, record: &EnvironmentRecord, persisted: bool, f: F) -> Result<EnvironmentRecord>
    where
        F: FnOnce(&mut EnvironmentRecord) -> Result<()>,
    {
        if persisted {
            return self.inner.registry.update(record.id, f);
        }
        let mut updated = record.clone();
        f(&mut updated)?;
        self.lock_transient().insert(updated.id, updated.clone());
        Ok(updated)
    }

    fn transient_name_taken(&self, name: &str) -> bool {
        self.lock_transient()
            .values()
            .any(|r| r.name.as_deref() == Some(name) && r.status.holds_name())
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<Uuid, InFlight>> {
        self.inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_transient(&self) -> MutexGuard<'_, HashMap<Uuid, EnvironmentRecord>> {
        self.inner.transient.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn touches_in_flight(discrepancy: &Discrepancy, in_flight: &[InFlight]) -> bool {
    let Discrepancy::OrphanedResource { resource } = discrepancy else {
        return false;
    };
    in_flight.iter().any(|f| match resource {
        LiveResource::NetworkDomain(domain) => *domain == f.domain_id,
        LiveResource::VmProcess { root, .. } | LiveResource::FilesystemRoot(root) => {
            f.root.as_ref() == Some(root)
        }
    })
}
