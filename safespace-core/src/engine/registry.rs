//! Environment Registry
//!
//! One JSON document holds every record. Writers take an exclusive `flock`
//! on a sibling lock file, rewrite the document into a temp file in the same
//! directory, fsync it and rename it over the old one, so a crash leaves
//! either the old or the new document and never a torn one. Readers take no
//! lock: a rename is atomic, so they always see a complete document.
//!
//! [`EnvironmentRegistry::reconcile`] compares the records with what a
//! [`LiveStateProbe`] observes on the host and reports each divergence as a
//! [`Discrepancy`]. It never repairs anything itself.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::network::{AddressPlan, NetworkConfig};
use super::vm::{VmConfig, VmStatus};
use crate::environment::{EnvironmentRecord, EnvironmentStatus};
use crate::error::{Error, Result};

pub const SCHEMA_VERSION: u32 = 1;
const LOCK_SUFFIX: &str = "lock";

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    schema_version: u32,
    environments: BTreeMap<Uuid, EnvironmentRecord>,
    /// Subnets handed to creates that have not registered yet, by pool index.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    subnet_leases: BTreeMap<u8, SubnetLease>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubnetLease {
    env_id: Uuid,
    leased_at: DateTime<Utc>,
}

/// Key for [`EnvironmentRegistry::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Id(Uuid),
    Name(String),
}

impl Lookup {
    /// A full UUID looks up by id, anything else by name.
    pub fn parse(raw: &str) -> Self {
        match Uuid::parse_str(raw) {
            Ok(id) => Self::Id(id),
            Err(_) => Self::Name(raw.to_string()),
        }
    }

    fn matches(&self, record: &EnvironmentRecord) -> bool {
        match self {
            Self::Id(id) => record.id == *id,
            Self::Name(name) => {
                record.name.as_deref() == Some(name.as_str()) && record.status.holds_name()
            }
        }
    }
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Name(name) => write!(f, "{name}"),
        }
    }
}

impl From<Uuid> for Lookup {
    fn from(id: Uuid) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for Lookup {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

/// What an orphaned record is missing on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MissingResource {
    FilesystemRoot,
    NetworkDomain,
}

/// Host state no record accounts for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LiveResource {
    NetworkDomain(String),
    VmProcess { pid: u32, root: PathBuf },
    FilesystemRoot(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Discrepancy {
    /// The record is active but part of its host state is gone.
    OrphanedRecord {
        env_id: Uuid,
        missing: MissingResource,
    },
    /// The record says active but its VM is not running.
    StatusMismatch {
        env_id: Uuid,
        recorded: EnvironmentStatus,
        observed: VmStatus,
    },
    /// Live on the host with no record.
    OrphanedResource { resource: LiveResource },
}

impl Discrepancy {
    pub fn env_id(&self) -> Option<Uuid> {
        match self {
            Self::OrphanedRecord { env_id, .. } | Self::StatusMismatch { env_id, .. } => {
                Some(*env_id)
            }
            Self::OrphanedResource { .. } => None,
        }
    }
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OrphanedRecord { env_id, missing } => {
                write!(f, "orphaned record {env_id}: {missing:?} is gone")
            }
            Self::StatusMismatch {
                env_id,
                recorded,
                observed,
            } => write!(f, "status mismatch {env_id}: recorded {recorded}, VM {observed}"),
            Self::OrphanedResource { resource } => match resource {
                LiveResource::NetworkDomain(d) => write!(f, "orphaned network domain {d}"),
                LiveResource::VmProcess { pid, root } => {
                    write!(f, "orphaned VM process {pid} under {}", root.display())
                }
                LiveResource::FilesystemRoot(p) => write!(f, "orphaned root {}", p.display()),
            },
        }
    }
}

/// A hypervisor process found on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveVm {
    pub pid: u32,
    pub root: PathBuf,
}

/// Read-only view of host state used by reconciliation.
///
/// A probe that fails returns `Err`; the check it backs is then skipped
/// rather than reported as a discrepancy.
#[async_trait]
pub trait LiveStateProbe: Send + Sync {
    async fn network_present(&self, config: &NetworkConfig) -> anyhow::Result<bool>;

    async fn vm_status(&self, env_id: Uuid, config: &VmConfig) -> anyhow::Result<VmStatus>;

    fn root_present(&self, root: &Path) -> bool {
        root.is_dir()
    }

    async fn live_domains(&self) -> anyhow::Result<Vec<String>>;

    async fn live_vms(&self) -> anyhow::Result<Vec<LiveVm>>;

    fn live_roots(&self) -> anyhow::Result<Vec<PathBuf>>;
}

/// Crash-consistent store of environment records.
#[derive(Debug, Clone)]
pub struct EnvironmentRegistry {
    path: PathBuf,
}

impl EnvironmentRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension(LOCK_SUFFIX)
    }

    /// Check that the document can be read. A missing document is fine.
    pub fn open(&self) -> Result<()> {
        self.load().map(|_| ())
    }

    /// Add a record. Fails if its id is known or its name is held by
    /// another environment.
    pub fn register(&self, record: &EnvironmentRecord) -> Result<()> {
        record.validate()?;
        self.write(|doc| {
            if doc.environments.contains_key(&record.id) {
                return Err(Error::InvalidSpec(format!(
                    "environment {} is already registered",
                    record.id
                )));
            }
            if let Some(name) = &record.name {
                if name_taken(doc, name, record.id) {
                    return Err(Error::NameInUse(name.clone()));
                }
            }
            doc.environments.insert(record.id, record.clone());
            // The record's network config holds the subnet from now on.
            doc.subnet_leases.retain(|_, lease| lease.env_id != record.id);
            Ok(())
        })?;
        info!(env_id = %record.id, name = record.name.as_deref().unwrap_or("-"), "Environment registered");
        Ok(())
    }

    pub fn get(&self, lookup: &Lookup) -> Result<Option<EnvironmentRecord>> {
        let doc = self.load()?;
        Ok(match lookup {
            Lookup::Id(id) => doc.environments.get(id).cloned(),
            Lookup::Name(_) => doc.environments.values().find(|r| lookup.matches(r)).cloned(),
        })
    }

    /// Every record, most recently accessed first.
    pub fn list(&self) -> Result<Vec<EnvironmentRecord>> {
        let mut records: Vec<_> = self.load()?.environments.into_values().collect();
        records.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        Ok(records)
    }

    /// Delete a record. Returns `false` if there was none.
    pub fn remove(&self, id: Uuid) -> Result<bool> {
        let removed = self.write(|doc| {
            doc.subnet_leases.retain(|_, lease| lease.env_id != id);
            Ok(doc.environments.remove(&id).is_some())
        })?;
        if removed {
            info!(env_id = %id, "Environment unregistered");
        }
        Ok(removed)
    }

    /// Apply a checked status transition.
    pub fn update_status(&self, id: Uuid, status: EnvironmentStatus) -> Result<EnvironmentRecord> {
        self.update(id, |record| {
            record.status = record.status.transition(status)?;
            Ok(())
        })
    }

    /// Mutate a record in place. The id cannot change.
    pub fn update<F>(&self, id: Uuid, f: F) -> Result<EnvironmentRecord>
    where
        F: FnOnce(&mut EnvironmentRecord) -> Result<()>,
    {
        self.write(|doc| {
            let mut record = doc
                .environments
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            f(&mut record)?;
            record.id = id;
            record.validate()?;
            if let Some(name) = &record.name {
                if record.status.holds_name() && name_taken(doc, name, id) {
                    return Err(Error::NameInUse(name.clone()));
                }
            }
            doc.environments.insert(id, record.clone());
            Ok(record)
        })
    }

    /// Set `last_accessed` to now.
    pub fn touch(&self, id: Uuid) -> Result<EnvironmentRecord> {
        self.update(id, |record| {
            record.last_accessed = Utc::now();
            Ok(())
        })
    }

    /// Lease a subnet for `env_id` under the document lock.
    ///
    /// `allocate` receives the pool indexes held by other environments,
    /// whether registered or still being created by any process sharing
    /// this document. Unregistered leases older than `expire_after` belong
    /// to creates that died and are dropped.
    pub fn lease_subnet<F>(&self, env_id: Uuid, expire_after: Duration, allocate: F) -> Result<AddressPlan>
    where
        F: FnOnce(&BTreeSet<u8>) -> Result<AddressPlan>,
    {
        let expire_after = chrono::Duration::from_std(expire_after)
            .map_err(|e| Error::InvalidSpec(format!("lease window out of range: {e}")))?;
        let cutoff = Utc::now() - expire_after;

        let plan = self.write(|doc| {
            let registered = &doc.environments;
            doc.subnet_leases.retain(|index, lease| {
                let live = registered.contains_key(&lease.env_id) || lease.leased_at >= cutoff;
                if !live {
                    warn!(env_id = %lease.env_id, index, "Dropping expired subnet lease");
                }
                live
            });

            let mut held: BTreeSet<u8> = doc
                .subnet_leases
                .iter()
                .filter(|(_, lease)| lease.env_id != env_id)
                .map(|(index, _)| *index)
                .collect();
            held.extend(
                doc.environments
                    .values()
                    .filter(|r| r.id != env_id && r.status != EnvironmentStatus::Closed)
                    .filter_map(|r| r.network_config.as_ref().map(|n| n.plan.index)),
            );

            let plan = allocate(&held)?;
            doc.subnet_leases.insert(
                plan.index,
                SubnetLease {
                    env_id,
                    leased_at: Utc::now(),
                },
            );
            Ok(plan)
        })?;
        debug!(%env_id, cidr = %plan.cidr(), "Subnet leased");
        Ok(plan)
    }

    /// Drop any unregistered subnet lease held by `env_id`.
    pub fn release_subnet(&self, env_id: Uuid) -> Result<bool> {
        self.write(|doc| {
            let before = doc.subnet_leases.len();
            doc.subnet_leases.retain(|_, lease| lease.env_id != env_id);
            Ok(doc.subnet_leases.len() != before)
        })
    }

    /// `true` if no live record holds `name`.
    pub fn name_available(&self, name: &str) -> Result<bool> {
        let doc = self.load()?;
        Ok(!name_taken(&doc, name, Uuid::nil()))
    }

    /// Records not accessed within `max_age`.
    pub fn stale(&self, max_age: Duration) -> Result<Vec<EnvironmentRecord>> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| Error::InvalidSpec(format!("stale window out of range: {e}")))?;
        let cutoff = Utc::now() - max_age;
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.last_accessed < cutoff)
            .collect())
    }

    /// Compare records with live host state.
    ///
    /// Active records are checked individually; live domains, VM processes
    /// and roots are matched against every record that is not closed.
    pub async fn reconcile(&self, probe: &dyn LiveStateProbe) -> Result<Vec<Discrepancy>> {
        let records = self.list()?;
        let mut found = Vec::new();

        for record in records.iter().filter(|r| r.status == EnvironmentStatus::Active) {
            found.extend(Self::inspect(record, probe).await);
        }

        let tracked: Vec<&EnvironmentRecord> = records
            .iter()
            .filter(|r| r.status != EnvironmentStatus::Closed)
            .collect();

        match probe.live_domains().await {
            Ok(domains) => {
                let known: HashSet<&str> = tracked
                    .iter()
                    .filter_map(|r| r.network_config.as_ref())
                    .map(|n| n.domain_id.as_str())
                    .collect();
                found.extend(
                    domains
                        .into_iter()
                        .filter(|d| !known.contains(d.as_str()))
                        .map(|d| Discrepancy::OrphanedResource {
                            resource: LiveResource::NetworkDomain(d),
                        }),
                );
            }
            Err(e) => warn!(error = %e, "Cannot list network domains, skipping"),
        }

        let known_roots: HashSet<&Path> = tracked.iter().map(|r| r.root_path.as_path()).collect();
        match probe.live_vms().await {
            Ok(vms) => found.extend(
                vms.into_iter()
                    .filter(|vm| !known_roots.contains(vm.root.as_path()))
                    .map(|vm| Discrepancy::OrphanedResource {
                        resource: LiveResource::VmProcess {
                            pid: vm.pid,
                            root: vm.root,
                        },
                    }),
            ),
            Err(e) => warn!(error = %e, "Cannot list VM processes, skipping"),
        }

        match probe.live_roots() {
            Ok(roots) => found.extend(
                roots
                    .into_iter()
                    .filter(|root| !known_roots.contains(root.as_path()))
                    .map(|root| Discrepancy::OrphanedResource {
                        resource: LiveResource::FilesystemRoot(root),
                    }),
            ),
            Err(e) => warn!(error = %e, "Cannot scan environment roots, skipping"),
        }

        debug!(records = records.len(), discrepancies = found.len(), "Reconciled registry");
        Ok(found)
    }

    /// Discrepancies for one record, regardless of its status.
    pub async fn inspect(record: &EnvironmentRecord, probe: &dyn LiveStateProbe) -> Vec<Discrepancy> {
        let mut found = Vec::new();
        let root_present = probe.root_present(&record.root_path);
        if !root_present {
            found.push(Discrepancy::OrphanedRecord {
                env_id: record.id,
                missing: MissingResource::FilesystemRoot,
            });
        }

        let mut network_present = true;
        if let Some(net) = &record.network_config {
            match probe.network_present(net).await {
                Ok(true) => {}
                Ok(false) => {
                    network_present = false;
                    found.push(Discrepancy::OrphanedRecord {
                        env_id: record.id,
                        missing: MissingResource::NetworkDomain,
                    });
                }
                Err(e) => debug!(env_id = %record.id, error = %e, "Network probe failed"),
            }
        }

        // A dead VM only counts as a mismatch when the rest of the
        // environment is still there.
        if let (Some(vm), true, true) = (&record.vm_config, root_present, network_present) {
            match probe.vm_status(record.id, vm).await {
                Ok(VmStatus::Running) => {}
                Ok(observed) => found.push(Discrepancy::StatusMismatch {
                    env_id: record.id,
                    recorded: record.status,
                    observed,
                }),
                Err(e) => debug!(env_id = %record.id, error = %e, "VM probe failed"),
            }
        }
        found
    }

    fn load(&self) -> Result<RegistryDocument> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RegistryDocument {
                    schema_version: SCHEMA_VERSION,
                    ..RegistryDocument::default()
                })
            }
            Err(e) => {
                return Err(Error::RegistryCorruption(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )))
            }
        };
        let doc: RegistryDocument = serde_json::from_slice(&raw).map_err(|e| {
            Error::RegistryCorruption(format!("cannot parse {}: {e}", self.path.display()))
        })?;
        if doc.schema_version > SCHEMA_VERSION {
            return Err(Error::RegistryCorruption(format!(
                "{} has schema version {}, this build reads up to {SCHEMA_VERSION}",
                self.path.display(),
                doc.schema_version
            )));
        }
        Ok(doc)
    }

    /// Locked read-modify-write. Nothing is written when `f` fails.
    fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut RegistryDocument) -> Result<T>,
    {
        let dir = self.dir();
        std::fs::create_dir_all(&dir).map_err(|e| Error::fs(&dir, e))?;
        let _lock = DocumentLock::acquire(&self.lock_path())?;

        let mut doc = self.load()?;
        let out = f(&mut doc)?;
        doc.schema_version = SCHEMA_VERSION;
        self.save(&doc)?;
        Ok(out)
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn save(&self, doc: &RegistryDocument) -> Result<()> {
        let dir = self.dir();
        let corrupt = |what: &str, e: &dyn fmt::Display| {
            Error::RegistryCorruption(format!("cannot {what} {}: {e}", self.path.display()))
        };

        let body = serde_json::to_vec_pretty(doc).map_err(|e| corrupt("serialize", &e))?;
        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| corrupt("stage", &e))?;
        tmp.write_all(&body).map_err(|e| corrupt("write", &e))?;
        tmp.as_file().sync_all().map_err(|e| corrupt("sync", &e))?;
        tmp.persist(&self.path).map_err(|e| corrupt("replace", &e.error))?;

        // Make the rename itself durable.
        if let Ok(handle) = File::open(&dir) {
            let _ = handle.sync_all();
        }
        Ok(())
    }
}

fn name_taken(doc: &RegistryDocument, name: &str, except: Uuid) -> bool {
    doc.environments.values().any(|r| {
        r.id != except && r.status.holds_name() && r.name.as_deref() == Some(name)
    })
}

/// Exclusive `flock` held for the lifetime of the value.
struct DocumentLock {
    file: File,
}

impl DocumentLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| Error::fs(path, e))?;
        // SAFETY: the descriptor is owned by `file`, which outlives the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(Error::RegistryCorruption(format!(
                "cannot lock {}: {}",
                path.display(),
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self { file })
    }
}

impl Drop for DocumentLock {
    fn drop(&mut self) {
        // SAFETY: as in `acquire`. Closing the file would also release it.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
