//! Workload-Aware Resource Allocation
//!
//! Turns host topology plus observed load into per-environment sizing, and
//! keeps the shared cache directory under its ceiling.
//!
//! # Performance-First Design:
//! - Topology is probed once per process and cached
//! - Load samples live in a fixed-size ring buffer
//! - `recommend` never fails: unreadable hosts get a conservative allocation

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::host::{HostProbe, HostTopology, SystemProbe};
use crate::config::ResourceSettings;

/// Normalized load below which the host counts as lightly loaded.
pub const LIGHT_LOAD_THRESHOLD: f64 = 0.5;
/// Normalized load below which the host counts as moderately loaded.
pub const MEDIUM_LOAD_THRESHOLD: f64 = 0.85;

/// Core class preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoreClass {
    Performance,
    Efficiency,
}

impl fmt::Display for CoreClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Performance => write!(f, "performance"),
            Self::Efficiency => write!(f, "efficiency"),
        }
    }
}

/// What the environment is expected to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadHint {
    /// Interactive work: latency matters.
    #[default]
    Foreground,
    /// A virtual machine.
    Vm,
    /// Batch or background jobs.
    Background,
    /// Test suites, which tolerate slower cores.
    TestRunner,
}

impl WorkloadHint {
    pub fn preferred_class(self) -> CoreClass {
        match self {
            Self::Foreground | Self::Vm => CoreClass::Performance,
            Self::Background | Self::TestRunner => CoreClass::Efficiency,
        }
    }
}

/// Load bucket derived from a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadClass {
    Light,
    Medium,
    Heavy,
}

impl WorkloadClass {
    pub fn from_load(load: f64) -> Self {
        if load < LIGHT_LOAD_THRESHOLD {
            Self::Light
        } else if load < MEDIUM_LOAD_THRESHOLD {
            Self::Medium
        } else {
            Self::Heavy
        }
    }

    /// Share of the host's cores and memory budget offered under this load.
    pub fn share(self) -> f64 {
        match self {
            Self::Light => 1.0,
            Self::Medium => 0.75,
            Self::Heavy => 0.5,
        }
    }
}

impl fmt::Display for WorkloadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Light => write!(f, "light"),
            Self::Medium => write!(f, "medium"),
            Self::Heavy => write!(f, "heavy"),
        }
    }
}

/// One load observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSample {
    pub taken_at: DateTime<Utc>,
    /// Normalized load, `None` when the host could not be read.
    pub load: Option<f64>,
    pub class: WorkloadClass,
}

/// Sizing decided for one environment. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub performance_cores: usize,
    pub efficiency_cores: usize,
    pub memory_ceiling_bytes: u64,
    pub cache_ceiling_bytes: u64,
    pub preferred_class: CoreClass,
    /// Load bucket the decision was based on.
    pub basis: WorkloadClass,
}

impl ResourceAllocation {
    /// Core count in the preferred class.
    pub fn preferred_cores(&self) -> usize {
        match self.preferred_class {
            CoreClass::Performance => self.performance_cores,
            CoreClass::Efficiency => self.efficiency_cores,
        }
    }

    pub fn memory_ceiling_mb(&self) -> u64 {
        self.memory_ceiling_bytes / (1024 * 1024)
    }
}

/// Decides per-environment sizing and maintains the cache directory.
pub struct ResourceManager {
    settings: ResourceSettings,
    probe: Arc<dyn HostProbe>,
    topology: OnceLock<HostTopology>,
    samples: Mutex<VecDeque<WorkloadSample>>,
    cache_lock: Mutex<()>,
}

impl ResourceManager {
    pub fn new(settings: ResourceSettings, probe: Arc<dyn HostProbe>) -> Self {
        let capacity = settings.sample_history.max(1);
        Self {
            settings,
            probe,
            topology: OnceLock::new(),
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            cache_lock: Mutex::new(()),
        }
    }

    /// Manager reading the live host.
    pub fn with_defaults(settings: ResourceSettings) -> Self {
        Self::new(settings, Arc::new(SystemProbe::new()))
    }

    pub fn settings(&self) -> &ResourceSettings {
        &self.settings
    }

    /// Host topology, detected on first use.
    pub fn topology(&self) -> &HostTopology {
        self.topology.get_or_init(|| match self.probe.topology() {
            Ok(topology) => {
                info!(
                    logical = topology.logical_cores,
                    performance = topology.performance_cores(),
                    efficiency = topology.efficiency_cores(),
                    memory_bytes = topology.total_memory_bytes,
                    "Detected host topology"
                );
                topology
            }
            Err(e) => {
                warn!(error = %e, "Host topology unreadable, using conservative defaults");
                HostTopology::conservative()
            }
        })
    }

    /// Sizing for a new environment under the most recent load sample.
    ///
    /// Core counts are at least one and never exceed the host's count for
    /// that class. With no sample yet the host is treated as lightly loaded.
    pub fn recommend(&self, hint: WorkloadHint) -> ResourceAllocation {
        let topology = self.topology();
        let basis = self
            .latest_sample()
            .map(|s| s.class)
            .unwrap_or(WorkloadClass::Light);
        let share = basis.share();

        let allocation = ResourceAllocation {
            performance_cores: scale_cores(topology.performance_cores(), share),
            efficiency_cores: scale_cores(topology.efficiency_cores(), share),
            memory_ceiling_bytes: (topology.total_memory_bytes as f64
                * percent(self.settings.memory_percent)
                * share) as u64,
            cache_ceiling_bytes: self.cache_ceiling_bytes(),
            preferred_class: hint.preferred_class(),
            basis,
        };

        debug!(
            ?hint,
            %basis,
            performance = allocation.performance_cores,
            efficiency = allocation.efficiency_cores,
            memory_bytes = allocation.memory_ceiling_bytes,
            "Resource recommendation"
        );
        allocation
    }

    /// Take a load sample and push it into the history ring.
    pub fn sample(&self) -> WorkloadSample {
        let sample = match self.probe.load() {
            Ok(load) => WorkloadSample {
                taken_at: Utc::now(),
                load: Some(load),
                class: WorkloadClass::from_load(load),
            },
            Err(e) => {
                warn!(error = %e, "Load unreadable, assuming medium load");
                WorkloadSample {
                    taken_at: Utc::now(),
                    load: None,
                    class: WorkloadClass::Medium,
                }
            }
        };

        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        if samples.len() >= self.settings.sample_history.max(1) {
            samples.pop_front();
        }
        samples.push_back(sample.clone());
        sample
    }

    /// The latest sample if it is younger than `max_age`, else a new one.
    pub fn fresh_sample(&self, max_age: Duration) -> WorkloadSample {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        match self.latest_sample() {
            Some(sample) if Utc::now() - sample.taken_at < max_age => sample,
            _ => self.sample(),
        }
    }

    pub fn latest_sample(&self) -> Option<WorkloadSample> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .cloned()
    }

    /// Sample history, oldest first.
    pub fn samples(&self) -> Vec<WorkloadSample> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Core ids of `class`, for affinity pinning.
    pub fn optimize_cores(&self, class: CoreClass) -> Vec<usize> {
        let topology = self.topology();
        match class {
            CoreClass::Performance => topology.performance_core_ids.clone(),
            CoreClass::Efficiency => topology.efficiency_core_ids.clone(),
        }
    }

    /// Wrap `argv` so the launched process runs on `class` cores.
    ///
    /// Uses `taskset` on Linux. Elsewhere there is no affinity API, so
    /// efficiency work is deprioritized with `nice` and performance work
    /// runs unwrapped.
    pub fn pinned_command(&self, class: CoreClass, argv: &[String]) -> Vec<String> {
        let mut wrapped = if cfg!(target_os = "linux") {
            let list = self
                .optimize_cores(class)
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(",");
            vec!["taskset".to_string(), "-c".to_string(), list]
        } else {
            match class {
                CoreClass::Performance => Vec::new(),
                CoreClass::Efficiency => vec!["nice".to_string(), "-n".to_string(), "10".to_string()],
            }
        };
        wrapped.extend(argv.iter().cloned());
        wrapped
    }

    /// Cache ceiling in bytes.
    pub fn cache_ceiling_bytes(&self) -> u64 {
        (self.topology().total_memory_bytes as f64 * percent(self.settings.max_cache_size_percent))
            as u64
    }

    /// Total bytes under the cache directory.
    pub fn cache_usage(&self) -> Result<u64> {
        Ok(cache_entries(&self.settings.cache_dir)?
            .iter()
            .map(|e| e.size)
            .sum())
    }

    /// Evict least-recently-accessed cache files until the cache holds at
    /// most `target_bytes`. Returns the bytes freed.
    pub fn reclaim_cache(&self, target_bytes: u64) -> Result<u64> {
        let _guard = self.cache_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut entries = cache_entries(&self.settings.cache_dir)?;
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        if total <= target_bytes {
            return Ok(0);
        }

        entries.sort_by_key(|e| e.accessed);
        let mut freed = 0u64;
        for entry in entries {
            if total <= target_bytes {
                break;
            }
            match std::fs::remove_file(&entry.path) {
                Ok(()) => {
                    total -= entry.size;
                    freed += entry.size;
                    debug!(path = %entry.path.display(), bytes = entry.size, "Evicted cache file");
                }
                Err(e) => warn!(path = %entry.path.display(), error = %e, "Failed to evict cache file"),
            }
        }

        info!(freed, remaining = total, target = target_bytes, "Cache reclaimed");
        Ok(freed)
    }

    /// Reclaim down to the low-water mark when the ceiling is exceeded.
    pub fn enforce_cache_ceiling(&self) -> Result<u64> {
        let ceiling = self.cache_ceiling_bytes();
        let usage = self.cache_usage()?;
        if usage <= ceiling {
            return Ok(0);
        }
        let target = (ceiling as f64 * percent(self.settings.cache_low_water_percent)) as u64;
        debug!(usage, ceiling, target, "Cache over ceiling");
        self.reclaim_cache(target)
    }
}

fn percent(value: u8) -> f64 {
    f64::from(value.min(100)) / 100.0
}

fn scale_cores(host: usize, share: f64) -> usize {
    let host = host.max(1);
    ((host as f64 * share).floor() as usize).clamp(1, host)
}

struct CacheEntry {
    path: PathBuf,
    size: u64,
    accessed: SystemTime,
}

fn cache_entries(dir: &Path) -> Result<Vec<CacheEntry>> {
    let mut entries = Vec::new();
    if !dir.exists() {
        return Ok(entries);
    }

    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let listing = std::fs::read_dir(&current)
            .with_context(|| format!("Failed to list cache directory {}", current.display()))?;
        for item in listing {
            let item = item?;
            let meta = item.metadata()?;
            if meta.is_dir() {
                pending.push(item.path());
            } else if meta.is_file() {
                entries.push(CacheEntry {
                    path: item.path(),
                    size: meta.len(),
                    accessed: meta.accessed().or_else(|_| meta.modified())?,
                });
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::host::StaticProbe;
    use std::fs::{File, FileTimes};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn manager_with(topology: HostTopology, load: f64) -> (ResourceManager, Arc<StaticProbe>) {
        let probe = Arc::new(StaticProbe::new(topology, load));
        let manager = ResourceManager::new(ResourceSettings::default(), probe.clone());
        (manager, probe)
    }

    fn hybrid() -> HostTopology {
        HostTopology::from_split(12, (0..4).collect(), (4..12).collect(), 16 * GIB)
    }

    // ── classification ────────────────────────────────────────────────

    #[test]
    fn test_load_thresholds() {
        assert_eq!(WorkloadClass::from_load(0.1), WorkloadClass::Light);
        assert_eq!(WorkloadClass::from_load(0.5), WorkloadClass::Medium);
        assert_eq!(WorkloadClass::from_load(0.84), WorkloadClass::Medium);
        assert_eq!(WorkloadClass::from_load(0.85), WorkloadClass::Heavy);
        assert_eq!(WorkloadClass::from_load(3.0), WorkloadClass::Heavy);
    }

    #[test]
    fn test_hint_preference() {
        assert_eq!(WorkloadHint::Vm.preferred_class(), CoreClass::Performance);
        assert_eq!(WorkloadHint::TestRunner.preferred_class(), CoreClass::Efficiency);
    }

    // ── recommend ─────────────────────────────────────────────────────

    #[test]
    fn test_light_load_offers_full_counts() {
        let (manager, _) = manager_with(hybrid(), 0.1);
        manager.sample();
        let alloc = manager.recommend(WorkloadHint::Foreground);
        assert_eq!(alloc.performance_cores, 4);
        assert_eq!(alloc.efficiency_cores, 8);
        assert_eq!(alloc.basis, WorkloadClass::Light);
        assert_eq!(alloc.memory_ceiling_bytes, 8 * GIB);
        assert_eq!(alloc.cache_ceiling_bytes, (16 * GIB) / 10);
    }

    #[test]
    fn test_heavy_load_shrinks_allocation() {
        let (manager, probe) = manager_with(hybrid(), 0.1);
        manager.sample();
        let light = manager.recommend(WorkloadHint::Vm);

        probe.set_load(1.5);
        manager.sample();
        let heavy = manager.recommend(WorkloadHint::Vm);

        assert_eq!(heavy.performance_cores, 2);
        assert_eq!(heavy.efficiency_cores, 4);
        assert!(heavy.memory_ceiling_bytes < light.memory_ceiling_bytes);
    }

    #[test]
    fn test_never_zero_never_above_host() {
        for load in [0.0, 0.6, 0.9, 10.0] {
            for topo in [HostTopology::conservative(), hybrid()] {
                let (manager, _) = manager_with(topo.clone(), load);
                manager.sample();
                for hint in [WorkloadHint::Foreground, WorkloadHint::Background] {
                    let alloc = manager.recommend(hint);
                    assert!(alloc.performance_cores >= 1);
                    assert!(alloc.efficiency_cores >= 1);
                    assert!(alloc.performance_cores <= topo.performance_cores());
                    assert!(alloc.efficiency_cores <= topo.efficiency_cores());
                }
            }
        }
    }

    #[test]
    fn test_single_core_host() {
        let topo = HostTopology::from_split(1, vec![0], Vec::new(), 2 * GIB);
        let (manager, _) = manager_with(topo, 0.0);
        let alloc = manager.recommend(WorkloadHint::Foreground);
        assert_eq!((alloc.performance_cores, alloc.efficiency_cores), (1, 1));
    }

    #[test]
    fn test_unreadable_host_is_conservative() {
        let manager = ResourceManager::new(ResourceSettings::default(), Arc::new(StaticProbe::unreadable()));
        let sample = manager.sample();
        assert_eq!(sample.load, None);
        assert_eq!(sample.class, WorkloadClass::Medium);

        let alloc = manager.recommend(WorkloadHint::Vm);
        assert_eq!(alloc.performance_cores, 1);
        assert_eq!(alloc.efficiency_cores, 1);
        assert!(alloc.memory_ceiling_bytes <= GIB);
    }

    #[test]
    fn test_preferred_cores() {
        let (manager, _) = manager_with(hybrid(), 0.0);
        assert_eq!(manager.recommend(WorkloadHint::Vm).preferred_cores(), 4);
        assert_eq!(manager.recommend(WorkloadHint::Background).preferred_cores(), 8);
    }

    // ── sampling ──────────────────────────────────────────────────────

    #[test]
    fn test_sample_history_is_bounded() {
        let probe = Arc::new(StaticProbe::new(hybrid(), 0.2));
        let settings = ResourceSettings {
            sample_history: 3,
            ..ResourceSettings::default()
        };
        let manager = ResourceManager::new(settings, probe.clone());
        for i in 0..5 {
            probe.set_load(i as f64 / 10.0);
            manager.sample();
        }
        let history = manager.samples();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].load, Some(0.2));
        assert_eq!(manager.latest_sample().unwrap().load, Some(0.4));
    }

    #[test]
    fn test_fresh_sample_reuses_recent_and_replaces_old() {
        let (manager, probe) = manager_with(hybrid(), 0.1);
        assert_eq!(manager.fresh_sample(Duration::from_secs(60)).class, WorkloadClass::Light);
        assert_eq!(manager.samples().len(), 1);

        probe.set_load(1.5);
        assert_eq!(manager.fresh_sample(Duration::from_secs(60)).class, WorkloadClass::Light);
        assert_eq!(manager.fresh_sample(Duration::ZERO).class, WorkloadClass::Heavy);
        assert_eq!(manager.samples().len(), 2);
    }

    // ── core pinning ──────────────────────────────────────────────────

    #[test]
    fn test_optimize_cores() {
        let (manager, _) = manager_with(hybrid(), 0.0);
        assert_eq!(manager.optimize_cores(CoreClass::Performance), vec![0, 1, 2, 3]);
        assert_eq!(manager.optimize_cores(CoreClass::Efficiency).len(), 8);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pinned_command_uses_taskset() {
        let (manager, _) = manager_with(hybrid(), 0.0);
        let argv = vec!["make".to_string(), "test".to_string()];
        assert_eq!(
            manager.pinned_command(CoreClass::Performance, &argv),
            vec!["taskset", "-c", "0,1,2,3", "make", "test"]
        );
    }

    // ── cache ─────────────────────────────────────────────────────────

    fn write_cache_file(dir: &Path, name: &str, size: usize, age_secs: u64) {
        let path = dir.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, vec![0u8; size]).unwrap();
        let when = SystemTime::now() - Duration::from_secs(age_secs);
        let file = File::options().write(true).open(&path).unwrap();
        file.set_times(FileTimes::new().set_accessed(when).set_modified(when))
            .unwrap();
    }

    #[test]
    fn test_reclaim_evicts_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ResourceSettings {
            cache_dir: dir.path().to_path_buf(),
            ..ResourceSettings::default()
        };
        let manager = ResourceManager::new(settings, Arc::new(StaticProbe::new(hybrid(), 0.0)));

        write_cache_file(dir.path(), "old.bin", 100, 3000);
        write_cache_file(dir.path(), "nested/middle.bin", 100, 2000);
        write_cache_file(dir.path(), "new.bin", 100, 10);
        assert_eq!(manager.cache_usage().unwrap(), 300);

        let freed = manager.reclaim_cache(150).unwrap();
        assert_eq!(freed, 200);
        assert!(!dir.path().join("old.bin").exists());
        assert!(!dir.path().join("nested/middle.bin").exists());
        assert!(dir.path().join("new.bin").exists());
    }

    #[test]
    fn test_reclaim_noop_under_target() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ResourceSettings {
            cache_dir: dir.path().to_path_buf(),
            ..ResourceSettings::default()
        };
        let manager = ResourceManager::new(settings, Arc::new(StaticProbe::new(hybrid(), 0.0)));
        write_cache_file(dir.path(), "a.bin", 10, 0);
        assert_eq!(manager.reclaim_cache(1024).unwrap(), 0);
        assert_eq!(manager.enforce_cache_ceiling().unwrap(), 0);
    }

    #[test]
    fn test_missing_cache_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ResourceSettings {
            cache_dir: dir.path().join("absent"),
            ..ResourceSettings::default()
        };
        let manager = ResourceManager::new(settings, Arc::new(StaticProbe::new(hybrid(), 0.0)));
        assert_eq!(manager.cache_usage().unwrap(), 0);
    }
}
