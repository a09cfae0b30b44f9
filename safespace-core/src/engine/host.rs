//! Host Topology and Load Probing
//!
//! Answers two questions for the resource manager: how many cores of each
//! class the host has (and how much memory), and how loaded it currently is.
//!
//! # Detection order (Linux)
//!
//! 1. Hybrid PMU lists: `/sys/devices/cpu_core/cpus` and
//!    `/sys/devices/cpu_atom/cpus`.
//! 2. Per-CPU `cpu_capacity`: the highest-capacity CPUs are performance
//!    cores, the rest efficiency cores.
//! 3. Otherwise every online CPU is treated as a performance core.
//!
//! On macOS the `hw.perflevel{0,1}.logicalcpu` sysctls give the split.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::{bail, Context, Result};

const GIB: u64 = 1024 * 1024 * 1024;

/// Core and memory layout of the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTopology {
    pub logical_cores: usize,
    pub performance_core_ids: Vec<usize>,
    pub efficiency_core_ids: Vec<usize>,
    pub total_memory_bytes: u64,
}

impl HostTopology {
    /// Build a topology from raw detection results.
    ///
    /// Hosts with fewer than two logical cores collapse to one core of each
    /// class; hosts without distinct efficiency cores report the performance
    /// set for both classes.
    pub fn from_split(
        logical_cores: usize,
        performance_core_ids: Vec<usize>,
        efficiency_core_ids: Vec<usize>,
        total_memory_bytes: u64,
    ) -> Self {
        if logical_cores < 2 {
            return Self {
                logical_cores: 1,
                performance_core_ids: vec![0],
                efficiency_core_ids: vec![0],
                total_memory_bytes,
            };
        }

        let performance_core_ids = if performance_core_ids.is_empty() {
            (0..logical_cores).collect()
        } else {
            performance_core_ids
        };
        let efficiency_core_ids = if efficiency_core_ids.is_empty() {
            performance_core_ids.clone()
        } else {
            efficiency_core_ids
        };

        Self {
            logical_cores,
            performance_core_ids,
            efficiency_core_ids,
            total_memory_bytes,
        }
    }

    /// Fallback used when detection fails: one core, 1 GiB.
    pub fn conservative() -> Self {
        Self::from_split(1, Vec::new(), Vec::new(), GIB)
    }

    pub fn performance_cores(&self) -> usize {
        self.performance_core_ids.len()
    }

    pub fn efficiency_cores(&self) -> usize {
        self.efficiency_core_ids.len()
    }

    /// `true` when the host exposes two distinct core classes.
    pub fn is_heterogeneous(&self) -> bool {
        self.performance_core_ids != self.efficiency_core_ids
    }
}

/// Source of host topology and load readings.
pub trait HostProbe: Send + Sync {
    fn topology(&self) -> Result<HostTopology>;

    /// One-minute load average normalized by logical core count.
    fn load(&self) -> Result<f64>;
}

/// Reads the live host.
#[derive(Debug, Default)]
pub struct SystemProbe;

impl SystemProbe {
    pub fn new() -> Self {
        Self
    }
}

impl HostProbe for SystemProbe {
    fn topology(&self) -> Result<HostTopology> {
        detect_topology()
    }

    fn load(&self) -> Result<f64> {
        let logical = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Ok(load_average()? / logical as f64)
    }
}

/// Fixed readings, for tests and for pinning behavior on odd hosts.
#[derive(Debug)]
pub struct StaticProbe {
    topology: Option<HostTopology>,
    load: Mutex<Option<f64>>,
}

impl StaticProbe {
    pub fn new(topology: HostTopology, load: f64) -> Self {
        Self {
            topology: Some(topology),
            load: Mutex::new(Some(load)),
        }
    }

    /// A probe whose readings always fail.
    pub fn unreadable() -> Self {
        Self {
            topology: None,
            load: Mutex::new(None),
        }
    }

    pub fn set_load(&self, load: f64) {
        *self.load.lock().unwrap_or_else(PoisonError::into_inner) = Some(load);
    }
}

impl HostProbe for StaticProbe {
    fn topology(&self) -> Result<HostTopology> {
        self.topology.clone().context("host topology is unreadable")
    }

    fn load(&self) -> Result<f64> {
        let load = *self.load.lock().unwrap_or_else(PoisonError::into_inner);
        load.context("host load is unreadable")
    }
}

/// Parse a kernel CPU list such as `0-3,8,10-11`.
pub fn parse_cpu_list(raw: &str) -> Result<Vec<usize>> {
    let mut ids = Vec::new();
    for part in raw.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().with_context(|| format!("bad cpu range `{part}`"))?;
                let hi: usize = hi.trim().parse().with_context(|| format!("bad cpu range `{part}`"))?;
                if hi < lo {
                    bail!("bad cpu range `{part}`");
                }
                ids.extend(lo..=hi);
            }
            None => ids.push(
                part.trim()
                    .parse()
                    .with_context(|| format!("bad cpu id `{part}`"))?,
            ),
        }
    }
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

/// Parse `MemTotal` out of `/proc/meminfo` content, in bytes.
pub fn parse_meminfo_total(raw: &str) -> Result<u64> {
    let line = raw
        .lines()
        .find(|l| l.starts_with("MemTotal:"))
        .context("MemTotal missing from meminfo")?;
    let kib: u64 = line
        .split_whitespace()
        .nth(1)
        .context("MemTotal has no value")?
        .parse()
        .context("MemTotal is not a number")?;
    Ok(kib * 1024)
}

/// Split CPUs by `cpu_capacity`: the maximum-capacity group is performance.
pub fn split_by_capacity(capacities: &[(usize, u64)]) -> (Vec<usize>, Vec<usize>) {
    let Some(max) = capacities.iter().map(|(_, c)| *c).max() else {
        return (Vec::new(), Vec::new());
    };
    let (perf, eff): (Vec<&(usize, u64)>, Vec<&(usize, u64)>) = capacities.iter().partition(|(_, c)| *c == max);
    (
        perf.into_iter().map(|(id, _)| *id).collect(),
        eff.into_iter().map(|(id, _)| *id).collect(),
    )
}

fn read_cpu_list(path: &Path) -> Option<Vec<usize>> {
    let raw = std::fs::read_to_string(path).ok()?;
    parse_cpu_list(&raw).ok().filter(|ids| !ids.is_empty())
}

#[cfg(target_os = "linux")]
fn detect_topology() -> Result<HostTopology> {
    let online = read_cpu_list(Path::new("/sys/devices/system/cpu/online"))
        .unwrap_or_else(|| {
            let n = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            (0..n).collect()
        });

    let (perf, eff) = match (
        read_cpu_list(Path::new("/sys/devices/cpu_core/cpus")),
        read_cpu_list(Path::new("/sys/devices/cpu_atom/cpus")),
    ) {
        (Some(perf), Some(eff)) => (perf, eff),
        _ => {
            let capacities: Vec<(usize, u64)> = online
                .iter()
                .filter_map(|id| {
                    let path = format!("/sys/devices/system/cpu/cpu{id}/cpu_capacity");
                    let raw = std::fs::read_to_string(path).ok()?;
                    Some((*id, raw.trim().parse().ok()?))
                })
                .collect();
            if capacities.len() == online.len() {
                split_by_capacity(&capacities)
            } else {
                (online.clone(), Vec::new())
            }
        }
    };

    let meminfo = std::fs::read_to_string("/proc/meminfo").context("Failed to read /proc/meminfo")?;
    let total = parse_meminfo_total(&meminfo)?;

    Ok(HostTopology::from_split(online.len(), perf, eff, total))
}

#[cfg(target_os = "macos")]
fn detect_topology() -> Result<HostTopology> {
    let logical = sysctl_u64("hw.logicalcpu")? as usize;
    let perf = sysctl_u64("hw.perflevel0.logicalcpu").unwrap_or(logical as u64) as usize;
    let eff = sysctl_u64("hw.perflevel1.logicalcpu").unwrap_or(0) as usize;
    let total = sysctl_u64("hw.memsize")?;
    // Apple numbers performance cores after efficiency cores.
    let eff_ids: Vec<usize> = (0..eff).collect();
    let perf_ids: Vec<usize> = (eff..eff + perf).collect();
    Ok(HostTopology::from_split(logical, perf_ids, eff_ids, total))
}

#[cfg(target_os = "macos")]
fn sysctl_u64(name: &str) -> Result<u64> {
    let cname = std::ffi::CString::new(name)?;
    let mut value: u64 = 0;
    let mut size = std::mem::size_of::<u64>();
    // SAFETY: value/size describe a valid, writable u64 buffer.
    let rc = unsafe {
        libc::sysctlbyname(
            cname.as_ptr(),
            &mut value as *mut u64 as *mut libc::c_void,
            &mut size,
            std::ptr::null_mut(),
            0,
        )
    };
    if rc != 0 {
        bail!("sysctl {name} failed: {}", std::io::Error::last_os_error());
    }
    Ok(value)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn detect_topology() -> Result<HostTopology> {
    bail!("host topology detection is not supported on this platform")
}

#[cfg(target_os = "linux")]
fn load_average() -> Result<f64> {
    let raw = std::fs::read_to_string("/proc/loadavg").context("Failed to read /proc/loadavg")?;
    raw.split_whitespace()
        .next()
        .context("empty /proc/loadavg")?
        .parse()
        .context("malformed /proc/loadavg")
}

#[cfg(not(target_os = "linux"))]
fn load_average() -> Result<f64> {
    let mut loads = [0f64; 3];
    // SAFETY: the buffer holds three doubles and we ask for one.
    let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 1) };
    if n < 1 {
        bail!("getloadavg failed");
    }
    Ok(loads[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3,8,10-11\n").unwrap(), vec![0, 1, 2, 3, 8, 10, 11]);
        assert_eq!(parse_cpu_list("5").unwrap(), vec![5]);
        assert!(parse_cpu_list("4-2").is_err());
        assert!(parse_cpu_list("x").is_err());
    }

    #[test]
    fn test_parse_meminfo_total() {
        let raw = "MemTotal:       16315412 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_meminfo_total(raw).unwrap(), 16_315_412 * 1024);
        assert!(parse_meminfo_total("MemFree: 1 kB").is_err());
    }

    #[test]
    fn test_split_by_capacity() {
        let (perf, eff) = split_by_capacity(&[(0, 1024), (1, 1024), (2, 512), (3, 512)]);
        assert_eq!(perf, vec![0, 1]);
        assert_eq!(eff, vec![2, 3]);

        let (perf, eff) = split_by_capacity(&[(0, 1024), (1, 1024)]);
        assert_eq!(perf, vec![0, 1]);
        assert!(eff.is_empty());
    }

    #[test]
    fn test_single_core_collapses() {
        let topo = HostTopology::from_split(1, vec![0], Vec::new(), GIB);
        assert_eq!(topo.performance_cores(), 1);
        assert_eq!(topo.efficiency_cores(), 1);
        assert!(!topo.is_heterogeneous());
    }

    #[test]
    fn test_homogeneous_host_reports_same_counts() {
        let topo = HostTopology::from_split(8, (0..8).collect(), Vec::new(), 8 * GIB);
        assert_eq!(topo.performance_cores(), 8);
        assert_eq!(topo.efficiency_cores(), 8);
        assert!(!topo.is_heterogeneous());
    }

    #[test]
    fn test_hybrid_host() {
        let topo = HostTopology::from_split(12, (0..4).collect(), (4..12).collect(), 16 * GIB);
        assert_eq!(topo.performance_cores(), 4);
        assert_eq!(topo.efficiency_cores(), 8);
        assert!(topo.is_heterogeneous());
    }

    #[test]
    fn test_static_probe() {
        let probe = StaticProbe::new(HostTopology::conservative(), 0.2);
        assert_eq!(probe.load().unwrap(), 0.2);
        probe.set_load(0.9);
        assert_eq!(probe.load().unwrap(), 0.9);

        let broken = StaticProbe::unreadable();
        assert!(broken.topology().is_err());
        assert!(broken.load().is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_system_probe_reads_host() {
        let topo = SystemProbe::new().topology().unwrap();
        assert!(topo.logical_cores >= 1);
        assert!(topo.performance_cores() >= 1);
        assert!(topo.total_memory_bytes > 0);
        assert!(SystemProbe::new().load().unwrap() >= 0.0);
    }
}
