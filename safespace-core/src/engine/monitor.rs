//! Periodic load sampling.
//!
//! [`LoadMonitor`] drives [`ResourceManager::sample`] from a background tokio
//! task and enforces the cache ceiling every few samples. Tests call
//! [`LoadMonitor::tick`] directly instead of waiting on the interval; it runs
//! the same step as the loop.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::resources::{ResourceManager, WorkloadSample};

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct LoadMonitor {
    manager: Arc<ResourceManager>,
    interval: Duration,
    cache_check_every: u32,
    /// Shared by the loop and [`tick`](Self::tick).
    ticks: Arc<AtomicU32>,
    running: Mutex<Option<Running>>,
}

impl LoadMonitor {
    pub fn new(manager: Arc<ResourceManager>) -> Self {
        let interval = manager.settings().sample_interval();
        let cache_check_every = manager.settings().cache_check_every;
        Self::with_interval(manager, interval, cache_check_every)
    }

    pub fn with_interval(manager: Arc<ResourceManager>, interval: Duration, cache_check_every: u32) -> Self {
        Self {
            manager,
            interval,
            cache_check_every,
            ticks: Arc::new(AtomicU32::new(0)),
            running: Mutex::new(None),
        }
    }

    /// Start sampling in the background. Returns `false` if already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let manager = self.manager.clone();
        let interval = self.interval;
        let cache_check_every = self.cache_check_every;
        let ticks = self.ticks.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        maintain(&manager, &ticks, cache_check_every).await;
                    }
                }
            }
            debug!("Load monitor stopped");
        });

        debug!(interval_ms = interval.as_millis() as u64, "Load monitor started");
        *running = Some(Running { cancel, task });
        true
    }

    /// Stop the background task and wait for it to exit.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Running { cancel, task }) = running {
            cancel.cancel();
            if let Err(e) = task.await {
                warn!(error = %e, "Load monitor task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run one loop step now: sample, and enforce the cache ceiling when due.
    pub async fn tick(&self) -> WorkloadSample {
        maintain(&self.manager, &self.ticks, self.cache_check_every).await
    }
}

impl Drop for LoadMonitor {
    fn drop(&mut self) {
        if let Some(running) = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            running.cancel.cancel();
        }
    }
}

async fn maintain(manager: &Arc<ResourceManager>, ticks: &AtomicU32, cache_check_every: u32) -> WorkloadSample {
    let tick = ticks.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    let sample = manager.sample();
    debug!(load = ?sample.load, class = %sample.class, "Load sample");

    if cache_check_every > 0 && tick % cache_check_every == 0 {
        // Eviction walks and deletes files.
        let manager = manager.clone();
        match tokio::task::spawn_blocking(move || manager.enforce_cache_ceiling()).await {
            Ok(Ok(0)) => {}
            Ok(Ok(freed)) => debug!(freed, "Cache ceiling enforced"),
            Ok(Err(e)) => warn!(error = %e, "Cache ceiling enforcement failed"),
            Err(e) => warn!(error = %e, "Cache ceiling task failed"),
        }
    }
    sample
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceSettings;
    use crate::engine::host::{HostTopology, StaticProbe};

    fn manager() -> Arc<ResourceManager> {
        let probe = Arc::new(StaticProbe::new(HostTopology::conservative(), 0.3));
        Arc::new(ResourceManager::new(ResourceSettings::default(), probe))
    }

    #[tokio::test]
    async fn test_tick_records_sample() {
        let manager = manager();
        let monitor = LoadMonitor::new(manager.clone());
        let sample = monitor.tick().await;
        assert_eq!(sample.load, Some(0.3));
        assert_eq!(manager.samples().len(), 1);
    }

    #[tokio::test]
    async fn test_tick_enforces_cache_ceiling_when_due() {
        let dir = tempfile::tempdir().unwrap();
        // 10% of 10 kB: a 1000 byte ceiling, reclaimed down to 800.
        let topology = HostTopology::from_split(1, vec![0], Vec::new(), 10_000);
        let settings = ResourceSettings {
            cache_dir: dir.path().to_path_buf(),
            ..ResourceSettings::default()
        };
        let manager = Arc::new(ResourceManager::new(settings, Arc::new(StaticProbe::new(topology, 0.3))));
        for name in ["a.bin", "b.bin", "c.bin"] {
            std::fs::write(dir.path().join(name), vec![0u8; 600]).unwrap();
        }

        let monitor = LoadMonitor::with_interval(manager.clone(), Duration::from_secs(60), 2);
        monitor.tick().await;
        assert_eq!(manager.cache_usage().unwrap(), 1800);
        monitor.tick().await;
        assert!(manager.cache_usage().unwrap() <= 800);
        assert_eq!(manager.samples().len(), 2);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let manager = manager();
        let monitor = LoadMonitor::with_interval(manager.clone(), Duration::from_millis(10), 0);
        assert!(monitor.start());
        assert!(!monitor.start());
        assert!(monitor.is_running());

        tokio::time::sleep(Duration::from_millis(60)).await;
        monitor.stop().await;
        assert!(!monitor.is_running());

        let taken = manager.samples().len();
        assert!(taken >= 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(manager.samples().len(), taken);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let monitor = LoadMonitor::new(manager());
        monitor.stop().await;
        assert!(!monitor.is_running());
    }
}
