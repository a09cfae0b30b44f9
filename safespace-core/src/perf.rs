//! Orchestrator Metrics
//!
//! Lightweight counters for lifecycle operations.
//!
//! # Design Goals:
//! - Lock-free atomic counters
//! - Zero-allocation recording
//! - Timings recorded by a guard that cannot be forgotten on early return

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Lifecycle counters shared by every clone of an orchestrator.
#[derive(Debug, Default)]
pub struct OrchestratorMetrics {
    creates: AtomicU64,
    create_time_ns: AtomicU64,
    create_failures: AtomicU64,
    unwound_steps: AtomicU64,
    recalls: AtomicU64,
    recall_time_ns: AtomicU64,
    forecloses: AtomicU64,
    foreclose_time_ns: AtomicU64,
    teardown_warnings: AtomicU64,
    sweeps: AtomicU64,
    remediations: AtomicU64,
}

impl OrchestratorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_create(&self, duration: Duration) {
        self.creates.fetch_add(1, Ordering::Relaxed);
        self.create_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// A failed create and the number of steps its unwind reversed.
    pub fn record_create_failure(&self, unwound: usize) {
        self.create_failures.fetch_add(1, Ordering::Relaxed);
        self.unwound_steps.fetch_add(unwound as u64, Ordering::Relaxed);
    }

    pub fn record_recall(&self, duration: Duration) {
        self.recalls.fetch_add(1, Ordering::Relaxed);
        self.recall_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_foreclose(&self, duration: Duration, warnings: usize) {
        self.forecloses.fetch_add(1, Ordering::Relaxed);
        self.foreclose_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        self.teardown_warnings
            .fetch_add(warnings as u64, Ordering::Relaxed);
    }

    pub fn record_sweep(&self, remediations: usize) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.remediations
            .fetch_add(remediations as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            creates: self.creates.load(Ordering::Relaxed),
            avg_create_ms: avg_ms(&self.creates, &self.create_time_ns),
            create_failures: self.create_failures.load(Ordering::Relaxed),
            unwound_steps: self.unwound_steps.load(Ordering::Relaxed),
            recalls: self.recalls.load(Ordering::Relaxed),
            avg_recall_ms: avg_ms(&self.recalls, &self.recall_time_ns),
            forecloses: self.forecloses.load(Ordering::Relaxed),
            avg_foreclose_ms: avg_ms(&self.forecloses, &self.foreclose_time_ns),
            teardown_warnings: self.teardown_warnings.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            remediations: self.remediations.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.creates,
            &self.create_time_ns,
            &self.create_failures,
            &self.unwound_steps,
            &self.recalls,
            &self.recall_time_ns,
            &self.forecloses,
            &self.foreclose_time_ns,
            &self.teardown_warnings,
            &self.sweeps,
            &self.remediations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn avg_ms(count: &AtomicU64, total_ns: &AtomicU64) -> f64 {
    let c = count.load(Ordering::Relaxed);
    if c == 0 {
        return 0.0;
    }
    (total_ns.load(Ordering::Relaxed) as f64) / (c as f64) / 1_000_000.0
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub creates: u64,
    pub avg_create_ms: f64,
    pub create_failures: u64,
    pub unwound_steps: u64,
    pub recalls: u64,
    pub avg_recall_ms: f64,
    pub forecloses: u64,
    pub avg_foreclose_ms: f64,
    pub teardown_warnings: u64,
    pub sweeps: u64,
    pub remediations: u64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "creates:     {:>6} (avg {:>8.3} ms, {} failed, {} steps unwound)",
            self.creates, self.avg_create_ms, self.create_failures, self.unwound_steps)?;
        writeln!(f, "recalls:     {:>6} (avg {:>8.3} ms)", self.recalls, self.avg_recall_ms)?;
        writeln!(f, "forecloses:  {:>6} (avg {:>8.3} ms, {} teardown warnings)",
            self.forecloses, self.avg_foreclose_ms, self.teardown_warnings)?;
        write!(f, "sweeps:      {:>6} ({} remediations)", self.sweeps, self.remediations)
    }
}

/// Which timing a [`ScopedTimer`] feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedOp {
    Create,
    Recall,
}

/// Records the elapsed time on drop unless [`ScopedTimer::discard`]ed.
pub struct ScopedTimer<'a> {
    start: Instant,
    metrics: &'a OrchestratorMetrics,
    op: TimedOp,
    armed: bool,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(metrics: &'a OrchestratorMetrics, op: TimedOp) -> Self {
        Self {
            start: Instant::now(),
            metrics,
            op,
            armed: true,
        }
    }

    /// Drop without recording; failed operations are counted separately.
    pub fn discard(mut self) {
        self.armed = false;
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let duration = self.start.elapsed();
        match self.op {
            TimedOp::Create => self.metrics.record_create(duration),
            TimedOp::Recall => self.metrics.record_recall(duration),
        }
    }
}
