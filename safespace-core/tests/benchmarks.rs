//! Performance benchmarks for SafeSpace Core.
//!
//! These tests measure timing for key operations and validate that
//! performance stays within acceptable bounds. Run with:
//!
//! ```sh
//! cargo test -p safespace-core --test benchmarks -- --ignored --nocapture
//! ```

mod common;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use common::Fixture;
use safespace_core::engine::{EnvironmentRegistry, HostTopology, ResourceManager, StaticProbe};
use safespace_core::{
    EnvironmentRecord, EnvironmentSpec, EnvironmentStatus, Lookup, Settings, WorkloadHint,
};
use uuid::Uuid;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Filesystem-only lifecycle benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_create_foreclose_filesystem() {
    const ITERATIONS: usize = 200;
    let rt = runtime();
    let fx = Fixture::new();

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        rt.block_on(async {
            let handle = fx.orchestrator.create(EnvironmentSpec::new()).await.unwrap();
            fx.orchestrator.foreclose(handle.id()).await.unwrap();
        });
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / ITERATIONS as u32;

    eprintln!(
        "[bench_create_foreclose_filesystem] {ITERATIONS} iterations in {elapsed:?} ({per_iter:?}/iter)"
    );
    eprintln!("  {}", fx.orchestrator.metrics());
    assert!(
        per_iter.as_millis() < 50,
        "create + foreclose of a bare root should complete in < 50 ms, got {per_iter:?}"
    );
}

// ---------------------------------------------------------------------------
// Dry-run network domain benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_create_network_dry_run() {
    const ITERATIONS: usize = 100;
    let rt = runtime();
    let fx = Fixture::new();

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        rt.block_on(async {
            let handle = fx
                .orchestrator
                .create(EnvironmentSpec::new().with_network())
                .await
                .unwrap();
            fx.orchestrator.foreclose(handle.id()).await.unwrap();
        });
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / ITERATIONS as u32;

    eprintln!(
        "[bench_create_network_dry_run] {ITERATIONS} iterations in {elapsed:?} ({per_iter:?}/iter)"
    );
    eprintln!("  commands recorded={}", fx.runner.commands().len());
    assert!(fx.runner.namespaces().is_empty());
    assert!(
        per_iter.as_millis() < 100,
        "dry-run network lifecycle should complete in < 100 ms, got {per_iter:?}"
    );
}

// ---------------------------------------------------------------------------
// Registry benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_registry_register_and_lookup() {
    const RECORDS: usize = 200;
    let dir = tempfile::tempdir().unwrap();
    let registry = EnvironmentRegistry::new(dir.path().join("environments.json"));
    let resources = ResourceManager::with_defaults(Settings::default().resources);
    let allocation = resources.recommend(WorkloadHint::Foreground);

    let start = Instant::now();
    for i in 0..RECORDS {
        let now = Utc::now();
        let record = EnvironmentRecord {
            id: Uuid::new_v4(),
            name: Some(format!("bench-{i}")),
            status: EnvironmentStatus::Active,
            resource_snapshot: allocation.clone(),
            network_config: None,
            vm_config: None,
            created_at: now,
            last_accessed: now,
            template_id: None,
            root_path: dir.path().join(format!("env-{i}")),
        };
        registry.register(&record).unwrap();
    }
    let write_elapsed = start.elapsed();

    let start = Instant::now();
    for i in 0..RECORDS {
        let lookup = Lookup::Name(format!("bench-{i}"));
        assert!(registry.get(&lookup).unwrap().is_some());
    }
    let read_elapsed = start.elapsed();

    eprintln!(
        "[bench_registry] {RECORDS} registers in {write_elapsed:?}, {RECORDS} lookups in {read_elapsed:?}"
    );
    assert_eq!(registry.list().unwrap().len(), RECORDS);
    assert!(
        write_elapsed.as_secs() < 10,
        "{RECORDS} durable registry writes should finish in < 10 s, got {write_elapsed:?}"
    );
}

// ---------------------------------------------------------------------------
// Resource recommendation benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_resource_recommend() {
    const ITERATIONS: usize = 10_000;
    let topology = HostTopology::from_split(8, vec![0, 1, 2, 3], vec![4, 5, 6, 7], 16 << 30);
    let probe = Arc::new(StaticProbe::new(topology, 0.5));
    let resources = ResourceManager::new(Settings::default().resources, probe);

    let hints = [
        WorkloadHint::Foreground,
        WorkloadHint::Vm,
        WorkloadHint::Background,
        WorkloadHint::TestRunner,
    ];
    let start = Instant::now();
    for i in 0..ITERATIONS {
        let allocation = resources.recommend(hints[i % hints.len()]);
        assert!(allocation.preferred_cores() >= 1);
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / ITERATIONS as u32;

    eprintln!("[bench_resource_recommend] {ITERATIONS} recommendations in {elapsed:?} ({per_iter:?}/iter)");
    assert!(
        per_iter.as_micros() < 100,
        "a recommendation should take < 100 µs, got {per_iter:?}"
    );
}
