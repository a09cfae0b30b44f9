//! SafeSpace Core - Isolated Environment Orchestration
//!
//! Builds disposable environments out of three host resources, each owned by
//! its own controller:
//!
//! - a private filesystem root with a `.env` descriptor
//! - an optional network domain (namespace or packet-filter anchor) with its
//!   own subnet, NAT and link impairment
//! - an optional supervised VM attached to that domain
//!
//! The [`EnvironmentOrchestrator`] sequences them, unwinds partial work on
//! failure and keeps a crash-safe registry so environments can be recalled
//! after a restart.
//!
//! # Performance-First Design Patterns:
//! - Core-class aware sizing with conservative fallbacks
//! - Per-key async locks instead of a global orchestrator lock
//! - Atomic write-then-rename for every registry update

pub mod config;
pub mod engine;
pub mod environment;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod perf;

pub use config::Settings;
pub use engine::{
    Discrepancy, EnvLayout, HostTopology, Impairment, LoadMonitor, Lookup, ResourceAllocation,
    ResourceManager, VmStatus, WorkloadHint,
};
pub use environment::{
    EnvironmentHandle, EnvironmentRecord, EnvironmentSpec, EnvironmentStatus, NetworkRequest,
    VmRequest,
};
pub use error::{Error, Result};
pub use executor::{CommandOutput, CommandRunner, DryRunRunner, SystemRunner};
pub use orchestrator::{EnvironmentOrchestrator, ForecloseReport, OrchestratorBuilder, SweepReport};
pub use perf::MetricsSnapshot;

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level. Calling it twice is harmless.
pub fn init(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.general.log_level));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok();

    if installed {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            dry_run = settings.general.dry_run,
            "SafeSpace initialized"
        );
    }
}
