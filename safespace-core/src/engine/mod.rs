//! Engine module - Environment building blocks
//!
//! Each controller owns one kind of host resource. None of them persists
//! state; the registry is written only by the orchestrator.

pub mod host;
pub mod layout;
pub mod monitor;
pub mod network;
pub mod registry;
pub mod resources;
pub mod vm;

pub use host::{HostProbe, HostTopology, StaticProbe, SystemProbe};
pub use layout::EnvLayout;
pub use monitor::LoadMonitor;
pub use network::{Impairment, NetworkConfig, NetworkHandle, NetworkIsolationController};
pub use registry::{Discrepancy, EnvironmentRegistry, LiveResource, LiveStateProbe, Lookup};
pub use resources::{CoreClass, ResourceAllocation, ResourceManager, WorkloadClass, WorkloadHint};
pub use vm::{VmConfig, VmController, VmHandle, VmSizing, VmStatus};
