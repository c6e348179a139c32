pub mod bootstrap;
pub mod compute;
pub mod config;
pub mod error;
pub mod instance;
pub mod lifecycle;
pub mod memory;
pub mod names;
pub mod network;
pub mod operation;
pub mod orchestrator;
pub mod progress;
pub mod readiness;
pub mod reconcile;
pub mod state;
pub mod subnet;

pub use compute::ComputeClient;
pub use config::FleetConfig;
pub use error::{ComputeError, FleetError, Result};
pub use lifecycle::{ClusterStatus, InstanceState};
pub use orchestrator::ClusterOrchestrator;
pub use progress::ProgressSink;
pub use state::{ClusterOverrides, StateStore};
