//! Instance lifecycle states and the cluster-level reduction over them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Last-known lifecycle state of a single instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Provisioning,
    Starting,
    Ready,
    Terminating,
    Terminated,
}

impl InstanceState {
    /// Map a provider instance status (`RUNNING`, `STAGING`, ...) onto a lifecycle state.
    pub fn from_compute_status(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => InstanceState::Ready,
            "PROVISIONING" => InstanceState::Provisioning,
            "STAGING" | "REPAIRING" => InstanceState::Starting,
            "STOPPING" | "SUSPENDING" => InstanceState::Terminating,
            _ => InstanceState::Terminated,
        }
    }

    /// Terminated is the only rest state.
    pub fn is_at_rest(self) -> bool {
        self == InstanceState::Terminated
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Provisioning => "provisioning",
            InstanceState::Starting => "starting",
            InstanceState::Ready => "ready",
            InstanceState::Terminating => "terminating",
            InstanceState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate status of a cluster. `Deleted` is only ever set by drift detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Provisioning,
    Starting,
    Ready,
    Terminating,
    Terminated,
    Deleted,
}

impl ClusterStatus {
    /// Reduce instance states to a cluster status.
    ///
    /// Priority: any terminating, then any starting, then any provisioning,
    /// then all-ready, then mixed ready (reported as starting), else terminated.
    pub fn derive<I>(states: I) -> Self
    where
        I: IntoIterator<Item = InstanceState>,
    {
        let mut ready = 0usize;
        let mut terminated = 0usize;
        let mut starting = false;
        let mut provisioning = false;
        let mut terminating = false;
        for state in states {
            match state {
                InstanceState::Ready => ready += 1,
                InstanceState::Terminated => terminated += 1,
                InstanceState::Starting => starting = true,
                InstanceState::Provisioning => provisioning = true,
                InstanceState::Terminating => terminating = true,
            }
        }

        if terminating {
            ClusterStatus::Terminating
        } else if starting {
            ClusterStatus::Starting
        } else if provisioning {
            ClusterStatus::Provisioning
        } else if ready > 0 && terminated == 0 {
            ClusterStatus::Ready
        } else if ready > 0 {
            ClusterStatus::Starting
        } else {
            ClusterStatus::Terminated
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClusterStatus::Provisioning => "provisioning",
            ClusterStatus::Starting => "starting",
            ClusterStatus::Ready => "ready",
            ClusterStatus::Terminating => "terminating",
            ClusterStatus::Terminated => "terminated",
            ClusterStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
