//! Waiting for a cluster's entry node to report that first-boot setup is done.
//!
//! The bootstrap content on index 0 serves a one-word status (`running`,
//! `ready` or `error`) over HTTP once it starts. Anything else, including
//! connection failures, means "not yet".

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{FleetError, Result};
use crate::operation::Cancellation;
use crate::progress::ProgressSink;

pub const READINESS_PORT: u16 = 34223;
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Longest status body worth reading.
const MAX_BODY: usize = 32;

/// One answer from the readiness endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Setup is still in progress.
    Running,
    /// Setup finished and failed.
    Failed,
    /// No usable answer; the message says why.
    Pending(String),
}

impl Readiness {
    pub fn parse(body: &str) -> Self {
        let head: String = body.chars().take(MAX_BODY).collect();
        match head.trim().to_ascii_lowercase().as_str() {
            "ready" => Readiness::Ready,
            "running" => Readiness::Running,
            "error" => Readiness::Failed,
            other => Readiness::Pending(format!("unexpected readiness response {other:?}")),
        }
    }
}

/// Asks a host whether it is ready. Implementations never fail: transport
/// errors come back as [`Readiness::Pending`].
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    async fn check(&self, host: &str) -> Readiness;
}

/// Ask `host` every `interval` until it answers `ready` or `error`, or
/// `cancel` fires.
pub async fn wait_for_ready(
    checker: &dyn ReadinessCheck,
    instance: &str,
    host: &str,
    cancel: &Cancellation,
    interval: Duration,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let task = format!("ready {instance}");
    progress.start(&task, &format!("Waiting for {instance} to be ready"));
    let mut last = String::from("no answer yet");
    loop {
        match checker.check(host).await {
            Readiness::Ready => {
                progress.done(&task, &format!("{instance} is ready"));
                return Ok(());
            }
            Readiness::Failed => {
                let err = FleetError::NotReady {
                    instance: instance.to_string(),
                    state: "error".to_string(),
                };
                progress.fail(&task, &err.to_string());
                return Err(err);
            }
            Readiness::Running => last = "setup still running".to_string(),
            Readiness::Pending(reason) => last = reason,
        }
        debug!(instance, host, reason = %last, "not ready yet");
        if cancel.is_cancelled() || !cancel.sleep(interval).await {
            let err = FleetError::Cancelled(format!("readiness of {instance} ({last})"));
            progress.fail(&task, &err.to_string());
            return Err(err);
        }
    }
}
