//! Long-running remote operation handles and the wait loop around them.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ComputeError, FleetError, Result};

/// Token for an asynchronous remote operation.
#[async_trait]
pub trait Operation: Send {
    fn name(&self) -> &str;

    /// Refresh from the remote. Fails if the operation finished with an error.
    async fn poll(&mut self) -> std::result::Result<(), ComputeError>;

    fn done(&self) -> bool;

    /// Percent complete, 0..=100.
    fn progress(&self) -> u8;

    /// Poll every `interval` until done.
    async fn wait(&mut self, interval: Duration) -> std::result::Result<(), ComputeError> {
        loop {
            self.poll().await?;
            if self.done() {
                return Ok(());
            }
            tokio::time::sleep(interval).await;
        }
    }
}

impl std::fmt::Debug for dyn Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation").field("name", &self.name()).finish()
    }
}

pub type OperationHandle = Box<dyn Operation>;

/// An operation the remote already finished synchronously.
#[derive(Debug, Clone)]
pub struct CompletedOperation {
    name: String,
    error: Option<String>,
}

impl CompletedOperation {
    pub fn boxed(name: impl Into<String>) -> OperationHandle {
        Box::new(Self {
            name: name.into(),
            error: None,
        })
    }

    /// A finished operation whose first poll reports `message`.
    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> OperationHandle {
        Box::new(Self {
            name: name.into(),
            error: Some(message.into()),
        })
    }
}

#[async_trait]
impl Operation for CompletedOperation {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&mut self) -> std::result::Result<(), ComputeError> {
        match &self.error {
            Some(message) => Err(ComputeError::Operation {
                name: self.name.clone(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    fn done(&self) -> bool {
        true
    }

    fn progress(&self) -> u8 {
        100
    }
}

/// Caller-side cancellation: a shutdown flag plus an optional deadline.
///
/// Cancelling stops local wait loops only. Remote operations already issued
/// keep running.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

impl Cancellation {
    /// Never cancels.
    pub fn none() -> Self {
        Self {
            rx: None,
            deadline: None,
        }
    }

    /// A cancellation driven by the returned sender; send `true` to cancel.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (
            tx,
            Self {
                rx: Some(rx),
                deadline: None,
            },
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        let flagged = self.rx.as_ref().is_some_and(|rx| *rx.borrow());
        let expired = self.deadline.is_some_and(|d| Instant::now() >= d);
        flagged || expired
    }

    /// Sleep for `interval` unless cancelled first. Returns false on cancellation.
    pub(crate) async fn sleep(&self, interval: Duration) -> bool {
        let mut wake = Instant::now() + interval;
        if let Some(deadline) = self.deadline {
            if deadline <= wake {
                wake = deadline;
            }
        }
        match self.rx.clone() {
            Some(mut rx) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(wake) => {}
                    cancelled = async { rx.wait_for(|flag| *flag).await.is_ok() } => {
                        if cancelled {
                            return false;
                        }
                        // Sender dropped without cancelling; finish the sleep.
                        tokio::time::sleep_until(wake).await;
                    }
                }
            }
            None => tokio::time::sleep_until(wake).await,
        }
        !self.is_cancelled()
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::none()
    }
}

/// Polls operations at a fixed interval, forwarding percent complete.
#[derive(Debug, Clone)]
pub struct Waiter {
    interval: Duration,
    cancel: Cancellation,
}

impl Waiter {
    pub fn new(interval: Duration, cancel: Cancellation) -> Self {
        Self { interval, cancel }
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    pub async fn wait(&self, op: OperationHandle) -> Result<()> {
        self.wait_with_progress(op, |_| {}).await
    }

    pub async fn wait_with_progress<F>(&self, mut op: OperationHandle, mut on_progress: F) -> Result<()>
    where
        F: FnMut(u8) + Send,
    {
        loop {
            if self.cancel.is_cancelled() {
                return Err(FleetError::Cancelled(op.name().to_string()));
            }
            op.poll().await.map_err(FleetError::from_poll)?;
            on_progress(op.progress());
            if op.done() {
                debug!(operation = op.name(), "operation done");
                return Ok(());
            }
            if !self.cancel.sleep(self.interval).await {
                return Err(FleetError::Cancelled(op.name().to_string()));
            }
        }
    }
}
