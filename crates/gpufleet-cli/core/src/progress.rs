//! Progress reporting for cluster-wide operations.
//!
//! A sink is shared by every per-instance task of a fan-out, so
//! implementations serialize their own writes. Nothing reads progress back
//! to make decisions.

use std::sync::Mutex;

use tracing::{info, warn};

pub trait ProgressSink: Send + Sync {
    /// A task with the given key is about to run.
    fn start(&self, task: &str, label: &str);
    /// Percent complete of the task's current remote operation.
    fn update(&self, task: &str, percent: u8);
    fn done(&self, task: &str, message: &str);
    fn warn(&self, task: &str, message: &str);
    fn fail(&self, task: &str, message: &str);
}

/// Reports progress as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn start(&self, task: &str, label: &str) {
        info!(task, "{label}");
    }

    fn update(&self, task: &str, percent: u8) {
        tracing::debug!(task, percent, "progress");
    }

    fn done(&self, task: &str, message: &str) {
        info!(task, "{message}");
    }

    fn warn(&self, task: &str, message: &str) {
        warn!(task, "{message}");
    }

    fn fail(&self, task: &str, message: &str) {
        tracing::error!(task, "{message}");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Start { task: String, label: String },
    Update { task: String, percent: u8 },
    Done { task: String, message: String },
    Warn { task: String, message: String },
    Fail { task: String, message: String },
}

/// Keeps every event in order; handy for asserting on what a run reported.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.lock().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::Warn { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ProgressEvent>> {
        // A poisoned log is still a valid log.
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, event: ProgressEvent) {
        self.lock().push(event);
    }
}

impl ProgressSink for RecordingProgress {
    fn start(&self, task: &str, label: &str) {
        self.push(ProgressEvent::Start {
            task: task.to_string(),
            label: label.to_string(),
        });
    }

    fn update(&self, task: &str, percent: u8) {
        self.push(ProgressEvent::Update {
            task: task.to_string(),
            percent,
        });
    }

    fn done(&self, task: &str, message: &str) {
        self.push(ProgressEvent::Done {
            task: task.to_string(),
            message: message.to_string(),
        });
    }

    fn warn(&self, task: &str, message: &str) {
        self.push(ProgressEvent::Warn {
            task: task.to_string(),
            message: message.to_string(),
        });
    }

    fn fail(&self, task: &str, message: &str) {
        self.push(ProgressEvent::Fail {
            task: task.to_string(),
            message: message.to_string(),
        });
    }
}
