//! Port for dispatching background work.
//!
//! Services hand typed tasks to this port; the worker runtime owns the
//! channel, retry policy, and beats.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::domain::ids::{JobId, VoiceId};
use crate::domain::voices::Provider;

/// Typed background tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerTask {
    /// Create the remote voice for a voice in `allocating`.
    Allocate { voice_id: VoiceId },
    /// Drive one synthesis job to completion.
    Synthesize { job_id: JobId },
    /// Drain the waiting queue while capacity remains.
    ProcessQueue { provider: Provider },
    /// Evict idle voices past the warm hold.
    ReclaimIdle { provider: Provider },
    /// Zero lots past their expiry, writing expire transactions.
    ExpireLots,
    /// Grant monthly credits to users lacking a lot this month.
    GrantMonthlyCredits,
}

impl WorkerTask {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Allocate { .. } => "allocate",
            Self::Synthesize { .. } => "synthesize",
            Self::ProcessQueue { .. } => "process_queue",
            Self::ReclaimIdle { .. } => "reclaim_idle",
            Self::ExpireLots => "expire_lots",
            Self::GrantMonthlyCredits => "grant_monthly_credits",
        }
    }
}

/// Raised when the worker runtime can no longer accept tasks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task dispatch failed: {message}")]
pub struct DispatchError {
    pub message: String,
}

impl DispatchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Port for handing tasks to the worker runtime.
#[cfg_attr(test, mockall::automock)]
pub trait TaskDispatcher: Send + Sync {
    /// Enqueue a task for immediate execution.
    fn dispatch(&self, task: WorkerTask) -> Result<(), DispatchError>;

    /// Enqueue a task after `delay`.
    fn dispatch_delayed(&self, task: WorkerTask, delay: Duration) -> Result<(), DispatchError>;
}

/// Fixture dispatcher that records tasks instead of running them.
///
/// Tests drive the recorded tasks by hand, which keeps worker behaviour
/// deterministic without a runtime.
#[derive(Default)]
pub struct RecordingDispatcher {
    tasks: Mutex<Vec<(WorkerTask, Option<Duration>)>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(WorkerTask, Option<Duration>)>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All recorded tasks in dispatch order, delays erased.
    pub fn recorded(&self) -> Vec<WorkerTask> {
        self.lock().iter().map(|(task, _)| *task).collect()
    }

    /// Remove and return the recorded tasks.
    pub fn drain(&self) -> Vec<WorkerTask> {
        self.lock().drain(..).map(|(task, _)| task).collect()
    }
}

impl TaskDispatcher for RecordingDispatcher {
    fn dispatch(&self, task: WorkerTask) -> Result<(), DispatchError> {
        self.lock().push((task, None));
        Ok(())
    }

    fn dispatch_delayed(&self, task: WorkerTask, delay: Duration) -> Result<(), DispatchError> {
        self.lock().push((task, Some(delay)));
        Ok(())
    }
}
