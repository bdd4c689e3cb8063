//! Background worker runtime: typed task dispatch, retry with jittered
//! backoff, per-task deadlines, and periodic beats.
//!
//! Tasks for one voice serialize through the per-voice slot lock inside the
//! slot manager; the runtime itself runs tasks in parallel up to its
//! configured concurrency.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::domain::config::AppConfig;
use crate::domain::credits::{CreditLedger, LedgerError};
use crate::domain::ports::{DispatchError, TaskDispatcher, WorkerTask};
use crate::domain::slots::{SlotError, SlotManager};
use crate::domain::synthesis::{SynthesisError, SynthesisOrchestrator};
use crate::domain::voices::Provider;

mod retry;

pub use retry::{BackoffJitter, EqualJitter, RetryPolicy, Sleeper, TokioSleeper};

/// Worker runtime configuration.
#[derive(Debug, Clone)]
pub struct WorkerRuntimeConfig {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub task_deadline: Duration,
    pub queue_poll_interval: Duration,
    pub reclaim_interval: Duration,
    pub expire_interval: Duration,
    pub monthly_grant_interval: Duration,
}

impl WorkerRuntimeConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            concurrency: config.worker_concurrency.max(1),
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base: config.backoff_base,
                cap: config.backoff_cap,
            },
            task_deadline: config.task_deadline,
            queue_poll_interval: config.queue_poll_interval,
            reclaim_interval: config.reclaim_interval,
            expire_interval: Duration::from_secs(24 * 60 * 60),
            monthly_grant_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl Default for WorkerRuntimeConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

/// A task plus its execution attempt, as carried on the runtime channel.
#[derive(Debug, Clone, Copy)]
pub struct TaskEnvelope {
    task: WorkerTask,
    /// 1-indexed execution attempt.
    attempt: u32,
}

/// Dispatcher handing tasks to the runtime over an unbounded channel.
pub struct ChannelDispatcher {
    tx: UnboundedSender<TaskEnvelope>,
}

impl ChannelDispatcher {
    /// Create the dispatcher and the receiving end for the runtime.
    pub fn new() -> (Arc<Self>, UnboundedReceiver<TaskEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn send(&self, envelope: TaskEnvelope) -> Result<(), DispatchError> {
        self.tx
            .send(envelope)
            .map_err(|_| DispatchError::new("worker runtime has shut down"))
    }

    fn send_later(&self, envelope: TaskEnvelope, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(envelope).is_err() {
                warn!(task = envelope.task.kind(), "delayed task dropped at shutdown");
            }
        });
    }
}

impl TaskDispatcher for ChannelDispatcher {
    fn dispatch(&self, task: WorkerTask) -> Result<(), DispatchError> {
        self.send(TaskEnvelope { task, attempt: 1 })
    }

    fn dispatch_delayed(&self, task: WorkerTask, delay: Duration) -> Result<(), DispatchError> {
        self.send_later(TaskEnvelope { task, attempt: 1 }, delay);
        Ok(())
    }
}

enum TaskFailure {
    Retryable(String),
    Terminal(String),
}

/// Services the runtime drives.
pub struct WorkerServices {
    pub slots: Arc<SlotManager>,
    pub orchestrator: Arc<SynthesisOrchestrator>,
    pub ledger: Arc<CreditLedger>,
}

/// The worker runtime.
pub struct WorkerRuntime {
    services: WorkerServices,
    dispatcher: Arc<ChannelDispatcher>,
    rx: tokio::sync::Mutex<UnboundedReceiver<TaskEnvelope>>,
    jitter: Arc<dyn BackoffJitter>,
    config: WorkerRuntimeConfig,
}

impl WorkerRuntime {
    pub fn new(
        services: WorkerServices,
        dispatcher: Arc<ChannelDispatcher>,
        rx: UnboundedReceiver<TaskEnvelope>,
        config: WorkerRuntimeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            services,
            dispatcher,
            rx: tokio::sync::Mutex::new(rx),
            jitter: Arc::new(EqualJitter),
            config,
        })
    }

    /// Start the worker pool and the periodic beats. Handles run until the
    /// process exits.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.concurrency + 1);
        for worker in 0..self.config.concurrency {
            let runtime = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                info!(worker, "worker loop started");
                runtime.worker_loop().await;
            }));
        }
        handles.push(self.spawn_beats());
        handles
    }

    async fn worker_loop(&self) {
        loop {
            let envelope = { self.rx.lock().await.recv().await };
            let Some(envelope) = envelope else {
                break;
            };
            self.execute(envelope).await;
        }
    }

    fn spawn_beats(self: &Arc<Self>) -> JoinHandle<()> {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let mut queue_beat = tokio::time::interval(runtime.config.queue_poll_interval);
            let mut reclaim_beat = tokio::time::interval(runtime.config.reclaim_interval);
            let mut expire_beat = tokio::time::interval(runtime.config.expire_interval);
            let mut monthly_beat = tokio::time::interval(runtime.config.monthly_grant_interval);
            loop {
                tokio::select! {
                    _ = queue_beat.tick() => {
                        for provider in Provider::ALL {
                            runtime.beat(WorkerTask::ProcessQueue { provider });
                        }
                    }
                    _ = reclaim_beat.tick() => {
                        for provider in Provider::ALL {
                            runtime.beat(WorkerTask::ReclaimIdle { provider });
                        }
                    }
                    _ = expire_beat.tick() => runtime.beat(WorkerTask::ExpireLots),
                    _ = monthly_beat.tick() => runtime.beat(WorkerTask::GrantMonthlyCredits),
                }
            }
        })
    }

    fn beat(&self, task: WorkerTask) {
        if let Err(dispatch_error) = self.dispatcher.dispatch(task) {
            warn!(task = task.kind(), %dispatch_error, "beat dispatch failed");
        }
    }

    async fn execute(&self, envelope: TaskEnvelope) {
        let kind = envelope.task.kind();
        let outcome =
            tokio::time::timeout(self.config.task_deadline, self.run_task(envelope.task)).await;
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(failure)) => failure,
            // The slot lock's TTL releases any lock the cancelled future
            // still held.
            Err(_) => TaskFailure::Retryable("task deadline exceeded".to_string()),
        };

        match failure {
            TaskFailure::Retryable(message) => {
                if self.config.retry.allows(envelope.attempt) {
                    let delay = self
                        .jitter
                        .jittered(self.config.retry.base_delay(envelope.attempt));
                    warn!(
                        task = kind,
                        attempt = envelope.attempt,
                        delay_ms = delay.as_millis() as u64,
                        message,
                        "task failed; retrying"
                    );
                    self.dispatcher.send_later(
                        TaskEnvelope {
                            task: envelope.task,
                            attempt: envelope.attempt + 1,
                        },
                        delay,
                    );
                } else {
                    error!(task = kind, attempt = envelope.attempt, message, "task retries exhausted");
                    self.dead_letter(envelope.task, &message).await;
                }
            }
            TaskFailure::Terminal(message) => {
                error!(task = kind, message, "task failed terminally");
            }
        }
    }

    async fn run_task(&self, task: WorkerTask) -> Result<(), TaskFailure> {
        match task {
            WorkerTask::Allocate { voice_id } => {
                map_slot_result(self.services.slots.allocate(voice_id).await)
            }
            WorkerTask::Synthesize { job_id } => {
                map_synthesis_result(self.services.orchestrator.run_synthesis(job_id).await)
            }
            WorkerTask::ProcessQueue { provider } => {
                map_slot_result(self.services.slots.process_queue(provider).await.map(|_| ()))
            }
            WorkerTask::ReclaimIdle { provider } => {
                map_slot_result(self.services.slots.reclaim_idle(provider).await.map(|_| ()))
            }
            WorkerTask::ExpireLots => {
                map_ledger_result(self.services.ledger.expire_now(None, None).await.map(|_| ()))
            }
            WorkerTask::GrantMonthlyCredits => {
                map_ledger_result(self.services.ledger.grant_monthly().await.map(|_| ()))
            }
        }
    }

    /// Terminal handling once retries ran out: the owning record moves to
    /// `error` and, for synthesis, the debit is refunded.
    async fn dead_letter(&self, task: WorkerTask, message: &str) {
        let result = match task {
            WorkerTask::Allocate { voice_id } => self
                .services
                .slots
                .fail_allocation(voice_id, message)
                .await
                .map_err(|e| e.to_string()),
            WorkerTask::Synthesize { job_id } => self
                .services
                .orchestrator
                .fail_job(job_id, message)
                .await
                .map_err(|e| e.to_string()),
            _ => Ok(()),
        };
        if let Err(dead_letter_error) = result {
            error!(task = task.kind(), dead_letter_error, "dead-letter handling failed");
        }
    }
}

fn map_slot_result(result: Result<(), SlotError>) -> Result<(), TaskFailure> {
    match result {
        Ok(()) => Ok(()),
        // A voice deleted mid-flight resolves the task.
        Err(SlotError::NotFound { .. }) => Ok(()),
        Err(SlotError::Retryable { message }) => Err(TaskFailure::Retryable(message)),
        Err(SlotError::Terminal { message }) => Err(TaskFailure::Terminal(message)),
    }
}

fn map_synthesis_result(result: Result<(), SynthesisError>) -> Result<(), TaskFailure> {
    match result {
        Ok(()) => Ok(()),
        Err(SynthesisError::Retryable { message }) => Err(TaskFailure::Retryable(message)),
        Err(other) => Err(TaskFailure::Terminal(other.to_string())),
    }
}

fn map_ledger_result(result: Result<(), LedgerError>) -> Result<(), TaskFailure> {
    match result {
        Ok(()) => Ok(()),
        Err(LedgerError::Conflict(message) | LedgerError::Unavailable(message)) => {
            Err(TaskFailure::Retryable(message))
        }
        Err(other) => Err(TaskFailure::Terminal(other.to_string())),
    }
}
