// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::{CoordinatorConfig, ShutdownPolicy};
use crate::job_engine::dispatcher::{Dispatcher, Shared};
use crate::job_engine::job::{Compensator, Job, JobAction};
use crate::job_engine::key_queue::KeyQueue;
use crate::job_engine::monitor::{JobMonitor, MonitorSnapshot};
use crate::job_engine::retry::RetryController;

/// Why a job was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("job key must not be empty")]
    InvalidKey,
    #[error("job coordinator has been shut down")]
    ShutDown,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("invalid coordinator config: {0}")]
    InvalidConfig(String),
    #[error("failed to spawn job worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Entry point for submitting keyed jobs.
///
/// Jobs with the same key run one after the other in submission order; jobs
/// with different keys run in parallel on the worker pool. Create one
/// instance at startup and pass it to everything that submits work.
pub struct JobCoordinator {
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    shutdown_policy: ShutdownPolicy,
    shut_down: AtomicBool,
}

impl JobCoordinator {
    pub fn new(config: CoordinatorConfig) -> Result<Self, CoordinatorError> {
        config.validate().map_err(CoordinatorError::InvalidConfig)?;
        let shared = Arc::new(Shared {
            queues: KeyQueue::new(),
            monitor: JobMonitor::new(),
            controller: RetryController::new(&config),
        });
        let dispatcher = Dispatcher::start(shared.clone(), config.workers)?;
        Ok(Self {
            shared,
            dispatcher,
            shutdown_policy: config.shutdown_policy,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn enqueue_job(
        &self,
        key: impl Into<String>,
        action: impl JobAction,
    ) -> Result<(), EnqueueError> {
        self.enqueue(Job::new(key, action))
    }

    pub fn enqueue_job_with_retries(
        &self,
        key: impl Into<String>,
        action: impl JobAction,
        max_retries: u32,
    ) -> Result<(), EnqueueError> {
        self.enqueue(Job::new(key, action).with_max_retries(max_retries))
    }

    pub fn enqueue_job_with_compensator(
        &self,
        key: impl Into<String>,
        action: impl JobAction,
        compensator: impl Compensator,
        max_retries: u32,
    ) -> Result<(), EnqueueError> {
        self.enqueue(
            Job::new(key, action)
                .with_compensator(compensator)
                .with_max_retries(max_retries),
        )
    }

    /// Admits the job and returns right away. Failures of the job itself are
    /// only reported through the log and the monitor.
    pub fn enqueue(&self, job: Job) -> Result<(), EnqueueError> {
        if job.key().is_empty() {
            return Err(EnqueueError::InvalidKey);
        }
        let key = job.key().to_string();

        self.shared.monitor.job_admitting();
        if let Err(job) = self.shared.queues.push(job) {
            self.shared.monitor.job_rejected();
            debug!("Rejected job {} (key {key}): shut down", job.desc());
            return Err(EnqueueError::ShutDown);
        }
        self.shared.monitor.job_admitted();

        if !self.dispatcher.wake(key.clone()) {
            // only possible once the workers are gone
            warn!("Job for key {key} admitted, but the dispatcher is already closed");
        }
        Ok(())
    }

    /// Number of admitted jobs that have not reached a terminal state.
    pub fn incomplete_task_count(&self) -> u64 {
        self.shared.monitor.incomplete()
    }

    pub fn monitor(&self) -> MonitorSnapshot {
        self.shared.monitor.snapshot(self.shared.queues.key_count())
    }

    /// Stops admitting jobs. Depending on the shutdown policy, jobs that have
    /// not started yet are either kept (and still run) or discarded.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.queues.close();
        info!("Job coordinator shutting down ({:?})", self.shutdown_policy);
        if self.shutdown_policy == ShutdownPolicy::Discard {
            let discarded = self.shared.queues.discard_waiting();
            for job in &discarded {
                warn!("Discarding job {} (key {}) on shutdown", job.desc(), job.key());
                self.shared.monitor.job_discarded();
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Blocks until every admitted job is resolved. Does not shut down.
    pub fn wait_until_idle(&self, timeout: Option<Duration>) -> bool {
        self.shared.monitor.wait_idle(timeout)
    }

    /// Shuts down, lets the remaining jobs finish and stops the workers.
    pub fn wait_until_finished(&self) {
        self.shutdown();
        self.shared.monitor.wait_idle(None);
        self.dispatcher.join();
        info!("Job coordinator finished");
    }
}

impl Drop for JobCoordinator {
    fn drop(&mut self) {
        // workers end after their current job, without joining them here
        self.dispatcher.close();
    }
}

impl std::fmt::Debug for JobCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCoordinator")
            .field("incomplete", &self.incomplete_task_count())
            .field("shutdown_policy", &self.shutdown_policy)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
