// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Retry and rollback handling of a single job.
//!
//! ```text
//!  Pending -> Running -+-> Succeeded
//!               ^      |
//!               |      +-> Retrying ---+          (attempts <= max_retries)
//!               +----------------------+
//!                      +-> Compensating -> Abandoned (compensator present)
//!                      +-> Abandoned                 (no compensator)
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use async_io::Timer;
use log::{debug, error, warn};

use crate::config::CoordinatorConfig;
use crate::job_engine::aggregator::{self, Outcome};
use crate::job_engine::completion::CompletionError;
use crate::job_engine::job::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Running,
    Retrying,
    Compensating,
    Succeeded,
    Abandoned,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Abandoned)
    }
}

/// What to do after an attempt has been aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Succeed,
    Retry,
    Compensate,
    Abandon,
}

/// `attempt_count` is the number of attempts made so far, including the one just finished.
pub fn decide(
    outcome_ok: bool,
    attempt_count: u32,
    max_retries: u32,
    has_compensator: bool,
) -> Decision {
    if outcome_ok {
        Decision::Succeed
    } else if attempt_count <= max_retries {
        Decision::Retry
    } else if has_compensator {
        Decision::Compensate
    } else {
        Decision::Abandon
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub key: String,
    pub state: JobState,
    pub attempts: u32,
    pub compensated: bool,
}

#[derive(Debug, Clone)]
pub struct RetryController {
    completion_timeout: Option<Duration>,
    retry_backoff: Option<Duration>,
}

impl RetryController {
    pub fn new(config: &CoordinatorConfig) -> Self {
        Self {
            completion_timeout: config.completion_timeout(),
            retry_backoff: config.retry_backoff(),
        }
    }

    /// Runs the job until it reaches a terminal state. Never fails: every
    /// error ends up in the log and in the returned resolution.
    pub async fn drive(&self, mut job: Job) -> Resolution {
        let mut state = JobState::Pending;
        loop {
            transition(&job, &mut state, JobState::Running);
            let outcome = self.attempt(&mut job).await;
            let decision = decide(
                outcome.is_success(),
                job.attempt_count,
                job.max_retries(),
                job.has_compensator(),
            );
            match decision {
                Decision::Succeed => {
                    transition(&job, &mut state, JobState::Succeeded);
                    return self.resolution(&job, state, false);
                }
                Decision::Retry => {
                    warn!(
                        "Job {} (key {}) failed attempt {}/{}: {}, retrying",
                        job.desc(),
                        job.key(),
                        job.attempt_count,
                        job.max_retries().saturating_add(1),
                        describe_failures(&outcome)
                    );
                    transition(&job, &mut state, JobState::Retrying);
                    if let Some(backoff) = self.retry_backoff {
                        Timer::after(backoff).await;
                    }
                }
                Decision::Compensate => {
                    error!(
                        "Job {} (key {}) failed after {} attempts: {}, running compensator",
                        job.desc(),
                        job.key(),
                        job.attempt_count,
                        describe_failures(&outcome)
                    );
                    transition(&job, &mut state, JobState::Compensating);
                    self.compensate(&mut job, outcome).await;
                    transition(&job, &mut state, JobState::Abandoned);
                    return self.resolution(&job, state, true);
                }
                Decision::Abandon => {
                    error!(
                        "Job {} (key {}) abandoned after {} attempts: {}",
                        job.desc(),
                        job.key(),
                        job.attempt_count,
                        describe_failures(&outcome)
                    );
                    transition(&job, &mut state, JobState::Abandoned);
                    return self.resolution(&job, state, false);
                }
            }
        }
    }

    async fn attempt(&self, job: &mut Job) -> Outcome {
        job.attempt_count = job.attempt_count.saturating_add(1);
        let started = panic::catch_unwind(AssertUnwindSafe(|| job.action.call()));
        let completions = match started {
            Ok(Ok(completions)) => completions,
            Ok(Err(err)) => return Outcome::synthetic_failure(CompletionError::from(err)),
            Err(payload) => return Outcome::synthetic_failure(CompletionError::from_panic(payload)),
        };
        aggregator::aggregate(completions, self.completion_timeout).await
    }

    async fn compensate(&self, job: &mut Job, outcome: Outcome) {
        let Some(compensator) = job.compensator.take() else {
            return;
        };
        let failed = outcome.failed_completions();
        let started = panic::catch_unwind(AssertUnwindSafe(move || compensator.compensate(failed)));
        let completions = match started {
            Ok(Ok(completions)) => completions,
            Ok(Err(err)) => {
                error!(
                    "Error running compensator of job {} (key {}): {err:#}",
                    job.desc(),
                    job.key()
                );
                return;
            }
            Err(payload) => {
                error!(
                    "Compensator of job {} (key {}) {}",
                    job.desc(),
                    job.key(),
                    CompletionError::from_panic(payload)
                );
                return;
            }
        };
        let outcome = aggregator::aggregate(completions, self.completion_timeout).await;
        if !outcome.is_success() {
            error!(
                "Compensation of job {} (key {}) did not complete: {}",
                job.desc(),
                job.key(),
                describe_failures(&outcome)
            );
        }
    }

    fn resolution(&self, job: &Job, state: JobState, compensated: bool) -> Resolution {
        Resolution {
            key: job.key().to_string(),
            state,
            attempts: job.attempt_count,
            compensated,
        }
    }
}

fn transition(job: &Job, state: &mut JobState, next: JobState) {
    debug!("Job {} (key {}): {:?} -> {:?}", job.desc(), job.key(), state, next);
    *state = next;
}

fn describe_failures(outcome: &Outcome) -> String {
    let errors: Vec<String> = outcome.failures.iter().map(|f| f.error.to_string()).collect();
    format!("{} of {} completions failed [{}]", errors.len(), outcome.total, errors.join("; "))
}
