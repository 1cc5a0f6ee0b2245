// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use crate::job_engine::completion::PendingCompletion;

/// The body of a job. Starts the writes and hands back one completion per write.
///
/// May be called again after a failed attempt, so it has to redo the whole
/// unit of work from scratch.
pub trait JobAction: Send + 'static {
    fn call(&mut self) -> anyhow::Result<Vec<PendingCompletion>>;
}

impl<F> JobAction for F
where
    F: FnMut() -> anyhow::Result<Vec<PendingCompletion>> + Send + 'static,
{
    fn call(&mut self) -> anyhow::Result<Vec<PendingCompletion>> {
        self()
    }
}

/// Reverts the partial effects of a job whose retries are used up.
/// Receives the completions of the last attempt that failed.
pub trait Compensator: Send + 'static {
    fn compensate(
        self: Box<Self>,
        failed: Vec<PendingCompletion>,
    ) -> anyhow::Result<Vec<PendingCompletion>>;
}

impl<F> Compensator for F
where
    F: FnOnce(Vec<PendingCompletion>) -> anyhow::Result<Vec<PendingCompletion>> + Send + 'static,
{
    fn compensate(
        self: Box<Self>,
        failed: Vec<PendingCompletion>,
    ) -> anyhow::Result<Vec<PendingCompletion>> {
        (*self)(failed)
    }
}

/// One admitted unit of work.
pub struct Job {
    key: String,
    desc: String,
    pub(crate) action: Box<dyn JobAction>,
    pub(crate) compensator: Option<Box<dyn Compensator>>,
    max_retries: u32,
    pub(crate) attempt_count: u32,
}

impl Job {
    pub fn new(key: impl Into<String>, action: impl JobAction) -> Self {
        let key = key.into();
        Self {
            desc: key.clone(),
            key,
            action: Box::new(action),
            compensator: None,
            max_retries: 0,
            attempt_count: 0,
        }
    }

    pub fn with_compensator(mut self, compensator: impl Compensator) -> Self {
        self.compensator = Some(Box::new(compensator));
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Free-form description, used for logging
    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn has_compensator(&self) -> bool {
        self.compensator.is_some()
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("key", &self.key)
            .field("desc", &self.desc)
            .field("max_retries", &self.max_retries)
            .field("attempt_count", &self.attempt_count)
            .field("compensator", &self.compensator.is_some())
            .finish()
    }
}
