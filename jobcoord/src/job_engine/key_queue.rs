// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use log::debug;

use crate::job_engine::job::Job;

#[derive(Default)]
struct KeyEntry {
    jobs: VecDeque<Job>,
    /// A job of this key has been handed to a worker and not released yet.
    active: bool,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, KeyEntry>,
    closed: bool,
}

/// Per-key FIFO of waiting jobs plus the "a job of this key is running" mark.
///
/// A single lock guards the whole map. Every operation holds it only for a
/// few map accesses, never while a job runs.
#[derive(Default)]
pub struct KeyQueue {
    inner: Mutex<Inner>,
}

impl KeyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the job to its key. Hands the job back if the queue is closed.
    pub fn push(&self, job: Job) -> Result<(), Job> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(job);
        }
        inner
            .entries
            .entry(job.key().to_string())
            .or_default()
            .jobs
            .push_back(job);
        Ok(())
    }

    /// Takes the head job of `key` and marks the key active, unless a job of
    /// the key is already active or nothing is queued.
    pub fn try_activate(&self, key: &str) -> Option<Job> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.get_mut(key)?;
        if entry.active {
            return None;
        }
        let job = entry.jobs.pop_front()?;
        entry.active = true;
        Some(job)
    }

    /// Ends the active job of `key`. Returns the next job of the key, which
    /// is active from now on, or clears the mark and drops the empty entry.
    pub fn release(&self, key: &str) -> Option<Job> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.get_mut(key)?;
        debug_assert!(entry.active, "release of inactive key {key}");
        match entry.jobs.pop_front() {
            Some(next) => Some(next),
            None => {
                inner.entries.remove(key);
                None
            }
        }
    }

    /// Rejects all further pushes.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Removes every job that has not been activated yet.
    pub fn discard_waiting(&self) -> Vec<Job> {
        let mut inner = self.inner.lock().unwrap();
        let mut discarded = Vec::new();
        inner.entries.retain(|key, entry| {
            if !entry.jobs.is_empty() {
                debug!("Discarding {} waiting jobs of key {}", entry.jobs.len(), key);
            }
            discarded.extend(entry.jobs.drain(..));
            entry.active
        });
        discarded
    }

    #[cfg(test)]
    pub(crate) fn waiting_len(&self, key: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(key).map_or(0, |entry| entry.jobs.len())
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self, key: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(key).is_some_and(|entry| entry.active)
    }

    /// Keys that currently have a running or waiting job.
    pub fn key_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}
