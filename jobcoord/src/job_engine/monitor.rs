// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::job_engine::retry::{JobState, Resolution};

/// Point-in-time view of the coordinator counters. The values are read one
/// after the other and need not be consistent with each other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorSnapshot {
    pub admitted: u64,
    pub succeeded: u64,
    pub abandoned: u64,
    pub retried: u64,
    pub compensated: u64,
    pub discarded: u64,
    pub incomplete: u64,
    pub queued_keys: usize,
}

/// Counters plus the gauge of admitted-but-unresolved jobs, which can be waited on.
#[derive(Default)]
pub struct JobMonitor {
    admitted: AtomicU64,
    succeeded: AtomicU64,
    abandoned: AtomicU64,
    retried: AtomicU64,
    compensated: AtomicU64,
    discarded: AtomicU64,
    incomplete: Mutex<u64>,
    idle: Condvar,
}

impl JobMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the gauge before the job becomes visible to workers.
    pub fn job_admitting(&self) {
        *self.incomplete.lock().unwrap() += 1;
    }

    pub fn job_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Undoes [`Self::job_admitting`] for a job that was rejected after all.
    pub fn job_rejected(&self) {
        self.decrement();
    }

    pub fn job_finished(&self, resolution: &Resolution) {
        match resolution.state {
            JobState::Succeeded => self.succeeded.fetch_add(1, Ordering::Relaxed),
            _ => self.abandoned.fetch_add(1, Ordering::Relaxed),
        };
        self.retried
            .fetch_add(u64::from(resolution.attempts.saturating_sub(1)), Ordering::Relaxed);
        if resolution.compensated {
            self.compensated.fetch_add(1, Ordering::Relaxed);
        }
        self.decrement();
    }

    pub fn job_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        self.abandoned.fetch_add(1, Ordering::Relaxed);
        self.decrement();
    }

    pub fn incomplete(&self) -> u64 {
        *self.incomplete.lock().unwrap()
    }

    /// Blocks until no admitted job is left unresolved. Returns `false` if the
    /// timeout elapsed first.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut incomplete = self.incomplete.lock().unwrap();
        while *incomplete > 0 {
            match deadline {
                None => incomplete = self.idle.wait(incomplete).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    incomplete = self.idle.wait_timeout(incomplete, deadline - now).unwrap().0;
                }
            }
        }
        true
    }

    pub fn snapshot(&self, queued_keys: usize) -> MonitorSnapshot {
        MonitorSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            compensated: self.compensated.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            incomplete: self.incomplete(),
            queued_keys,
        }
    }

    fn decrement(&self) {
        let mut incomplete = self.incomplete.lock().unwrap();
        *incomplete = incomplete.saturating_sub(1);
        if *incomplete == 0 {
            self.idle.notify_all();
        }
    }
}
