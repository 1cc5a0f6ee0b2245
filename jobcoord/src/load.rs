// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Synthetic workload of simulated datastore writes, used to exercise a
//! coordinator from the command line.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::bail;
use async_io::Timer;
use log::{debug, warn};
use serde::Serialize;

use crate::job_engine::{Job, JobCoordinator, MonitorSnapshot, PendingCompletion};

#[derive(Debug, Clone)]
pub struct LoadProfile {
    pub keys: usize,
    pub jobs: usize,
    pub writes_per_job: usize,
    pub max_retries: u32,
    /// Chance (0..=100) that an attempt has a failing write.
    pub failure_percent: u8,
    pub with_compensator: bool,
    pub write_latency: Duration,
}

impl Default for LoadProfile {
    fn default() -> Self {
        Self {
            keys: 10,
            jobs: 100,
            writes_per_job: 2,
            max_retries: 2,
            failure_percent: 10,
            with_compensator: false,
            write_latency: Duration::from_millis(1),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub monitor: MonitorSnapshot,
    pub rejected: usize,
    /// Attempts that started after an attempt of a later job of the same key.
    pub ordering_violations: usize,
    pub elapsed_ms: u128,
}

impl LoadReport {
    pub fn is_consistent(&self) -> bool {
        self.ordering_violations == 0 && self.monitor.incomplete == 0
    }
}

/// Highest job sequence number that started an attempt, per key.
#[derive(Default)]
struct OrderLedger {
    last_started: HashMap<String, usize>,
    violations: usize,
}

impl OrderLedger {
    fn record(&mut self, key: &str, seq: usize) {
        let last = self.last_started.entry(key.to_string()).or_insert(seq);
        if seq < *last {
            warn!("Job {seq} of key {key} started after job {last}");
            self.violations += 1;
        } else {
            *last = seq;
        }
    }
}

/// Deterministic stand-in for a dice roll, so that runs are reproducible.
fn attempt_fails(seq: usize, attempt: u32, failure_percent: u8) -> bool {
    let roll = (seq as u64 * 2_654_435_761 + u64::from(attempt) * 40_503) % 100;
    roll < u64::from(failure_percent)
}

fn simulated_write(key: String, latency: Duration, fail: bool) -> PendingCompletion {
    PendingCompletion::new(async move {
        Timer::after(latency).await;
        if fail {
            bail!("simulated write conflict on {key}");
        }
        Ok(())
    })
}

/// Enqueues the profile's jobs round-robin over its keys and waits until all
/// of them are resolved.
pub fn run(coordinator: &JobCoordinator, profile: &LoadProfile) -> LoadReport {
    let started = Instant::now();
    let ledger = Arc::new(Mutex::new(OrderLedger::default()));
    let mut rejected = 0;

    for seq in 0..profile.jobs {
        let key = format!("entity-{}", seq % profile.keys.max(1));
        let ledger = ledger.clone();
        let action_key = key.clone();
        let writes = profile.writes_per_job.max(1);
        let latency = profile.write_latency;
        let failure_percent = profile.failure_percent;
        let mut attempt = 0;

        let action = move || -> anyhow::Result<Vec<PendingCompletion>> {
            attempt += 1;
            ledger.lock().unwrap().record(&action_key, seq);
            let fail = attempt_fails(seq, attempt, failure_percent);
            Ok((0..writes)
                .map(|w| simulated_write(action_key.clone(), latency, fail && w == 0))
                .collect())
        };

        let mut job = Job::new(key.clone(), action)
            .with_desc(format!("load-{seq}"))
            .with_max_retries(profile.max_retries);
        if profile.with_compensator {
            let revert_key = key.clone();
            job = job.with_compensator(
                move |failed: Vec<PendingCompletion>| -> anyhow::Result<Vec<PendingCompletion>> {
                    debug!("Reverting {} failed writes on {revert_key}", failed.len());
                    Ok(vec![simulated_write(revert_key, latency, false)])
                },
            );
        }

        if let Err(e) = coordinator.enqueue(job) {
            warn!("Job {seq} for {key} not admitted: {e}");
            rejected += 1;
        }
    }

    coordinator.wait_until_idle(None);

    let ordering_violations = ledger.lock().unwrap().violations;
    LoadReport {
        monitor: coordinator.monitor(),
        rejected,
        ordering_violations,
        elapsed_ms: started.elapsed().as_millis(),
    }
}
