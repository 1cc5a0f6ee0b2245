// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use async_channel::{Receiver, Sender};
use futures::FutureExt;
use log::{debug, error, info, warn};

use crate::job_engine::completion::CompletionError;
use crate::job_engine::job::Job;
use crate::job_engine::key_queue::KeyQueue;
use crate::job_engine::monitor::JobMonitor;
use crate::job_engine::retry::{JobState, Resolution, RetryController};

/// Messages to the worker pool.
pub(crate) enum Signal {
    /// A job was pushed for this key; run its head job if the key is idle.
    Wake(String),
    /// The next job of a key that was just released. Already active.
    Resume(Job),
}

/// State shared between the facade and all workers.
pub(crate) struct Shared {
    pub(crate) queues: KeyQueue,
    pub(crate) monitor: JobMonitor,
    pub(crate) controller: RetryController,
}

/// Fixed pool of worker threads. Each thread is one worker slot and runs at
/// most one job (including its retries and compensation) at a time.
pub(crate) struct Dispatcher {
    tx: Sender<Signal>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub(crate) fn start(shared: Arc<Shared>, workers: usize) -> std::io::Result<Self> {
        let (tx, rx) = async_channel::unbounded();
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let shared = shared.clone();
            let rx = rx.clone();
            let tx_in_thread = tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("jobcoord-worker-{worker}"))
                .spawn(move || {
                    futures::executor::block_on(worker_loop(worker, shared, rx, tx_in_thread))
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // let the workers spawned so far run out
                    tx.close();
                    return Err(e);
                }
            }
        }
        info!("Started {workers} job workers");
        Ok(Self {
            tx,
            workers: Mutex::new(handles),
        })
    }

    /// Tells the pool that `key` has a waiting job. Never blocks.
    pub(crate) fn wake(&self, key: String) -> bool {
        self.tx.try_send(Signal::Wake(key)).is_ok()
    }

    /// Workers exit once the signals already sent are handled.
    pub(crate) fn close(&self) {
        self.tx.close();
    }

    pub(crate) fn join(&self) {
        self.close();
        let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("A job worker terminated with a panic");
            }
        }
        debug!("All job workers stopped");
    }
}

async fn worker_loop(
    worker: usize,
    shared: Arc<Shared>,
    rx: Receiver<Signal>,
    tx: Sender<Signal>,
) {
    debug!("Starting job worker {worker}");
    while let Ok(signal) = rx.recv().await {
        let job = match signal {
            Signal::Wake(key) => match shared.queues.try_activate(&key) {
                Some(job) => job,
                // another job of the key is running; its release picks up the queued ones
                None => continue,
            },
            Signal::Resume(job) => job,
        };

        let key = job.key().to_string();
        let desc = job.desc().to_string();
        debug!("Worker {worker} executing job {desc} (key {key})");
        let driven = AssertUnwindSafe(shared.controller.drive(job)).catch_unwind();
        let resolution = match driven.await {
            Ok(resolution) => resolution,
            Err(payload) => {
                // still released below, so the rest of the key's queue runs
                error!(
                    "Worker {worker} abandoned job {desc} (key {key}): {}",
                    CompletionError::from_panic(payload)
                );
                Resolution {
                    key: key.clone(),
                    state: JobState::Abandoned,
                    attempts: 0,
                    compensated: false,
                }
            }
        };

        if let Some(next) = shared.queues.release(&key) {
            // back of the channel, so that other keys get their turn
            if let Err(err) = tx.send(Signal::Resume(next)).await {
                if let Signal::Resume(job) = err.into_inner() {
                    warn!(
                        "Dropping job {} (key {}): dispatcher already closed",
                        job.desc(),
                        job.key()
                    );
                    shared.monitor.job_discarded();
                }
            }
        }
        shared.monitor.job_finished(&resolution);
    }
    debug!("Job worker {worker} ended, channel closed");
}
