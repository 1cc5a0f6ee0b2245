// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Helpers shared by the scenario tests of the job coordinator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use jobcoord::{CompletionSender, PendingCompletion};

pub type Completions = anyhow::Result<Vec<PendingCompletion>>;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Ordered log of events written from inside jobs.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == event).count()
    }

    /// Events that start with `prefix`, in recording order.
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[derive(Default)]
struct TrackerState {
    running: HashMap<String, usize>,
    total_running: usize,
    max_total_running: usize,
    overlaps: usize,
}

/// Detects jobs of the same key running at the same time.
#[derive(Clone, Default)]
pub struct ExclusionTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl ExclusionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self, key: &str) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let running = state.running.entry(key.to_string()).or_insert(0);
        *running += 1;
        if *running > 1 {
            state.overlaps += 1;
        }
        state.total_running += 1;
        state.max_total_running = state.max_total_running.max(state.total_running);
    }

    pub fn exit(&self, key: &str) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        if let Some(running) = state.running.get_mut(key) {
            *running -= 1;
        }
        state.total_running -= 1;
    }

    /// Runs `work` between [`Self::enter`] and [`Self::exit`].
    pub fn around<T>(&self, key: &str, work: impl FnOnce() -> T) -> T {
        self.enter(key);
        let result = work();
        self.exit(key);
        result
    }

    pub fn overlaps(&self) -> usize {
        self.state.lock().unwrap().overlaps
    }

    /// Highest number of jobs seen running at once, over all keys.
    pub fn max_parallel(&self) -> usize {
        self.state.lock().unwrap().max_total_running
    }
}

/// Hands out completions from inside a job and resolves them later from the test.
#[derive(Clone, Default)]
pub struct ManualCompletions {
    senders: Arc<Mutex<Vec<CompletionSender>>>,
}

impl ManualCompletions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> PendingCompletion {
        let (sender, completion) = PendingCompletion::channel();
        self.senders.lock().unwrap().push(sender);
        completion
    }

    pub fn issued(&self) -> usize {
        self.senders.lock().unwrap().len()
    }

    pub fn succeed_all(&self) {
        for sender in self.senders.lock().unwrap().drain(..) {
            sender.succeed();
        }
    }

    pub fn fail_all(&self, msg: &str) {
        for sender in self.senders.lock().unwrap().drain(..) {
            sender.fail(anyhow::anyhow!("{msg}"));
        }
    }
}
