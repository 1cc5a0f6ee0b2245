// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! # Design: Keyed Job Coordinator
//!
//! ## Overview
//! Serializes datastore-mutating jobs per entity key while jobs of different
//! keys run in parallel.
//!
//! - A job is an action that starts writes and returns one [`PendingCompletion`] per write.
//! - Jobs of one key wait in a FIFO; at most one of them is active at a time.
//! - A fixed pool of worker threads runs active jobs, each worker one job at a time.
//! - A failed attempt is retried up to `max_retries` times, then the optional
//!   compensator runs once and the job is abandoned.
//! - Releasing a key hands its next job straight back to the pool.
//!
//!
//! ```text
//!         +--------------------------------------+
//!         |     JobCoordinator::enqueue_job      |
//!         +------------------+-------------------+
//!                            | push + wake(key)
//!                            v
//!         +--------------------------------------+
//!         | KeyQueue  "A": [j1 j2]  "B": [j3]    |<----+
//!         +------------------+-------------------+     |
//!                            | try_activate            | release(key)
//!                            v                         |
//!         +---------+  +---------+  +---------+        |
//!         | worker0 |  | worker1 |  | worker2 |  ...   |
//!         +----+----+  +----+----+  +----+----+        |
//!              |            |            |             |
//!              v            v            v             |
//!         RetryController: action -> aggregate -> retry | compensate
//!              +---------------------------------------+
//! ```

pub mod aggregator;
pub mod completion;
pub mod coordinator;
pub(crate) mod dispatcher;
pub mod job;
pub mod key_queue;
pub mod monitor;
pub mod retry;

pub use aggregator::{aggregate, Failure, Outcome};
pub use completion::{CompletionError, CompletionResult, CompletionSender, PendingCompletion};
pub use coordinator::{CoordinatorError, EnqueueError, JobCoordinator};
pub use job::{Compensator, Job, JobAction};
pub use monitor::MonitorSnapshot;
pub use retry::{decide, Decision, JobState, Resolution, RetryController};
