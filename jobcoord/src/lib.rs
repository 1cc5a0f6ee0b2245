// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

pub mod config;
pub mod job_engine;
pub mod load;

pub use config::{CoordinatorConfig, ShutdownPolicy};
pub use job_engine::{
    Compensator, CompletionError, CompletionSender, EnqueueError, Job, JobAction, JobCoordinator,
    MonitorSnapshot, PendingCompletion,
};
