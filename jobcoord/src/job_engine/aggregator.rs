// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_io::Timer;
use futures::future::{self, Either, FutureExt};

use crate::job_engine::completion::{CompletionError, CompletionResult, PendingCompletion};

/// A completion of an attempt that did not succeed.
#[derive(Debug, Clone)]
pub struct Failure {
    pub completion: PendingCompletion,
    pub error: CompletionError,
}

/// Combined result of all completions of one attempt.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    pub total: usize,
    pub failures: Vec<Failure>,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Outcome of an attempt that never produced completions because the
    /// action itself errored or panicked.
    pub fn synthetic_failure(error: CompletionError) -> Self {
        Self {
            total: 1,
            failures: vec![Failure {
                completion: PendingCompletion::from_error(error.clone()),
                error,
            }],
        }
    }

    pub fn failed_completions(&self) -> Vec<PendingCompletion> {
        self.failures.iter().map(|f| f.completion.clone()).collect()
    }
}

/// Waits for every completion and reports which ones failed.
///
/// Does not stop at the first failure, so a compensator gets to see the full
/// set. An empty list is an immediate success.
pub async fn aggregate(completions: Vec<PendingCompletion>, timeout: Option<Duration>) -> Outcome {
    let total = completions.len();
    let results = future::join_all(
        completions
            .into_iter()
            .map(|completion| async move {
                let res = resolve_within(&completion, timeout).await;
                (completion, res)
            }),
    )
    .await;

    let failures = results
        .into_iter()
        .filter_map(|(completion, res)| match res {
            Ok(()) => None,
            Err(error) => Some(Failure { completion, error }),
        })
        .collect();

    Outcome { total, failures }
}

async fn resolve_within(
    completion: &PendingCompletion,
    timeout: Option<Duration>,
) -> CompletionResult {
    let wait = AssertUnwindSafe(completion.wait())
        .catch_unwind()
        .map(|res| res.unwrap_or_else(|payload| Err(CompletionError::from_panic(payload))));

    match timeout {
        None => wait.await,
        Some(limit) => match future::select(Box::pin(wait), Timer::after(limit)).await {
            Either::Left((res, _)) => res,
            Either::Right(_) => Err(CompletionError::TimedOut(limit)),
        },
    }
}
