// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};

/// Why a completion did not succeed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompletionError {
    #[error("{0:#}")]
    Failed(Arc<anyhow::Error>),
    #[error("completion did not resolve within {0:?}")]
    TimedOut(Duration),
    #[error("completion was dropped before it resolved")]
    Dropped,
    #[error("panicked: {0}")]
    Panicked(String),
}

impl From<anyhow::Error> for CompletionError {
    fn from(err: anyhow::Error) -> Self {
        CompletionError::Failed(Arc::new(err))
    }
}

impl CompletionError {
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        CompletionError::Panicked(msg)
    }
}

pub type CompletionResult = Result<(), CompletionError>;

/// Handle to one outstanding asynchronous write.
///
/// Cloning is cheap and every clone observes the same resolution, so the job
/// that produced it, the aggregator and a compensator can all hold one.
#[derive(Clone)]
pub struct PendingCompletion {
    inner: Shared<BoxFuture<'static, CompletionResult>>,
}

impl PendingCompletion {
    /// Wraps any future that reports the result of a write.
    pub fn new<F>(fut: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_result_future(fut.map(|res| res.map_err(CompletionError::from)))
    }

    fn from_result_future<F>(fut: F) -> Self
    where
        F: Future<Output = CompletionResult> + Send + 'static,
    {
        Self {
            inner: fut.boxed().shared(),
        }
    }

    pub fn succeeded() -> Self {
        Self::from_result_future(future::ready(Ok(())))
    }

    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::from_error(CompletionError::from(err.into()))
    }

    pub(crate) fn from_error(err: CompletionError) -> Self {
        Self::from_result_future(future::ready(Err(err)))
    }

    /// A completion resolved by hand through the returned sender.
    pub fn channel() -> (CompletionSender, PendingCompletion) {
        let (tx, rx) = oneshot::channel::<CompletionResult>();
        let completion = Self::from_result_future(rx.map(|received| match received {
            Ok(res) => res,
            Err(oneshot::Canceled) => Err(CompletionError::Dropped),
        }));
        (CompletionSender { tx }, completion)
    }

    /// The result, if the completion has already been resolved by a waiter.
    pub fn peek(&self) -> Option<CompletionResult> {
        self.inner.peek().cloned()
    }

    pub async fn wait(&self) -> CompletionResult {
        self.inner.clone().await
    }
}

impl fmt::Debug for PendingCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.peek() {
            None => "pending".to_string(),
            Some(Ok(())) => "succeeded".to_string(),
            Some(Err(e)) => format!("failed: {e}"),
        };
        f.debug_struct("PendingCompletion")
            .field("state", &state)
            .finish()
    }
}

/// Resolves the [`PendingCompletion`] it was created with.
#[derive(Debug)]
pub struct CompletionSender {
    tx: oneshot::Sender<CompletionResult>,
}

impl CompletionSender {
    pub fn succeed(self) {
        // the receiving side may already have given up (timeout), nothing to do then
        let _ = self.tx.send(Ok(()));
    }

    pub fn fail(self, err: impl Into<anyhow::Error>) {
        let _ = self.tx.send(Err(CompletionError::from(err.into())));
    }
}
