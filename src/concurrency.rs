//! Bounded-parallelism fan-out
//!
//! Runs independent sub-tasks with at most `limit` in flight. Tasks finish
//! in any order, but the report always lists outcomes in submission order.
//! A failing task never stops its siblings; whether the fan-out as a whole
//! succeeded is decided by the caller's [`SuccessCriterion`].

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessCriterion {
    #[default]
    AnySucceeds,
    AllSucceed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Fan-out cancelled")]
pub struct FanOutCancelled;

#[derive(Debug)]
pub struct TaskOutcome<T, E> {
    /// Submission index
    pub index: usize,
    pub result: Result<T, E>,
}

/// Outcomes of every task, ordered by submission index
#[derive(Debug)]
pub struct FanOutReport<T, E> {
    pub outcomes: Vec<TaskOutcome<T, E>>,
}

impl<T, E> FanOutReport<T, E> {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_err()).count()
    }

    pub fn success_count(&self) -> usize {
        self.total() - self.failure_count()
    }

    pub fn succeeded(&self, criterion: SuccessCriterion) -> bool {
        match criterion {
            SuccessCriterion::AnySucceeds => self.success_count() > 0,
            SuccessCriterion::AllSucceed => self.failure_count() == 0,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = (usize, &E)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.index, e)))
    }

    /// Successful results with their submission index, in order
    pub fn into_successes(self) -> Vec<(usize, T)> {
        self.outcomes
            .into_iter()
            .filter_map(|o| o.result.ok().map(|v| (o.index, v)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConcurrentTaskRunner {
    limit: usize,
}

impl Default for ConcurrentTaskRunner {
    fn default() -> Self {
        Self { limit: 5 }
    }
}

impl ConcurrentTaskRunner {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run `worker` over every task, stopping early only on cancellation
    pub async fn run_bounded<I, T, E, F, Fut>(
        &self,
        tasks: Vec<I>,
        worker: F,
        cancel: &CancellationToken,
    ) -> Result<FanOutReport<T, E>, FanOutCancelled>
    where
        F: Fn(usize, I) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let pending = stream::iter(tasks.into_iter().enumerate().map(|(index, task)| {
            let fut = worker(index, task);
            async move { (index, fut.await) }
        }))
        .buffer_unordered(self.limit)
        .collect::<Vec<_>>();

        let mut finished = tokio::select! {
            _ = cancel.cancelled() => return Err(FanOutCancelled),
            finished = pending => finished,
        };

        finished.sort_by_key(|(index, _)| *index);
        Ok(FanOutReport {
            outcomes: finished
                .into_iter()
                .map(|(index, result)| TaskOutcome { index, result })
                .collect(),
        })
    }
}

/// Run with `limit` concurrent workers and no cancellation
pub async fn run_bounded<I, T, E, F, Fut>(tasks: Vec<I>, limit: usize, worker: F) -> FanOutReport<T, E>
where
    F: Fn(usize, I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let never = CancellationToken::new();
    match ConcurrentTaskRunner::new(limit)
        .run_bounded(tasks, worker, &never)
        .await
    {
        Ok(report) => report,
        Err(FanOutCancelled) => FanOutReport {
            outcomes: Vec::new(),
        },
    }
}
