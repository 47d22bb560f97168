//! Dispatch primitives shared by the trade and transfer engines.
//!
//! Every function takes a list of planned operations and a `run` closure that
//! turns one of them into an [`OperationResult`]. `run` is expected to capture
//! its own errors; the primitives only add scheduling. Results come back
//! ordered by `operation_index`.

use futures_util::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::domain::{OperationResult, OperationSlot};

/// A planned operation that knows where its result belongs
pub trait Dispatch: Send + 'static {
    fn slot(&self) -> &OperationSlot;
}

/// Parallel ceiling: the request's value, else min(default, signers), never 0
pub fn effective_concurrency(requested: Option<usize>, default: usize, signer_count: usize) -> usize {
    requested
        .unwrap_or_else(|| default.min(signer_count))
        .max(1)
}

/// One operation at a time, in plan order
///
/// With `stop_on_failure` the loop is abandoned after the first failed
/// result; abandoned operations produce no result.
pub async fn run_sequential<T, F, Fut>(
    tasks: Vec<T>,
    delay: Duration,
    stop_on_failure: bool,
    run: F,
) -> Vec<OperationResult>
where
    T: Dispatch,
    F: Fn(T) -> Fut,
    Fut: Future<Output = OperationResult>,
{
    let total = tasks.len();
    let mut results: Vec<OperationResult> = Vec::with_capacity(total);

    for (position, task) in tasks.into_iter().enumerate() {
        if stop_on_failure && results.iter().any(OperationResult::is_failed) {
            info!(
                dispatched = position,
                abandoned = total - position,
                "stopping sequential batch after failure"
            );
            break;
        }

        if position > 0 && !delay.is_zero() {
            sleep(delay).await;
        }

        results.push(run(task).await);
    }

    results
}

/// Every operation as its own task, at most `max_concurrency` running at once
///
/// A permit is taken before a task is spawned and dropped when it finishes,
/// so the bound holds even if an operation panics.
pub async fn run_bounded<T, F, Fut>(tasks: Vec<T>, max_concurrency: usize, run: F) -> Vec<OperationResult>
where
    T: Dispatch,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = OperationResult> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let run = Arc::new(run);
    let mut handles = Vec::with_capacity(tasks.len());

    for task in tasks {
        let slot = task.slot().clone();
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                handles.push((slot, None));
                continue;
            }
        };

        let run = run.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            run(task).await
        });
        handles.push((slot, Some(handle)));
    }

    settle(handles).await
}

/// Task `i` starts after `i × delay`; no other concurrency ceiling
pub async fn run_staggered<T, F, Fut>(tasks: Vec<T>, delay: Duration, run: F) -> Vec<OperationResult>
where
    T: Dispatch,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = OperationResult> + Send + 'static,
{
    let run = Arc::new(run);

    let handles = tasks
        .into_iter()
        .enumerate()
        .map(|(position, task)| {
            let slot = task.slot().clone();
            let offset = delay.saturating_mul(position as u32);
            let run = run.clone();
            let handle = tokio::spawn(async move {
                if !offset.is_zero() {
                    sleep(offset).await;
                }
                run(task).await
            });
            (slot, Some(handle))
        })
        .collect();

    settle(handles).await
}

/// Each partition runs sequentially in its own task; partitions overlap
///
/// Used for round-robin, where a partition is one signer's sub-list and must
/// keep its nonce order. `stop_on_failure` is shared across partitions:
/// once any operation fails, no partition starts another one.
pub async fn run_partitioned<T, F, Fut>(
    partitions: Vec<Vec<T>>,
    delay: Duration,
    stop_on_failure: bool,
    run: F,
) -> Vec<OperationResult>
where
    T: Dispatch,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = OperationResult> + Send + 'static,
{
    let run = Arc::new(run);
    let halted = Arc::new(AtomicBool::new(false));

    let handles: Vec<(Vec<OperationSlot>, JoinHandle<Vec<OperationResult>>)> = partitions
        .into_iter()
        .filter(|partition| !partition.is_empty())
        .map(|partition| {
            let slots: Vec<OperationSlot> = partition.iter().map(|t| t.slot().clone()).collect();
            let run = run.clone();
            let halted = halted.clone();

            let handle = tokio::spawn(async move {
                let mut results = Vec::with_capacity(partition.len());
                for (position, task) in partition.into_iter().enumerate() {
                    if stop_on_failure && halted.load(Ordering::SeqCst) {
                        break;
                    }
                    if position > 0 && !delay.is_zero() {
                        sleep(delay).await;
                    }

                    let result = run(task).await;
                    if result.is_failed() {
                        halted.store(true, Ordering::SeqCst);
                    }
                    results.push(result);
                }
                results
            });
            (slots, handle)
        })
        .collect();

    let mut results = Vec::new();
    for (slots, handle) in handles {
        match handle.await {
            Ok(partition_results) => results.extend(partition_results),
            Err(e) => {
                warn!(error = %e, operations = slots.len(), "partition task aborted");
                results.extend(
                    slots
                        .iter()
                        .map(|slot| OperationResult::failed(slot, format!("task aborted: {}", e))),
                );
            }
        }
    }

    results.sort_by_key(|r| r.operation_index);
    results
}

/// Await every spawned operation; a task that could not finish becomes a failed result
async fn settle(
    handles: Vec<(OperationSlot, Option<JoinHandle<OperationResult>>)>,
) -> Vec<OperationResult> {
    let (slots, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();

    let outcomes = join_all(handles.into_iter().map(|handle| async move {
        match handle {
            Some(handle) => handle.await.map_err(|e| e.to_string()),
            None => Err("concurrency limiter closed".to_string()),
        }
    }))
    .await;

    let mut results: Vec<OperationResult> = slots
        .iter()
        .zip(outcomes)
        .map(|(slot, outcome)| match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!(operation = slot.operation_index, error = %e, "operation task aborted");
                OperationResult::failed(slot, format!("task aborted: {}", e))
            }
        })
        .collect();

    results.sort_by_key(|r| r.operation_index);
    results
}
