//! Generic priority executor
//!
//! Operations are queued by priority (high > normal > low, FIFO within a
//! tier) and drained in chunks of `batch_size`. Inside a chunk at most
//! `max_concurrency` handlers run at once. Failed attempts are re-queued
//! until `retry_attempts` retries are used up, unless the error says the
//! outcome is unknown.
//!
//! Each handler runs in its own task and the configured timeout only bounds
//! how long the executor waits for it. A timed-out operation is failed for
//! good while its handler runs to completion in the background, so a chain
//! transaction that is already out is confirmed and never sent twice.
//!
//! Dispatch is static: the executor is generic over one [`OperationHandler`]
//! whose associated operation type is usually a closed enum.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::queue::PriorityQueue;
use crate::config::ExecutorConfig;
use crate::error::{BatchError, Result};

/// Scheduling hint; higher values are dispatched first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuedStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueuedStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueuedStatus::Completed | QueuedStatus::Failed)
    }
}

/// Payload accepted by an executor
pub trait BatchOperation: Clone + Send + Sync + fmt::Debug + 'static {
    /// Short tag used in logs and status reports
    fn kind(&self) -> &'static str;
}

/// Handles every operation of one payload type
#[async_trait]
pub trait OperationHandler: Send + Sync + 'static {
    type Operation: BatchOperation;
    type Output: Clone + Send + Sync + fmt::Debug + Serialize + 'static;

    async fn handle(&self, operation: Self::Operation) -> Result<Self::Output>;
}

/// Snapshot of one queued operation
#[derive(Debug, Clone, Serialize)]
#[serde(bound(serialize = "T: Serialize"))]
pub struct QueuedOperation<O, T> {
    pub id: String,
    pub kind: &'static str,
    #[serde(skip_serializing)]
    pub payload: O,
    pub priority: Priority,
    pub status: QueuedStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<T>,
}

/// Terminal snapshots of the awaited operations, in the order asked for
#[derive(Debug, Clone, Serialize)]
#[serde(bound(serialize = "T: Serialize"))]
pub struct ExecutorReport<O, T> {
    pub completed: usize,
    pub failed: usize,
    pub operations: Vec<QueuedOperation<O, T>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub high_count: usize,
    pub normal_count: usize,
    pub low_count: usize,
    pub enqueued_total: u64,
    pub dequeued_total: u64,
    pub running: bool,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Executor[{}, queued={}, P={}/R={}/C={}/F={}, H={}/N={}/L={}, enq={}, deq={}]",
            if self.running { "running" } else { "stopped" },
            self.queued,
            self.pending,
            self.processing,
            self.completed,
            self.failed,
            self.high_count,
            self.normal_count,
            self.low_count,
            self.enqueued_total,
            self.dequeued_total
        )
    }
}

type Record<H> = QueuedOperation<<H as OperationHandler>::Operation, <H as OperationHandler>::Output>;

struct Inner<H: OperationHandler> {
    handler: Arc<H>,
    config: ExecutorConfig,
    queue: Mutex<PriorityQueue<Priority, String>>,
    operations: DashMap<String, Record<H>>,
    wakeup: Notify,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Priority queue plus bounded-concurrency processor
pub struct BatchExecutor<H: OperationHandler> {
    inner: Arc<Inner<H>>,
}

impl<H: OperationHandler> Clone for BatchExecutor<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H: OperationHandler> BatchExecutor<H> {
    pub fn new(handler: Arc<H>, config: ExecutorConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                handler,
                config,
                queue: Mutex::new(PriorityQueue::new()),
                operations: DashMap::new(),
                wakeup: Notify::new(),
                shutdown_tx,
                worker: Mutex::new(None),
            }),
        }
    }

    /// Spawn the processing loop; a second call is a no-op
    pub fn start(&self) {
        let mut worker = lock(&self.inner.worker);
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        self.inner.shutdown_tx.send_replace(false);
        let inner = self.inner.clone();
        *worker = Some(tokio::spawn(async move { inner.run().await }));
        info!(
            batch_size = self.inner.config.batch_size,
            max_concurrency = self.inner.config.max_concurrency,
            "batch executor started"
        );
    }

    /// Stop dispatching and wait for the in-flight chunk to settle
    ///
    /// Pending operations stay queued and are picked up by the next `start`.
    pub async fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        self.inner.wakeup.notify_one();

        let handle = lock(&self.inner.worker).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "executor loop terminated abnormally");
            }
        }
        info!("batch executor stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.worker)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn add_operation(&self, payload: H::Operation, priority: Priority) -> String {
        let id = Uuid::new_v4().to_string();
        let record = QueuedOperation {
            id: id.clone(),
            kind: payload.kind(),
            payload,
            priority,
            status: QueuedStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
        };
        debug!(id = %id, kind = record.kind, ?priority, "operation queued");

        self.inner.operations.insert(id.clone(), record);
        lock(&self.inner.queue).push(priority, id.clone());
        self.inner.wakeup.notify_one();
        id
    }

    pub fn add_batch_operations(&self, operations: Vec<(H::Operation, Priority)>) -> Vec<String> {
        operations
            .into_iter()
            .map(|(payload, priority)| self.add_operation(payload, priority))
            .collect()
    }

    /// Cancel an operation that has not been dispatched yet
    ///
    /// This includes operations of the current chunk still waiting for a
    /// worker slot. A cancelled operation ends as `failed` with error
    /// "cancelled".
    pub fn cancel_operation(&self, id: &str) -> bool {
        // Holding the queue lock keeps the dispatcher from popping it meanwhile
        let mut queue = lock(&self.inner.queue);
        let Some(mut record) = self.inner.operations.get_mut(id) else {
            return false;
        };
        if record.status != QueuedStatus::Pending {
            return false;
        }

        queue.remove_where(|queued| queued == id);
        record.status = QueuedStatus::Failed;
        record.error = Some("cancelled".to_string());
        record.completed_at = Some(Utc::now());
        drop(record);
        drop(queue);

        info!(id = %id, "operation cancelled");
        true
    }

    pub fn get_operation(&self, id: &str) -> Option<Record<H>> {
        self.inner.operations.get(id).map(|record| record.clone())
    }

    /// Poll until every id is terminal
    ///
    /// Without an explicit timeout the wait is bounded by
    /// `timeout × ids.len()`.
    pub async fn wait_for_completion(
        &self,
        ids: &[String],
        wait: Option<Duration>,
    ) -> Result<ExecutorReport<H::Operation, H::Output>> {
        for id in ids {
            if !self.inner.operations.contains_key(id) {
                return Err(BatchError::NotFound(format!("operation {}", id)));
            }
        }

        let limit = wait.unwrap_or_else(|| {
            self.inner
                .config
                .timeout()
                .saturating_mul(ids.len().max(1) as u32)
        });
        let deadline = Instant::now() + limit;

        loop {
            let snapshots: Vec<Record<H>> = ids.iter().filter_map(|id| self.get_operation(id)).collect();
            let pending = snapshots.iter().filter(|op| !op.status.is_terminal()).count();

            if pending == 0 {
                let completed = snapshots
                    .iter()
                    .filter(|op| op.status == QueuedStatus::Completed)
                    .count();
                return Ok(ExecutorReport {
                    completed,
                    failed: snapshots.len() - completed,
                    operations: snapshots,
                });
            }

            if Instant::now() >= deadline {
                warn!(pending, total = ids.len(), "wait_for_completion timed out");
                return Err(BatchError::WaitTimeout {
                    pending,
                    total: ids.len(),
                });
            }

            sleep(self.inner.config.poll_interval()).await;
        }
    }

    pub fn queue_status(&self) -> QueueStatus {
        let mut status = {
            let queue = lock(&self.inner.queue);
            QueueStatus {
                queued: queue.len(),
                high_count: queue.count_where(|p| *p == Priority::High),
                normal_count: queue.count_where(|p| *p == Priority::Normal),
                low_count: queue.count_where(|p| *p == Priority::Low),
                enqueued_total: queue.enqueued_total(),
                dequeued_total: queue.dequeued_total(),
                ..QueueStatus::default()
            }
        };

        for record in self.inner.operations.iter() {
            match record.status {
                QueuedStatus::Pending => status.pending += 1,
                QueuedStatus::Processing => status.processing += 1,
                QueuedStatus::Completed => status.completed += 1,
                QueuedStatus::Failed => status.failed += 1,
            }
        }
        status.running = self.is_running();
        status
    }
}

impl<H: OperationHandler> Inner<H> {
    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let chunk = lock(&self.queue).pop_batch(self.config.batch_size.max(1));
            if chunk.is_empty() {
                tokio::select! {
                    _ = self.wakeup.notified() => continue,
                    _ = shutdown_rx.changed() => continue,
                }
            }

            debug!(size = chunk.len(), "processing chunk");
            self.clone().process_chunk(chunk).await;

            let delay = self.config.delay_between_batches();
            if !delay.is_zero() {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }
    }

    async fn process_chunk(self: Arc<Self>, chunk: Vec<String>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut handles = Vec::with_capacity(chunk.len());

        for id in chunk {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let inner = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                inner.attempt(id).await;
            }));
        }

        for outcome in join_all(handles).await {
            if let Err(e) = outcome {
                error!(error = %e, "operation task aborted");
            }
        }
    }

    async fn attempt(&self, id: String) {
        let payload = {
            let Some(mut record) = self.operations.get_mut(&id) else {
                return;
            };
            // Cancelled while waiting for a slot
            if record.status != QueuedStatus::Pending {
                debug!(id = %id, status = ?record.status, "skipping operation");
                return;
            }
            record.status = QueuedStatus::Processing;
            record.started_at = Some(Utc::now());
            record.payload.clone()
        };

        let started = Instant::now();
        let handler = self.handler.clone();
        let mut task = tokio::spawn(async move { handler.handle(payload).await });

        let waited = timeout(self.config.timeout(), &mut task).await;
        match waited {
            Ok(Ok(Ok(output))) => {
                if let Some(mut record) = self.operations.get_mut(&id) {
                    record.status = QueuedStatus::Completed;
                    record.completed_at = Some(Utc::now());
                    record.error = None;
                    record.result = Some(output);
                }
                debug!(id = %id, elapsed_ms = started.elapsed().as_millis() as u64, "operation completed");
            }
            Ok(Ok(Err(e))) => self.fail_or_retry(&id, e),
            Ok(Err(e)) => {
                error!(id = %id, error = %e, "operation task aborted");
                self.fail(&id, format!("operation task aborted: {}", e));
            }
            Err(_) => {
                let err = BatchError::OperationTimeout {
                    id: id.clone(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
                self.fail(&id, err.to_string());
                tokio::spawn(async move {
                    match task.await {
                        Ok(Ok(_)) => warn!(id = %id, "operation finished after its timeout"),
                        Ok(Err(e)) => warn!(id = %id, error = %e, "operation failed after its timeout"),
                        Err(e) => error!(id = %id, error = %e, "operation task aborted after its timeout"),
                    }
                });
            }
        }
    }

    fn fail_or_retry(&self, id: &str, error: BatchError) {
        if !error.is_retryable() {
            self.fail(id, error.to_string());
            return;
        }

        let requeue = match self.operations.get_mut(id) {
            Some(mut record) => {
                record.retry_count += 1;
                record.error = Some(error.to_string());

                if record.retry_count <= self.config.retry_attempts {
                    record.status = QueuedStatus::Pending;
                    warn!(
                        id = %id,
                        attempt = record.retry_count,
                        max_retries = self.config.retry_attempts,
                        error = %error,
                        "operation failed, re-queueing"
                    );
                    Some(record.priority)
                } else {
                    record.status = QueuedStatus::Failed;
                    record.completed_at = Some(Utc::now());
                    error!(id = %id, retries = record.retry_count - 1, error = %error, "operation failed permanently");
                    None
                }
            }
            None => None,
        };

        if let Some(priority) = requeue {
            lock(&self.queue).push(priority, id.to_string());
            self.wakeup.notify_one();
        }
    }

    /// Fail without a retry
    fn fail(&self, id: &str, error: String) {
        if let Some(mut record) = self.operations.get_mut(id) {
            record.retry_count += 1;
            record.status = QueuedStatus::Failed;
            record.completed_at = Some(Utc::now());
            error!(id = %id, error = %error, "operation failed, not retrying");
            record.error = Some(error);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
