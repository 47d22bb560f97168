//! Multi-wallet trade batches
//!
//! `submit_batch_trade` validates a request and queues it; a background
//! worker runs up to `max_concurrent_batches` batches at once, highest
//! priority first. Each batch fans its trades out over every enabled signer
//! and schedules the resulting operations with the requested strategy.

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::join_all;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::context::ChainContext;
use super::queue::PriorityQueue;
use super::strategy::{effective_concurrency, run_bounded, run_sequential, run_staggered, Dispatch};
use crate::config::{AppConfig, TradeEngineConfig};
use crate::domain::{
    parse_signers, BatchKind, BatchMeta, BatchResult, ExecutionStrategy, FailureStrategy,
    OperationResult, OperationSlot, RequestState, Signer, TradeBatchRequest, ValidatedTrade,
};
use crate::error::{BatchError, Result, ValidationError};

/// Base queue score before the dry-run bonus and size penalty
const BASE_PRIORITY: i64 = 100;

/// A request that passed validation
#[derive(Debug, Clone)]
struct ValidatedTradeBatch {
    trades: Vec<ValidatedTrade>,
    signers: Vec<Signer>,
    execution_strategy: ExecutionStrategy,
    failure_strategy: FailureStrategy,
    max_concurrency: Option<usize>,
    delay: Duration,
    dry_run: bool,
}

impl ValidatedTradeBatch {
    fn enabled_signers(&self) -> impl Iterator<Item = &Signer> {
        self.signers.iter().filter(|s| s.enabled)
    }

    fn operation_count(&self) -> usize {
        self.trades.len() * self.enabled_signers().count()
    }
}

struct QueuedTrade {
    request_id: String,
    batch: ValidatedTradeBatch,
}

/// One (signer, trade) pair of the cross-product
struct TradeTask {
    slot: OperationSlot,
    signer: Signer,
    trade: ValidatedTrade,
}

impl Dispatch for TradeTask {
    fn slot(&self) -> &OperationSlot {
        &self.slot
    }
}

struct Inner {
    context: ChainContext,
    config: TradeEngineConfig,
    max_batch_size: usize,
    chain_id: u64,
    queue: Mutex<PriorityQueue<i64, QueuedTrade>>,
    active: DashMap<String, RequestState>,
    results: DashMap<String, BatchResult>,
    wakeup: Notify,
    finished: Notify,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct TradeBatchEngine {
    inner: Arc<Inner>,
}

impl TradeBatchEngine {
    pub fn new(context: ChainContext, config: &AppConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                context,
                config: config.trade.clone(),
                max_batch_size: config.batch.max_batch_size,
                chain_id: config.chain.chain_id,
                queue: Mutex::new(PriorityQueue::new()),
                active: DashMap::new(),
                results: DashMap::new(),
                wakeup: Notify::new(),
                finished: Notify::new(),
                shutdown_tx,
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn start(&self) {
        let mut worker = lock(&self.inner.worker);
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        self.inner.shutdown_tx.send_replace(false);
        let inner = self.inner.clone();
        *worker = Some(tokio::spawn(async move { inner.run().await }));
        info!(
            max_concurrent_batches = self.inner.config.max_concurrent_batches,
            "trade batch engine started"
        );
    }

    /// Stop taking new batches and wait for running ones to finish
    pub async fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        self.inner.wakeup.notify_one();

        let handle = lock(&self.inner.worker).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "trade worker terminated abnormally");
            }
        }
        info!("trade batch engine stopped");
    }

    /// Validate and queue a batch; returns its request id without waiting
    pub fn submit_batch_trade(&self, request: TradeBatchRequest) -> Result<String> {
        let batch = self.validate(&request)?;
        let priority = self.priority_for(&batch);
        let request_id = Uuid::new_v4().to_string();

        info!(
            request_id = %request_id,
            trades = batch.trades.len(),
            signers = batch.enabled_signers().count(),
            strategy = %batch.execution_strategy,
            dry_run = batch.dry_run,
            priority,
            "trade batch queued"
        );

        self.inner
            .active
            .insert(request_id.clone(), RequestState::Pending);
        lock(&self.inner.queue).push(
            priority,
            QueuedTrade {
                request_id: request_id.clone(),
                batch,
            },
        );
        self.inner.wakeup.notify_one();
        Ok(request_id)
    }

    pub fn get_batch_result(&self, request_id: &str) -> Option<BatchResult> {
        self.inner.results.get(request_id).map(|r| r.clone())
    }

    pub fn get_batch_status(&self, request_id: &str) -> RequestState {
        if self.inner.results.contains_key(request_id) {
            return RequestState::Completed;
        }
        self.inner
            .active
            .get(request_id)
            .map(|state| *state)
            .unwrap_or(RequestState::NotFound)
    }

    /// Drop a batch that has not started yet
    pub fn cancel_batch_trade(&self, request_id: &str) -> bool {
        let removed = lock(&self.inner.queue)
            .remove_where(|queued| queued.request_id == request_id)
            .is_some();

        if removed {
            self.inner.active.remove(request_id);
            info!(request_id = %request_id, "trade batch cancelled");
        }
        removed
    }

    /// Wait for a queued batch to produce its result
    pub async fn wait_for_result(&self, request_id: &str, wait: Duration) -> Result<BatchResult> {
        let deadline = Instant::now() + wait;
        loop {
            let finished = self.inner.finished.notified();

            if let Some(result) = self.get_batch_result(request_id) {
                return Ok(result);
            }
            if self.get_batch_status(request_id) == RequestState::NotFound {
                return Err(BatchError::NotFound(format!("trade batch {}", request_id)));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if timeout(remaining, finished).await.is_err() {
                return Err(BatchError::WaitTimeout {
                    pending: 1,
                    total: 1,
                });
            }
        }
    }

    pub fn queued_batches(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    fn validate(&self, request: &TradeBatchRequest) -> Result<ValidatedTradeBatch> {
        if request.trades.is_empty() {
            return Err(ValidationError::Empty("trades").into());
        }
        if request.signers.is_empty() {
            return Err(ValidationError::Empty("signers").into());
        }
        if request.execution_strategy == ExecutionStrategy::RoundRobin {
            return Err(ValidationError::UnsupportedStrategy {
                strategy: request.execution_strategy.to_string(),
                engine: "trade",
            }
            .into());
        }
        if request.max_concurrency == Some(0) {
            return Err(ValidationError::ZeroConcurrency.into());
        }

        let trades = request
            .trades
            .iter()
            .enumerate()
            .map(|(index, trade)| trade.validate(index))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let signers = parse_signers(&request.signers, self.inner.chain_id)?;

        let batch = ValidatedTradeBatch {
            trades,
            signers,
            execution_strategy: request.execution_strategy,
            failure_strategy: request.failure_strategy,
            max_concurrency: request.max_concurrency,
            delay: Duration::from_millis(request.delay_between_trades_ms.unwrap_or(0)),
            dry_run: request.dry_run,
        };

        let requested = batch.operation_count();
        if requested > self.inner.max_batch_size {
            return Err(ValidationError::BatchTooLarge {
                requested,
                max: self.inner.max_batch_size,
            }
            .into());
        }

        Ok(batch)
    }

    /// Dry runs jump ahead; every 10 operations cost one point, up to the cap
    fn priority_for(&self, batch: &ValidatedTradeBatch) -> i64 {
        let bonus = if batch.dry_run {
            self.inner.config.dry_run_priority_bonus
        } else {
            0
        };
        let penalty = (batch.operation_count() as i64 / 10).min(self.inner.config.size_penalty_cap);
        BASE_PRIORITY + bonus - penalty
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let slots = Arc::new(Semaphore::new(self.config.max_concurrent_batches.max(1)));
        let mut running: Vec<JoinHandle<()>> = Vec::new();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            running.retain(|handle| !handle.is_finished());

            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_rx.changed() => continue,
            };

            let next = lock(&self.queue).pop();
            let Some(queued) = next else {
                drop(permit);
                tokio::select! {
                    _ = self.wakeup.notified() => {}
                    _ = shutdown_rx.changed() => {}
                }
                continue;
            };

            let inner = self.clone();
            running.push(tokio::spawn(async move {
                let _permit = permit;
                inner.execute(queued).await;
            }));
        }

        for outcome in join_all(running).await {
            if let Err(e) = outcome {
                error!(error = %e, "trade batch task aborted");
            }
        }
    }

    async fn execute(&self, queued: QueuedTrade) {
        let QueuedTrade { request_id, batch } = queued;
        self.active.insert(request_id.clone(), RequestState::Processing);

        let started = Instant::now();
        let meta = BatchMeta {
            request_id: request_id.clone(),
            kind: BatchKind::Trade,
            strategy: batch.execution_strategy,
            dry_run: batch.dry_run,
            planned_operations: batch.operation_count(),
            started_at: Utc::now(),
        };

        let result = if batch.enabled_signers().next().is_none() {
            warn!(request_id = %request_id, "trade batch has no enabled signers");
            BatchResult::aborted(meta, started.elapsed(), "no enabled signers")
        } else {
            let results = self.dispatch(&request_id, &batch).await;
            BatchResult::aggregate(meta, started.elapsed(), results).with_trade_summary()
        };

        info!(
            request_id = %request_id,
            status = ?result.status,
            successful = result.successful,
            failed = result.failed,
            elapsed_ms = result.execution_time_ms,
            "trade batch finished"
        );

        self.results.insert(request_id.clone(), result);
        self.active.remove(&request_id);
        self.finished.notify_waiters();
    }

    async fn dispatch(&self, request_id: &str, batch: &ValidatedTradeBatch) -> Vec<OperationResult> {
        let tasks = plan(batch);
        let dry_run = batch.dry_run;
        let context = self.context.clone();

        if batch.failure_strategy == FailureStrategy::RetryFailed {
            warn!(request_id = %request_id, "retry_failed is not supported for trades, continuing on failure");
        }

        let run = move |task: TradeTask| {
            let context = context.clone();
            async move { execute_trade(&context, task, dry_run).await }
        };

        match batch.execution_strategy {
            ExecutionStrategy::Sequential => {
                run_sequential(
                    tasks,
                    batch.delay,
                    batch.failure_strategy.stops_on_failure(),
                    run,
                )
                .await
            }
            ExecutionStrategy::Parallel => {
                let signer_count = batch.enabled_signers().count();
                let limit = effective_concurrency(
                    batch.max_concurrency,
                    self.config.default_max_concurrency,
                    signer_count,
                );
                debug!(request_id = %request_id, limit, "parallel trade dispatch");
                run_bounded(tasks, limit, run).await
            }
            ExecutionStrategy::Staggered | ExecutionStrategy::RoundRobin => {
                run_staggered(tasks, batch.delay, run).await
            }
        }
    }
}

/// Signer-major cross-product of enabled signers and trades
fn plan(batch: &ValidatedTradeBatch) -> Vec<TradeTask> {
    let mut tasks = Vec::with_capacity(batch.operation_count());
    for signer in batch.enabled_signers() {
        for (item_index, trade) in batch.trades.iter().enumerate() {
            tasks.push(TradeTask {
                slot: OperationSlot {
                    operation_index: tasks.len(),
                    item_index,
                    signer: signer.address(),
                    signer_label: signer.label.clone(),
                },
                signer: signer.clone(),
                trade: trade.clone(),
            });
        }
    }
    tasks
}

async fn execute_trade(context: &ChainContext, task: TradeTask, dry_run: bool) -> OperationResult {
    let started = Instant::now();

    let result = match context.swap(&task.signer, &task.trade, dry_run).await {
        Ok(outcome) => {
            let mut result = OperationResult::success(&task.slot);
            outcome.apply(&mut result);
            result
        }
        Err(e) => {
            warn!(
                signer = ?task.slot.signer,
                operation = task.slot.operation_index,
                error = %e,
                "trade failed"
            );
            let mut result = OperationResult::failed(&task.slot, e.to_string());
            result.amount_in = Some(task.trade.amount_in);
            result
        }
    };

    result.with_elapsed(started.elapsed())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
