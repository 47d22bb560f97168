//! Multi-wallet transfer batches
//!
//! Unlike trades, a transfer batch runs to completion inside
//! `submit_batch_transfer`. Transfer `i` is sent by enabled signer
//! `i mod n`, whatever the strategy.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use super::context::ChainContext;
use super::strategy::{effective_concurrency, run_bounded, run_partitioned, run_sequential, Dispatch};
use crate::chain::GasPriority;
use crate::config::{AppConfig, TransferEngineConfig};
use crate::domain::{
    parse_address, parse_signers, BatchKind, BatchMeta, BatchResult, ExecutionStrategy,
    FailureStrategy, OperationResult, OperationSlot, RequestState, Signer, SweepResult,
    TransferBatchRequest, TransferParams,
};
use crate::error::{BatchError, Result, ValidationError};

struct TransferTask {
    slot: OperationSlot,
    signer: Signer,
    transfer: TransferParams,
}

impl Dispatch for TransferTask {
    fn slot(&self) -> &OperationSlot {
        &self.slot
    }
}

pub(super) struct Inner {
    pub(super) context: ChainContext,
    pub(super) config: TransferEngineConfig,
    pub(super) max_batch_size: usize,
    pub(super) chain_id: u64,
    pub(super) active: DashMap<String, RequestState>,
    pub(super) results: DashMap<String, BatchResult>,
    pub(super) sweeps: DashMap<String, SweepResult>,
}

#[derive(Clone)]
pub struct TransferBatchEngine {
    pub(super) inner: Arc<Inner>,
}

impl TransferBatchEngine {
    pub fn new(context: ChainContext, config: &AppConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                context,
                config: config.transfer.clone(),
                max_batch_size: config.batch.max_batch_size,
                chain_id: config.chain.chain_id,
                active: DashMap::new(),
                results: DashMap::new(),
                sweeps: DashMap::new(),
            }),
        }
    }

    /// Validate and run a transfer batch to completion
    pub async fn submit_batch_transfer(&self, request: TransferBatchRequest) -> Result<BatchResult> {
        let signers = self.validate(&request)?;
        let request_id = Uuid::new_v4().to_string();
        let enabled: Vec<Signer> = signers.into_iter().filter(|s| s.enabled).collect();

        info!(
            request_id = %request_id,
            transfers = request.transfers.len(),
            signers = enabled.len(),
            strategy = %request.execution_strategy,
            dry_run = request.dry_run,
            "transfer batch started"
        );
        self.inner
            .active
            .insert(request_id.clone(), RequestState::Processing);

        let started = Instant::now();
        let meta = BatchMeta {
            request_id: request_id.clone(),
            kind: BatchKind::Transfer,
            strategy: request.execution_strategy,
            dry_run: request.dry_run,
            planned_operations: if enabled.is_empty() { 0 } else { request.transfers.len() },
            started_at: Utc::now(),
        };

        let result = if enabled.is_empty() {
            warn!(request_id = %request_id, "transfer batch has no enabled signers");
            BatchResult::aborted(meta, started.elapsed(), "no enabled signers")
        } else {
            let results = self.dispatch(&request_id, &request, &enabled).await;
            BatchResult::aggregate(meta, started.elapsed(), results)
        };

        info!(
            request_id = %request_id,
            status = ?result.status,
            successful = result.successful,
            failed = result.failed,
            elapsed_ms = result.execution_time_ms,
            "transfer batch finished"
        );

        self.inner.results.insert(request_id.clone(), result.clone());
        self.inner.active.remove(&request_id);
        Ok(result)
    }

    pub fn get_transfer_result(&self, request_id: &str) -> Option<BatchResult> {
        self.inner.results.get(request_id).map(|r| r.clone())
    }

    pub fn get_sweep_result(&self, request_id: &str) -> Option<SweepResult> {
        self.inner.sweeps.get(request_id).map(|r| r.clone())
    }

    pub fn get_batch_status(&self, request_id: &str) -> RequestState {
        if self.inner.results.contains_key(request_id) || self.inner.sweeps.contains_key(request_id) {
            return RequestState::Completed;
        }
        self.inner
            .active
            .get(request_id)
            .map(|state| *state)
            .unwrap_or(RequestState::NotFound)
    }

    fn validate(&self, request: &TransferBatchRequest) -> Result<Vec<Signer>> {
        if request.transfers.is_empty() {
            return Err(ValidationError::Empty("transfers").into());
        }
        if request.signers.is_empty() {
            return Err(ValidationError::Empty("signers").into());
        }
        if request.execution_strategy == ExecutionStrategy::Staggered {
            return Err(ValidationError::UnsupportedStrategy {
                strategy: request.execution_strategy.to_string(),
                engine: "transfer",
            }
            .into());
        }
        if request.max_concurrency == Some(0) {
            return Err(ValidationError::ZeroConcurrency.into());
        }
        if request.transfers.len() > self.inner.max_batch_size {
            return Err(ValidationError::BatchTooLarge {
                requested: request.transfers.len(),
                max: self.inner.max_batch_size,
            }
            .into());
        }

        for (index, transfer) in request.transfers.iter().enumerate() {
            transfer.validate(index)?;
        }

        Ok(parse_signers(&request.signers, self.inner.chain_id)?)
    }

    async fn dispatch(
        &self,
        request_id: &str,
        request: &TransferBatchRequest,
        enabled: &[Signer],
    ) -> Vec<OperationResult> {
        let tasks = plan(&request.transfers, enabled);
        let delay = Duration::from_millis(request.delay_between_transfers_ms.unwrap_or(0));
        let stop_on_failure = request.failure_strategy.stops_on_failure();

        if request.failure_strategy == FailureStrategy::RetryFailed {
            warn!(request_id = %request_id, "retry_failed is not implemented for transfers, continuing on failure");
        }

        let context = self.inner.context.clone();
        let (gas_priority, dry_run) = (request.gas_priority, request.dry_run);
        let run = move |task: TransferTask| {
            let context = context.clone();
            async move { execute_transfer(&context, task, gas_priority, dry_run).await }
        };

        match request.execution_strategy {
            ExecutionStrategy::Sequential => run_sequential(tasks, delay, stop_on_failure, run).await,
            ExecutionStrategy::RoundRobin => {
                let mut partitions: Vec<Vec<TransferTask>> = (0..enabled.len()).map(|_| Vec::new()).collect();
                for task in tasks {
                    partitions[task.slot.operation_index % enabled.len()].push(task);
                }
                run_partitioned(partitions, delay, stop_on_failure, run).await
            }
            ExecutionStrategy::Parallel | ExecutionStrategy::Staggered => {
                let limit = effective_concurrency(
                    request.max_concurrency,
                    self.inner.config.default_max_concurrency,
                    enabled.len(),
                );
                run_bounded(tasks, limit, run).await
            }
        }
    }
}

/// Transfer `i` goes to enabled signer `i mod n`
fn plan(transfers: &[TransferParams], enabled: &[Signer]) -> Vec<TransferTask> {
    transfers
        .iter()
        .enumerate()
        .map(|(index, transfer)| {
            let signer = &enabled[index % enabled.len()];
            TransferTask {
                slot: OperationSlot {
                    operation_index: index,
                    item_index: index,
                    signer: signer.address(),
                    signer_label: signer.label.clone(),
                },
                signer: signer.clone(),
                transfer: transfer.clone(),
            }
        })
        .collect()
}

async fn execute_transfer(
    context: &ChainContext,
    task: TransferTask,
    gas_priority: Option<GasPriority>,
    dry_run: bool,
) -> OperationResult {
    let started = Instant::now();
    let field = format!("transfers[{}].recipient", task.slot.item_index);

    let outcome = match parse_address(&field, &task.transfer.recipient) {
        Ok(recipient) => {
            context
                .transfer(
                    &task.signer,
                    &task.transfer.asset,
                    recipient,
                    task.transfer.amount,
                    gas_priority,
                    dry_run,
                )
                .await
        }
        Err(e) => Err(BatchError::InvalidAddress(e.to_string())),
    };

    let result = match outcome {
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
                "transfer failed"
            );
            let mut result = OperationResult::failed(&task.slot, e.to_string());
            result.amount_in = Some(task.transfer.amount);
            result
        }
    };

    result.with_elapsed(started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChainClient, MockDexClient, MockGasEstimator};
    use crate::domain::SignerConfig;
    use crate::signing::MockNonceLedger;
    use rust_decimal_macros::dec;

    const KEY_0: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const KEY_1: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
    const KEY_2: &str = "0x5de4111afa1a4b94908f83103eb1f1706367c2e68ca870fc3fb9a804cdab365a";

    fn engine_with(chain: MockChainClient) -> TransferBatchEngine {
        let context = ChainContext::new(
            Arc::new(chain),
            Arc::new(MockDexClient::new()),
            Arc::new(MockGasEstimator::new()),
            Arc::new(MockNonceLedger::new()),
        );
        TransferBatchEngine::new(context, &AppConfig::default())
    }

    fn request(transfers: usize, signers: Vec<SignerConfig>) -> TransferBatchRequest {
        TransferBatchRequest {
            transfers: (0..transfers)
                .map(|_| TransferParams {
                    recipient: "0x000000000000000000000000000000000000dEaD".to_string(),
                    amount: dec!(1),
                    asset: Default::default(),
                })
                .collect(),
            signers,
            execution_strategy: ExecutionStrategy::Sequential,
            failure_strategy: FailureStrategy::ContinueOnFailure,
            max_concurrency: None,
            delay_between_transfers_ms: None,
            gas_priority: None,
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn test_rejects_staggered_and_zero_amount() {
        let engine = engine_with(MockChainClient::new());

        let mut staggered = request(1, vec![SignerConfig::new(KEY_0)]);
        staggered.execution_strategy = ExecutionStrategy::Staggered;
        let err = engine.submit_batch_transfer(staggered).await.unwrap_err();
        assert!(err.to_string().contains("staggered"));

        let mut zero = request(1, vec![SignerConfig::new(KEY_0)]);
        zero.transfers[0].amount = dec!(0);
        let err = engine.submit_batch_transfer(zero).await.unwrap_err();
        assert!(err.to_string().contains("transfers[0].amount"));
    }

    #[tokio::test]
    async fn test_no_enabled_signers_fails_batch() {
        let engine = engine_with(MockChainClient::new());
        let result = engine
            .submit_batch_transfer(request(2, vec![SignerConfig::new(KEY_0).disabled()]))
            .await
            .unwrap();

        assert_eq!(result.status, crate::domain::BatchStatus::Failed);
        assert_eq!(result.total_operations, 0);
        assert_eq!(result.error.as_deref(), Some("no enabled signers"));
        assert_eq!(engine.get_batch_status(&result.request_id), RequestState::Completed);
    }

    #[tokio::test]
    async fn test_bad_recipient_fails_only_its_transfer() {
        let mut chain = MockChainClient::new();
        chain.expect_get_balance().returning(|_, _| Ok(dec!(0)));
        let engine = engine_with(chain);

        let mut req = request(2, vec![SignerConfig::new(KEY_0)]);
        req.transfers[0].recipient = "bob".to_string();
        let result = engine.submit_batch_transfer(req).await.unwrap();

        assert_eq!(result.total_operations, 2);
        assert!(result.results[0].error.as_deref().unwrap_or_default().contains("Invalid address"));
        assert!(result.results[1].error.as_deref().unwrap_or_default().contains("insufficient"));
    }

    #[test]
    fn test_plan_assigns_senders_modulo() {
        let signers = parse_signers(
            &[SignerConfig::new(KEY_0), SignerConfig::new(KEY_1), SignerConfig::new(KEY_2)],
            1,
        )
        .unwrap();
        let transfers = request(5, vec![]).transfers;
        let tasks = plan(&transfers, &signers);

        let senders: Vec<_> = tasks.iter().map(|t| t.slot.signer).collect();
        assert_eq!(senders[0], signers[0].address());
        assert_eq!(senders[3], signers[0].address());
        assert_eq!(senders[4], signers[1].address());
        assert_eq!(senders[2], signers[2].address());
    }
}
