//! Composition root
//!
//! Builds every engine from one set of collaborators and owns their
//! lifecycle. Nothing in the crate is global; callers construct a
//! `BatchService` and pass it (or its engines) where needed.

use std::sync::Arc;
use tracing::info;

use crate::adapters::PaperChain;
use crate::batch::{
    BatchExecutor, ChainContext, ChainOperationHandler, TradeBatchEngine, TransferBatchEngine,
};
use crate::chain::{ChainClient, DexClient, GasEstimator};
use crate::config::AppConfig;
use crate::signing::{InMemoryNonceLedger, NonceLedger};

pub struct BatchService {
    config: AppConfig,
    context: ChainContext,
    trades: TradeBatchEngine,
    transfers: TransferBatchEngine,
    executor: BatchExecutor<ChainOperationHandler>,
}

impl BatchService {
    pub fn new(
        config: AppConfig,
        chain: Arc<dyn ChainClient>,
        dex: Arc<dyn DexClient>,
        gas: Arc<dyn GasEstimator>,
        nonces: Arc<dyn NonceLedger>,
    ) -> Self {
        let context = ChainContext::new(chain, dex, gas, nonces);
        let trades = TradeBatchEngine::new(context.clone(), &config);
        let transfers = TransferBatchEngine::new(context.clone(), &config);
        let executor = BatchExecutor::new(
            Arc::new(ChainOperationHandler::new(context.clone())),
            config.executor.clone(),
        );

        Self {
            config,
            context,
            trades,
            transfers,
            executor,
        }
    }

    /// Every collaborator backed by one in-memory paper chain
    pub fn paper(config: AppConfig, chain: Arc<PaperChain>, nonces: Arc<InMemoryNonceLedger>) -> Self {
        Self::new(config, chain.clone(), chain.clone(), chain, nonces)
    }

    pub fn start(&self) {
        self.trades.start();
        self.executor.start();
        info!("batch service started");
    }

    pub async fn shutdown(&self) {
        self.trades.shutdown().await;
        self.executor.shutdown().await;
        info!("batch service stopped");
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn context(&self) -> &ChainContext {
        &self.context
    }

    pub fn trades(&self) -> &TradeBatchEngine {
        &self.trades
    }

    pub fn transfers(&self) -> &TransferBatchEngine {
        &self.transfers
    }

    pub fn executor(&self) -> &BatchExecutor<ChainOperationHandler> {
        &self.executor
    }
}
