//! Chain operations runnable through the generic executor

use async_trait::async_trait;
use ethers::types::Address;
use rust_decimal::Decimal;
use serde::Serialize;

use super::context::{ChainContext, SwapOutcome, TransferOutcome};
use super::executor::{BatchOperation, OperationHandler};
use crate::chain::GasPriority;
use crate::domain::{Asset, Signer, ValidatedTrade};
use crate::error::Result;

/// Single on-chain action queued with a priority
#[derive(Debug, Clone)]
pub enum ChainOperation {
    Transfer {
        signer: Signer,
        asset: Asset,
        recipient: Address,
        amount: Decimal,
        gas_priority: Option<GasPriority>,
    },
    Swap {
        signer: Signer,
        trade: ValidatedTrade,
    },
}

impl BatchOperation for ChainOperation {
    fn kind(&self) -> &'static str {
        match self {
            ChainOperation::Transfer { .. } => "transfer",
            ChainOperation::Swap { .. } => "swap",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainReceipt {
    Transfer(TransferOutcome),
    Swap(SwapOutcome),
}

/// Executes [`ChainOperation`]s live through the shared chain lifecycle
pub struct ChainOperationHandler {
    context: ChainContext,
}

impl ChainOperationHandler {
    pub fn new(context: ChainContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl OperationHandler for ChainOperationHandler {
    type Operation = ChainOperation;
    type Output = ChainReceipt;

    async fn handle(&self, operation: ChainOperation) -> Result<ChainReceipt> {
        match operation {
            ChainOperation::Transfer {
                signer,
                asset,
                recipient,
                amount,
                gas_priority,
            } => self
                .context
                .transfer(&signer, &asset, recipient, amount, gas_priority, false)
                .await
                .map(ChainReceipt::Transfer),
            ChainOperation::Swap { signer, trade } => self
                .context
                .swap(&signer, &trade, false)
                .await
                .map(ChainReceipt::Swap),
        }
    }
}
