use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::AssetId;
use crate::error::Result;
use crate::signing::Wallet;

/// Fee urgency passed to the gas estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GasPriority {
    Low,
    #[default]
    Standard,
    High,
}

/// Inputs for a gas estimate
#[derive(Debug, Clone, PartialEq)]
pub struct GasRequest {
    pub to: Address,
    pub data: Bytes,
    /// Native value in whole units
    pub value: Decimal,
    pub from: Address,
    pub priority: Option<GasPriority>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasEstimate {
    pub gas_limit: u64,
    /// Native units per gas
    pub gas_price: Decimal,
}

/// Unsigned transaction ready for submission
#[derive(Debug, Clone, PartialEq)]
pub struct TxRequest {
    pub from: Address,
    pub to: Address,
    /// Native value in whole units
    pub value: Decimal,
    pub data: Bytes,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: Decimal,
}

/// Handle to a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTx {
    pub tx_hash: H256,
    pub from: Address,
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub gas_used: u64,
    pub effective_gas_price: Decimal,
    /// false when the transaction was mined but reverted
    pub success: bool,
}

impl TxReceipt {
    pub fn gas_cost(&self) -> Decimal {
        Decimal::from(self.gas_used) * self.effective_gas_price
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub amount_out: Decimal,
    pub effective_price: Decimal,
}

/// Swap parameters as handed to the DEX client
#[derive(Debug, Clone, PartialEq)]
pub struct SwapParams {
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: Decimal,
    pub slippage_tolerance: Decimal,
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapReceipt {
    pub tx_hash: H256,
    pub amount_out: Decimal,
    pub gas_used: u64,
    pub gas_cost: Decimal,
    pub effective_price: Decimal,
    pub price_impact: Decimal,
}

/// Balance reads and raw transaction submission
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Balance of `owner` in whole units of `asset`
    async fn get_balance(&self, owner: Address, asset: AssetId) -> Result<Decimal>;

    /// Sign and broadcast a transaction
    async fn send_transaction(&self, signer: &Wallet, tx: TxRequest) -> Result<PendingTx>;

    /// Wait for the receipt; the client applies its own confirmation timeout
    async fn wait_for_receipt(&self, pending: &PendingTx) -> Result<TxReceipt>;
}

/// Swap quoting and execution
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DexClient: Send + Sync {
    async fn quote(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: Decimal,
        slippage_tolerance: Decimal,
    ) -> Result<Quote>;

    /// Execute a swap signed by `signer` using the reserved `nonce`
    async fn swap(&self, params: &SwapParams, signer: &Wallet, nonce: u64) -> Result<SwapReceipt>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GasEstimator: Send + Sync {
    async fn estimate(&self, request: &GasRequest) -> Result<GasEstimate>;
}
