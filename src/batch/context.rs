//! Per-operation chain lifecycle shared by every engine
//!
//! All submissions funnel through [`ChainContext`]: balance check, signer
//! gate, nonce reservation, submission, confirmation. A nonce that was
//! reserved but never reached the network is released again.

use chrono::Utc;
use ethers::types::{Address, H256};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::chain::{
    build_transfer_call, ChainClient, DexClient, GasEstimator, GasPriority, GasRequest, SwapParams,
    TransferCall, TxRequest,
};
use crate::domain::{Asset, AssetId, OperationResult, Signer, ValidatedTrade};
use crate::error::{BatchError, Result};
use crate::signing::{NonceLedger, SignerGates};

/// Collaborators needed to take one operation on chain
#[derive(Clone)]
pub struct ChainContext {
    pub chain: Arc<dyn ChainClient>,
    pub dex: Arc<dyn DexClient>,
    pub gas: Arc<dyn GasEstimator>,
    pub nonces: Arc<dyn NonceLedger>,
    pub gates: SignerGates,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwapOutcome {
    pub tx_hash: Option<H256>,
    pub amount_in: Decimal,
    pub amount_out: Decimal,
    pub effective_price: Decimal,
    pub price_impact: Option<Decimal>,
    pub gas_used: Option<u64>,
    pub gas_cost: Option<Decimal>,
    pub nonce: Option<u64>,
}

impl SwapOutcome {
    pub fn apply(&self, result: &mut OperationResult) {
        result.tx_hash = self.tx_hash;
        result.amount_in = Some(self.amount_in);
        result.amount_out = Some(self.amount_out);
        result.effective_price = Some(self.effective_price);
        result.price_impact = self.price_impact;
        result.gas_used = self.gas_used;
        result.gas_cost = self.gas_cost;
        result.nonce = self.nonce;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferOutcome {
    pub tx_hash: Option<H256>,
    pub amount: Decimal,
    pub gas_used: Option<u64>,
    pub gas_cost: Option<Decimal>,
    /// gas_limit × gas_price from the estimator, set on dry runs
    pub estimated_gas_cost: Option<Decimal>,
    pub nonce: Option<u64>,
}

impl TransferOutcome {
    pub fn apply(&self, result: &mut OperationResult) {
        result.tx_hash = self.tx_hash;
        result.amount_in = Some(self.amount);
        result.gas_used = self.gas_used;
        result.gas_cost = self.gas_cost;
        result.nonce = self.nonce;
    }
}

impl ChainContext {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        dex: Arc<dyn DexClient>,
        gas: Arc<dyn GasEstimator>,
        nonces: Arc<dyn NonceLedger>,
    ) -> Self {
        Self {
            chain,
            dex,
            gas,
            nonces,
            gates: SignerGates::new(),
        }
    }

    /// Balance of `owner`, or InsufficientBalance when it is below `required`
    pub async fn ensure_balance(&self, owner: Address, asset: AssetId, required: Decimal) -> Result<Decimal> {
        let available = self.chain.get_balance(owner, asset).await?;
        if available < required {
            return Err(BatchError::InsufficientBalance {
                asset: asset.to_string(),
                required,
                available,
            });
        }
        Ok(available)
    }

    /// Run one swap for `signer`; a dry run only asks for a quote
    pub async fn swap(&self, signer: &Signer, trade: &ValidatedTrade, dry_run: bool) -> Result<SwapOutcome> {
        signer.check_cap(trade.amount_in).map_err(BatchError::Validation)?;

        if let Some(deadline) = trade.deadline {
            if deadline <= Utc::now() {
                return Err(BatchError::Validation(format!(
                    "trade deadline {} has passed",
                    deadline
                )));
            }
        }

        let address = signer.address();
        self.ensure_balance(address, AssetId::Token(trade.token_in), trade.amount_in)
            .await?;

        if dry_run {
            let quote = self
                .dex
                .quote(
                    trade.token_in,
                    trade.token_out,
                    trade.amount_in,
                    trade.slippage_tolerance,
                )
                .await?;
            debug!(signer = ?address, amount_out = %quote.amount_out, "dry-run quote");
            return Ok(SwapOutcome {
                tx_hash: None,
                amount_in: trade.amount_in,
                amount_out: quote.amount_out,
                effective_price: quote.effective_price,
                price_impact: None,
                gas_used: None,
                gas_cost: None,
                nonce: None,
            });
        }

        let mut reservation = self.reserve(address).await?;
        let nonce = reservation.nonce;

        let params = SwapParams {
            token_in: trade.token_in,
            token_out: trade.token_out,
            amount_in: trade.amount_in,
            slippage_tolerance: trade.slippage_tolerance,
            deadline: trade.deadline,
        };

        reservation.mark_in_flight();
        let receipt = match self.dex.swap(&params, &signer.wallet, nonce).await {
            Ok(receipt) => receipt,
            Err(e) => {
                reservation.release().await;
                return Err(e);
            }
        };

        self.nonces.confirm(address, nonce).await?;
        info!(
            signer = ?address,
            nonce,
            tx_hash = ?receipt.tx_hash,
            amount_out = %receipt.amount_out,
            "swap confirmed"
        );

        Ok(SwapOutcome {
            tx_hash: Some(receipt.tx_hash),
            amount_in: trade.amount_in,
            amount_out: receipt.amount_out,
            effective_price: receipt.effective_price,
            price_impact: Some(receipt.price_impact),
            gas_used: Some(receipt.gas_used),
            gas_cost: Some(receipt.gas_cost),
            nonce: Some(nonce),
        })
    }

    /// Send `amount` of `asset` from `signer` to `recipient`
    pub async fn transfer(
        &self,
        signer: &Signer,
        asset: &Asset,
        recipient: Address,
        amount: Decimal,
        priority: Option<GasPriority>,
        dry_run: bool,
    ) -> Result<TransferOutcome> {
        signer.check_cap(amount).map_err(BatchError::Validation)?;
        self.ensure_balance(signer.address(), asset.id(), amount).await?;

        let call = build_transfer_call(asset, recipient, amount)?;
        self.dispatch_call(signer, call, amount, priority, dry_run).await
    }

    /// Estimate, sign, submit and confirm a prepared call
    ///
    /// The nonce is released when estimation or submission fails, or when
    /// the future is dropped before submission starts. If the receipt never
    /// arrives it stays reserved, since the transaction may still be mined.
    pub async fn dispatch_call(
        &self,
        signer: &Signer,
        call: TransferCall,
        amount: Decimal,
        priority: Option<GasPriority>,
        dry_run: bool,
    ) -> Result<TransferOutcome> {
        let from = signer.address();
        let gas_request = GasRequest {
            to: call.to,
            data: call.data.clone(),
            value: call.value,
            from,
            priority,
        };

        if dry_run {
            let estimate = self.gas.estimate(&gas_request).await?;
            return Ok(TransferOutcome {
                tx_hash: None,
                amount,
                gas_used: None,
                gas_cost: None,
                estimated_gas_cost: Some(Decimal::from(estimate.gas_limit) * estimate.gas_price),
                nonce: None,
            });
        }

        let mut reservation = self.reserve(from).await?;
        let nonce = reservation.nonce;

        let estimate = match self.gas.estimate(&gas_request).await {
            Ok(estimate) => estimate,
            Err(e) => {
                reservation.release().await;
                return Err(e);
            }
        };

        let tx = TxRequest {
            from,
            to: call.to,
            value: call.value,
            data: call.data,
            nonce,
            gas_limit: estimate.gas_limit,
            gas_price: estimate.gas_price,
        };

        reservation.mark_in_flight();
        let pending = match self.chain.send_transaction(&signer.wallet, tx).await {
            Ok(pending) => pending,
            Err(e) => {
                reservation.release().await;
                return Err(e);
            }
        };
        debug!(signer = ?from, nonce, tx_hash = ?pending.tx_hash, "transfer submitted");

        let receipt = self.chain.wait_for_receipt(&pending).await?;
        self.nonces.confirm(from, nonce).await?;

        if !receipt.success {
            return Err(BatchError::Chain(format!(
                "transaction {:?} reverted",
                receipt.tx_hash
            )));
        }

        info!(
            signer = ?from,
            nonce,
            tx_hash = ?receipt.tx_hash,
            gas_used = receipt.gas_used,
            "transfer confirmed"
        );

        Ok(TransferOutcome {
            tx_hash: Some(receipt.tx_hash),
            amount,
            gas_used: Some(receipt.gas_used),
            gas_cost: Some(receipt.gas_cost()),
            estimated_gas_cost: None,
            nonce: Some(nonce),
        })
    }

    /// Take the signer's gate, then its next nonce
    async fn reserve(&self, address: Address) -> Result<Reservation> {
        let gate = self.gates.acquire(address).await;
        let nonce = self.nonces.reserve(address).await?;
        Ok(Reservation {
            nonces: self.nonces.clone(),
            gate: Some(gate),
            address,
            nonce,
            in_flight: false,
        })
    }
}

/// A reserved nonce together with the signer gate it was taken under
///
/// Dropped before the transaction is handed to the chain, it gives the nonce
/// back from a detached task that keeps the gate until the release lands.
/// Once in flight the nonce is only returned by an explicit `release`.
struct Reservation {
    nonces: Arc<dyn NonceLedger>,
    gate: Option<OwnedMutexGuard<()>>,
    address: Address,
    nonce: u64,
    in_flight: bool,
}

impl Reservation {
    fn mark_in_flight(&mut self) {
        self.in_flight = true;
    }

    async fn release(mut self) {
        self.in_flight = true;
        if let Err(e) = self.nonces.release(self.address, self.nonce).await {
            warn!(signer = ?self.address, nonce = self.nonce, error = %e, "failed to release nonce");
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.in_flight {
            return;
        }

        let (nonces, gate, address, nonce) = (self.nonces.clone(), self.gate.take(), self.address, self.nonce);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _gate = gate;
                    match nonces.release(address, nonce).await {
                        Ok(()) => debug!(signer = ?address, nonce, "released abandoned nonce"),
                        Err(e) => warn!(signer = ?address, nonce, error = %e, "failed to release abandoned nonce"),
                    }
                });
            }
            Err(_) => warn!(signer = ?address, nonce, "nonce abandoned outside a runtime, left pending"),
        }
    }
}
