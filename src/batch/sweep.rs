//! Fund consolidation: many signers → one destination
//!
//! Signers are swept concurrently up to the configured ceiling; the assets of
//! one signer are swept one after another so its nonces stay ordered.

use chrono::Utc;
use ethers::types::Address;
use futures_util::stream::{self, StreamExt};
use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::ChainContext;
use super::strategy::effective_concurrency;
use super::transfer::TransferBatchEngine;
use crate::chain::{build_transfer_call, GasPriority};
use crate::domain::{
    parse_address, parse_signers, Asset, OperationResult, OperationSlot, RequestState, Signer,
    SweepLeg, SweepRequest, SweepResult,
};
use crate::error::{BatchError, Result, ValidationError};

pub const SKIP_ZERO_BALANCE: &str = "zero balance";
pub const SKIP_GAS_RESERVE: &str = "insufficient balance after gas reserve";
pub const SKIP_BELOW_MINIMUM: &str = "below minimum sweep amount";

/// Per-leg thresholds resolved from the request and config
#[derive(Debug, Clone, Copy)]
struct SweepRules {
    /// Native amount left behind; None when the request opts out
    gas_reserve: Option<Decimal>,
    min_amount: Option<Decimal>,
    gas_priority: Option<GasPriority>,
}

impl SweepRules {
    /// Amount to move for one leg, or the reason the leg is skipped
    fn sweepable(&self, asset: &Asset, balance: Decimal) -> std::result::Result<Decimal, &'static str> {
        if balance <= Decimal::ZERO {
            return Err(SKIP_ZERO_BALANCE);
        }

        let amount = match self.gas_reserve {
            Some(reserve) if asset.is_native() => {
                let remaining = balance - reserve;
                if remaining <= Decimal::ZERO {
                    return Err(SKIP_GAS_RESERVE);
                }
                remaining
            }
            _ => balance,
        };

        match self.min_amount {
            Some(min) if amount < min => Err(SKIP_BELOW_MINIMUM),
            _ => Ok(amount),
        }
    }
}

struct SignerSweep {
    signer_index: usize,
    signer: Signer,
}

impl TransferBatchEngine {
    /// Move every sweepable balance of every enabled signer to `destination`
    pub async fn sweep_funds(&self, request: SweepRequest) -> Result<SweepResult> {
        let (destination, signers, rules) = self.validate_sweep(&request)?;
        let request_id = Uuid::new_v4().to_string();
        let enabled: Vec<Signer> = signers.into_iter().filter(|s| s.enabled).collect();

        info!(
            request_id = %request_id,
            destination = ?destination,
            signers = enabled.len(),
            assets = request.assets.len(),
            "sweep started"
        );
        self.inner
            .active
            .insert(request_id.clone(), RequestState::Processing);

        let started = Instant::now();
        let started_at = Utc::now();
        let limit = effective_concurrency(
            request.max_concurrency,
            self.inner.config.default_max_concurrency,
            enabled.len(),
        );

        let context = &self.inner.context;
        let assets = &request.assets;
        let jobs = enabled
            .into_iter()
            .enumerate()
            .map(|(signer_index, signer)| SignerSweep { signer_index, signer });

        let per_signer: Vec<Vec<SweepLeg>> = stream::iter(jobs)
            .map(|job| sweep_signer(context, job, assets, destination, rules))
            .buffer_unordered(limit)
            .collect()
            .await;

        let mut legs: Vec<SweepLeg> = per_signer.into_iter().flatten().collect();
        legs.sort_by_key(|leg| leg.result.operation_index);

        let result = SweepResult::aggregate(request_id.clone(), destination, started_at, started.elapsed(), legs);
        info!(
            request_id = %request_id,
            status = ?result.status,
            successful = result.successful,
            skipped = result.skipped,
            failed = result.failed,
            "sweep finished"
        );

        self.inner.sweeps.insert(request_id.clone(), result.clone());
        self.inner.active.remove(&request_id);
        Ok(result)
    }

    fn validate_sweep(&self, request: &SweepRequest) -> Result<(Address, Vec<Signer>, SweepRules)> {
        if request.signers.is_empty() {
            return Err(ValidationError::Empty("signers").into());
        }
        if request.assets.is_empty() {
            return Err(ValidationError::Empty("assets").into());
        }
        if request.max_concurrency == Some(0) {
            return Err(ValidationError::ZeroConcurrency.into());
        }

        let destination = parse_address("destination", &request.destination)
            .map_err(|e| BatchError::InvalidAddress(e.to_string()))?;

        if let Some(reserve) = request.gas_reserve {
            if reserve.is_sign_negative() {
                return Err(BatchError::Validation(format!(
                    "gas_reserve must not be negative, got {}",
                    reserve
                )));
            }
        }

        let signers = parse_signers(&request.signers, self.inner.chain_id)?;

        // Disabled signers contribute no legs, same as for trade batches
        let legs = signers.iter().filter(|s| s.enabled).count() * request.assets.len();
        if legs > self.inner.max_batch_size {
            return Err(ValidationError::BatchTooLarge {
                requested: legs,
                max: self.inner.max_batch_size,
            }
            .into());
        }

        let rules = SweepRules {
            gas_reserve: request
                .reserve_gas
                .then(|| request.gas_reserve.unwrap_or(self.inner.config.default_gas_reserve)),
            min_amount: request.min_amount,
            gas_priority: request.gas_priority,
        };

        Ok((destination, signers, rules))
    }
}

async fn sweep_signer(
    context: &ChainContext,
    job: SignerSweep,
    assets: &[Asset],
    destination: Address,
    rules: SweepRules,
) -> Vec<SweepLeg> {
    let mut legs = Vec::with_capacity(assets.len());
    for (asset_index, asset) in assets.iter().enumerate() {
        let slot = OperationSlot {
            operation_index: job.signer_index * assets.len() + asset_index,
            item_index: asset_index,
            signer: job.signer.address(),
            signer_label: job.signer.label.clone(),
        };
        legs.push(sweep_leg(context, &job.signer, slot, asset, destination, rules).await);
    }
    legs
}

async fn sweep_leg(
    context: &ChainContext,
    signer: &Signer,
    slot: OperationSlot,
    asset: &Asset,
    destination: Address,
    rules: SweepRules,
) -> SweepLeg {
    let started = Instant::now();
    let leg = |balance: Decimal, result: OperationResult| SweepLeg {
        asset: asset.id(),
        symbol: asset.symbol().to_string(),
        balance,
        result: result.with_elapsed(started.elapsed()),
    };

    let balance = match context.chain.get_balance(signer.address(), asset.id()).await {
        Ok(balance) => balance,
        Err(e) => {
            warn!(signer = ?slot.signer, asset = %asset.id(), error = %e, "sweep balance read failed");
            return leg(Decimal::ZERO, OperationResult::failed(&slot, e.to_string()));
        }
    };

    let amount = match rules.sweepable(asset, balance) {
        Ok(amount) => amount,
        Err(reason) => {
            debug!(signer = ?slot.signer, asset = asset.symbol(), %balance, reason, "sweep leg skipped");
            return leg(balance, OperationResult::skipped(&slot, reason));
        }
    };

    let outcome = match build_transfer_call(asset, destination, amount) {
        Ok(call) => {
            context
                .dispatch_call(signer, call, amount, rules.gas_priority, false)
                .await
        }
        Err(e) => Err(e),
    };

    match outcome {
        Ok(outcome) => {
            let mut result = OperationResult::success(&slot);
            outcome.apply(&mut result);
            leg(balance, result)
        }
        Err(e) => {
            warn!(signer = ?slot.signer, asset = asset.symbol(), error = %e, "sweep leg failed");
            let mut result = OperationResult::failed(&slot, e.to_string());
            result.amount_in = Some(amount);
            leg(balance, result)
        }
    }
}
