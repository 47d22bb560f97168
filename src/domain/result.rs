use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::asset::AssetId;
use super::request::ExecutionStrategy;

/// Terminal state of a single dispatched operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Success,
    Failed,
    Skipped,
}

/// Who runs an operation and where it sits in the batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSlot {
    /// Position in the dispatch plan
    pub operation_index: usize,
    /// Index of the trade, transfer or asset entry in the request
    pub item_index: usize,
    pub signer: Address,
    pub signer_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub operation_index: usize,
    pub item_index: usize,
    pub signer: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer_label: Option<String>,
    pub status: OperationStatus,
    pub tx_hash: Option<H256>,
    pub amount_in: Option<Decimal>,
    pub amount_out: Option<Decimal>,
    pub gas_used: Option<u64>,
    pub gas_cost: Option<Decimal>,
    pub effective_price: Option<Decimal>,
    /// Realized price impact, reported as slippage
    pub price_impact: Option<Decimal>,
    pub nonce: Option<u64>,
    pub error: Option<String>,
    pub skip_reason: Option<String>,
    pub execution_time_ms: u64,
}

impl OperationResult {
    fn base(slot: &OperationSlot, status: OperationStatus) -> Self {
        Self {
            operation_index: slot.operation_index,
            item_index: slot.item_index,
            signer: slot.signer,
            signer_label: slot.signer_label.clone(),
            status,
            tx_hash: None,
            amount_in: None,
            amount_out: None,
            gas_used: None,
            gas_cost: None,
            effective_price: None,
            price_impact: None,
            nonce: None,
            error: None,
            skip_reason: None,
            execution_time_ms: 0,
        }
    }

    pub fn success(slot: &OperationSlot) -> Self {
        Self::base(slot, OperationStatus::Success)
    }

    pub fn failed(slot: &OperationSlot, error: impl Into<String>) -> Self {
        let mut result = Self::base(slot, OperationStatus::Failed);
        result.error = Some(error.into());
        result
    }

    pub fn skipped(slot: &OperationSlot, reason: impl Into<String>) -> Self {
        let mut result = Self::base(slot, OperationStatus::Skipped);
        result.skip_reason = Some(reason.into());
        result
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.execution_time_ms = elapsed.as_millis() as u64;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == OperationStatus::Success
    }

    pub fn is_failed(&self) -> bool {
        self.status == OperationStatus::Failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    Trade,
    Transfer,
    Sweep,
}

/// Outcome of a finished batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// No failures
    Completed,
    /// Some operations failed, some succeeded
    PartiallyCompleted,
    /// Nothing succeeded, or the orchestration itself aborted
    Failed,
}

impl BatchStatus {
    pub fn from_counts(successful: usize, failed: usize) -> Self {
        if failed == 0 {
            BatchStatus::Completed
        } else if successful > 0 {
            BatchStatus::PartiallyCompleted
        } else {
            BatchStatus::Failed
        }
    }
}

/// Where a submitted request currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Processing,
    Completed,
    NotFound,
}

/// Fixed facts about a batch, captured when execution starts
#[derive(Debug, Clone)]
pub struct BatchMeta {
    pub request_id: String,
    pub kind: BatchKind,
    pub strategy: ExecutionStrategy,
    pub dry_run: bool,
    pub planned_operations: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSummary {
    pub total_amount_in: Decimal,
    pub total_amount_out: Decimal,
    /// total_amount_out / total_amount_in over successful trades
    pub average_price: Decimal,
    pub average_slippage: Decimal,
}

impl TradeSummary {
    /// Summary over successful trades only; zeros when none succeeded
    pub fn from_results(results: &[OperationResult]) -> Self {
        let successful: Vec<&OperationResult> = results.iter().filter(|r| r.is_success()).collect();

        let total_amount_in: Decimal = successful.iter().filter_map(|r| r.amount_in).sum();
        let total_amount_out: Decimal = successful.iter().filter_map(|r| r.amount_out).sum();

        let average_price = if total_amount_in.is_zero() {
            Decimal::ZERO
        } else {
            total_amount_out / total_amount_in
        };

        let impacts: Vec<Decimal> = successful.iter().filter_map(|r| r.price_impact).collect();
        let average_slippage = if impacts.is_empty() {
            Decimal::ZERO
        } else {
            impacts.iter().copied().sum::<Decimal>() / Decimal::from(impacts.len())
        };

        Self {
            total_amount_in,
            total_amount_out,
            average_price,
            average_slippage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub request_id: String,
    pub kind: BatchKind,
    pub status: BatchStatus,
    pub strategy: ExecutionStrategy,
    pub dry_run: bool,
    /// Size of the dispatch plan before any stop-on-failure cut
    pub planned_operations: usize,
    /// Operations actually dispatched (= results.len())
    pub total_operations: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_gas_used: u64,
    pub total_gas_cost: Decimal,
    pub execution_time_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub results: Vec<OperationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_summary: Option<TradeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchResult {
    /// Aggregate dispatched operation results
    pub fn aggregate(meta: BatchMeta, elapsed: Duration, results: Vec<OperationResult>) -> Self {
        let successful = results.iter().filter(|r| r.status == OperationStatus::Success).count();
        let failed = results.iter().filter(|r| r.status == OperationStatus::Failed).count();
        let skipped = results.iter().filter(|r| r.status == OperationStatus::Skipped).count();

        let total_gas_used = results.iter().filter_map(|r| r.gas_used).sum();
        let total_gas_cost = results.iter().filter_map(|r| r.gas_cost).sum();

        Self {
            request_id: meta.request_id,
            kind: meta.kind,
            status: BatchStatus::from_counts(successful, failed),
            strategy: meta.strategy,
            dry_run: meta.dry_run,
            planned_operations: meta.planned_operations,
            total_operations: results.len(),
            successful,
            failed,
            skipped,
            total_gas_used,
            total_gas_cost,
            execution_time_ms: elapsed.as_millis() as u64,
            started_at: meta.started_at,
            completed_at: Utc::now(),
            results,
            trade_summary: None,
            error: None,
        }
    }

    /// Orchestration-level abort: nothing was dispatched
    pub fn aborted(meta: BatchMeta, elapsed: Duration, error: impl Into<String>) -> Self {
        let mut result = Self::aggregate(meta, elapsed, Vec::new());
        result.status = BatchStatus::Failed;
        result.error = Some(error.into());
        result
    }

    pub fn with_trade_summary(mut self) -> Self {
        self.trade_summary = Some(TradeSummary::from_results(&self.results));
        self
    }
}

/// One (signer, asset) leg of a sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepLeg {
    pub asset: AssetId,
    pub symbol: String,
    /// Balance observed before sweeping
    pub balance: Decimal,
    #[serde(flatten)]
    pub result: OperationResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub request_id: String,
    pub destination: Address,
    pub status: BatchStatus,
    pub total_legs: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Amount swept per asset symbol, successful legs only
    pub swept: BTreeMap<String, Decimal>,
    pub total_gas_cost: Decimal,
    pub execution_time_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub legs: Vec<SweepLeg>,
}

impl SweepResult {
    pub fn aggregate(
        request_id: String,
        destination: Address,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        legs: Vec<SweepLeg>,
    ) -> Self {
        let mut swept: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut total_gas_cost = Decimal::ZERO;
        let (mut successful, mut failed, mut skipped) = (0, 0, 0);

        for leg in &legs {
            match leg.result.status {
                OperationStatus::Success => {
                    successful += 1;
                    *swept.entry(leg.symbol.clone()).or_default() +=
                        leg.result.amount_in.unwrap_or_default();
                    total_gas_cost += leg.result.gas_cost.unwrap_or_default();
                }
                OperationStatus::Failed => failed += 1,
                OperationStatus::Skipped => skipped += 1,
            }
        }

        Self {
            request_id,
            destination,
            status: BatchStatus::from_counts(successful, failed),
            total_legs: legs.len(),
            successful,
            failed,
            skipped,
            swept,
            total_gas_cost,
            execution_time_ms: elapsed.as_millis() as u64,
            started_at,
            completed_at: Utc::now(),
            legs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn slot(index: usize) -> OperationSlot {
        OperationSlot {
            operation_index: index,
            item_index: index,
            signer: Address::repeat_byte(index as u8 + 1),
            signer_label: None,
        }
    }

    fn meta(planned: usize) -> BatchMeta {
        BatchMeta {
            request_id: "req-1".to_string(),
            kind: BatchKind::Trade,
            strategy: ExecutionStrategy::Parallel,
            dry_run: false,
            planned_operations: planned,
            started_at: Utc::now(),
        }
    }

    fn trade_success(index: usize, amount_in: Decimal, amount_out: Decimal, impact: Decimal) -> OperationResult {
        let mut result = OperationResult::success(&slot(index));
        result.amount_in = Some(amount_in);
        result.amount_out = Some(amount_out);
        result.price_impact = Some(impact);
        result.gas_used = Some(21_000);
        result.gas_cost = Some(dec!(0.001));
        result
    }

    #[test]
    fn test_status_from_counts() {
        assert_eq!(BatchStatus::from_counts(3, 0), BatchStatus::Completed);
        assert_eq!(BatchStatus::from_counts(0, 0), BatchStatus::Completed);
        assert_eq!(BatchStatus::from_counts(2, 1), BatchStatus::PartiallyCompleted);
        assert_eq!(BatchStatus::from_counts(0, 4), BatchStatus::Failed);
    }

    #[test]
    fn test_aggregate_counts_add_up() {
        let results = vec![
            trade_success(0, dec!(100), dec!(50), dec!(0.01)),
            OperationResult::failed(&slot(1), "boom"),
            OperationResult::skipped(&slot(2), "zero balance"),
        ];
        let batch = BatchResult::aggregate(meta(3), Duration::from_millis(12), results);

        assert_eq!(batch.successful + batch.failed + batch.skipped, batch.total_operations);
        assert_eq!(batch.total_operations, 3);
        assert_eq!(batch.total_gas_used, 21_000);
        assert_eq!(batch.total_gas_cost, dec!(0.001));
        assert_eq!(batch.status, BatchStatus::PartiallyCompleted);
    }

    #[test]
    fn test_trade_summary_is_weighted() {
        let results = vec![
            trade_success(0, dec!(100), dec!(50), dec!(0.01)),
            trade_success(1, dec!(300), dec!(90), dec!(0.03)),
            OperationResult::failed(&slot(2), "reverted"),
        ];
        let summary = TradeSummary::from_results(&results);

        assert_eq!(summary.total_amount_in, dec!(400));
        assert_eq!(summary.total_amount_out, dec!(140));
        assert_eq!(summary.average_price, dec!(0.35));
        assert_eq!(summary.average_slippage, dec!(0.02));
    }

    #[test]
    fn test_trade_summary_all_failed_is_zero() {
        let results = vec![OperationResult::failed(&slot(0), "a"), OperationResult::failed(&slot(1), "b")];
        let summary = TradeSummary::from_results(&results);
        assert_eq!(summary.average_price, Decimal::ZERO);
        assert_eq!(summary.average_slippage, Decimal::ZERO);
    }

    #[test]
    fn test_aborted_batch_is_failed() {
        let batch = BatchResult::aborted(meta(0), Duration::ZERO, "no enabled signers");
        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(batch.total_operations, 0);
        assert_eq!(batch.error.as_deref(), Some("no enabled signers"));
    }

    #[test]
    fn test_sweep_totals_per_symbol() {
        let mut eth = OperationResult::success(&slot(0));
        eth.amount_in = Some(dec!(1.5));
        eth.gas_cost = Some(dec!(0.0004));
        let mut eth2 = OperationResult::success(&slot(1));
        eth2.amount_in = Some(dec!(0.5));
        eth2.gas_cost = Some(dec!(0.0004));

        let legs = vec![
            SweepLeg { asset: AssetId::Native, symbol: "ETH".into(), balance: dec!(1.51), result: eth },
            SweepLeg { asset: AssetId::Native, symbol: "ETH".into(), balance: dec!(0.51), result: eth2 },
            SweepLeg {
                asset: AssetId::Native,
                symbol: "ETH".into(),
                balance: dec!(0),
                result: OperationResult::skipped(&slot(2), "zero balance"),
            },
        ];
        let result = SweepResult::aggregate("s-1".into(), Address::zero(), Utc::now(), Duration::ZERO, legs);

        assert_eq!(result.swept.get("ETH"), Some(&dec!(2.0)));
        assert_eq!(result.total_gas_cost, dec!(0.0008));
        assert_eq!(result.skipped, 1);
        assert_eq!(result.status, BatchStatus::Completed);
    }
}
