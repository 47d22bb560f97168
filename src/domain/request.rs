use chrono::{DateTime, Utc};
use ethers::types::Address;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::asset::{parse_address, Asset};
use crate::chain::GasPriority;
use crate::error::ValidationError;
use crate::signing::Wallet;

/// Largest accepted slippage tolerance (50%)
pub const MAX_SLIPPAGE: Decimal = dec!(0.5);

/// How a batch's operations are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    #[default]
    Sequential,
    Parallel,
    Staggered,
    RoundRobin,
}

impl ExecutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Staggered => "staggered",
            Self::RoundRobin => "round_robin",
        }
    }
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happens to the rest of a batch after an operation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    #[default]
    ContinueOnFailure,
    StopOnFirstFailure,
    /// Accepted for compatibility; batches do not retry and treat it as continue
    RetryFailed,
}

impl FailureStrategy {
    pub fn stops_on_failure(&self) -> bool {
        matches!(self, FailureStrategy::StopOnFirstFailure)
    }
}

/// One signing identity offered to a batch
#[derive(Clone, Serialize, Deserialize)]
pub struct SignerConfig {
    /// Hex private key; never serialized back out
    #[serde(skip_serializing, default)]
    pub private_key: String,
    #[serde(default)]
    pub label: Option<String>,
    /// Largest amount a single operation may move for this signer
    #[serde(default)]
    pub max_amount: Option<Decimal>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SignerConfig {
    pub fn new(private_key: impl Into<String>) -> Self {
        Self {
            private_key: private_key.into(),
            label: None,
            max_amount: None,
            enabled: true,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_max_amount(mut self, max_amount: Decimal) -> Self {
        self.max_amount = Some(max_amount);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl Drop for SignerConfig {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

impl std::fmt::Debug for SignerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerConfig")
            .field("label", &self.label)
            .field("max_amount", &self.max_amount)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// A parsed signer ready for scheduling
#[derive(Debug, Clone)]
pub struct Signer {
    pub wallet: Wallet,
    pub label: Option<String>,
    pub max_amount: Option<Decimal>,
    pub enabled: bool,
}

impl Signer {
    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Fails when `amount` is above the signer's cap
    pub fn check_cap(&self, amount: Decimal) -> Result<(), String> {
        match self.max_amount {
            Some(cap) if amount > cap => Err(format!(
                "amount {} exceeds signer limit {}",
                amount, cap
            )),
            _ => Ok(()),
        }
    }
}

/// Parse every signer credential; the whole list fails on the first bad key
pub fn parse_signers(configs: &[SignerConfig], chain_id: u64) -> Result<Vec<Signer>, ValidationError> {
    configs
        .iter()
        .enumerate()
        .map(|(index, cfg)| {
            let wallet = Wallet::from_private_key(&cfg.private_key, chain_id).map_err(|e| {
                ValidationError::InvalidCredential {
                    index,
                    reason: e.to_string(),
                }
            })?;
            Ok(Signer {
                wallet,
                label: cfg.label.clone(),
                max_amount: cfg.max_amount,
                enabled: cfg.enabled,
            })
        })
        .collect()
}

/// One swap to run for every enabled signer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeParams {
    pub token_in: String,
    pub token_out: String,
    pub amount_in: Decimal,
    pub slippage_tolerance: Decimal,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

/// TradeParams with parsed token addresses
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedTrade {
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: Decimal,
    pub slippage_tolerance: Decimal,
    pub deadline: Option<DateTime<Utc>>,
}

impl TradeParams {
    pub fn validate(&self, index: usize) -> Result<ValidatedTrade, ValidationError> {
        let token_in = parse_address(&format!("trades[{index}].token_in"), &self.token_in)?;
        let token_out = parse_address(&format!("trades[{index}].token_out"), &self.token_out)?;

        if token_in == token_out {
            return Err(ValidationError::IdenticalTokens {
                field: format!("trades[{index}]"),
            });
        }

        if self.amount_in <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveAmount {
                field: format!("trades[{index}].amount_in"),
                value: self.amount_in,
            });
        }

        if self.slippage_tolerance <= Decimal::ZERO || self.slippage_tolerance > MAX_SLIPPAGE {
            return Err(ValidationError::SlippageOutOfRange {
                field: format!("trades[{index}]"),
                value: self.slippage_tolerance,
            });
        }

        Ok(ValidatedTrade {
            token_in,
            token_out,
            amount_in: self.amount_in,
            slippage_tolerance: self.slippage_tolerance,
            deadline: self.deadline,
        })
    }
}

/// Multi-wallet trade batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeBatchRequest {
    pub trades: Vec<TradeParams>,
    pub signers: Vec<SignerConfig>,
    #[serde(default)]
    pub execution_strategy: ExecutionStrategy,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    /// Parallel ceiling; defaults to min(5, signer count)
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Sequential pause, or per-index offset for staggered
    #[serde(default)]
    pub delay_between_trades_ms: Option<u64>,
    #[serde(default)]
    pub dry_run: bool,
}

/// One transfer; the sender is picked by the batch strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferParams {
    /// Checked per operation, so a bad recipient fails only its own transfer
    pub recipient: String,
    pub amount: Decimal,
    #[serde(default)]
    pub asset: Asset,
}

impl TransferParams {
    pub fn validate(&self, index: usize) -> Result<(), ValidationError> {
        if self.amount <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveAmount {
                field: format!("transfers[{index}].amount"),
                value: self.amount,
            });
        }
        Ok(())
    }
}

/// Multi-wallet transfer batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferBatchRequest {
    pub transfers: Vec<TransferParams>,
    pub signers: Vec<SignerConfig>,
    #[serde(default)]
    pub execution_strategy: ExecutionStrategy,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub delay_between_transfers_ms: Option<u64>,
    #[serde(default)]
    pub gas_priority: Option<GasPriority>,
    #[serde(default)]
    pub dry_run: bool,
}

/// Consolidate balances from many signers into one destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepRequest {
    pub signers: Vec<SignerConfig>,
    pub destination: String,
    #[serde(default = "default_sweep_assets")]
    pub assets: Vec<Asset>,
    /// Keep some native currency behind for future fees
    #[serde(default = "default_enabled")]
    pub reserve_gas: bool,
    /// Overrides the configured default reserve
    #[serde(default)]
    pub gas_reserve: Option<Decimal>,
    /// Legs below this amount are skipped
    #[serde(default)]
    pub min_amount: Option<Decimal>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub gas_priority: Option<GasPriority>,
}

fn default_sweep_assets() -> Vec<Asset> {
    vec![Asset::native()]
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_0: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const USDC: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";
    const WETH: &str = "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2";

    fn trade(amount: Decimal, slippage: Decimal) -> TradeParams {
        TradeParams {
            token_in: USDC.to_string(),
            token_out: WETH.to_string(),
            amount_in: amount,
            slippage_tolerance: slippage,
            deadline: None,
        }
    }

    #[test]
    fn test_slippage_bounds() {
        assert!(trade(dec!(10), dec!(0.5)).validate(0).is_ok());
        assert!(trade(dec!(10), dec!(0.01)).validate(0).is_ok());
        assert!(matches!(
            trade(dec!(10), dec!(0)).validate(0),
            Err(ValidationError::SlippageOutOfRange { .. })
        ));
        assert!(matches!(
            trade(dec!(10), dec!(0.51)).validate(0),
            Err(ValidationError::SlippageOutOfRange { .. })
        ));
    }

    #[test]
    fn test_trade_requires_positive_amount_and_distinct_tokens() {
        assert!(matches!(
            trade(dec!(0), dec!(0.01)).validate(2),
            Err(ValidationError::NonPositiveAmount { ref field, .. }) if field == "trades[2].amount_in"
        ));

        let mut same = trade(dec!(1), dec!(0.01));
        same.token_out = USDC.to_string();
        assert!(matches!(same.validate(0), Err(ValidationError::IdenticalTokens { .. })));

        let mut bad = trade(dec!(1), dec!(0.01));
        bad.token_in = "USDC".to_string();
        assert!(matches!(bad.validate(0), Err(ValidationError::MalformedAddress { .. })));
    }

    #[test]
    fn test_parse_signers_reports_bad_index() {
        let configs = vec![SignerConfig::new(KEY_0), SignerConfig::new("0x1234")];
        let err = parse_signers(&configs, 1).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidCredential { index: 1, .. }));
    }

    #[test]
    fn test_signer_cap() {
        let signers = parse_signers(&[SignerConfig::new(KEY_0).with_max_amount(dec!(5))], 1).unwrap();
        assert!(signers[0].check_cap(dec!(5)).is_ok());
        assert!(signers[0].check_cap(dec!(5.01)).unwrap_err().contains("exceeds signer limit"));
    }

    #[test]
    fn test_signer_config_never_serializes_key() {
        let cfg = SignerConfig::new(KEY_0).with_label("hot-1");
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("ac0974"));
        assert!(!format!("{:?}", cfg).contains("ac0974"));
    }

    #[test]
    fn test_request_defaults() {
        let json = format!(
            r#"{{"trades":[{{"token_in":"{USDC}","token_out":"{WETH}","amount_in":"1","slippage_tolerance":"0.01"}}],
                "signers":[{{"private_key":"{KEY_0}"}}]}}"#
        );
        let request: TradeBatchRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(request.execution_strategy, ExecutionStrategy::Sequential);
        assert_eq!(request.failure_strategy, FailureStrategy::ContinueOnFailure);
        assert!(request.signers[0].enabled);
        assert!(!request.dry_run);
    }
}
