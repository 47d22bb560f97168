//! In-memory chain for paper runs and tests
//!
//! `PaperChain` implements every chain-facing trait against a local ledger.
//! Transactions are settled when their receipt is requested: a transfer that
//! cannot be covered at that point is mined as reverted and still pays gas.

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::abi::{decode, encode, ParamType, Token};
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::chain::tx_builder::ERC20_TRANSFER_SELECTOR;
use crate::chain::{
    ChainClient, DexClient, GasEstimate, GasEstimator, GasPriority, GasRequest, PendingTx, Quote,
    SwapParams, SwapReceipt, TxReceipt, TxRequest,
};
use crate::domain::{Asset, AssetId, NATIVE_DECIMALS};
use crate::error::{BatchError, Result};
use crate::signing::Wallet;

pub const NATIVE_TRANSFER_GAS: u64 = 21_000;
pub const TOKEN_TRANSFER_GAS: u64 = 52_000;
pub const SWAP_GAS: u64 = 140_000;

#[derive(Debug, Clone)]
pub struct PaperChainConfig {
    /// Simulated round-trip of every call
    pub latency: Duration,
    /// Standard-priority gas price in native units
    pub gas_price: Decimal,
    /// Rate used for pairs without an explicit one
    pub default_rate: Decimal,
    /// Realized price impact of every swap
    pub price_impact: Decimal,
}

impl Default for PaperChainConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(5),
            gas_price: dec!(0.00000002),
            default_rate: dec!(1),
            price_impact: dec!(0.003),
        }
    }
}

/// Starting state for a paper chain, usually read from JSON
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaperSeed {
    #[serde(default)]
    pub balances: Vec<SeedBalance>,
    #[serde(default)]
    pub rates: Vec<SeedRate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedBalance {
    pub owner: Address,
    #[serde(default)]
    pub asset: Asset,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedRate {
    pub token_in: Address,
    pub token_out: Address,
    pub rate: Decimal,
}

/// A transaction or swap accepted by the paper chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub from: Address,
    pub nonce: u64,
    pub tx_hash: H256,
}

/// Decrements the in-flight counter when the call returns
struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct PaperChain {
    config: PaperChainConfig,
    ledger: Mutex<HashMap<(Address, AssetId), Decimal>>,
    token_decimals: DashMap<Address, u8>,
    rates: DashMap<(Address, Address), Decimal>,
    failures: DashMap<Address, String>,
    mempool: DashMap<H256, TxRequest>,
    submissions: Mutex<Vec<Submission>>,
    tx_counter: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Default for PaperChain {
    fn default() -> Self {
        Self::new(PaperChainConfig::default())
    }
}

impl PaperChain {
    pub fn new(config: PaperChainConfig) -> Self {
        Self {
            config,
            ledger: Mutex::new(HashMap::new()),
            token_decimals: DashMap::new(),
            rates: DashMap::new(),
            failures: DashMap::new(),
            mempool: DashMap::new(),
            submissions: Mutex::new(Vec::new()),
            tx_counter: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn from_seed(config: PaperChainConfig, seed: &PaperSeed) -> Self {
        let chain = Self::new(config);
        for entry in &seed.balances {
            if let Asset::Erc20 { address, decimals, .. } = &entry.asset {
                chain.register_token(*address, *decimals);
            }
            chain.set_balance(entry.owner, entry.asset.id(), entry.amount);
        }
        for rate in &seed.rates {
            chain.set_rate(rate.token_in, rate.token_out, rate.rate);
        }
        info!(
            balances = seed.balances.len(),
            rates = seed.rates.len(),
            "paper chain seeded"
        );
        chain
    }

    pub fn set_balance(&self, owner: Address, asset: AssetId, amount: Decimal) {
        lock(&self.ledger).insert((owner, asset), amount);
    }

    pub fn balance(&self, owner: Address, asset: AssetId) -> Decimal {
        lock(&self.ledger)
            .get(&(owner, asset))
            .copied()
            .unwrap_or_default()
    }

    /// Decimals used to read ERC-20 calldata; unregistered tokens use 18
    pub fn register_token(&self, token: Address, decimals: u8) {
        self.token_decimals.insert(token, decimals);
    }

    pub fn set_rate(&self, token_in: Address, token_out: Address, rate: Decimal) {
        self.rates.insert((token_in, token_out), rate);
    }

    /// Make every submission by `signer` fail with `message`
    pub fn fail_signer(&self, signer: Address, message: impl Into<String>) {
        self.failures.insert(signer, message.into());
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
    }

    pub fn submissions(&self) -> Vec<Submission> {
        lock(&self.submissions).clone()
    }

    /// Nonces submitted by `signer`, in submission order
    pub fn nonces_for(&self, signer: Address) -> Vec<u64> {
        lock(&self.submissions)
            .iter()
            .filter(|s| s.from == signer)
            .map(|s| s.nonce)
            .collect()
    }

    /// Highest number of calls that were ever in flight together
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight {
            counter: &self.in_flight,
        };
        if !self.config.latency.is_zero() {
            sleep(self.config.latency).await;
        }
        guard
    }

    fn check_injected(&self, signer: Address) -> Result<()> {
        match self.failures.get(&signer) {
            Some(message) => Err(BatchError::Chain(message.clone())),
            None => Ok(()),
        }
    }

    /// Hash of the signed (from, nonce, sequence) digest
    fn derive_hash(&self, signer: &Wallet, nonce: u64) -> Result<H256> {
        let sequence = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        let digest = keccak256(encode(&[
            Token::Address(signer.address()),
            Token::Uint(U256::from(nonce)),
            Token::Uint(U256::from(sequence)),
        ]));
        let signature = signer.sign_hash(H256::from(digest))?;
        Ok(H256::from(keccak256(signature.to_vec())))
    }

    fn record(&self, from: Address, nonce: u64, tx_hash: H256) {
        lock(&self.submissions).push(Submission {
            from,
            nonce,
            tx_hash,
        });
    }

    fn rate(&self, token_in: Address, token_out: Address) -> Decimal {
        self.rates
            .get(&(token_in, token_out))
            .map(|rate| *rate)
            .unwrap_or(self.config.default_rate)
    }

    fn price(&self, token_in: Address, token_out: Address, amount_in: Decimal) -> Quote {
        let amount_out = amount_in * self.rate(token_in, token_out) * (Decimal::ONE - self.config.price_impact);
        let effective_price = if amount_in.is_zero() {
            Decimal::ZERO
        } else {
            amount_out / amount_in
        };
        Quote {
            amount_out,
            effective_price,
        }
    }

    /// Recipient and whole-unit amount of an ERC-20 `transfer` call
    fn decode_token_transfer(&self, token: Address, data: &[u8]) -> Option<(Address, Decimal)> {
        if data.len() < 4 || data[..4] != ERC20_TRANSFER_SELECTOR {
            return None;
        }
        let tokens = decode(&[ParamType::Address, ParamType::Uint(256)], &data[4..]).ok()?;
        let (recipient, raw) = match tokens.as_slice() {
            [Token::Address(recipient), Token::Uint(raw)] => (*recipient, *raw),
            _ => return None,
        };
        if raw > U256::from(u128::MAX) {
            return None;
        }

        let decimals = self
            .token_decimals
            .get(&token)
            .map(|d| *d)
            .unwrap_or(NATIVE_DECIMALS);
        let amount = Decimal::try_from_i128_with_scale(raw.as_u128() as i128, u32::from(decimals)).ok()?;
        Some((recipient, amount))
    }

    /// Apply a mined transaction; false when it reverts
    fn settle(&self, tx: &TxRequest, gas_cost: Decimal) -> bool {
        let mut ledger = lock(&self.ledger);
        let native_key = (tx.from, AssetId::Native);
        let native = ledger.get(&native_key).copied().unwrap_or_default();

        let token_leg = if tx.data.is_empty() {
            None
        } else {
            match self.decode_token_transfer(tx.to, &tx.data) {
                Some(leg) => Some(leg),
                None => {
                    ledger.insert(native_key, (native - gas_cost).max(Decimal::ZERO));
                    return false;
                }
            }
        };

        let native_needed = tx.value + gas_cost;
        let covered = native >= native_needed
            && match token_leg {
                Some((_, amount)) => {
                    ledger
                        .get(&(tx.from, AssetId::Token(tx.to)))
                        .copied()
                        .unwrap_or_default()
                        >= amount
                }
                None => true,
            };

        if !covered {
            ledger.insert(native_key, (native - gas_cost).max(Decimal::ZERO));
            return false;
        }

        ledger.insert(native_key, native - native_needed);
        match token_leg {
            Some((recipient, amount)) => {
                let token = AssetId::Token(tx.to);
                *ledger.entry((tx.from, token)).or_default() -= amount;
                *ledger.entry((recipient, token)).or_default() += amount;
            }
            None => {
                *ledger.entry((tx.to, AssetId::Native)).or_default() += tx.value;
            }
        }
        true
    }
}

#[async_trait]
impl ChainClient for PaperChain {
    async fn get_balance(&self, owner: Address, asset: AssetId) -> Result<Decimal> {
        let _flight = self.enter().await;
        Ok(self.balance(owner, asset))
    }

    async fn send_transaction(&self, signer: &Wallet, tx: TxRequest) -> Result<PendingTx> {
        let _flight = self.enter().await;
        self.check_injected(signer.address())?;

        if tx.from != signer.address() {
            return Err(BatchError::Wallet(format!(
                "transaction from {:?} signed by {:?}",
                tx.from,
                signer.address()
            )));
        }

        let tx_hash = self.derive_hash(signer, tx.nonce)?;
        let pending = PendingTx {
            tx_hash,
            from: tx.from,
            nonce: tx.nonce,
        };
        self.record(tx.from, tx.nonce, tx_hash);
        debug!(from = ?tx.from, nonce = tx.nonce, tx_hash = ?tx_hash, "paper transaction accepted");

        self.mempool.insert(tx_hash, tx);
        Ok(pending)
    }

    async fn wait_for_receipt(&self, pending: &PendingTx) -> Result<TxReceipt> {
        let _flight = self.enter().await;
        let (_, tx) = self.mempool.remove(&pending.tx_hash).ok_or_else(|| {
            BatchError::ChainTimeout(format!("transaction {:?} was never seen", pending.tx_hash))
        })?;

        let intrinsic = if tx.data.is_empty() {
            NATIVE_TRANSFER_GAS
        } else {
            TOKEN_TRANSFER_GAS
        };
        let gas_used = intrinsic.min(tx.gas_limit);
        let gas_cost = Decimal::from(gas_used) * tx.gas_price;
        let success = self.settle(&tx, gas_cost);

        Ok(TxReceipt {
            tx_hash: pending.tx_hash,
            gas_used,
            effective_gas_price: tx.gas_price,
            success,
        })
    }
}

#[async_trait]
impl GasEstimator for PaperChain {
    async fn estimate(&self, request: &GasRequest) -> Result<GasEstimate> {
        let _flight = self.enter().await;
        let gas_limit = if request.data.is_empty() {
            NATIVE_TRANSFER_GAS
        } else {
            TOKEN_TRANSFER_GAS
        };
        let multiplier = match request.priority.unwrap_or_default() {
            GasPriority::Low => dec!(0.8),
            GasPriority::Standard => Decimal::ONE,
            GasPriority::High => dec!(1.5),
        };
        Ok(GasEstimate {
            gas_limit,
            gas_price: self.config.gas_price * multiplier,
        })
    }
}

#[async_trait]
impl DexClient for PaperChain {
    async fn quote(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: Decimal,
        _slippage_tolerance: Decimal,
    ) -> Result<Quote> {
        let _flight = self.enter().await;
        Ok(self.price(token_in, token_out, amount_in))
    }

    async fn swap(&self, params: &SwapParams, signer: &Wallet, nonce: u64) -> Result<SwapReceipt> {
        let _flight = self.enter().await;
        let from = signer.address();
        self.check_injected(from)?;

        if self.config.price_impact > params.slippage_tolerance {
            return Err(BatchError::Dex(format!(
                "price impact {} exceeds slippage tolerance {}",
                self.config.price_impact, params.slippage_tolerance
            )));
        }

        let quote = self.price(params.token_in, params.token_out, params.amount_in);
        {
            let mut ledger = lock(&self.ledger);
            let key_in = (from, AssetId::Token(params.token_in));
            let available = ledger.get(&key_in).copied().unwrap_or_default();
            if available < params.amount_in {
                return Err(BatchError::InsufficientBalance {
                    asset: AssetId::Token(params.token_in).to_string(),
                    required: params.amount_in,
                    available,
                });
            }
            ledger.insert(key_in, available - params.amount_in);
            *ledger
                .entry((from, AssetId::Token(params.token_out)))
                .or_default() += quote.amount_out;
        }

        let tx_hash = self.derive_hash(signer, nonce)?;
        self.record(from, nonce, tx_hash);

        Ok(SwapReceipt {
            tx_hash,
            amount_out: quote.amount_out,
            gas_used: SWAP_GAS,
            gas_cost: Decimal::from(SWAP_GAS) * self.config.gas_price,
            effective_price: quote.effective_price,
            price_impact: self.config.price_impact,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::build_transfer_call;

    const KEY_0: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn quiet() -> PaperChainConfig {
        PaperChainConfig {
            latency: Duration::ZERO,
            ..PaperChainConfig::default()
        }
    }

    fn tx(wallet: &Wallet, to: Address, value: Decimal, nonce: u64) -> TxRequest {
        TxRequest {
            from: wallet.address(),
            to,
            value,
            data: Default::default(),
            nonce,
            gas_limit: NATIVE_TRANSFER_GAS,
            gas_price: dec!(0.00000001),
        }
    }

    #[tokio::test]
    async fn test_native_transfer_settles_with_gas() {
        let chain = PaperChain::new(quiet());
        let wallet = Wallet::from_private_key(KEY_0, 1).unwrap();
        let bob = Address::repeat_byte(0xb0);
        chain.set_balance(wallet.address(), AssetId::Native, dec!(1));

        let pending = chain
            .send_transaction(&wallet, tx(&wallet, bob, dec!(0.5), 0))
            .await
            .unwrap();
        let receipt = chain.wait_for_receipt(&pending).await.unwrap();

        assert!(receipt.success);
        assert_eq!(receipt.gas_cost(), dec!(0.00021));
        assert_eq!(chain.balance(bob, AssetId::Native), dec!(0.5));
        assert_eq!(chain.balance(wallet.address(), AssetId::Native), dec!(0.49979));
        assert_eq!(chain.nonces_for(wallet.address()), vec![0]);
    }

    #[tokio::test]
    async fn test_uncovered_transfer_reverts() {
        let chain = PaperChain::new(quiet());
        let wallet = Wallet::from_private_key(KEY_0, 1).unwrap();
        chain.set_balance(wallet.address(), AssetId::Native, dec!(0.5));

        let pending = chain
            .send_transaction(&wallet, tx(&wallet, Address::repeat_byte(1), dec!(0.5), 0))
            .await
            .unwrap();
        let receipt = chain.wait_for_receipt(&pending).await.unwrap();

        assert!(!receipt.success);
        assert_eq!(chain.balance(Address::repeat_byte(1), AssetId::Native), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_token_transfer_reads_calldata() {
        let chain = PaperChain::new(quiet());
        let wallet = Wallet::from_private_key(KEY_0, 1).unwrap();
        let usdc = Asset::erc20(Address::repeat_byte(0xcc), "USDC", 6);
        let bob = Address::repeat_byte(0xb0);
        chain.register_token(Address::repeat_byte(0xcc), 6);
        chain.set_balance(wallet.address(), AssetId::Native, dec!(1));
        chain.set_balance(wallet.address(), usdc.id(), dec!(250));

        let call = build_transfer_call(&usdc, bob, dec!(100.5)).unwrap();
        let mut request = tx(&wallet, call.to, call.value, 0);
        request.data = call.data;
        request.gas_limit = TOKEN_TRANSFER_GAS;

        let pending = chain.send_transaction(&wallet, request).await.unwrap();
        assert!(chain.wait_for_receipt(&pending).await.unwrap().success);
        assert_eq!(chain.balance(bob, usdc.id()), dec!(100.5));
        assert_eq!(chain.balance(wallet.address(), usdc.id()), dec!(149.5));
    }

    #[tokio::test]
    async fn test_injected_failure_and_distinct_hashes() {
        let chain = PaperChain::new(quiet());
        let wallet = Wallet::from_private_key(KEY_0, 1).unwrap();
        chain.set_balance(wallet.address(), AssetId::Native, dec!(1));

        let a = chain
            .send_transaction(&wallet, tx(&wallet, Address::repeat_byte(1), dec!(0.1), 0))
            .await
            .unwrap();
        let b = chain
            .send_transaction(&wallet, tx(&wallet, Address::repeat_byte(1), dec!(0.1), 1))
            .await
            .unwrap();
        assert_ne!(a.tx_hash, b.tx_hash);

        chain.fail_signer(wallet.address(), "nonce too low");
        let err = chain
            .send_transaction(&wallet, tx(&wallet, Address::repeat_byte(1), dec!(0.1), 2))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nonce too low"));
    }

    #[tokio::test]
    async fn test_swap_moves_balances_at_rate() {
        let chain = PaperChain::new(quiet());
        let wallet = Wallet::from_private_key(KEY_0, 1).unwrap();
        let (usdc, weth) = (Address::repeat_byte(0xcc), Address::repeat_byte(0xee));
        chain.set_rate(usdc, weth, dec!(0.0005));
        chain.set_balance(wallet.address(), AssetId::Token(usdc), dec!(2000));

        let params = SwapParams {
            token_in: usdc,
            token_out: weth,
            amount_in: dec!(1000),
            slippage_tolerance: dec!(0.01),
            deadline: None,
        };
        let receipt = chain.swap(&params, &wallet, 0).await.unwrap();

        assert_eq!(receipt.amount_out, dec!(0.4985));
        assert_eq!(chain.balance(wallet.address(), AssetId::Token(usdc)), dec!(1000));
        assert_eq!(chain.balance(wallet.address(), AssetId::Token(weth)), dec!(0.4985));

        let mut tight = params.clone();
        tight.slippage_tolerance = dec!(0.001);
        assert!(chain.swap(&tight, &wallet, 1).await.is_err());
    }

    #[test]
    fn test_seed_from_json() {
        let seed: PaperSeed = serde_json::from_str(
            r#"{"balances":[
                {"owner":"0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266","amount":"1.5"},
                {"owner":"0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266",
                 "asset":{"type":"erc20","address":"0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48","symbol":"USDC","decimals":6},
                 "amount":"250"}
            ]}"#,
        )
        .unwrap();
        let chain = PaperChain::from_seed(quiet(), &seed);
        let owner = seed.balances[0].owner;

        assert_eq!(chain.balance(owner, AssetId::Native), dec!(1.5));
        assert_eq!(chain.balance(owner, seed.balances[1].asset.id()), dec!(250));
    }
}
