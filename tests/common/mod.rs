#![allow(dead_code)]

use ethers::types::Address;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use wallet_batch::adapters::{PaperChain, PaperChainConfig};
use wallet_batch::config::AppConfig;
use wallet_batch::domain::{AssetId, SignerConfig};
use wallet_batch::service::BatchService;
use wallet_batch::signing::{InMemoryNonceLedger, Wallet};

/// Well-known development keys
pub const KEYS: [&str; 6] = [
    "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
    "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
    "0x5de4111afa1a4b94908f83103eb1f1706367c2e68ca870fc3fb9a804cdab365a",
    "0x7c852118294e51e653712a81e05800f419141751be58f605c371e15141b007a6",
    "0x47e179ec197488593b187f80a00eb0da91f1b9d0b13f8733639f19c30a34926a",
    "0x8b3a350cf5c34c9194ca85829a2df0ec3153be0318b5e2d3348e872092edffba",
];

pub const USDC: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";
pub const WETH: &str = "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2";

pub struct Harness {
    pub chain: Arc<PaperChain>,
    pub nonces: Arc<InMemoryNonceLedger>,
    pub service: BatchService,
}

pub fn harness(latency_ms: u64) -> Harness {
    harness_with(latency_ms, AppConfig::default())
}

pub fn harness_with(latency_ms: u64, config: AppConfig) -> Harness {
    let chain = Arc::new(PaperChain::new(PaperChainConfig {
        latency: Duration::from_millis(latency_ms),
        ..PaperChainConfig::default()
    }));
    let nonces = Arc::new(InMemoryNonceLedger::new());
    let service = BatchService::paper(config, chain.clone(), nonces.clone());
    Harness {
        chain,
        nonces,
        service,
    }
}

pub fn address_of(key: &str) -> Address {
    Wallet::from_private_key(key, 1)
        .expect("test key parses")
        .address()
}

pub fn token(raw: &str) -> Address {
    raw.parse().expect("test token address parses")
}

pub fn signers(count: usize) -> Vec<SignerConfig> {
    KEYS[..count]
        .iter()
        .enumerate()
        .map(|(i, key)| SignerConfig::new(*key).with_label(format!("wallet-{}", i)))
        .collect()
}

pub fn fund_token(chain: &PaperChain, key: &str, raw_token: &str, amount: Decimal) {
    chain.set_balance(address_of(key), AssetId::Token(token(raw_token)), amount);
}

pub fn fund_native(chain: &PaperChain, key: &str, amount: Decimal) {
    chain.set_balance(address_of(key), AssetId::Native, amount);
}

/// Every nonce list is 0, 1, 2, ... with no repeats
pub fn assert_contiguous(nonces: &[u64]) {
    let expected: Vec<u64> = (0..nonces.len() as u64).collect();
    assert_eq!(nonces, expected.as_slice(), "nonces must be gapless and increasing");
}
