mod common;

use common::*;
use ethers::types::Address;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use wallet_batch::config::AppConfig;
use wallet_batch::domain::{
    Asset, AssetId, BatchStatus, ExecutionStrategy, FailureStrategy, OperationStatus, RequestState,
    SignerConfig, SweepRequest, TransferBatchRequest, TransferParams,
};

const RECIPIENT: &str = "0x000000000000000000000000000000000000dEaD";

fn native_transfer(amount: Decimal) -> TransferParams {
    TransferParams {
        recipient: RECIPIENT.to_string(),
        amount,
        asset: Asset::native(),
    }
}

fn request(transfers: Vec<TransferParams>, signer_count: usize, strategy: ExecutionStrategy) -> TransferBatchRequest {
    TransferBatchRequest {
        transfers,
        signers: signers(signer_count),
        execution_strategy: strategy,
        failure_strategy: FailureStrategy::ContinueOnFailure,
        max_concurrency: None,
        delay_between_transfers_ms: None,
        gas_priority: None,
        dry_run: false,
    }
}

fn sweep_request(signer_count: usize, destination: &str) -> SweepRequest {
    SweepRequest {
        signers: signers(signer_count),
        destination: destination.to_string(),
        assets: vec![Asset::native()],
        reserve_gas: true,
        gas_reserve: None,
        min_amount: None,
        max_concurrency: None,
        gas_priority: None,
    }
}

#[tokio::test]
async fn round_robin_alternates_senders() {
    let h = harness(1);
    fund_native(&h.chain, KEYS[0], dec!(1));
    fund_native(&h.chain, KEYS[1], dec!(1));

    let result = h
        .service
        .transfers()
        .submit_batch_transfer(request(
            (1..=4).map(|i| native_transfer(Decimal::new(i, 2))).collect(),
            2,
            ExecutionStrategy::RoundRobin,
        ))
        .await
        .unwrap();

    assert_eq!(result.status, BatchStatus::Completed);
    let order: Vec<usize> = result.results.iter().map(|r| r.operation_index).collect();
    assert_eq!(order, vec![0, 1, 2, 3]);

    let (a, b) = (address_of(KEYS[0]), address_of(KEYS[1]));
    let senders: Vec<Address> = result.results.iter().map(|r| r.signer).collect();
    assert_eq!(senders, vec![a, b, a, b]);

    let nonces: Vec<Option<u64>> = result.results.iter().map(|r| r.nonce).collect();
    assert_eq!(nonces, vec![Some(0), Some(0), Some(1), Some(1)]);

    // 0.01 + 0.03 from the first signer, 0.02 + 0.04 from the second
    assert_eq!(h.chain.balance(token(RECIPIENT), AssetId::Native), dec!(0.10));
    assert_eq!(
        h.service.transfers().get_batch_status(&result.request_id),
        RequestState::Completed
    );
    assert!(h.service.transfers().get_transfer_result(&result.request_id).is_some());
}

#[tokio::test]
async fn parallel_transfers_use_gapless_nonces() {
    let h = harness(2);
    for key in &KEYS[..3] {
        fund_native(&h.chain, key, dec!(5));
    }

    let mut req = request(
        (0..9).map(|_| native_transfer(dec!(0.1))).collect(),
        3,
        ExecutionStrategy::Parallel,
    );
    req.max_concurrency = Some(4);
    let result = h.service.transfers().submit_batch_transfer(req).await.unwrap();

    assert_eq!(result.successful, 9);
    assert_eq!(result.total_gas_used, 9 * 21_000);
    for key in &KEYS[..3] {
        let signer = address_of(key);
        assert_contiguous(&h.chain.nonces_for(signer));
        assert_eq!(h.nonces.last_confirmed(signer), Some(2));
    }
    assert!(h.chain.peak_in_flight() <= 4);
}

#[tokio::test]
async fn bad_recipient_stops_a_sequential_batch() {
    let h = harness(1);
    fund_native(&h.chain, KEYS[0], dec!(1));

    let mut transfers: Vec<TransferParams> = (0..3).map(|_| native_transfer(dec!(0.1))).collect();
    transfers[1].recipient = "0xnot-an-address".to_string();
    let mut req = request(transfers, 1, ExecutionStrategy::Sequential);
    req.failure_strategy = FailureStrategy::StopOnFirstFailure;

    let result = h.service.transfers().submit_batch_transfer(req).await.unwrap();

    assert_eq!(result.planned_operations, 3);
    assert_eq!(result.total_operations, 2);
    assert_eq!(result.status, BatchStatus::PartiallyCompleted);
    assert!(result.results[1]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("Invalid address"));
    // The failed leg never reserved a nonce
    assert_eq!(h.nonces.reservations(address_of(KEYS[0])), vec![0]);
}

#[tokio::test]
async fn retry_failed_runs_like_continue() {
    let h = harness(1);
    fund_native(&h.chain, KEYS[0], dec!(1));
    fund_native(&h.chain, KEYS[1], dec!(1));
    h.chain.fail_signer(address_of(KEYS[1]), "rpc unavailable");

    let mut req = request(
        (0..4).map(|_| native_transfer(dec!(0.1))).collect(),
        2,
        ExecutionStrategy::Sequential,
    );
    req.failure_strategy = FailureStrategy::RetryFailed;
    let result = h.service.transfers().submit_batch_transfer(req).await.unwrap();

    assert_eq!(result.total_operations, 4);
    assert_eq!(result.successful, 2);
    assert_eq!(result.failed, 2);
    assert_eq!(result.successful + result.failed + result.skipped, result.total_operations);

    let failing = address_of(KEYS[1]);
    assert!(h.chain.nonces_for(failing).is_empty());
    // Both reservations were handed back, so the ledger reuses nonce 0
    assert_eq!(h.nonces.next_nonce(failing), 0);
    assert_eq!(h.nonces.pending_count(failing), 0);
    assert!(h.nonces.issued_nonces(failing).is_empty());
}

#[tokio::test]
async fn dry_run_transfer_estimates_only() {
    let h = harness(1);
    fund_native(&h.chain, KEYS[0], dec!(1));

    let mut req = request(vec![native_transfer(dec!(0.5))], 1, ExecutionStrategy::Sequential);
    req.dry_run = true;
    let result = h.service.transfers().submit_batch_transfer(req).await.unwrap();

    assert_eq!(result.successful, 1);
    assert!(result.results[0].tx_hash.is_none());
    assert!(h.chain.submissions().is_empty());
    assert_eq!(h.chain.balance(address_of(KEYS[0]), AssetId::Native), dec!(1));
}

#[tokio::test]
async fn sweep_skips_by_reason_and_moves_the_rest() {
    let h = harness(1);
    fund_native(&h.chain, KEYS[0], dec!(0.01));
    fund_native(&h.chain, KEYS[2], dec!(1.0));
    fund_native(&h.chain, KEYS[3], dec!(0.015));

    let mut req = sweep_request(4, RECIPIENT);
    req.min_amount = Some(dec!(0.001));
    let first = h.service.transfers().sweep_funds(req).await.unwrap();

    let reasons: Vec<Option<&str>> = first
        .legs
        .iter()
        .map(|leg| leg.result.skip_reason.as_deref())
        .collect();
    assert_eq!(
        reasons,
        vec![
            Some("insufficient balance after gas reserve"),
            Some("zero balance"),
            None,
            None,
        ]
    );
    assert_eq!(first.legs[2].result.status, OperationStatus::Success);
    assert_eq!(first.legs[2].result.amount_in, Some(dec!(0.99)));
    assert_eq!(first.legs[3].result.amount_in, Some(dec!(0.005)));
    assert_eq!(first.swept.get("ETH"), Some(&dec!(0.995)));
    assert_eq!(first.successful + first.failed + first.skipped, first.total_legs);

    let mut strict = sweep_request(1, RECIPIENT);
    strict.signers = vec![signers(4).remove(3)];
    fund_native(&h.chain, KEYS[3], dec!(0.015));
    strict.min_amount = Some(dec!(0.01));
    let second = h.service.transfers().sweep_funds(strict).await.unwrap();
    assert_eq!(
        second.legs[0].result.skip_reason.as_deref(),
        Some("below minimum sweep amount")
    );
    assert_eq!(second.status, BatchStatus::Completed);
    assert!(h.service.transfers().get_sweep_result(&second.request_id).is_some());
}

#[tokio::test]
async fn sweep_moves_tokens_and_native() {
    let h = harness(1);
    let usdc = token(USDC);
    h.chain.register_token(usdc, 6);
    for key in &KEYS[..2] {
        fund_native(&h.chain, key, dec!(0.5));
        fund_token(&h.chain, key, USDC, dec!(250.5));
    }

    let mut req = sweep_request(2, RECIPIENT);
    req.assets = vec![Asset::erc20(usdc, "USDC", 6), Asset::native()];
    req.max_concurrency = Some(2);
    let result = h.service.transfers().sweep_funds(req).await.unwrap();

    assert_eq!(result.status, BatchStatus::Completed);
    assert_eq!(result.successful, 4);
    let order: Vec<usize> = result.legs.iter().map(|leg| leg.result.operation_index).collect();
    assert_eq!(order, vec![0, 1, 2, 3]);

    let destination = token(RECIPIENT);
    assert_eq!(h.chain.balance(destination, AssetId::Token(usdc)), dec!(501));
    assert_eq!(result.swept.get("USDC"), Some(&dec!(501)));
    for key in &KEYS[..2] {
        let signer = address_of(key);
        assert_eq!(h.chain.balance(signer, AssetId::Token(usdc)), Decimal::ZERO);
        assert_eq!(h.chain.nonces_for(signer), vec![0, 1]);
    }
}

#[tokio::test]
async fn sweep_rejects_bad_destination() {
    let h = harness(0);
    let err = h
        .service
        .transfers()
        .sweep_funds(sweep_request(1, "vault"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Invalid address"));
}

#[tokio::test]
async fn all_signers_disabled_fails_the_transfer_batch() {
    let h = harness(0);
    let mut req = request(vec![native_transfer(dec!(1))], 1, ExecutionStrategy::Parallel);
    req.signers[0].enabled = false;

    let result = h.service.transfers().submit_batch_transfer(req).await.unwrap();
    assert_eq!(result.status, BatchStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("no enabled signers"));
}

#[tokio::test]
async fn failed_sweep_legs_do_not_block_the_others() {
    let h = harness(1);
    let usdc = token(USDC);
    h.chain.register_token(usdc, 2);
    for key in &KEYS[..3] {
        fund_native(&h.chain, key, dec!(0.5));
    }
    // Finer than the token's two decimals, so this leg cannot be encoded
    fund_token(&h.chain, KEYS[0], USDC, dec!(10.123));
    fund_token(&h.chain, KEYS[1], USDC, dec!(10.12));
    fund_token(&h.chain, KEYS[2], USDC, dec!(5));
    h.chain.fail_signer(address_of(KEYS[2]), "rpc unavailable");

    let mut req = sweep_request(3, RECIPIENT);
    req.assets = vec![Asset::erc20(usdc, "USDC", 2), Asset::native()];
    req.max_concurrency = Some(3);
    let result = h.service.transfers().sweep_funds(req).await.unwrap();

    let statuses: Vec<OperationStatus> = result.legs.iter().map(|leg| leg.result.status).collect();
    assert_eq!(
        statuses,
        vec![
            OperationStatus::Failed,
            OperationStatus::Success,
            OperationStatus::Success,
            OperationStatus::Success,
            OperationStatus::Failed,
            OperationStatus::Failed,
        ]
    );
    assert!(result.legs[0]
        .result
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("decimal places"));
    assert!(result.legs[4]
        .result
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("rpc unavailable"));

    assert_eq!(result.status, BatchStatus::PartiallyCompleted);
    assert_eq!((result.successful, result.failed, result.skipped), (3, 3, 0));
    assert_eq!(result.successful + result.failed + result.skipped, result.total_legs);

    // The first signer's native leg still went out, on the nonce its token leg never used
    assert_eq!(h.chain.nonces_for(address_of(KEYS[0])), vec![0]);
    assert_eq!(h.chain.nonces_for(address_of(KEYS[1])), vec![0, 1]);
    assert_eq!(h.chain.balance(token(RECIPIENT), AssetId::Token(usdc)), dec!(10.12));
    assert_eq!(h.chain.balance(address_of(KEYS[0]), AssetId::Token(usdc)), dec!(10.123));
}

#[tokio::test]
async fn sweep_size_limit_counts_enabled_signers_only() {
    let mut config = AppConfig::default();
    config.batch.max_batch_size = 2;
    let h = harness_with(1, config);
    for key in &KEYS[..3] {
        fund_native(&h.chain, key, dec!(0.5));
    }

    let mut req = sweep_request(3, RECIPIENT);
    req.signers[2] = SignerConfig::new(KEYS[2]).disabled();
    let result = h.service.transfers().sweep_funds(req).await.unwrap();
    assert_eq!(result.total_legs, 2);
    assert_eq!(result.status, BatchStatus::Completed);

    let err = h
        .service
        .transfers()
        .sweep_funds(sweep_request(3, RECIPIENT))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exceeds maximum of 2"));
}
