//! Chain-facing collaborators.
//!
//! The batch engines only talk to the outside world through these traits:
//! balance reads and transaction submission (`ChainClient`), swaps
//! (`DexClient`) and fee estimation (`GasEstimator`).

pub mod traits;
pub mod tx_builder;

pub use traits::{
    ChainClient, DexClient, GasEstimate, GasEstimator, GasPriority, GasRequest, PendingTx, Quote,
    SwapParams, SwapReceipt, TxReceipt, TxRequest,
};
pub use tx_builder::{build_transfer_call, to_base_units, TransferCall};

#[cfg(test)]
pub use traits::{MockChainClient, MockDexClient, MockGasEstimator};
