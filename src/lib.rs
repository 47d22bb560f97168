pub mod adapters;
pub mod batch;
pub mod chain;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod service;
pub mod signing;

pub use batch::{BatchExecutor, ChainContext, TradeBatchEngine, TransferBatchEngine};
pub use config::AppConfig;
pub use error::{BatchError, Result};
pub use service::BatchService;
pub use signing::Wallet;
