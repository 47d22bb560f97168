use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "wallet-batch")]
#[command(version = "0.1.0")]
#[command(about = "Multi-wallet trade, transfer and sweep batches", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding default.toml and per-environment overrides
    #[arg(short, long, default_value = "config", env = "WALLET_BATCH_CONFIG_DIR")]
    pub config_dir: PathBuf,

    /// JSON file with starting balances and swap rates for the paper chain
    #[arg(short, long)]
    pub seed: Option<PathBuf>,

    /// Simulated latency of every paper chain call
    #[arg(long, default_value = "5")]
    pub latency_ms: u64,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a trade batch and wait for its result
    Trade {
        /// JSON TradeBatchRequest
        #[arg(short, long)]
        request: PathBuf,
        /// Give up waiting after this many seconds
        #[arg(long, default_value = "120")]
        wait_secs: u64,
    },
    /// Run a transfer batch
    Transfer {
        /// JSON TransferBatchRequest
        #[arg(short, long)]
        request: PathBuf,
    },
    /// Sweep balances from many signers into one address
    Sweep {
        /// JSON SweepRequest
        #[arg(short, long)]
        request: PathBuf,
    },
    /// Load and validate configuration, then print it
    CheckConfig,
}
