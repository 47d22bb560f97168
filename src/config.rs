use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub batch: BatchLimitsConfig,
    #[serde(default)]
    pub trade: TradeEngineConfig,
    #[serde(default)]
    pub transfer: TransferEngineConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Chain id the signer wallets are bound to
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
}

fn default_chain_id() -> u64 {
    1
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: default_chain_id(),
        }
    }
}

/// Global limits shared by every engine
#[derive(Debug, Clone, Deserialize)]
pub struct BatchLimitsConfig {
    /// Upper bound on operations dispatched by a single batch
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_max_batch_size() -> usize {
    100
}

impl Default for BatchLimitsConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradeEngineConfig {
    /// Ceiling for the parallel strategy when the request leaves it unset
    #[serde(default = "default_max_concurrency")]
    pub default_max_concurrency: usize,
    /// Number of trade batches the worker executes at once
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
    /// Queue priority bonus for dry-run requests
    #[serde(default = "default_dry_run_bonus")]
    pub dry_run_priority_bonus: i64,
    /// Largest priority penalty a big batch can receive
    #[serde(default = "default_size_penalty_cap")]
    pub size_penalty_cap: i64,
}

fn default_max_concurrency() -> usize {
    5
}

fn default_max_concurrent_batches() -> usize {
    2
}

fn default_dry_run_bonus() -> i64 {
    20
}

fn default_size_penalty_cap() -> i64 {
    30
}

impl Default for TradeEngineConfig {
    fn default() -> Self {
        Self {
            default_max_concurrency: default_max_concurrency(),
            max_concurrent_batches: default_max_concurrent_batches(),
            dry_run_priority_bonus: default_dry_run_bonus(),
            size_penalty_cap: default_size_penalty_cap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferEngineConfig {
    /// Ceiling for parallel transfers and concurrent sweep signers
    #[serde(default = "default_max_concurrency")]
    pub default_max_concurrency: usize,
    /// Native amount left behind by a sweep when the request sets none
    #[serde(default = "default_gas_reserve")]
    pub default_gas_reserve: Decimal,
}

fn default_gas_reserve() -> Decimal {
    dec!(0.01)
}

impl Default for TransferEngineConfig {
    fn default() -> Self {
        Self {
            default_max_concurrency: default_max_concurrency(),
            default_gas_reserve: default_gas_reserve(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Operations pulled from the queue per processing round
    #[serde(default = "default_chunk_size")]
    pub batch_size: usize,
    /// Operations running at once inside a round
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Pause between processing rounds in milliseconds
    #[serde(default = "default_delay_between_batches")]
    pub delay_between_batches_ms: u64,
    /// Retries after the first failed attempt
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// How long the executor waits on one attempt; a timeout fails it without retry
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Polling interval used by wait_for_completion
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_chunk_size() -> usize {
    10
}

fn default_delay_between_batches() -> u64 {
    100
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_poll_interval() -> u64 {
    100
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_chunk_size(),
            max_concurrency: default_max_concurrency(),
            delay_between_batches_ms: default_delay_between_batches(),
            retry_attempts: default_retry_attempts(),
            timeout_ms: default_timeout_ms(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn delay_between_batches(&self) -> Duration {
        Duration::from_millis(self.delay_between_batches_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            chain: ChainConfig::default(),
            batch: BatchLimitsConfig::default(),
            trade: TradeEngineConfig::default(),
            transfer: TransferEngineConfig::default(),
            executor: ExecutorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("batch.max_batch_size", 100)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("WALLET_BATCH_ENV")
                        .unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (WALLET_BATCH__BATCH__MAX_BATCH_SIZE, etc.)
            .add_source(
                Environment::with_prefix("WALLET_BATCH")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.batch.max_batch_size == 0 {
            errors.push("batch.max_batch_size must be at least 1".to_string());
        }

        if self.trade.default_max_concurrency == 0 {
            errors.push("trade.default_max_concurrency must be at least 1".to_string());
        }

        if self.trade.max_concurrent_batches == 0 {
            errors.push("trade.max_concurrent_batches must be at least 1".to_string());
        }

        if self.trade.size_penalty_cap < 0 {
            errors.push("trade.size_penalty_cap must not be negative".to_string());
        }

        if self.transfer.default_max_concurrency == 0 {
            errors.push("transfer.default_max_concurrency must be at least 1".to_string());
        }

        if self.transfer.default_gas_reserve < Decimal::ZERO {
            errors.push("transfer.default_gas_reserve must not be negative".to_string());
        }

        if self.executor.batch_size == 0 || self.executor.max_concurrency == 0 {
            errors.push("executor.batch_size and executor.max_concurrency must be at least 1".to_string());
        }

        if self.executor.timeout_ms == 0 {
            errors.push("executor.timeout_ms must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
