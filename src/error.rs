use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for the batch engine
#[derive(Error, Debug)]
pub enum BatchError {
    // Request validation (rejected before any chain interaction)
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // Per-operation chain errors
    #[error("insufficient balance for {asset}: required {required}, available {available}")]
    InsufficientBalance {
        asset: String,
        required: Decimal,
        available: Decimal,
    },

    #[error("Nonce conflict for {address} at nonce {nonce}: {reason}")]
    NonceConflict {
        address: String,
        nonce: u64,
        reason: String,
    },

    #[error("Chain confirmation timed out: {0}")]
    ChainTimeout(String),

    #[error("Chain error: {0}")]
    Chain(String),

    #[error("DEX error: {0}")]
    Dex(String),

    // Crypto/signing errors
    #[error("Wallet error: {0}")]
    Wallet(String),

    // Executor errors
    #[error("Operation {id} timed out after {elapsed_ms}ms")]
    OperationTimeout { id: String, elapsed_ms: u64 },

    #[error("Timed out waiting for {pending} of {total} operations")]
    WaitTimeout { pending: usize, total: usize },

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Result type alias for BatchError
pub type Result<T> = std::result::Result<T, BatchError>;

/// Field-level request validation problems
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("request contains no {0}")]
    Empty(&'static str),

    #[error("execution strategy '{strategy}' is not supported for {engine} batches")]
    UnsupportedStrategy {
        strategy: String,
        engine: &'static str,
    },

    #[error("{field} '{value}' is not a valid address")]
    MalformedAddress { field: String, value: String },

    #[error("{field} must be positive, got {value}")]
    NonPositiveAmount { field: String, value: Decimal },

    #[error("{field} slippage {value} must be within (0, 0.5]")]
    SlippageOutOfRange { field: String, value: Decimal },

    #[error("{field}: token_in and token_out must differ")]
    IdenticalTokens { field: String },

    #[error("signer #{index} credential is invalid: {reason}")]
    InvalidCredential { index: usize, reason: String },

    #[error("batch of {requested} operations exceeds maximum of {max}")]
    BatchTooLarge { requested: usize, max: usize },

    #[error("max_concurrency must be at least 1")]
    ZeroConcurrency,
}

impl From<ValidationError> for BatchError {
    fn from(err: ValidationError) -> Self {
        BatchError::Validation(err.to_string())
    }
}

impl BatchError {
    /// Whether the error was raised before any chain interaction
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BatchError::Validation(_) | BatchError::InvalidAddress(_)
        )
    }

    /// Whether running the operation again is safe
    ///
    /// False when a transaction may already be on its way to the chain.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            BatchError::ChainTimeout(_) | BatchError::OperationTimeout { .. }
        )
    }
}
