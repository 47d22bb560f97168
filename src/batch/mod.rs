//! Batch engines and the scheduling machinery they share

pub mod context;
pub mod executor;
pub mod handlers;
pub mod queue;
pub mod strategy;
pub mod sweep;
pub mod trade;
pub mod transfer;

pub use context::{ChainContext, SwapOutcome, TransferOutcome};
pub use executor::{
    BatchExecutor, BatchOperation, ExecutorReport, OperationHandler, Priority, QueueStatus,
    QueuedOperation, QueuedStatus,
};
pub use handlers::{ChainOperation, ChainOperationHandler, ChainReceipt};
pub use queue::PriorityQueue;
pub use sweep::{SKIP_BELOW_MINIMUM, SKIP_GAS_RESERVE, SKIP_ZERO_BALANCE};
pub use trade::TradeBatchEngine;
pub use transfer::TransferBatchEngine;
