pub mod nonce_manager;
pub mod wallet;

pub use nonce_manager::{InMemoryNonceLedger, NonceEvent, NonceLedger, SignerGates};
pub use wallet::Wallet;

#[cfg(test)]
pub use nonce_manager::MockNonceLedger;
