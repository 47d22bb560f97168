use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::Address;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::{BatchError, Result};

/// Per-address transaction ordering
///
/// Every submission path must follow reserve → submit → confirm. A nonce that
/// was reserved but never reached the chain is handed back with `release`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NonceLedger: Send + Sync {
    /// Reserve the next nonce for `address`
    async fn reserve(&self, address: Address) -> Result<u64>;

    /// Mark a reserved nonce as used on chain
    async fn confirm(&self, address: Address, nonce: u64) -> Result<()>;

    /// Return a reserved nonce whose transaction was never submitted
    async fn release(&self, address: Address, nonce: u64) -> Result<()>;
}

#[derive(Debug, Default)]
struct AddressNonces {
    next: u64,
    pending: BTreeSet<u64>,
    last_confirmed: Option<u64>,
}

/// Ledger event, recorded for inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceEvent {
    Reserved { address: Address, nonce: u64 },
    Confirmed { address: Address, nonce: u64 },
    Released { address: Address, nonce: u64 },
}

/// In-process nonce ledger
///
/// Allocation is atomic per address: the map entry lock covers the
/// read-increment-write of the counter.
#[derive(Default)]
pub struct InMemoryNonceLedger {
    nonces: DashMap<Address, AddressNonces>,
    log: StdMutex<Vec<NonceEvent>>,
}

impl InMemoryNonceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an address at a known on-chain nonce
    pub fn seed(&self, address: Address, next_nonce: u64) {
        let mut entry = self.nonces.entry(address).or_default();
        entry.next = next_nonce;
        entry.pending.clear();
    }

    /// Next nonce that `reserve` would hand out
    pub fn next_nonce(&self, address: Address) -> u64 {
        self.nonces.get(&address).map(|n| n.next).unwrap_or(0)
    }

    pub fn last_confirmed(&self, address: Address) -> Option<u64> {
        self.nonces.get(&address).and_then(|n| n.last_confirmed)
    }

    pub fn pending_count(&self, address: Address) -> usize {
        self.nonces.get(&address).map(|n| n.pending.len()).unwrap_or(0)
    }

    /// Every reservation/confirmation/release in the order it happened
    pub fn events(&self) -> Vec<NonceEvent> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Nonces reserved for `address`, in reservation order
    ///
    /// This is the raw allocation log. A released head nonce is handed out
    /// again, so it shows up once per reservation; see
    /// [`issued_nonces`](Self::issued_nonces) for the net view.
    pub fn reservations(&self, address: Address) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                NonceEvent::Reserved { address: a, nonce } if a == address => Some(nonce),
                _ => None,
            })
            .collect()
    }

    /// Nonces reserved for `address` and not given back, in reservation order
    pub fn issued_nonces(&self, address: Address) -> Vec<u64> {
        let mut issued = Vec::new();
        for event in self.events() {
            match event {
                NonceEvent::Reserved { address: a, nonce } if a == address => issued.push(nonce),
                NonceEvent::Released { address: a, nonce } if a == address => {
                    if let Some(pos) = issued.iter().rposition(|n| *n == nonce) {
                        issued.remove(pos);
                    }
                }
                _ => {}
            }
        }
        issued
    }

    fn record(&self, event: NonceEvent) {
        if let Ok(mut log) = self.log.lock() {
            log.push(event);
        }
    }
}

#[async_trait]
impl NonceLedger for InMemoryNonceLedger {
    async fn reserve(&self, address: Address) -> Result<u64> {
        let nonce = {
            let mut entry = self.nonces.entry(address).or_default();
            let nonce = entry.next;
            entry.next += 1;
            entry.pending.insert(nonce);
            // Logged while the entry is still held so the log order matches allocation order
            self.record(NonceEvent::Reserved { address, nonce });
            nonce
        };

        debug!(?address, nonce, "reserved nonce");
        Ok(nonce)
    }

    async fn confirm(&self, address: Address, nonce: u64) -> Result<()> {
        let mut entry = self.nonces.entry(address).or_default();
        if !entry.pending.remove(&nonce) {
            return Err(BatchError::NonceConflict {
                address: format!("{:?}", address),
                nonce,
                reason: "nonce was not reserved or is already confirmed".to_string(),
            });
        }
        let highest = entry.last_confirmed.map_or(nonce, |n| n.max(nonce));
        entry.last_confirmed = Some(highest);
        self.record(NonceEvent::Confirmed { address, nonce });
        drop(entry);

        debug!(?address, nonce, "confirmed nonce");
        Ok(())
    }

    async fn release(&self, address: Address, nonce: u64) -> Result<()> {
        let mut entry = self.nonces.entry(address).or_default();
        if !entry.pending.remove(&nonce) {
            return Err(BatchError::NonceConflict {
                address: format!("{:?}", address),
                nonce,
                reason: "cannot release a nonce that is not pending".to_string(),
            });
        }

        if entry.next == nonce + 1 {
            entry.next = nonce;
        } else {
            warn!(?address, nonce, next = entry.next, "released nonce below the head, leaving a gap");
        }
        self.record(NonceEvent::Released { address, nonce });
        Ok(())
    }
}

/// Per-signer exclusive section around reserve → submit → confirm
///
/// Holding a signer's gate guarantees its nonces are reserved, submitted and
/// confirmed in strictly increasing order, whatever the batch strategy.
#[derive(Default, Clone)]
pub struct SignerGates {
    gates: Arc<DashMap<Address, Arc<Mutex<()>>>>,
}

impl SignerGates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `address`; released when the guard drops
    pub async fn acquire(&self, address: Address) -> OwnedMutexGuard<()> {
        let gate = self
            .gates
            .entry(address)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        gate.lock_owned().await
    }
}
