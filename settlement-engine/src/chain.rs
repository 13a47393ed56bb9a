//! Transaction broadcast boundary
//!
//! The settlement core hands fully signed transaction hex to a
//! [`TxBroadcaster`] and records the returned txid. Retries must reconcile
//! first: `is_confirmed` answers whether a previous attempt already landed,
//! so a timed-out broadcast is never blindly repeated into a
//! double-settlement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::SettlementError;
use crate::SettlementResult;

/// Chain access used by settlement paths
#[async_trait]
pub trait TxBroadcaster: Send + Sync {
    /// Submit raw transaction hex; returns the txid on acceptance
    async fn broadcast(&self, tx_hex: &str) -> SettlementResult<String>;

    /// Whether a transaction has been accepted by the network
    async fn is_confirmed(&self, txid: &str) -> SettlementResult<bool>;
}

/// In-memory chain for tests and local development
pub struct MemoryChain {
    accepted: RwLock<HashMap<String, String>>,
    /// Number of upcoming broadcasts to fail with a transient error
    failures: AtomicU32,
}

impl MemoryChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            accepted: RwLock::new(HashMap::new()),
            failures: AtomicU32::new(0),
        })
    }

    /// Make the next `n` broadcasts fail with a transient network error
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Number of transactions accepted so far
    pub async fn accepted_count(&self) -> usize {
        self.accepted.read().await.len()
    }
}

#[async_trait]
impl TxBroadcaster for MemoryChain {
    async fn broadcast(&self, tx_hex: &str) -> SettlementResult<String> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SettlementError::transient("broadcast refused by peer"));
        }

        let bytes = hex::decode(tx_hex)
            .map_err(|e| SettlementError::script(format!("invalid transaction hex: {e}")))?;
        let first = Sha256::digest(&bytes);
        let txid = hex::encode(Sha256::digest(first));

        self.accepted
            .write()
            .await
            .insert(txid.clone(), tx_hex.to_string());
        info!("Accepted transaction: {}", txid);
        Ok(txid)
    }

    async fn is_confirmed(&self, txid: &str) -> SettlementResult<bool> {
        Ok(self.accepted.read().await.contains_key(txid))
    }
}
