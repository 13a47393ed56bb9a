//! Wallet and custody boundary
//!
//! Private key material lives behind [`WalletProvider`] and never crosses
//! into the settlement core: signing paths hand the custodian a 32-byte
//! digest and receive a signature back. [`MemoryWallets`] is the in-memory
//! implementation used by tests and local development, shaped like the
//! production custodian it stands in for.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::currency::Currency;
use crate::error::SettlementError;
use crate::script::{OutPoint, SpendableInput};
use crate::SettlementResult;

/// Key custodian and ledger for agent wallets
#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// Public key registered for a wallet
    async fn get_public_key(&self, wallet_id: &str) -> SettlementResult<PublicKey>;

    /// Sign a digest with the wallet's key; the key itself never leaves
    /// the custodian
    async fn sign_with_wallet_key(
        &self,
        wallet_id: &str,
        digest: &[u8; 32],
    ) -> SettlementResult<Signature>;

    /// Unspent outputs the wallet can fund an escrow from
    async fn get_spendable_inputs(&self, wallet_id: &str)
        -> SettlementResult<Vec<SpendableInput>>;

    /// Ledger balance in the currency's smallest unit
    async fn get_balance(&self, wallet_id: &str, currency: Currency) -> SettlementResult<u64>;

    /// Custodial ledger movement between wallets; returns a transfer
    /// reference usable as a settlement reference
    async fn transfer(
        &self,
        from_wallet_id: &str,
        to_wallet_id: &str,
        amount: u64,
        currency: Currency,
    ) -> SettlementResult<String>;
}

/// Advisory currency conversion rates.
///
/// Never consulted on a settlement-critical path; settlement amounts are
/// fixed in the payment's own currency at creation time.
#[async_trait]
pub trait ConversionOracle: Send + Sync {
    async fn get_rate(&self, from: Currency, to: Currency) -> SettlementResult<f64>;
}

/// Fixed-rate oracle for tests and local development
pub struct FixedRateOracle {
    rates: HashMap<(Currency, Currency), f64>,
}

impl FixedRateOracle {
    pub fn new(rates: HashMap<(Currency, Currency), f64>) -> Self {
        Self { rates }
    }
}

#[async_trait]
impl ConversionOracle for FixedRateOracle {
    async fn get_rate(&self, from: Currency, to: Currency) -> SettlementResult<f64> {
        if from == to {
            return Ok(1.0);
        }
        self.rates
            .get(&(from, to))
            .copied()
            .ok_or_else(|| SettlementError::not_found("rate", format!("{from}->{to}")))
    }
}

/// The platform's custody and arbitration identity.
///
/// Initialized once and passed by reference wherever custody funds move or
/// the admin role signs.
#[derive(Debug, Clone)]
pub struct PlatformCustody {
    /// Wallet holding custodial escrow balances
    pub custody_wallet_id: String,
    /// Wallet whose key signs admin approvals and the third escrow slot
    pub admin_wallet_id: String,
}

impl PlatformCustody {
    pub fn new(custody_wallet_id: impl Into<String>, admin_wallet_id: impl Into<String>) -> Self {
        Self {
            custody_wallet_id: custody_wallet_id.into(),
            admin_wallet_id: admin_wallet_id.into(),
        }
    }
}

struct WalletRecord {
    secret: SecretKey,
    public: PublicKey,
    balances: HashMap<Currency, u64>,
    utxos: Vec<SpendableInput>,
}

/// In-memory wallet custodian
pub struct MemoryWallets {
    secp: Secp256k1<All>,
    wallets: RwLock<HashMap<String, WalletRecord>>,
}

impl MemoryWallets {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            secp: Secp256k1::new(),
            wallets: RwLock::new(HashMap::new()),
        })
    }

    /// Register a wallet with a freshly generated keypair
    pub async fn register(&self, wallet_id: &str) -> PublicKey {
        let (secret, public) = self
            .secp
            .generate_keypair(&mut secp256k1::rand::thread_rng());
        self.wallets.write().await.insert(
            wallet_id.to_string(),
            WalletRecord {
                secret,
                public,
                balances: HashMap::new(),
                utxos: Vec::new(),
            },
        );
        info!("Registered wallet: {}", wallet_id);
        public
    }

    /// Credit a ledger balance
    pub async fn credit(&self, wallet_id: &str, currency: Currency, amount: u64) {
        if let Some(record) = self.wallets.write().await.get_mut(wallet_id) {
            *record.balances.entry(currency).or_insert(0) += amount;
        }
    }

    /// Give the wallet a spendable P2PK output of the given value
    pub async fn add_utxo(&self, wallet_id: &str, txid: [u8; 32], vout: u32, amount: u64) {
        if let Some(record) = self.wallets.write().await.get_mut(wallet_id) {
            record.utxos.push(SpendableInput {
                outpoint: OutPoint { txid, vout },
                amount,
                owner: record.public,
            });
        }
    }
}

#[async_trait]
impl WalletProvider for MemoryWallets {
    async fn get_public_key(&self, wallet_id: &str) -> SettlementResult<PublicKey> {
        self.wallets
            .read()
            .await
            .get(wallet_id)
            .map(|r| r.public)
            .ok_or_else(|| SettlementError::not_found("wallet", wallet_id))
    }

    async fn sign_with_wallet_key(
        &self,
        wallet_id: &str,
        digest: &[u8; 32],
    ) -> SettlementResult<Signature> {
        let wallets = self.wallets.read().await;
        let record = wallets
            .get(wallet_id)
            .ok_or_else(|| SettlementError::not_found("wallet", wallet_id))?;
        let message = Message::from_digest_slice(digest)
            .map_err(|e| SettlementError::invalid_signature(format!("digest rejected: {e}")))?;
        Ok(self.secp.sign_ecdsa(&message, &record.secret))
    }

    async fn get_spendable_inputs(
        &self,
        wallet_id: &str,
    ) -> SettlementResult<Vec<SpendableInput>> {
        self.wallets
            .read()
            .await
            .get(wallet_id)
            .map(|r| r.utxos.clone())
            .ok_or_else(|| SettlementError::not_found("wallet", wallet_id))
    }

    async fn get_balance(&self, wallet_id: &str, currency: Currency) -> SettlementResult<u64> {
        self.wallets
            .read()
            .await
            .get(wallet_id)
            .map(|r| r.balances.get(&currency).copied().unwrap_or(0))
            .ok_or_else(|| SettlementError::not_found("wallet", wallet_id))
    }

    async fn transfer(
        &self,
        from_wallet_id: &str,
        to_wallet_id: &str,
        amount: u64,
        currency: Currency,
    ) -> SettlementResult<String> {
        let mut wallets = self.wallets.write().await;

        let available = wallets
            .get(from_wallet_id)
            .ok_or_else(|| SettlementError::not_found("wallet", from_wallet_id))?
            .balances
            .get(&currency)
            .copied()
            .unwrap_or(0);
        if available < amount {
            return Err(SettlementError::InsufficientFunds {
                needed: amount,
                available,
            });
        }
        if !wallets.contains_key(to_wallet_id) {
            return Err(SettlementError::not_found("wallet", to_wallet_id));
        }

        // Both sides exist and the source covers the amount; apply atomically
        // under the single write lock
        if let Some(from) = wallets.get_mut(from_wallet_id) {
            *from.balances.entry(currency).or_insert(0) -= amount;
        }
        if let Some(to) = wallets.get_mut(to_wallet_id) {
            *to.balances.entry(currency).or_insert(0) += amount;
        }

        let reference = format!("xfer-{}", Uuid::new_v4());
        info!(
            "Transferred {} {} from {} to {} ({})",
            amount,
            currency.smallest_unit_name(),
            from_wallet_id,
            to_wallet_id,
            reference
        );
        Ok(reference)
    }
}
