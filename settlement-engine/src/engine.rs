//! Escrow state machine
//!
//! Drives a payment through pending -> escrowed -> {released, refunded,
//! disputed}. Every balance-moving transition is gated by the quorum
//! authorizer, and all mutations of one payment run under that payment's
//! mutex: concurrent conflicting operations never both succeed, the loser
//! observes the changed status.
//!
//! Funds move all-or-nothing. `create` records no payment row unless the
//! escrow movement landed; `release`/`refund` mark nothing settled until the
//! broadcast or ledger transfer is confirmed accepted, and a timed-out
//! broadcast is surfaced as retryable after reconciling against the chain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use secp256k1::ecdsa::Signature;
use serde::Deserialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::chain::TxBroadcaster;
use crate::currency::{split_amounts, Currency};
use crate::error::SettlementError;
use crate::events::{EventSink, SettlementEvent};
use crate::models::{
    ActorRole, ApprovalAction, DisputeMark, EscrowMode, EscrowReference, Payment, PaymentStatus,
    SettlementApproval, SettlementReference,
};
use crate::quorum::QuorumAuthorizer;
use crate::script::{self, OutPoint, Script, SpendSignature};
use crate::wallet::{PlatformCustody, WalletProvider};
use crate::SettlementResult;

/// Configuration for the settlement engine
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard cap on a single payment's amount, in smallest units
    pub per_payment_limit: Option<u64>,
    /// Bound applied to every broadcast attempt
    pub broadcast_timeout_secs: u64,
    /// Dispute window applied when the service does not carry its own
    pub default_dispute_window_minutes: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            per_payment_limit: None,
            broadcast_timeout_secs: 10,
            default_dispute_window_minutes: 30,
        }
    }
}

/// Payment creation request
#[derive(Debug, Clone)]
pub struct CreatePaymentRequest {
    pub service_id: String,
    pub buyer_wallet_id: String,
    pub seller_wallet_id: String,
    pub amount: u64,
    pub currency: Currency,
    pub escrow_mode: EscrowMode,
    /// Service-specific dispute window; engine default when absent
    pub dispute_window_minutes: Option<i64>,
}

/// Main settlement engine coordinating escrow, quorum, and disputes
pub struct SettlementEngine {
    pub(crate) config: EngineConfig,
    pub(crate) wallets: Arc<dyn WalletProvider>,
    pub(crate) chain: Arc<dyn TxBroadcaster>,
    pub(crate) custody: Arc<PlatformCustody>,
    pub(crate) quorum: QuorumAuthorizer,
    /// In-memory payment storage, keyed by id
    pub(crate) payments: RwLock<HashMap<Uuid, Payment>>,
    /// In-memory dispute storage, keyed by id
    pub(crate) disputes: RwLock<HashMap<Uuid, crate::models::Dispute>>,
    /// Per-payment mutual exclusion
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    pub(crate) events: EventSink,
}

impl SettlementEngine {
    pub fn new(
        config: EngineConfig,
        wallets: Arc<dyn WalletProvider>,
        chain: Arc<dyn TxBroadcaster>,
        custody: Arc<PlatformCustody>,
        events: EventSink,
    ) -> Self {
        let quorum = QuorumAuthorizer::new(wallets.clone(), custody.clone());
        Self {
            config,
            wallets,
            chain,
            custody,
            quorum,
            payments: RwLock::new(HashMap::new()),
            disputes: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Acquire this payment's mutex; all mutations hold it across the
    /// read-decide-write span
    pub(crate) async fn payment_lock(&self, payment_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(payment_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Get a payment by id
    pub async fn get_payment(&self, payment_id: Uuid) -> SettlementResult<Payment> {
        self.payments
            .read()
            .await
            .get(&payment_id)
            .cloned()
            .ok_or_else(|| SettlementError::not_found("payment", payment_id.to_string()))
    }

    /// Validate, move funds into custody, and record the payment as
    /// escrowed. All-or-nothing: any failure leaves no payment row.
    pub async fn create_payment(&self, request: CreatePaymentRequest) -> SettlementResult<Payment> {
        request.currency.validate_amount(request.amount)?;
        if request.buyer_wallet_id == request.seller_wallet_id {
            return Err(SettlementError::validation(
                "Buyer and seller wallets must differ",
            ));
        }
        if let Some(limit) = self.config.per_payment_limit {
            if request.amount > limit {
                return Err(SettlementError::validation(format!(
                    "Amount {} exceeds the per-payment spending limit {}",
                    request.amount, limit
                )));
            }
        }

        let platform_fee = request.currency.platform_fee(request.amount);
        let mut payment = Payment::new(
            request.service_id,
            request.buyer_wallet_id,
            request.seller_wallet_id,
            request.amount,
            platform_fee,
            request.currency,
            request.escrow_mode,
            request
                .dispute_window_minutes
                .unwrap_or(self.config.default_dispute_window_minutes),
        );

        info!(
            "Creating {} payment {} for {} {}",
            payment.escrow_mode_name(),
            payment.id,
            payment.amount,
            payment.currency
        );

        match payment.escrow_mode {
            EscrowMode::Custodial => {
                let balance = self
                    .wallets
                    .get_balance(&payment.buyer_wallet_id, payment.currency)
                    .await?;
                if balance < payment.amount {
                    return Err(SettlementError::InsufficientFunds {
                        needed: payment.amount,
                        available: balance,
                    });
                }
                self.wallets
                    .transfer(
                        &payment.buyer_wallet_id,
                        &self.custody.custody_wallet_id,
                        payment.amount,
                        payment.currency,
                    )
                    .await?;
            }
            EscrowMode::Multisig => {
                let escrow_reference = self.fund_multisig_escrow(&payment).await?;
                payment.escrow_reference = Some(escrow_reference);
            }
        }

        payment.validate_transition(PaymentStatus::Escrowed)?;
        payment.status = PaymentStatus::Escrowed;

        self.payments
            .write()
            .await
            .insert(payment.id, payment.clone());

        self.events.publish(SettlementEvent::PaymentCreated {
            payment: payment.clone(),
        });
        self.events.publish(SettlementEvent::PaymentEscrowed {
            payment: payment.clone(),
        });
        info!("Escrowed payment {}", payment.id);
        Ok(payment)
    }

    /// Build, sign, and broadcast the 2-of-3 funding transaction
    async fn fund_multisig_escrow(&self, payment: &Payment) -> SettlementResult<EscrowReference> {
        let buyer_key = self.wallets.get_public_key(&payment.buyer_wallet_id).await?;
        let provider_key = self
            .wallets
            .get_public_key(&payment.seller_wallet_id)
            .await?;
        let admin_key = self
            .wallets
            .get_public_key(&self.custody.admin_wallet_id)
            .await?;
        let locking_script = script::build_escrow_script(&buyer_key, &provider_key, &admin_key);

        let utxos = self
            .wallets
            .get_spendable_inputs(&payment.buyer_wallet_id)
            .await?;
        let plan = script::plan_funding(&utxos, &locking_script, payment.amount, &buyer_key)?;

        let mut signatures = Vec::with_capacity(plan.input_digests.len());
        for digest in &plan.input_digests {
            signatures.push(
                self.wallets
                    .sign_with_wallet_key(&payment.buyer_wallet_id, digest)
                    .await?,
            );
        }
        let funded = script::seal_funding(plan, &signatures)?;

        self.broadcast_with_reconcile(&funded.tx_hex, &funded.txid)
            .await?;

        Ok(EscrowReference {
            funding_txid: funded.txid,
            vout: funded.escrow_vout,
            locking_script: locking_script.to_hex(),
        })
    }

    /// Release escrowed funds to the seller. Requires quorum for 'release'.
    /// Calling again on an already-released payment succeeds as a no-op.
    pub async fn release(&self, payment_id: Uuid) -> SettlementResult<Payment> {
        let _guard = self.payment_lock(payment_id).await;
        let payment = self.get_payment(payment_id).await?;

        match payment.status {
            PaymentStatus::Released => {
                info!("Payment {} already released; no-op", payment_id);
                return Ok(payment);
            }
            PaymentStatus::Escrowed => {}
            other => {
                return Err(SettlementError::state_conflict(
                    other.to_string(),
                    "released".to_string(),
                    "only escrowed payments can be released".to_string(),
                ))
            }
        }

        self.quorum
            .ensure_quorum(payment_id, ApprovalAction::Release)
            .await?;

        let reference = self
            .move_funds(&payment, ApprovalAction::Release, None)
            .await?;
        let updated = self
            .finish_settlement(
                payment_id,
                PaymentStatus::Released,
                reference,
                ApprovalAction::Release,
            )
            .await?;

        self.events.publish(SettlementEvent::PaymentReleased {
            payment: updated.clone(),
        });
        info!("Released payment {}", payment_id);
        Ok(updated)
    }

    /// Return escrowed funds to the buyer. Requires quorum for 'refund'.
    /// Calling again on an already-refunded payment succeeds as a no-op.
    pub async fn refund(&self, payment_id: Uuid) -> SettlementResult<Payment> {
        let _guard = self.payment_lock(payment_id).await;
        let payment = self.get_payment(payment_id).await?;

        match payment.status {
            PaymentStatus::Refunded => {
                info!("Payment {} already refunded; no-op", payment_id);
                return Ok(payment);
            }
            PaymentStatus::Escrowed => {}
            other => {
                return Err(SettlementError::state_conflict(
                    other.to_string(),
                    "refunded".to_string(),
                    "only escrowed payments can be refunded".to_string(),
                ))
            }
        }

        self.quorum
            .ensure_quorum(payment_id, ApprovalAction::Refund)
            .await?;

        let reference = self
            .move_funds(&payment, ApprovalAction::Refund, None)
            .await?;
        let updated = self
            .finish_settlement(
                payment_id,
                PaymentStatus::Refunded,
                reference,
                ApprovalAction::Refund,
            )
            .await?;

        self.events.publish(SettlementEvent::PaymentRefunded {
            payment: updated.clone(),
        });
        info!("Refunded payment {}", payment_id);
        Ok(updated)
    }

    /// Submit an externally signed settlement approval
    pub async fn submit_approval(
        &self,
        payment_id: Uuid,
        action: ApprovalAction,
        role: ActorRole,
        identity: &str,
        signature: Signature,
    ) -> SettlementResult<SettlementApproval> {
        let payment = self.get_payment(payment_id).await?;
        self.quorum
            .submit_approval(&payment, action, role, identity, signature)
            .await
    }

    /// Record the service execution outcome. Stamps the completion time
    /// (starting the dispute window) and, in custodial mode, generates the
    /// policy-driven approval: success yields the provider's release
    /// approval, failure the buyer's refund approval.
    pub async fn record_execution_outcome(
        &self,
        payment_id: Uuid,
        success: bool,
    ) -> SettlementResult<Payment> {
        let _guard = self.payment_lock(payment_id).await;

        let payment = {
            let mut payments = self.payments.write().await;
            let payment = payments
                .get_mut(&payment_id)
                .ok_or_else(|| SettlementError::not_found("payment", payment_id.to_string()))?;
            if payment.status != PaymentStatus::Escrowed {
                return Err(SettlementError::state_conflict(
                    payment.status.to_string(),
                    "escrowed".to_string(),
                    "execution outcome applies to escrowed payments".to_string(),
                ));
            }
            payment.completed_at = Some(Utc::now());
            payment.clone()
        };

        if payment.escrow_mode == EscrowMode::Custodial {
            if success {
                self.quorum
                    .auto_approve(&payment, ApprovalAction::Release, ActorRole::Provider)
                    .await?;
            } else {
                self.quorum
                    .auto_approve(&payment, ApprovalAction::Refund, ActorRole::Buyer)
                    .await?;
            }
        }

        info!(
            "Recorded execution outcome for payment {} (success: {})",
            payment_id, success
        );
        Ok(payment)
    }

    /// Release every payment flagged eligible by the dispute window scan.
    /// In custodial mode the platform co-signs as the second role; multisig
    /// payments are skipped until their quorum is met externally.
    pub async fn auto_release_eligible(&self) -> Vec<Uuid> {
        let eligible: Vec<Uuid> = self
            .payments
            .read()
            .await
            .values()
            .filter(|p| {
                p.status == PaymentStatus::Escrowed
                    && p.dispute_status == Some(DisputeMark::NoDispute)
            })
            .map(|p| p.id)
            .collect();

        let mut released = Vec::new();
        for payment_id in eligible {
            let Ok(payment) = self.get_payment(payment_id).await else {
                continue;
            };
            if payment.escrow_mode == EscrowMode::Custodial {
                if let Err(e) = self
                    .quorum
                    .auto_approve(&payment, ApprovalAction::Release, ActorRole::Admin)
                    .await
                {
                    warn!("Admin co-approval for payment {} failed: {}", payment_id, e);
                }
            }
            match self.release(payment_id).await {
                Ok(_) => released.push(payment_id),
                Err(e) => warn!("Auto-release of payment {} skipped: {}", payment_id, e),
            }
        }
        released
    }

    /// Execute the balance movement for an action. For split resolutions,
    /// `split_percent` carries the buyer's percentage and `action` is the
    /// quorum action that authorized the movement.
    pub(crate) async fn move_funds(
        &self,
        payment: &Payment,
        action: ApprovalAction,
        split_percent: Option<u8>,
    ) -> SettlementResult<String> {
        match payment.escrow_mode {
            EscrowMode::Custodial => self.move_custodial(payment, action, split_percent).await,
            EscrowMode::Multisig => self.spend_multisig(payment, action, split_percent).await,
        }
    }

    async fn move_custodial(
        &self,
        payment: &Payment,
        action: ApprovalAction,
        split_percent: Option<u8>,
    ) -> SettlementResult<String> {
        let custody = &self.custody.custody_wallet_id;
        match (action, split_percent) {
            (ApprovalAction::Release, None) => {
                // Platform fee stays in custody
                self.wallets
                    .transfer(
                        custody,
                        &payment.seller_wallet_id,
                        payment.amount - payment.platform_fee,
                        payment.currency,
                    )
                    .await
            }
            (ApprovalAction::Refund, None) => {
                self.wallets
                    .transfer(
                        custody,
                        &payment.buyer_wallet_id,
                        payment.amount,
                        payment.currency,
                    )
                    .await
            }
            (_, Some(percent)) => {
                let (buyer_share, seller_share) =
                    split_amounts(payment.amount, payment.platform_fee, percent);
                let mut references = Vec::with_capacity(2);
                if buyer_share > 0 {
                    references.push(
                        self.wallets
                            .transfer(custody, &payment.buyer_wallet_id, buyer_share, payment.currency)
                            .await?,
                    );
                }
                if seller_share > 0 {
                    references.push(
                        self.wallets
                            .transfer(
                                custody,
                                &payment.seller_wallet_id,
                                seller_share,
                                payment.currency,
                            )
                            .await?,
                    );
                }
                Ok(references.join("+"))
            }
        }
    }

    /// Spend the multisig escrow: plan outputs, compute the digest, gather
    /// transaction-level signatures from quorum-approved roles only, then
    /// finalize and broadcast
    async fn spend_multisig(
        &self,
        payment: &Payment,
        action: ApprovalAction,
        split_percent: Option<u8>,
    ) -> SettlementResult<String> {
        let escrow_reference = payment.escrow_reference.as_ref().ok_or_else(|| {
            SettlementError::script("multisig payment carries no escrow reference")
        })?;
        let locking_script = Script::from_hex(&escrow_reference.locking_script)?;
        let escrow_outpoint =
            OutPoint::from_hex(&escrow_reference.funding_txid, escrow_reference.vout)?;

        let buyer_key = self.wallets.get_public_key(&payment.buyer_wallet_id).await?;
        let seller_key = self
            .wallets
            .get_public_key(&payment.seller_wallet_id)
            .await?;

        let outputs = match (action, split_percent) {
            (ApprovalAction::Release, None) => script::release_outputs(
                payment.amount,
                payment.platform_fee,
                &seller_key,
                &locking_script,
            )?,
            (ApprovalAction::Refund, None) => script::refund_outputs(payment.amount, &buyer_key)?,
            (_, Some(percent)) => script::split_outputs(
                payment.amount,
                payment.platform_fee,
                percent,
                &buyer_key,
                &seller_key,
                &locking_script,
            )?,
        };

        let digest = script::compute_spending_digest(escrow_outpoint, &locking_script, &outputs);

        // A spend signature is only gathered from a role that holds a
        // verified authorization approval for this same action
        let approved = self.quorum.approved_roles(payment.id, action).await;
        let mut spend_signatures = Vec::with_capacity(approved.len());
        for (_, identity) in &approved {
            let pubkey = self.wallets.get_public_key(identity).await?;
            let signature = self.wallets.sign_with_wallet_key(identity, &digest).await?;
            spend_signatures.push(SpendSignature { pubkey, signature });
        }

        let transaction =
            script::finalize_spend(escrow_outpoint, &locking_script, &spend_signatures, &outputs)?;
        self.broadcast_with_reconcile(&transaction.to_hex(), &transaction.txid_hex())
            .await
    }

    /// Broadcast with a bounded timeout, reconciling first so a retried
    /// call never double-settles a transaction that already landed
    pub(crate) async fn broadcast_with_reconcile(
        &self,
        tx_hex: &str,
        txid: &str,
    ) -> SettlementResult<String> {
        if self.chain.is_confirmed(txid).await? {
            info!("Transaction {} already accepted; skipping broadcast", txid);
            return Ok(txid.to_string());
        }
        let timeout = Duration::from_secs(self.config.broadcast_timeout_secs);
        match tokio::time::timeout(timeout, self.chain.broadcast(tx_hex)).await {
            Ok(result) => result,
            Err(_) => Err(SettlementError::transient("broadcast timed out")),
        }
    }

    /// Apply the terminal transition after a confirmed fund movement
    pub(crate) async fn finish_settlement(
        &self,
        payment_id: Uuid,
        status: PaymentStatus,
        reference: String,
        action: ApprovalAction,
    ) -> SettlementResult<Payment> {
        let mut payments = self.payments.write().await;
        let payment = payments
            .get_mut(&payment_id)
            .ok_or_else(|| SettlementError::not_found("payment", payment_id.to_string()))?;
        payment.validate_transition(status)?;
        payment.status = status;
        payment.settlement_reference = Some(SettlementReference { reference, action });
        if payment.completed_at.is_none() {
            payment.completed_at = Some(Utc::now());
        }
        Ok(payment.clone())
    }
}

impl Payment {
    fn escrow_mode_name(&self) -> &'static str {
        match self.escrow_mode {
            EscrowMode::Custodial => "custodial",
            EscrowMode::Multisig => "multisig",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::wallet::MemoryWallets;

    struct Harness {
        wallets: Arc<MemoryWallets>,
        chain: Arc<MemoryChain>,
        engine: SettlementEngine,
    }

    async fn harness() -> Harness {
        let wallets = MemoryWallets::new();
        wallets.register("buyer-w").await;
        wallets.register("seller-w").await;
        wallets.register("admin-w").await;
        wallets.register("custody-w").await;

        let chain = MemoryChain::new();
        let custody = Arc::new(PlatformCustody::new("custody-w", "admin-w"));
        let (events, _rx) = EventSink::channel();
        let engine = SettlementEngine::new(
            EngineConfig::default(),
            wallets.clone(),
            chain.clone(),
            custody,
            events,
        );
        Harness {
            wallets,
            chain,
            engine,
        }
    }

    fn custodial_request(amount: u64) -> CreatePaymentRequest {
        CreatePaymentRequest {
            service_id: "svc-1".into(),
            buyer_wallet_id: "buyer-w".into(),
            seller_wallet_id: "seller-w".into(),
            amount,
            currency: Currency::Bsv,
            escrow_mode: EscrowMode::Custodial,
            dispute_window_minutes: Some(30),
        }
    }

    async fn approve(
        h: &Harness,
        payment: &Payment,
        action: ApprovalAction,
        role: ActorRole,
        wallet_id: &str,
    ) {
        let digest = QuorumAuthorizer::expected_message(payment, action);
        let sig = h
            .wallets
            .sign_with_wallet_key(wallet_id, &digest)
            .await
            .unwrap();
        h.engine
            .submit_approval(payment.id, action, role, wallet_id, sig)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn custodial_create_escrows_the_amount() {
        let h = harness().await;
        h.wallets.credit("buyer-w", Currency::Bsv, 5_000).await;

        let payment = h.engine.create_payment(custodial_request(1000)).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Escrowed);
        assert_eq!(payment.platform_fee, 20);
        assert_eq!(
            h.wallets.get_balance("buyer-w", Currency::Bsv).await.unwrap(),
            4_000
        );
        assert_eq!(
            h.wallets.get_balance("custody-w", Currency::Bsv).await.unwrap(),
            1_000
        );
    }

    #[tokio::test]
    async fn failed_create_leaves_no_payment_row() {
        let h = harness().await;
        h.wallets.credit("buyer-w", Currency::Bsv, 100).await;

        let err = h.engine.create_payment(custodial_request(1000)).await.unwrap_err();
        assert!(matches!(err, SettlementError::InsufficientFunds { .. }));
        assert!(h.engine.payments.read().await.is_empty());
    }

    #[tokio::test]
    async fn spending_limit_is_checked_before_any_movement() {
        let mut h = harness().await;
        h.engine.config.per_payment_limit = Some(500);
        h.wallets.credit("buyer-w", Currency::Bsv, 5_000).await;

        let err = h.engine.create_payment(custodial_request(1000)).await.unwrap_err();
        assert!(matches!(err, SettlementError::Validation(_)));
        assert_eq!(
            h.wallets.get_balance("buyer-w", Currency::Bsv).await.unwrap(),
            5_000
        );
    }

    #[tokio::test]
    async fn release_requires_quorum() {
        let h = harness().await;
        h.wallets.credit("buyer-w", Currency::Bsv, 5_000).await;
        let payment = h.engine.create_payment(custodial_request(1000)).await.unwrap();

        let err = h.engine.release(payment.id).await.unwrap_err();
        assert!(matches!(err, SettlementError::QuorumNotMet { .. }));

        approve(&h, &payment, ApprovalAction::Release, ActorRole::Buyer, "buyer-w").await;
        let err = h.engine.release(payment.id).await.unwrap_err();
        assert!(matches!(
            err,
            SettlementError::QuorumNotMet { approvals: 1, .. }
        ));

        approve(&h, &payment, ApprovalAction::Release, ActorRole::Provider, "seller-w").await;
        let released = h.engine.release(payment.id).await.unwrap();
        assert_eq!(released.status, PaymentStatus::Released);
        // Seller receives amount minus the platform fee
        assert_eq!(
            h.wallets.get_balance("seller-w", Currency::Bsv).await.unwrap(),
            980
        );
        assert_eq!(
            h.wallets.get_balance("custody-w", Currency::Bsv).await.unwrap(),
            20
        );
    }

    #[tokio::test]
    async fn repeated_release_is_a_noop_success() {
        let h = harness().await;
        h.wallets.credit("buyer-w", Currency::Bsv, 5_000).await;
        let payment = h.engine.create_payment(custodial_request(1000)).await.unwrap();
        approve(&h, &payment, ApprovalAction::Release, ActorRole::Buyer, "buyer-w").await;
        approve(&h, &payment, ApprovalAction::Release, ActorRole::Provider, "seller-w").await;

        h.engine.release(payment.id).await.unwrap();
        let again = h.engine.release(payment.id).await.unwrap();
        assert_eq!(again.status, PaymentStatus::Released);
        // No double payout
        assert_eq!(
            h.wallets.get_balance("seller-w", Currency::Bsv).await.unwrap(),
            980
        );
    }

    #[tokio::test]
    async fn refund_returns_the_full_amount_to_the_buyer() {
        let h = harness().await;
        h.wallets.credit("buyer-w", Currency::Bsv, 5_000).await;
        let payment = h.engine.create_payment(custodial_request(1000)).await.unwrap();
        approve(&h, &payment, ApprovalAction::Refund, ActorRole::Buyer, "buyer-w").await;
        approve(&h, &payment, ApprovalAction::Refund, ActorRole::Admin, "admin-w").await;

        let refunded = h.engine.refund(payment.id).await.unwrap();
        assert_eq!(refunded.status, PaymentStatus::Refunded);
        assert_eq!(
            h.wallets.get_balance("buyer-w", Currency::Bsv).await.unwrap(),
            5_000
        );
    }

    #[tokio::test]
    async fn concurrent_release_and_refund_settle_exactly_once() {
        let h = harness().await;
        h.wallets.credit("buyer-w", Currency::Bsv, 5_000).await;
        let payment = h.engine.create_payment(custodial_request(1000)).await.unwrap();
        for (action, role, wallet) in [
            (ApprovalAction::Release, ActorRole::Buyer, "buyer-w"),
            (ApprovalAction::Release, ActorRole::Provider, "seller-w"),
            (ApprovalAction::Refund, ActorRole::Buyer, "buyer-w"),
            (ApprovalAction::Refund, ActorRole::Admin, "admin-w"),
        ] {
            approve(&h, &payment, action, role, wallet).await;
        }

        let (release_result, refund_result) =
            tokio::join!(h.engine.release(payment.id), h.engine.refund(payment.id));

        // Exactly one wins; the loser sees the changed status
        assert_ne!(release_result.is_ok(), refund_result.is_ok());
        let final_status = h.engine.get_payment(payment.id).await.unwrap().status;
        match (&release_result, &refund_result) {
            (Ok(_), Err(SettlementError::StateConflict { .. })) => {
                assert_eq!(final_status, PaymentStatus::Released);
            }
            (Err(SettlementError::StateConflict { .. }), Ok(_)) => {
                assert_eq!(final_status, PaymentStatus::Refunded);
            }
            other => panic!("unexpected race outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn execution_success_creates_the_provider_release_approval() {
        let h = harness().await;
        h.wallets.credit("buyer-w", Currency::Bsv, 5_000).await;
        let payment = h.engine.create_payment(custodial_request(1000)).await.unwrap();

        let updated = h
            .engine
            .record_execution_outcome(payment.id, true)
            .await
            .unwrap();
        assert!(updated.completed_at.is_some());
        assert_eq!(
            h.engine
                .quorum
                .approved_roles(payment.id, ApprovalAction::Release)
                .await,
            vec![(ActorRole::Provider, "seller-w".to_string())]
        );
    }

    #[tokio::test]
    async fn execution_failure_creates_the_buyer_refund_approval() {
        let h = harness().await;
        h.wallets.credit("buyer-w", Currency::Bsv, 5_000).await;
        let payment = h.engine.create_payment(custodial_request(1000)).await.unwrap();

        h.engine
            .record_execution_outcome(payment.id, false)
            .await
            .unwrap();
        assert_eq!(
            h.engine
                .quorum
                .approval_count(payment.id, ApprovalAction::Refund)
                .await,
            1
        );
    }

    #[tokio::test]
    async fn multisig_payment_funds_and_releases_on_chain() {
        let h = harness().await;
        h.wallets.add_utxo("buyer-w", [3u8; 32], 0, 250_000).await;

        let request = CreatePaymentRequest {
            escrow_mode: EscrowMode::Multisig,
            amount: 100_000,
            ..custodial_request(100_000)
        };
        let payment = h.engine.create_payment(request).await.unwrap();
        let escrow_ref = payment.escrow_reference.clone().unwrap();
        assert_eq!(escrow_ref.vout, 0);
        assert!(h.chain.is_confirmed(&escrow_ref.funding_txid).await.unwrap());

        approve(&h, &payment, ApprovalAction::Release, ActorRole::Buyer, "buyer-w").await;
        approve(&h, &payment, ApprovalAction::Release, ActorRole::Provider, "seller-w").await;

        let released = h.engine.release(payment.id).await.unwrap();
        assert_eq!(released.status, PaymentStatus::Released);
        let settlement = released.settlement_reference.unwrap();
        assert!(h.chain.is_confirmed(&settlement.reference).await.unwrap());
        assert_eq!(h.chain.accepted_count().await, 2);
    }

    #[tokio::test]
    async fn transient_broadcast_failure_is_retryable() {
        let h = harness().await;
        h.wallets.add_utxo("buyer-w", [3u8; 32], 0, 250_000).await;
        let request = CreatePaymentRequest {
            escrow_mode: EscrowMode::Multisig,
            amount: 100_000,
            ..custodial_request(100_000)
        };
        let payment = h.engine.create_payment(request).await.unwrap();
        approve(&h, &payment, ApprovalAction::Release, ActorRole::Buyer, "buyer-w").await;
        approve(&h, &payment, ApprovalAction::Release, ActorRole::Provider, "seller-w").await;

        h.chain.fail_next(1);
        let err = h.engine.release(payment.id).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            h.engine.get_payment(payment.id).await.unwrap().status,
            PaymentStatus::Escrowed
        );

        // The retry reconciles and lands
        let released = h.engine.release(payment.id).await.unwrap();
        assert_eq!(released.status, PaymentStatus::Released);
    }
}
