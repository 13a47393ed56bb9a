//! Settlement quorum authorizer
//!
//! Collects signed approvals for release/refund actions and decides when
//! enough distinct parties agree. A signature binds one payment, one action,
//! and the exact economic terms: the signed digest is a domain-prefixed hash
//! of the canonical, field-sorted payment terms, so an approval can never be
//! replayed across payments or across actions.
//!
//! The approval store is append-only per (payment, action, role).
//! Resubmitting the identical signature is a no-op; submitting a different
//! signature for an already-approved role is rejected, never overwritten, so
//! an actor cannot revoke an approval already counted toward quorum.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, Secp256k1};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::SettlementError;
use crate::models::{ActorRole, ApprovalAction, Payment, SettlementApproval};
use crate::wallet::{PlatformCustody, WalletProvider};
use crate::SettlementResult;

/// Distinct roles required before a settlement action may fire
pub const QUORUM_SIZE: usize = 2;

/// Domain prefix separating approval digests from every other signed thing
const APPROVAL_DOMAIN: &[u8] = b"agentspay.settlement.approval.v1";

/// Verifies and stores settlement approvals, keyed by (payment, action)
pub struct QuorumAuthorizer {
    wallets: Arc<dyn WalletProvider>,
    custody: Arc<PlatformCustody>,
    approvals: RwLock<HashMap<(Uuid, ApprovalAction), HashMap<ActorRole, SettlementApproval>>>,
}

impl QuorumAuthorizer {
    pub fn new(wallets: Arc<dyn WalletProvider>, custody: Arc<PlatformCustody>) -> Self {
        Self {
            wallets,
            custody,
            approvals: RwLock::new(HashMap::new()),
        }
    }

    /// The digest an actor must sign to approve `action` on this payment.
    ///
    /// Canonical, field-sorted serialization of the payment terms plus the
    /// action, domain-prefixed and hashed.
    pub fn expected_message(payment: &Payment, action: ApprovalAction) -> [u8; 32] {
        // Keys in sorted order; the payload is rebuilt identically by every
        // verifier, so formatting here is part of the signature domain
        let payload = format!(
            concat!(
                "{{\"action\":\"{}\",\"amount\":{},\"buyerWalletId\":\"{}\",",
                "\"currency\":\"{}\",\"paymentId\":\"{}\",\"platformFee\":{},",
                "\"sellerWalletId\":\"{}\",\"serviceId\":\"{}\"}}"
            ),
            action,
            payment.amount,
            payment.buyer_wallet_id,
            payment.currency,
            payment.id,
            payment.platform_fee,
            payment.seller_wallet_id,
            payment.service_id,
        );

        let mut hasher = Sha256::new();
        hasher.update(APPROVAL_DOMAIN);
        hasher.update(payload.as_bytes());
        hasher.finalize().into()
    }

    /// The wallet identity a role must present for this payment
    pub fn role_identity(&self, payment: &Payment, role: ActorRole) -> String {
        match role {
            ActorRole::Buyer => payment.buyer_wallet_id.clone(),
            ActorRole::Provider => payment.seller_wallet_id.clone(),
            ActorRole::Admin => self.custody.admin_wallet_id.clone(),
        }
    }

    /// Verify and record an approval.
    ///
    /// Identity must match the role's wallet on this payment, and the
    /// signature must verify against that wallet's known public key over
    /// the expected message.
    pub async fn submit_approval(
        &self,
        payment: &Payment,
        action: ApprovalAction,
        role: ActorRole,
        identity: &str,
        signature: Signature,
    ) -> SettlementResult<SettlementApproval> {
        let expected_identity = self.role_identity(payment, role);
        if identity != expected_identity {
            return Err(SettlementError::forbidden(format!(
                "{role} approvals for this payment must come from wallet {expected_identity}"
            )));
        }

        let signature_hex = hex::encode(signature.serialize_der());

        // Append-only: an identical resubmission collapses, a different
        // signature for an approved role is rejected before any other work
        {
            let approvals = self.approvals.read().await;
            if let Some(existing) = approvals
                .get(&(payment.id, action))
                .and_then(|by_role| by_role.get(&role))
            {
                if existing.signature == signature_hex {
                    return Ok(existing.clone());
                }
                return Err(SettlementError::state_conflict(
                    "approved".to_string(),
                    "approved".to_string(),
                    format!("{role} already holds a counted {action} approval"),
                ));
            }
        }

        let digest = Self::expected_message(payment, action);
        let public_key = self.wallets.get_public_key(identity).await?;
        let message = Message::from_digest_slice(&digest)
            .map_err(|e| SettlementError::invalid_signature(format!("digest rejected: {e}")))?;
        Secp256k1::verification_only()
            .verify_ecdsa(&message, &signature, &public_key)
            .map_err(|_| {
                SettlementError::invalid_signature(format!(
                    "{role} signature does not verify for {action} on payment {}",
                    payment.id
                ))
            })?;

        let approval = SettlementApproval {
            payment_id: payment.id,
            action,
            actor_role: role,
            actor_identity: identity.to_string(),
            signature: signature_hex,
            signed_message: hex::encode(digest),
            created_at: Utc::now(),
        };

        let mut approvals = self.approvals.write().await;
        let by_role = approvals.entry((payment.id, action)).or_default();
        match by_role.get(&role) {
            Some(existing) if existing.signature == approval.signature => Ok(existing.clone()),
            Some(_) => Err(SettlementError::state_conflict(
                "approved".to_string(),
                "approved".to_string(),
                format!("{role} already holds a counted {action} approval"),
            )),
            None => {
                by_role.insert(role, approval.clone());
                info!(
                    "Recorded {} approval from {} for payment {}",
                    action, role, payment.id
                );
                Ok(approval)
            }
        }
    }

    /// Sign and submit an approval on behalf of a role through the wallet
    /// boundary. Verification is never skipped: the produced signature goes
    /// through [`Self::submit_approval`] like any external one.
    pub async fn auto_approve(
        &self,
        payment: &Payment,
        action: ApprovalAction,
        role: ActorRole,
    ) -> SettlementResult<SettlementApproval> {
        let identity = self.role_identity(payment, role);
        let digest = Self::expected_message(payment, action);
        let signature = self.wallets.sign_with_wallet_key(&identity, &digest).await?;
        self.submit_approval(payment, action, role, &identity, signature)
            .await
    }

    /// Distinct roles holding a valid approval for the action
    pub async fn approval_count(&self, payment_id: Uuid, action: ApprovalAction) -> usize {
        self.approvals
            .read()
            .await
            .get(&(payment_id, action))
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Roles and identities whose approvals currently count toward quorum
    pub async fn approved_roles(
        &self,
        payment_id: Uuid,
        action: ApprovalAction,
    ) -> Vec<(ActorRole, String)> {
        self.approvals
            .read()
            .await
            .get(&(payment_id, action))
            .map(|by_role| {
                by_role
                    .values()
                    .map(|a| (a.actor_role, a.actor_identity.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True iff at least two distinct roles hold a valid approval
    pub async fn quorum_ready(&self, payment_id: Uuid, action: ApprovalAction) -> bool {
        self.approval_count(payment_id, action).await >= QUORUM_SIZE
    }

    /// Error form of [`Self::quorum_ready`]
    pub async fn ensure_quorum(
        &self,
        payment_id: Uuid,
        action: ApprovalAction,
    ) -> SettlementResult<()> {
        let approvals = self.approval_count(payment_id, action).await;
        if approvals >= QUORUM_SIZE {
            Ok(())
        } else {
            Err(SettlementError::QuorumNotMet {
                payment_id: payment_id.to_string(),
                action: action.to_string(),
                approvals,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::Currency;
    use crate::models::EscrowMode;
    use crate::wallet::MemoryWallets;

    async fn setup() -> (Arc<MemoryWallets>, QuorumAuthorizer, Payment) {
        let wallets = MemoryWallets::new();
        wallets.register("buyer-w").await;
        wallets.register("seller-w").await;
        wallets.register("admin-w").await;
        wallets.register("custody-w").await;

        let custody = Arc::new(PlatformCustody::new("custody-w", "admin-w"));
        let authorizer = QuorumAuthorizer::new(wallets.clone(), custody);

        let payment = Payment::new(
            "svc-1".into(),
            "buyer-w".into(),
            "seller-w".into(),
            1000,
            20,
            Currency::Bsv,
            EscrowMode::Custodial,
            30,
        );
        (wallets, authorizer, payment)
    }

    async fn signed(
        wallets: &MemoryWallets,
        payment: &Payment,
        action: ApprovalAction,
        wallet_id: &str,
    ) -> Signature {
        let digest = QuorumAuthorizer::expected_message(payment, action);
        wallets.sign_with_wallet_key(wallet_id, &digest).await.unwrap()
    }

    #[tokio::test]
    async fn two_distinct_roles_reach_quorum() {
        let (wallets, authorizer, payment) = setup().await;
        let action = ApprovalAction::Release;

        let sig = signed(&wallets, &payment, action, "buyer-w").await;
        authorizer
            .submit_approval(&payment, action, ActorRole::Buyer, "buyer-w", sig)
            .await
            .unwrap();
        assert!(!authorizer.quorum_ready(payment.id, action).await);

        let sig = signed(&wallets, &payment, action, "seller-w").await;
        authorizer
            .submit_approval(&payment, action, ActorRole::Provider, "seller-w", sig)
            .await
            .unwrap();
        assert!(authorizer.quorum_ready(payment.id, action).await);
        assert!(authorizer.ensure_quorum(payment.id, action).await.is_ok());
    }

    #[tokio::test]
    async fn one_role_never_reaches_quorum_regardless_of_identities() {
        let (wallets, authorizer, payment) = setup().await;
        let action = ApprovalAction::Release;

        let sig = signed(&wallets, &payment, action, "buyer-w").await;
        authorizer
            .submit_approval(&payment, action, ActorRole::Buyer, "buyer-w", sig)
            .await
            .unwrap();

        // The same role under other identities is refused outright
        for other in ["seller-w", "admin-w"] {
            let sig = signed(&wallets, &payment, action, other).await;
            let err = authorizer
                .submit_approval(&payment, action, ActorRole::Buyer, other, sig)
                .await
                .unwrap_err();
            assert!(matches!(err, SettlementError::Forbidden(_)));
        }

        assert_eq!(authorizer.approval_count(payment.id, action).await, 1);
        let err = authorizer.ensure_quorum(payment.id, action).await.unwrap_err();
        assert!(matches!(
            err,
            SettlementError::QuorumNotMet { approvals: 1, .. }
        ));
    }

    #[tokio::test]
    async fn identical_resubmission_collapses() {
        let (wallets, authorizer, payment) = setup().await;
        let action = ApprovalAction::Refund;

        let sig = signed(&wallets, &payment, action, "buyer-w").await;
        let first = authorizer
            .submit_approval(&payment, action, ActorRole::Buyer, "buyer-w", sig)
            .await
            .unwrap();
        let second = authorizer
            .submit_approval(&payment, action, ActorRole::Buyer, "buyer-w", sig)
            .await
            .unwrap();

        assert_eq!(first.signature, second.signature);
        assert_eq!(authorizer.approval_count(payment.id, action).await, 1);
    }

    #[tokio::test]
    async fn conflicting_signature_for_an_approved_role_is_rejected() {
        let (wallets, authorizer, payment) = setup().await;
        let action = ApprovalAction::Refund;

        let sig = signed(&wallets, &payment, action, "buyer-w").await;
        authorizer
            .submit_approval(&payment, action, ActorRole::Buyer, "buyer-w", sig)
            .await
            .unwrap();

        // A different signature (here: over the other action's digest) must
        // not displace the counted approval
        let other = signed(&wallets, &payment, ApprovalAction::Release, "buyer-w").await;
        let err = authorizer
            .submit_approval(&payment, action, ActorRole::Buyer, "buyer-w", other)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::StateConflict { .. }));
        assert_eq!(authorizer.approval_count(payment.id, action).await, 1);
    }

    #[tokio::test]
    async fn cross_action_signatures_fail_verification() {
        let (wallets, authorizer, payment) = setup().await;

        // Signed for release, submitted for refund
        let sig = signed(&wallets, &payment, ApprovalAction::Release, "buyer-w").await;
        let err = authorizer
            .submit_approval(&payment, ApprovalAction::Refund, ActorRole::Buyer, "buyer-w", sig)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidSignature(_)));
    }

    #[tokio::test]
    async fn cross_payment_signatures_fail_verification() {
        let (wallets, authorizer, payment) = setup().await;
        let other_payment = Payment::new(
            "svc-2".into(),
            "buyer-w".into(),
            "seller-w".into(),
            5000,
            100,
            Currency::Bsv,
            EscrowMode::Custodial,
            30,
        );

        let sig = signed(&wallets, &other_payment, ApprovalAction::Release, "buyer-w").await;
        let err = authorizer
            .submit_approval(&payment, ApprovalAction::Release, ActorRole::Buyer, "buyer-w", sig)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidSignature(_)));
    }

    #[tokio::test]
    async fn auto_approvals_are_real_verified_signatures() {
        let (_, authorizer, payment) = setup().await;

        let approval = authorizer
            .auto_approve(&payment, ApprovalAction::Release, ActorRole::Provider)
            .await
            .unwrap();
        assert_eq!(approval.actor_identity, "seller-w");
        assert_eq!(
            approval.signed_message,
            hex::encode(QuorumAuthorizer::expected_message(
                &payment,
                ApprovalAction::Release
            ))
        );
        assert_eq!(
            authorizer
                .approval_count(payment.id, ApprovalAction::Release)
                .await,
            1
        );
    }
}
