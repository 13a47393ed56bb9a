//! Dispute lifecycle and window management
//!
//! Buyers contest an escrowed (or freshly released) payment within a
//! bounded window. Opening a dispute and expiring its window race on the
//! same payment, so both run under the payment's mutex: exactly one wins.
//! The window scan only flags eligibility; the state machine performs the
//! actual auto-release.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::currency::split_amounts;
use crate::engine::SettlementEngine;
use crate::error::SettlementError;
use crate::events::SettlementEvent;
use crate::models::{
    ActorRole, ApprovalAction, Dispute, DisputeMark, DisputeResolution, DisputeStatus, EscrowMode,
    PaymentStatus,
};
use crate::wallet::WalletProvider;
use crate::SettlementResult;

/// Requested outcome for a dispute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionRequest {
    /// Return the escrowed amount to the buyer
    Refund,
    /// Pay the seller out as if the service completed
    Release,
    /// Return this percentage of the amount to the buyer, remainder minus
    /// the platform fee to the seller
    Split(u8),
}

impl ResolutionRequest {
    fn validate(self) -> SettlementResult<()> {
        match self {
            Self::Split(percent) if percent > 100 => Err(SettlementError::invalid_resolution(
                format!("split percentage {percent} outside 0-100"),
            )),
            _ => Ok(()),
        }
    }

    fn as_resolution(self) -> DisputeResolution {
        match self {
            Self::Refund => DisputeResolution::Refund,
            Self::Release => DisputeResolution::Release,
            Self::Split(_) => DisputeResolution::Split,
        }
    }

    fn terminal_status(self) -> DisputeStatus {
        match self {
            Self::Refund => DisputeStatus::ResolvedRefund,
            Self::Release => DisputeStatus::ResolvedRelease,
            Self::Split(_) => DisputeStatus::ResolvedSplit,
        }
    }

    /// The approval action whose quorum gates this resolution. A split
    /// moves escrowed value back toward the buyer, so it rides the refund
    /// quorum.
    fn quorum_action(self) -> ApprovalAction {
        match self {
            Self::Release => ApprovalAction::Release,
            Self::Refund | Self::Split(_) => ApprovalAction::Refund,
        }
    }
}

impl SettlementEngine {
    /// Open a dispute on a contestable payment. Only the buyer may open
    /// one, only before the deadline, and only while no other dispute is
    /// active.
    pub async fn open_dispute(
        &self,
        payment_id: Uuid,
        caller_wallet_id: &str,
        reason: &str,
        evidence: Option<String>,
    ) -> SettlementResult<Dispute> {
        let _guard = self.payment_lock(payment_id).await;
        let payment = self.get_payment(payment_id).await?;

        if caller_wallet_id != payment.buyer_wallet_id {
            return Err(SettlementError::forbidden(
                "only the buyer may open a dispute on this payment",
            ));
        }
        if !payment.status.can_dispute() {
            return Err(SettlementError::state_conflict(
                payment.status.to_string(),
                "disputed".to_string(),
                "payment is not contestable in its current status".to_string(),
            ));
        }
        let deadline = payment.dispute_deadline();
        if Utc::now() >= deadline {
            return Err(SettlementError::state_conflict(
                payment.status.to_string(),
                "disputed".to_string(),
                format!("dispute window expired at {deadline}"),
            ));
        }
        if reason.trim().is_empty() {
            return Err(SettlementError::validation("Dispute reason cannot be empty"));
        }
        if self
            .disputes
            .read()
            .await
            .values()
            .any(|d| d.payment_id == payment_id && !d.status.is_terminal())
        {
            return Err(SettlementError::state_conflict(
                "disputed".to_string(),
                "disputed".to_string(),
                "an active dispute already exists for this payment".to_string(),
            ));
        }

        {
            let mut payments = self.payments.write().await;
            if let Some(stored) = payments.get_mut(&payment_id) {
                if stored.status == PaymentStatus::Escrowed {
                    stored.validate_transition(PaymentStatus::Disputed)?;
                    stored.status = PaymentStatus::Disputed;
                }
                stored.dispute_status = Some(DisputeMark::Open);
            }
        }

        let dispute = Dispute::new(
            payment_id,
            payment.buyer_wallet_id.clone(),
            payment.seller_wallet_id.clone(),
            reason.to_string(),
            evidence,
        );
        self.disputes
            .write()
            .await
            .insert(dispute.id, dispute.clone());

        // The buyer contesting is the policy event behind their refund
        // approval; multisig buyers sign and submit explicitly instead
        if payment.escrow_mode == EscrowMode::Custodial {
            if let Err(e) = self
                .quorum
                .auto_approve(&payment, ApprovalAction::Refund, ActorRole::Buyer)
                .await
            {
                warn!("Buyer refund approval on dispute open failed: {}", e);
            }
        }

        info!("Opened dispute {} on payment {}", dispute.id, payment_id);
        self.events.publish(SettlementEvent::DisputeOpened {
            dispute: dispute.clone(),
        });
        Ok(dispute)
    }

    /// Resolve a dispute. Only the platform arbiter may resolve, and the
    /// resulting fund movement is gated by the same quorum rules as any
    /// release or refund.
    pub async fn resolve_dispute(
        &self,
        dispute_id: Uuid,
        resolver_wallet_id: &str,
        resolution: ResolutionRequest,
    ) -> SettlementResult<Dispute> {
        resolution.validate()?;
        if resolver_wallet_id != self.custody.admin_wallet_id {
            return Err(SettlementError::forbidden(
                "only the platform arbiter may resolve disputes",
            ));
        }

        let payment_id = self
            .disputes
            .read()
            .await
            .get(&dispute_id)
            .map(|d| d.payment_id)
            .ok_or_else(|| SettlementError::not_found("dispute", dispute_id.to_string()))?;

        let _guard = self.payment_lock(payment_id).await;

        // Re-read under the lock; a concurrent resolution may have won
        let dispute = self
            .disputes
            .read()
            .await
            .get(&dispute_id)
            .cloned()
            .ok_or_else(|| SettlementError::not_found("dispute", dispute_id.to_string()))?;
        if !dispute.status.can_resolve() {
            return Err(SettlementError::state_conflict(
                "resolved".to_string(),
                "resolved".to_string(),
                "dispute is already resolved".to_string(),
            ));
        }
        let payment = self.get_payment(payment_id).await?;

        let action = resolution.quorum_action();
        // The arbiter's decision carries their approval in custodial mode;
        // multisig admins submit theirs explicitly like everyone else
        if payment.escrow_mode == EscrowMode::Custodial {
            if let Err(e) = self
                .quorum
                .auto_approve(&payment, action, ActorRole::Admin)
                .await
            {
                warn!("Admin approval on dispute resolution failed: {}", e);
            }
        }
        self.quorum.ensure_quorum(payment_id, action).await?;

        match payment.status {
            PaymentStatus::Disputed => {
                let (reference, final_status) = match resolution {
                    ResolutionRequest::Refund => (
                        self.move_funds(&payment, ApprovalAction::Refund, None).await?,
                        PaymentStatus::Refunded,
                    ),
                    ResolutionRequest::Release => (
                        self.move_funds(&payment, ApprovalAction::Release, None).await?,
                        PaymentStatus::Released,
                    ),
                    ResolutionRequest::Split(percent) => {
                        let (_, seller_share) =
                            split_amounts(payment.amount, payment.platform_fee, percent);
                        let reference = self
                            .move_funds(&payment, ApprovalAction::Refund, Some(percent))
                            .await?;
                        let final_status = if seller_share > 0 {
                            PaymentStatus::Released
                        } else {
                            PaymentStatus::Refunded
                        };
                        (reference, final_status)
                    }
                };
                let updated = self
                    .finish_settlement(payment_id, final_status, reference, action)
                    .await?;
                match final_status {
                    PaymentStatus::Released => self.events.publish(
                        SettlementEvent::PaymentReleased {
                            payment: updated.clone(),
                        },
                    ),
                    _ => self.events.publish(SettlementEvent::PaymentRefunded {
                        payment: updated.clone(),
                    }),
                }
            }
            PaymentStatus::Released => {
                // Post-release contest: the payout already left custody, so
                // a buyer-favoring outcome claws back from the seller's
                // ledger. On-chain payouts cannot be recalled.
                match (resolution, payment.escrow_mode) {
                    (ResolutionRequest::Release, _) => {}
                    (_, EscrowMode::Multisig) => {
                        return Err(SettlementError::state_conflict(
                            "released".to_string(),
                            "refunded".to_string(),
                            "a released multisig escrow cannot be clawed back".to_string(),
                        ))
                    }
                    (ResolutionRequest::Refund, EscrowMode::Custodial) => {
                        self.wallets
                            .transfer(
                                &payment.seller_wallet_id,
                                &payment.buyer_wallet_id,
                                payment.amount - payment.platform_fee,
                                payment.currency,
                            )
                            .await?;
                    }
                    (ResolutionRequest::Split(percent), EscrowMode::Custodial) => {
                        let (buyer_share, _) =
                            split_amounts(payment.amount, payment.platform_fee, percent);
                        let clawback = buyer_share.min(payment.amount - payment.platform_fee);
                        if clawback > 0 {
                            self.wallets
                                .transfer(
                                    &payment.seller_wallet_id,
                                    &payment.buyer_wallet_id,
                                    clawback,
                                    payment.currency,
                                )
                                .await?;
                        }
                    }
                }
            }
            other => {
                return Err(SettlementError::state_conflict(
                    other.to_string(),
                    "resolved".to_string(),
                    "payment is not under dispute".to_string(),
                ))
            }
        }

        let resolved = {
            let mut disputes = self.disputes.write().await;
            let stored = disputes
                .get_mut(&dispute_id)
                .ok_or_else(|| SettlementError::not_found("dispute", dispute_id.to_string()))?;
            stored.status = resolution.terminal_status();
            stored.resolution = Some(resolution.as_resolution());
            if let ResolutionRequest::Split(percent) = resolution {
                stored.split_percent = Some(percent);
            }
            stored.resolved_at = Some(Utc::now());
            stored.clone()
        };
        {
            let mut payments = self.payments.write().await;
            if let Some(stored) = payments.get_mut(&payment_id) {
                stored.dispute_status = None;
            }
        }

        info!(
            "Resolved dispute {} on payment {} ({:?})",
            dispute_id, payment_id, resolved.resolution
        );
        self.events.publish(SettlementEvent::DisputeResolved {
            dispute: resolved.clone(),
        });
        Ok(resolved)
    }

    /// Get a dispute by id
    pub async fn get_dispute(&self, dispute_id: Uuid) -> SettlementResult<Dispute> {
        self.disputes
            .read()
            .await
            .get(&dispute_id)
            .cloned()
            .ok_or_else(|| SettlementError::not_found("dispute", dispute_id.to_string()))
    }

    /// Flag escrowed payments whose dispute window lapsed with no dispute.
    /// Flagging only; [`SettlementEngine::auto_release_eligible`] performs
    /// the releases.
    pub async fn expire_dispute_windows(&self) -> Vec<Uuid> {
        let now = Utc::now();
        let candidates: Vec<Uuid> = self
            .payments
            .read()
            .await
            .values()
            .filter(|p| {
                p.status == PaymentStatus::Escrowed
                    && p.dispute_status.is_none()
                    && now >= p.dispute_deadline()
            })
            .map(|p| p.id)
            .collect();

        let mut expired = Vec::new();
        for payment_id in candidates {
            let _guard = self.payment_lock(payment_id).await;
            let deadline = {
                let mut payments = self.payments.write().await;
                let Some(payment) = payments.get_mut(&payment_id) else {
                    continue;
                };
                // Re-check under the lock: a dispute may have raced in
                if payment.status != PaymentStatus::Escrowed
                    || payment.dispute_status.is_some()
                    || Utc::now() < payment.dispute_deadline()
                {
                    continue;
                }
                payment.dispute_status = Some(DisputeMark::NoDispute);
                payment.dispute_deadline()
            };
            info!("Dispute window expired for payment {}", payment_id);
            self.events.publish(SettlementEvent::DisputeWindowExpired {
                payment_id,
                deadline,
            });
            expired.push(payment_id);
        }
        expired
    }
}

/// Configuration for the dispute window scanner
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Seconds between background scans
    pub scan_interval_secs: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 60,
        }
    }
}

/// Periodically expires lapsed dispute windows and hands eligible payments
/// to the engine for auto-release
pub struct DisputeWindowManager {
    engine: Arc<SettlementEngine>,
    config: WindowConfig,
}

impl DisputeWindowManager {
    pub fn new(engine: Arc<SettlementEngine>, config: WindowConfig) -> Self {
        Self { engine, config }
    }

    /// One scan pass: flag expired windows, then auto-release
    pub async fn scan_once(&self) -> Vec<Uuid> {
        let expired = self.engine.expire_dispute_windows().await;
        let released = self.engine.auto_release_eligible().await;
        if !released.is_empty() {
            info!("Auto-released {} payment(s)", released.len());
        }
        expired
    }

    /// Run scans on a timer until the task is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(self.config.scan_interval_secs));
            loop {
                ticker.tick().await;
                self.scan_once().await;
            }
        })
    }
}
