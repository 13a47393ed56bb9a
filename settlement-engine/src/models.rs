//! Core data models for the settlement system
//!
//! Payments, settlement approvals, and disputes, together with the state
//! machines that constrain how they may change. Amount and currency are
//! immutable after creation; status transitions go through
//! [`Payment::validate_transition`] and nowhere else.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::currency::Currency;
use crate::error::SettlementError;
use crate::SettlementResult;

/// Payment lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Created, funds not yet in custody
    Pending,
    /// Funds held in escrow awaiting settlement
    Escrowed,
    /// Funds released to the seller (terminal)
    Released,
    /// Funds returned to the buyer (terminal)
    Refunded,
    /// Under an open dispute
    Disputed,
}

impl PaymentStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Refunded)
    }

    /// Check if this state allows settlement (release or refund)
    pub fn can_settle(&self) -> bool {
        matches!(self, Self::Escrowed | Self::Disputed)
    }

    /// Check if this state allows opening a dispute
    pub fn can_dispute(&self) -> bool {
        matches!(self, Self::Escrowed | Self::Released)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Escrowed => "escrowed",
            Self::Released => "released",
            Self::Refunded => "refunded",
            Self::Disputed => "disputed",
        };
        write!(f, "{s}")
    }
}

/// How the escrowed funds are held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowMode {
    /// Platform custody ledger holds the funds
    Custodial,
    /// On-chain 2-of-3 multisig locking script holds the funds
    Multisig,
}

/// Dispute-window marker carried on the payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeMark {
    /// Window expired with no dispute; eligible for auto-release
    NoDispute,
    /// An active dispute exists
    Open,
}

/// Location of escrowed funds on chain (multisig mode only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowReference {
    /// Funding transaction id, hex
    pub funding_txid: String,
    /// Index of the escrow output within the funding transaction
    pub vout: u32,
    /// The 2-of-3 locking script, hex
    pub locking_script: String,
}

/// Reference to the transaction or ledger transfer that settled the payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementReference {
    /// Release/refund transaction id or custody transfer id
    pub reference: String,
    /// Whether the movement released or refunded the funds
    pub action: ApprovalAction,
}

/// Payment record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub service_id: String,
    pub buyer_wallet_id: String,
    pub seller_wallet_id: String,
    /// Amount in the currency's smallest unit; immutable after creation
    pub amount: u64,
    /// Platform fee in smallest units; always <= amount
    pub platform_fee: u64,
    pub currency: Currency,
    pub status: PaymentStatus,
    pub escrow_mode: EscrowMode,
    pub escrow_reference: Option<EscrowReference>,
    pub settlement_reference: Option<SettlementReference>,
    /// Window marker maintained by the dispute subsystem
    pub dispute_status: Option<DisputeMark>,
    /// Minutes after completion during which the buyer may contest
    pub dispute_window_minutes: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Payment {
    /// Create a new pending payment
    pub fn new(
        service_id: String,
        buyer_wallet_id: String,
        seller_wallet_id: String,
        amount: u64,
        platform_fee: u64,
        currency: Currency,
        escrow_mode: EscrowMode,
        dispute_window_minutes: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            service_id,
            buyer_wallet_id,
            seller_wallet_id,
            amount,
            platform_fee,
            currency,
            status: PaymentStatus::Pending,
            escrow_mode,
            escrow_reference: None,
            settlement_reference: None,
            dispute_status: None,
            dispute_window_minutes,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Validate a status transition without applying it
    pub fn validate_transition(&self, to: PaymentStatus) -> SettlementResult<()> {
        use PaymentStatus::*;

        let valid = match (self.status, to) {
            (Pending, Escrowed) => true,
            (Escrowed, Released) => true,
            (Escrowed, Refunded) => true,
            (Escrowed, Disputed) => true,
            (Disputed, Released) => true,
            (Disputed, Refunded) => true,
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(SettlementError::state_conflict(
                self.status.to_string(),
                to.to_string(),
                "invalid status transition".to_string(),
            ))
        }
    }

    /// Deadline after which the buyer can no longer contest
    pub fn dispute_deadline(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.created_at) + Duration::minutes(self.dispute_window_minutes)
    }
}

/// Settlement actions an approval can authorize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Release,
    Refund,
}

impl std::fmt::Display for ApprovalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Release => write!(f, "release"),
            Self::Refund => write!(f, "refund"),
        }
    }
}

/// The three roles that can hold an approval; quorum requires two of them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Buyer,
    Provider,
    Admin,
}

impl std::fmt::Display for ActorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buyer => write!(f, "buyer"),
            Self::Provider => write!(f, "provider"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

/// A verified, signed intent to settle a payment one way.
///
/// At most one row exists per (payment, action, role); resubmission by the
/// same role collapses instead of accumulating, so quorum counts distinct
/// roles rather than submissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementApproval {
    pub payment_id: Uuid,
    pub action: ApprovalAction,
    pub actor_role: ActorRole,
    /// Wallet id whose key produced the signature
    pub actor_identity: String,
    /// DER-encoded ECDSA signature, hex
    pub signature: String,
    /// The digest that was signed, hex
    pub signed_message: String,
    pub created_at: DateTime<Utc>,
}

/// Dispute lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    UnderReview,
    ResolvedRefund,
    ResolvedRelease,
    ResolvedSplit,
    Expired,
}

impl DisputeStatus {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ResolvedRefund | Self::ResolvedRelease | Self::ResolvedSplit | Self::Expired
        )
    }

    /// Check if the dispute can still be resolved
    pub fn can_resolve(&self) -> bool {
        matches!(self, Self::Open | Self::UnderReview)
    }
}

/// How an arbitrator settled a dispute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeResolution {
    Refund,
    Release,
    /// Percentage of the amount returned to the buyer
    Split,
}

/// Dispute record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub buyer_wallet_id: String,
    pub provider_wallet_id: String,
    pub reason: String,
    /// Evidence is immutable after creation
    pub evidence: Option<String>,
    pub status: DisputeStatus,
    pub resolution: Option<DisputeResolution>,
    pub split_percent: Option<u8>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Dispute {
    /// Create a new open dispute
    pub fn new(
        payment_id: Uuid,
        buyer_wallet_id: String,
        provider_wallet_id: String,
        reason: String,
        evidence: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_id,
            buyer_wallet_id,
            provider_wallet_id,
            reason,
            evidence,
            status: DisputeStatus::Open,
            resolution: None,
            split_percent: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}
