//! Error types for the settlement core
//!
//! Every fallible operation in the crate returns [`SettlementError`]. API
//! layers surface only the stable [`SettlementError::kind`] string and the
//! human-readable message, never internal paths or stack traces.

use thiserror::Error;

/// Main error type for settlement operations
#[derive(Error, Debug)]
pub enum SettlementError {
    /// Request validation errors (bad amount, bad currency, malformed input)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced entity does not exist
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Caller is not the actor the operation requires
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Wrong status for the requested transition, or a concurrent
    /// operation won the race on the same payment
    #[error("State conflict: {from} -> {to}: {reason}")]
    StateConflict {
        from: String,
        to: String,
        reason: String,
    },

    /// Fewer than the required number of distinct roles hold a valid
    /// approval for the action
    #[error("Quorum not met for {action} on payment {payment_id}: {approvals} of 2 distinct roles")]
    QuorumNotMet {
        payment_id: String,
        action: String,
        approvals: usize,
    },

    /// Signature failed verification against the actor's known key
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Balance or spendable inputs cannot cover the requested amount
    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    /// Network call failed or timed out; safe to retry after reconciling
    /// on-chain/ledger state
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Script construction, parsing, or spend assembly failed
    #[error("Script error: {0}")]
    Script(String),

    /// Dispute resolution outside refund | release | split(0-100)
    #[error("Invalid resolution: {0}")]
    InvalidResolution(String),
}

impl SettlementError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(entity: &'static str, id: S) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Create a forbidden error
    pub fn forbidden<S: Into<String>>(msg: S) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a state conflict error
    pub fn state_conflict<S: Into<String>>(from: S, to: S, reason: S) -> Self {
        Self::StateConflict {
            from: from.into(),
            to: to.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid signature error
    pub fn invalid_signature<S: Into<String>>(msg: S) -> Self {
        Self::InvalidSignature(msg.into())
    }

    /// Create a transient network error
    pub fn transient<S: Into<String>>(msg: S) -> Self {
        Self::TransientNetwork(msg.into())
    }

    /// Create a script error
    pub fn script<S: Into<String>>(msg: S) -> Self {
        Self::Script(msg.into())
    }

    /// Create an invalid resolution error
    pub fn invalid_resolution<S: Into<String>>(msg: S) -> Self {
        Self::InvalidResolution(msg.into())
    }

    /// Stable machine-readable kind for API responses
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::StateConflict { .. } => "state_conflict",
            Self::QuorumNotMet { .. } => "quorum_not_met",
            Self::InvalidSignature(_) => "invalid_signature",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::TransientNetwork(_) => "transient_network",
            Self::Script(_) => "script_error",
            Self::InvalidResolution(_) => "invalid_resolution",
        }
    }

    /// Whether the caller may retry the operation after reconciling state
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }
}
