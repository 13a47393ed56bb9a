//! Quorum-authorized escrow settlement core for agent-to-agent payments
//!
//! This crate implements the settlement half of a payment marketplace:
//! - Escrow state machine driving pending -> escrowed -> released/refunded
//! - 2-of-3 multisig locking scripts so no single party moves escrowed value
//! - Quorum authorizer collecting and verifying signed settlement approvals
//! - Time-boxed dispute subsystem racing safely against automatic settlement

pub mod chain;
pub mod config;
pub mod currency;
pub mod dispute;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod quorum;
pub mod script;
pub mod wallet;

use error::SettlementError;

/// Result type alias for settlement operations
pub type SettlementResult<T> = Result<T, SettlementError>;

/// Install a process-wide tracing subscriber; repeated calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().try_init();
}
