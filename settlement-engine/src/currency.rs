//! Currency abstraction
//!
//! Each supported asset carries its own validation bounds and fee policy.
//! All amounts are integers in the asset's smallest unit (satoshis for BSV,
//! cents for MNEE). Everything here is pure and deterministic; advisory
//! conversion rates are never consulted on a settlement-critical path.

use serde::{Deserialize, Serialize};

use crate::error::SettlementError;
use crate::SettlementResult;

/// Platform fee: 2%, rounded up, minimum one smallest unit.
const FEE_NUMERATOR: u64 = 2;
const FEE_DENOMINATOR: u64 = 100;

/// Supported settlement assets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    /// Bitcoin SV, denominated in satoshis
    #[serde(rename = "BSV")]
    Bsv,
    /// MNEE stablecoin, denominated in cents
    #[serde(rename = "MNEE")]
    Mnee,
}

impl Currency {
    /// Smallest accepted amount, in smallest units
    pub fn min_amount(self) -> u64 {
        match self {
            Self::Bsv => 1,
            Self::Mnee => 1,
        }
    }

    /// Largest accepted amount, in smallest units
    pub fn max_amount(self) -> u64 {
        match self {
            // Total BSV supply in satoshis
            Self::Bsv => 2_100_000_000_000_000,
            // 10 billion dollars in cents
            Self::Mnee => 1_000_000_000_000,
        }
    }

    /// Human name of the smallest unit, for logs and messages
    pub fn smallest_unit_name(self) -> &'static str {
        match self {
            Self::Bsv => "satoshis",
            Self::Mnee => "cents",
        }
    }

    /// Validate an amount against this currency's bounds
    pub fn validate_amount(self, amount: u64) -> SettlementResult<()> {
        if amount < self.min_amount() {
            return Err(SettlementError::validation(format!(
                "Amount must be at least {} {}",
                self.min_amount(),
                self.smallest_unit_name()
            )));
        }
        if amount > self.max_amount() {
            return Err(SettlementError::validation(format!(
                "Amount {} exceeds maximum {} {}",
                amount,
                self.max_amount(),
                self.smallest_unit_name()
            )));
        }
        Ok(())
    }

    /// Platform fee for an amount: 2% rounded up, at least one unit,
    /// never more than the amount itself
    pub fn platform_fee(self, amount: u64) -> u64 {
        if amount == 0 {
            return 0;
        }
        let fee = (amount * FEE_NUMERATOR + FEE_DENOMINATOR - 1) / FEE_DENOMINATOR;
        fee.max(1).min(amount)
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bsv => write!(f, "BSV"),
            Self::Mnee => write!(f, "MNEE"),
        }
    }
}

/// Integer split of an escrowed amount between buyer and seller.
///
/// The buyer's share is floor(amount * percent / 100); the seller receives
/// the remainder after the platform fee. Together with the fee the shares
/// always sum back to the original amount.
pub fn split_amounts(amount: u64, platform_fee: u64, percent: u8) -> (u64, u64) {
    let buyer_share = amount * u64::from(percent) / 100;
    let seller_share = amount.saturating_sub(platform_fee).saturating_sub(buyer_share);
    (buyer_share, seller_share)
}
