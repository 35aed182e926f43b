//! Session wallet records

use chrono::{DateTime, Utc};
use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::vault::EncryptedKey;
use crate::domain_types::{EthAddress, TokenAmount};

/// Lifecycle of a session wallet
///
/// ```text
/// funding ──▶ active ──▶ closing ──▶ closed
///    │                     │  ▲  ▲
///    └──────▶ closing      ▼  │  │ (lease expired)
///                         stuck  closing
/// ```
/// A `closing` record whose lease has run out belongs to a close that
/// died part way, and may be closed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    /// Waiting for the owner to deposit token and gas
    Funding,
    /// May sign payments
    Active,
    /// Refund in progress
    Closing,
    /// Token balance could not be returned; funds still in custody
    Stuck,
    /// Drained and key erased
    Closed,
}

impl SessionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// States from which `close` may start
    pub fn can_close(&self) -> bool {
        matches!(self, Self::Funding | Self::Active | Self::Stuck)
    }
}

/// How the token balance went back to the owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RefundPath {
    /// settlePayment from session to owner
    Settlement,
    /// Plain ERC20 transfer signed by the session key
    Transfer,
}

/// A payment whose settlement outcome was unknown when it returned.
/// Its amount stays counted in `spent` until the nonce is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InDoubtPayment {
    pub nonce: H256,
    pub amount: TokenAmount,
    pub recorded_at: DateTime<Utc>,
}

/// Refund bookkeeping, filled in by `close`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRecord {
    pub token_tx: Option<String>,
    pub token_amount: TokenAmount,
    pub token_path: Option<RefundPath>,
    pub native_tx: Option<String>,
    pub native_amount: U256,
    /// Fee currency left behind after the native refund
    pub native_dust: U256,
    pub refunded_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub owner: EthAddress,
    pub session_address: EthAddress,
    /// None once the session is closed and the key erased
    #[serde(skip)]
    pub encrypted_key: Option<EncryptedKey>,
    pub spending_cap: TokenAmount,
    pub spent: TokenAmount,
    pub status: SessionStatus,
    pub approval_tx: Option<String>,
    pub refund: RefundRecord,
    pub in_doubt: Vec<InDoubtPayment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every write; stores compare it to detect concurrent updates
    pub version: u64,
}

impl SessionRecord {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn remaining(&self) -> TokenAmount {
        self.spending_cap.saturating_sub(self.spent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(SessionStatus::Stuck.to_string(), "stuck");
        assert_eq!("closing".parse::<SessionStatus>().unwrap(), SessionStatus::Closing);
        assert!(SessionStatus::Stuck.can_close());
        assert!(!SessionStatus::Closed.can_close());
        assert!(!SessionStatus::Closing.can_close());
    }
}
