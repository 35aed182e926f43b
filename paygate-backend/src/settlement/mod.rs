//! Settlement Client
//!
//! Talks to the external settlement contract:
//! - `verifyPayment` / `isNonceUsed`: read-only re-validation of a proof
//! - `settlePayment`: the state-changing payer -> recipient transfer
//!
//! Two implementations exist: [`ContractSettlementClient`] against a live
//! RPC endpoint and [`crate::sandbox::SandboxChain`], a deterministic
//! in-process stand-in selected with `PAYGATE_MODE=sandbox`.

pub mod abi;
mod contract;

pub use contract::ContractSettlementClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::H256;
use serde::Serialize;
use thiserror::Error;

use crate::domain_types::{EthAddress, TokenAmount};
use crate::payment::PaymentProof;

/// Proof of a confirmed settlement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub nonce: H256,
    pub payer: EthAddress,
    pub recipient: EthAddress,
    pub amount: TokenAmount,
    pub settled_at: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    /// Mined but reverted; nothing moved
    #[error("settlement transaction {tx_hash} reverted: {reason}")]
    Reverted { reason: String, tx_hash: String },

    /// No confirmation within the bounded wait. If a hash is known the
    /// transaction is in flight and may still land.
    #[error("settlement not confirmed within {timeout_secs}s (tx {tx_hash:?})")]
    Timeout {
        timeout_secs: u64,
        tx_hash: Option<String>,
    },

    /// Transport or node failure before anything was broadcast
    #[error("settlement provider error: {0}")]
    Provider(String),

    /// Refused before broadcast (gas estimation revert, bad signer)
    #[error("settlement rejected: {0}")]
    Rejected(String),
}

impl SettlementError {
    /// True when a transaction was broadcast but its outcome is unknown
    pub fn is_in_doubt(&self) -> bool {
        matches!(self, Self::Timeout { tx_hash: Some(_), .. })
    }

    pub fn tx_hash(&self) -> Option<&str> {
        match self {
            Self::Reverted { tx_hash, .. } => Some(tx_hash),
            Self::Timeout { tx_hash, .. } => tx_hash.as_deref(),
            _ => None,
        }
    }
}

/// Result of the authoritative read-only check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnChainVerdict {
    Valid,
    Invalid,
    NonceUsed,
}

#[async_trait]
pub trait SettlementClient: Send + Sync {
    /// Read-only `verifyPayment` against the contract
    async fn verify_payment(&self, proof: &PaymentProof) -> Result<bool, SettlementError>;

    /// Read-only `isNonceUsed`
    async fn is_nonce_used(&self, nonce: H256) -> Result<bool, SettlementError>;

    /// Submit `settlePayment` and wait for confirmation
    async fn settle(&self, proof: &PaymentProof) -> Result<SettlementReceipt, SettlementError>;

    /// Network identifier advertised in challenges
    fn network(&self) -> &str;

    /// Name for logging
    fn mode_name(&self) -> &'static str;

    /// Used-nonce flag first, then field and signature re-validation
    async fn verify_on_chain(&self, proof: &PaymentProof) -> Result<OnChainVerdict, SettlementError> {
        if self.is_nonce_used(proof.nonce()).await? {
            return Ok(OnChainVerdict::NonceUsed);
        }
        if self.verify_payment(proof).await? {
            Ok(OnChainVerdict::Valid)
        } else {
            Ok(OnChainVerdict::Invalid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_broadcast_timeout_is_in_doubt() {
        let timeout = SettlementError::Timeout {
            timeout_secs: 60,
            tx_hash: Some("0xabc".to_string()),
        };
        assert!(timeout.is_in_doubt());
        assert_eq!(timeout.tx_hash(), Some("0xabc"));

        let reverted = SettlementError::Reverted {
            reason: "status 0".to_string(),
            tx_hash: "0xdef".to_string(),
        };
        assert!(!reverted.is_in_doubt());
        assert_eq!(reverted.tx_hash(), Some("0xdef"));

        assert!(
            !SettlementError::Timeout {
                timeout_secs: 60,
                tx_hash: None
            }
            .is_in_doubt()
        );
        assert!(!SettlementError::Provider("connection refused".to_string()).is_in_doubt());
        assert_eq!(SettlementError::Rejected("x".to_string()).tx_hash(), None);
    }
}
