//! Error types for paygate-backend.
//!
//! `GateRejection` is what callers of the payment gate see. Every variant
//! except `LedgerUnavailable` is an expected, caller-recoverable outcome and
//! renders to a structured `PaymentRejection` body. `SessionError` covers the
//! session wallet lifecycle; its `Custody` variant is the only one that
//! signals funds the service could not hand back.

use paygate_types::{PaymentChallenge, PaymentRejection, RejectionCode};
use strum::Display;
use thiserror::Error;

use crate::domain_types::{EthAddress, TokenAmount};
use crate::sessions::SessionStatus;

/// Why a structurally valid proof does not satisfy the price policy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    #[error("amount {received} is below the required price {expected}")]
    AmountTooLow {
        expected: TokenAmount,
        received: TokenAmount,
    },

    #[error("token {received} is not the accepted asset {expected}")]
    WrongToken {
        expected: EthAddress,
        received: EthAddress,
    },

    #[error("recipient {received} does not match the payee {expected}")]
    WrongRecipient {
        expected: EthAddress,
        received: EthAddress,
    },

    #[error("proof is {age_secs}s old, freshness window is {window_secs}s")]
    Expired { age_secs: u64, window_secs: u64 },

    #[error("proof timestamp is {ahead_secs}s in the future (tolerance {tolerance_secs}s)")]
    FromFuture { ahead_secs: u64, tolerance_secs: u64 },

    #[error("payer must not be the zero address")]
    ZeroPayer,
}

impl PolicyViolation {
    fn field(&self) -> &'static str {
        match self {
            Self::AmountTooLow { .. } => "amount",
            Self::WrongToken { .. } => "token",
            Self::WrongRecipient { .. } => "recipient",
            Self::Expired { .. } | Self::FromFuture { .. } => "timestamp",
            Self::ZeroPayer => "payer",
        }
    }

    fn expected_received(&self) -> (Option<String>, Option<String>) {
        match self {
            Self::AmountTooLow { expected, received } => {
                (Some(expected.to_string()), Some(received.to_string()))
            }
            Self::WrongToken { expected, received } | Self::WrongRecipient { expected, received } => {
                (Some(expected.to_checksum()), Some(received.to_checksum()))
            }
            Self::Expired { age_secs, window_secs } => (
                Some(format!("age <= {}s", window_secs)),
                Some(format!("age {}s", age_secs)),
            ),
            Self::FromFuture { ahead_secs, tolerance_secs } => (
                Some(format!("at most {}s ahead", tolerance_secs)),
                Some(format!("{}s ahead", ahead_secs)),
            ),
            Self::ZeroPayer => (Some("non-zero address".to_string()), None),
        }
    }
}

/// Where a replayed nonce was caught
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ReplaySource {
    /// Claimed or confirmed in the local nonce ledger
    Ledger,
    /// Marked used by the settlement contract
    OnChain,
}

/// Rejection returned by [`crate::payment::PaymentGate::authorize`]
#[derive(Error, Debug)]
pub enum GateRejection {
    /// No proof attached; the normal start of the protocol
    #[error("payment required")]
    ChallengeRequired(Box<PaymentChallenge>),

    #[error("malformed payment proof: {reason}")]
    MalformedProof {
        reason: String,
        challenge: Box<PaymentChallenge>,
    },

    #[error("payment policy violation: {0}")]
    PolicyViolation(PolicyViolation),

    #[error("nonce {nonce} already used (detected by {detected_by})")]
    ReplayDetected {
        nonce: String,
        detected_by: ReplaySource,
    },

    #[error("signature does not recover to payer {claimed}")]
    SignatureInvalid {
        claimed: EthAddress,
        recovered: Option<EthAddress>,
    },

    #[error("settlement failed: {reason}")]
    SettlementFailed {
        reason: String,
        in_doubt: bool,
        tx_hash: Option<String>,
    },

    #[error("unknown paid operation '{0}'")]
    UnknownOperation(String),

    #[error("nonce ledger unavailable: {0}")]
    LedgerUnavailable(String),
}

impl GateRejection {
    pub fn code(&self) -> RejectionCode {
        match self {
            Self::ChallengeRequired(_) => RejectionCode::ChallengeRequired,
            Self::MalformedProof { .. } => RejectionCode::MalformedProof,
            Self::PolicyViolation(_) => RejectionCode::PolicyViolation,
            Self::ReplayDetected { .. } => RejectionCode::ReplayDetected,
            Self::SignatureInvalid { .. } => RejectionCode::SignatureInvalid,
            Self::SettlementFailed { .. } => RejectionCode::SettlementFailed,
            Self::UnknownOperation(_) => RejectionCode::UnknownOperation,
            Self::LedgerUnavailable(_) => RejectionCode::LedgerUnavailable,
        }
    }

    /// HTTP status the surface should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ReplayDetected { .. } => 409,
            Self::UnknownOperation(_) => 404,
            Self::LedgerUnavailable(_) => 503,
            _ => 402,
        }
    }

    /// Challenge to advertise alongside the rejection, if any
    pub fn challenge(&self) -> Option<&PaymentChallenge> {
        match self {
            Self::ChallengeRequired(challenge) | Self::MalformedProof { challenge, .. } => {
                Some(challenge.as_ref())
            }
            _ => None,
        }
    }

    /// Structured body for automated callers
    pub fn to_body(&self) -> PaymentRejection {
        let mut body = PaymentRejection {
            code: self.code(),
            message: self.to_string(),
            field: None,
            expected: None,
            received: None,
            in_doubt: false,
            transaction: None,
            challenge: self.challenge().cloned(),
        };

        match self {
            Self::PolicyViolation(violation) => {
                let (expected, received) = violation.expected_received();
                body.field = Some(violation.field().to_string());
                body.expected = expected;
                body.received = received;
            }
            Self::ReplayDetected { nonce, .. } => {
                body.field = Some("nonce".to_string());
                body.expected = Some("unused nonce".to_string());
                body.received = Some(nonce.clone());
            }
            Self::SignatureInvalid { claimed, recovered } => {
                body.field = Some("signature".to_string());
                body.expected = Some(claimed.to_checksum());
                body.received = recovered.map(|r| r.to_checksum());
            }
            Self::SettlementFailed {
                in_doubt, tx_hash, ..
            } => {
                body.in_doubt = *in_doubt;
                body.transaction = tx_hash.clone();
            }
            _ => {}
        }

        body
    }
}

/// A session cannot hand its funds back to the owner
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CustodyError {
    #[error(
        "session {session_id} still holds {remaining} token units (dust threshold {dust}): {last_error}"
    )]
    TokenNotDrained {
        session_id: String,
        remaining: TokenAmount,
        dust: TokenAmount,
        last_error: String,
    },

    #[error("session {session_id} holds funds but its key material is gone")]
    KeyUnavailable { session_id: String },
}

/// Errors from the session wallet lifecycle
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("session {session_id} is not owned by {caller}")]
    NotOwner { session_id: String, caller: String },

    #[error("session {session_id} is {status}, cannot {operation}")]
    InvalidState {
        session_id: String,
        status: SessionStatus,
        operation: &'static str,
    },

    #[error("spending cap exceeded: cap {cap}, spent {spent}, requested {requested}")]
    CapExceeded {
        cap: TokenAmount,
        spent: TokenAmount,
        requested: TokenAmount,
    },

    #[error("session is not funded: {0}")]
    NotFunded(String),

    #[error("invalid session request: {0}")]
    InvalidRequest(String),

    #[error("concurrent update on session {0}, giving up")]
    Contention(String),

    #[error(transparent)]
    Custody(#[from] CustodyError),

    #[error("chain error: {0}")]
    Chain(#[from] crate::chain::ChainError),

    #[error("session store error: {0}")]
    Store(String),

    #[error("key vault error: {0}")]
    Vault(#[from] crate::sessions::VaultError),

    #[error("payment rejected: {0}")]
    Payment(#[from] GateRejection),
}

impl SessionError {
    /// HTTP status the surface should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::NotOwner { .. } => 403,
            Self::InvalidState { .. } | Self::Contention(_) => 409,
            Self::CapExceeded { .. } | Self::NotFunded(_) | Self::InvalidRequest(_) => 400,
            Self::Payment(rejection) => rejection.http_status(),
            Self::Custody(_) => 500,
            Self::Chain(_) => 502,
            Self::Store(_) | Self::Vault(_) => 500,
        }
    }
}
