//! Shared wire types for the paygate payment protocol and its SDK clients.
//!
//! Everything here is plain serde data: amounts and addresses travel as
//! strings so clients in any language can produce them without a big-number
//! or chain library. Validation happens on the server side.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// Protocol version advertised in challenges
pub const X402_VERSION: u8 = 1;

/// Request header carrying the serialized payment proof
pub const PAYMENT_HEADER: &str = "X-PAYMENT";

/// Response header carrying the base64 challenge on a 402
pub const PAYMENT_REQUIRED_HEADER: &str = "PAYMENT-REQUIRED";

/// Response header carrying the base64 settlement summary on success
pub const PAYMENT_RESPONSE_HEADER: &str = "X-PAYMENT-RESPONSE";

/// Only payment scheme this gate accepts
pub const SCHEME_EXACT: &str = "exact";

// =====================================================
// Proof header
// =====================================================

/// Payment proof as it appears in the `X-PAYMENT` header.
///
/// `amount` is a decimal (or 0x-hex) string of token base units,
/// `timestamp` is unix seconds at signing time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentProofPayload {
    pub nonce: String,
    pub amount: String,
    pub token: String,
    pub payer: String,
    pub recipient: String,
    pub signature: String,
    pub timestamp: u64,
}

impl PaymentProofPayload {
    /// Encode as the JSON form of the header value
    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|e| format!("Failed to serialize payment proof: {}", e))
    }

    /// Encode as the base64 form of the header value
    pub fn to_base64(&self) -> Result<String, String> {
        Ok(STANDARD.encode(self.to_json()?))
    }

    /// Decode a header value that is either raw JSON or base64(JSON)
    pub fn from_header(value: &str) -> Result<Self, String> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("Payment header is empty".to_string());
        }

        let json = if trimmed.starts_with('{') {
            trimmed.to_string()
        } else {
            let decoded = STANDARD
                .decode(trimmed)
                .map_err(|e| format!("Payment header is neither JSON nor base64: {}", e))?;
            String::from_utf8(decoded)
                .map_err(|e| format!("Invalid UTF-8 in payment header: {}", e))?
        };

        serde_json::from_str(&json).map_err(|e| format!("Malformed payment proof JSON: {}", e))
    }
}

// =====================================================
// Challenge (402 body)
// =====================================================

/// Body of a 402 response, naming everything a caller needs to pay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentChallenge {
    pub x402_version: u8,
    pub error: String,
    pub accepts: Vec<PaymentRequirements>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    /// Required price in token base units (decimal string)
    pub max_amount_required: String,
    /// Human-readable price, e.g. "0.01 USDC"
    pub amount_formatted: String,
    pub pay_to: String,
    pub asset: String,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub max_timeout_seconds: u64,
    pub header_name: String,
    /// Worked example of the header value with placeholder payer/nonce/signature
    pub example: PaymentProofPayload,
}

impl PaymentChallenge {
    /// Encode for the `PAYMENT-REQUIRED` response header
    pub fn to_base64(&self) -> Result<String, String> {
        let json = serde_json::to_string(self)
            .map_err(|e| format!("Failed to serialize payment challenge: {}", e))?;
        Ok(STANDARD.encode(json))
    }

    /// Decode a `PAYMENT-REQUIRED` response header
    pub fn from_base64(encoded: &str) -> Result<Self, String> {
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|e| format!("Failed to decode payment required header: {}", e))?;
        let json = String::from_utf8(decoded)
            .map_err(|e| format!("Invalid UTF-8 in payment required header: {}", e))?;
        serde_json::from_str(&json).map_err(|e| format!("Failed to parse payment challenge: {}", e))
    }
}

// =====================================================
// Rejections
// =====================================================

/// Machine-readable rejection category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCode {
    ChallengeRequired,
    MalformedProof,
    PolicyViolation,
    ReplayDetected,
    SignatureInvalid,
    SettlementFailed,
    UnknownOperation,
    LedgerUnavailable,
}

/// Structured rejection returned for every failed authorization.
///
/// `expected`/`received` name the offending field values so an automated
/// caller can correct the proof and retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRejection {
    pub code: RejectionCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<String>,
    /// True when a settlement transaction was broadcast but not confirmed
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub in_doubt: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<PaymentChallenge>,
}

// =====================================================
// Settlement response header
// =====================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementResponse {
    pub success: bool,
    pub transaction: String,
    pub network: String,
    pub payer: String,
}

impl SettlementResponse {
    /// Encode for the `X-PAYMENT-RESPONSE` header
    pub fn to_base64(&self) -> Result<String, String> {
        let json = serde_json::to_string(self)
            .map_err(|e| format!("Failed to serialize settlement response: {}", e))?;
        Ok(STANDARD.encode(json))
    }
}
