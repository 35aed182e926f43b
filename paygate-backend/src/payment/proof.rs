//! Validated payment proof
//!
//! `PaymentProof` can only be built through [`PaymentProof::from_payload`]
//! (or the signer), so every field is known to be well-formed once a value
//! exists. Fields are private; the proof is immutable.

use ethers::types::{H256, Signature};
use paygate_types::PaymentProofPayload;
use std::str::FromStr;

use crate::domain_types::{EthAddress, TokenAmount};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentProof {
    nonce: H256,
    amount: TokenAmount,
    token: EthAddress,
    payer: EthAddress,
    recipient: EthAddress,
    signature: Signature,
    timestamp: u64,
}

impl PaymentProof {
    pub(crate) fn new(
        nonce: H256,
        amount: TokenAmount,
        token: EthAddress,
        payer: EthAddress,
        recipient: EthAddress,
        signature: Signature,
        timestamp: u64,
    ) -> Self {
        Self {
            nonce,
            amount,
            token,
            payer,
            recipient,
            signature,
            timestamp,
        }
    }

    /// Parse a header value (raw JSON or base64 JSON) into a validated proof
    pub fn from_header(value: &str) -> Result<Self, String> {
        let payload = PaymentProofPayload::from_header(value)?;
        Self::from_payload(&payload)
    }

    /// Validate every field of a wire payload. Fails on the first bad field.
    pub fn from_payload(payload: &PaymentProofPayload) -> Result<Self, String> {
        let nonce = parse_nonce(&payload.nonce)?;
        let amount = TokenAmount::parse_base_units(&payload.amount)
            .map_err(|e| format!("amount: {}", e))?;
        let token = EthAddress::parse(&payload.token).map_err(|e| format!("token: {}", e))?;
        let payer = EthAddress::parse(&payload.payer).map_err(|e| format!("payer: {}", e))?;
        let recipient =
            EthAddress::parse(&payload.recipient).map_err(|e| format!("recipient: {}", e))?;
        let signature = parse_signature(&payload.signature)?;

        if payload.timestamp == 0 {
            return Err("timestamp: must be a unix timestamp in seconds".to_string());
        }

        Ok(Self {
            nonce,
            amount,
            token,
            payer,
            recipient,
            signature,
            timestamp: payload.timestamp,
        })
    }

    /// Wire form for the `X-PAYMENT` header
    pub fn to_payload(&self) -> PaymentProofPayload {
        PaymentProofPayload {
            nonce: self.nonce_hex(),
            amount: self.amount.to_string(),
            token: self.token.to_checksum(),
            payer: self.payer.to_checksum(),
            recipient: self.recipient.to_checksum(),
            signature: format!("0x{}", hex::encode(self.signature.to_vec())),
            timestamp: self.timestamp,
        }
    }

    pub fn nonce(&self) -> H256 {
        self.nonce
    }

    pub fn nonce_hex(&self) -> String {
        format!("{:?}", self.nonce)
    }

    pub fn amount(&self) -> TokenAmount {
        self.amount
    }

    pub fn token(&self) -> EthAddress {
        self.token
    }

    pub fn payer(&self) -> EthAddress {
        self.payer
    }

    pub fn recipient(&self) -> EthAddress {
        self.recipient
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// 65-byte r ‖ s ‖ v encoding, as passed to the settlement contract
    pub fn signature_bytes(&self) -> Vec<u8> {
        self.signature.to_vec()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

fn parse_nonce(value: &str) -> Result<H256, String> {
    let hex_part = value
        .strip_prefix("0x")
        .ok_or_else(|| "nonce: must be 0x-prefixed".to_string())?;
    if hex_part.len() != 64 {
        return Err(format!(
            "nonce: expected 64 hex digits, got {}",
            hex_part.len()
        ));
    }
    H256::from_str(hex_part).map_err(|e| format!("nonce: {}", e))
}

/// Parse a 65-byte hex signature, normalizing v from 0/1 to 27/28
fn parse_signature(value: &str) -> Result<Signature, String> {
    let hex_part = value
        .strip_prefix("0x")
        .ok_or_else(|| "signature: must be 0x-prefixed".to_string())?;
    if hex_part.len() != 130 {
        return Err(format!(
            "signature: expected 130 hex chars, got {}",
            hex_part.len()
        ));
    }

    let mut bytes = hex::decode(hex_part).map_err(|e| format!("signature: {}", e))?;
    if bytes[64] < 27 {
        bytes[64] += 27;
    }

    Signature::try_from(bytes.as_slice()).map_err(|e| format!("signature: {}", e))
}
