//! 402 challenge construction

use chrono::Utc;
use ethers::types::H256;
use paygate_types::{
    PAYMENT_HEADER, PaymentChallenge, PaymentProofPayload, PaymentRequirements, SCHEME_EXACT,
    X402_VERSION,
};

use super::gate::GateConfig;
use super::pricing::PriceEntry;
use super::verifier::generate_nonce;

/// Challenge naming the exact price, asset, payee and network for `entry`,
/// with a filled-in example of the header a caller should send back.
pub fn build_challenge(
    entry: &PriceEntry,
    config: &GateConfig,
    resource: &str,
    error: &str,
) -> PaymentChallenge {
    let nonce = generate_nonce().unwrap_or_else(|_| H256::zero());

    let example = PaymentProofPayload {
        nonce: format!("{:?}", nonce),
        amount: entry.price.to_string(),
        token: config.token.to_checksum(),
        payer: "<your address>".to_string(),
        recipient: entry.recipient.to_checksum(),
        signature: "<personal_sign(keccak256(nonce ++ amount ++ token ++ payer ++ recipient))>"
            .to_string(),
        timestamp: Utc::now().timestamp().max(0) as u64,
    };

    PaymentChallenge {
        x402_version: X402_VERSION,
        error: error.to_string(),
        accepts: vec![PaymentRequirements {
            scheme: SCHEME_EXACT.to_string(),
            network: config.network.clone(),
            max_amount_required: entry.price.to_string(),
            amount_formatted: entry
                .price
                .format(config.token_decimals, &config.token_symbol),
            pay_to: entry.recipient.to_checksum(),
            asset: config.token.to_checksum(),
            resource: resource.to_string(),
            description: entry.description.clone(),
            max_timeout_seconds: config.freshness_window.as_secs(),
            header_name: PAYMENT_HEADER.to_string(),
            example,
        }],
    }
}
