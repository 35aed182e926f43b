//! Local signature checks for payment proofs
//!
//! The signed message is the packed encoding
//! `nonce[32] ‖ amount[32] ‖ token[20] ‖ payer[20] ‖ recipient[20]`,
//! hashed with keccak256 and signed as an EIP-191 personal message. This is
//! the same digest the settlement contract's `verifyPayment` rebuilds, so a
//! proof that passes here is one the contract can accept.
//!
//! Verification is pure and costs no network round trip.
//!
//! The proof's timestamp is not part of the signed message, so anyone
//! holding a proof can restamp it and the freshness window is advisory.
//! Replay protection rests on the nonce ledger and, once a record has been
//! evicted, on the contract's used-nonce flag.

use ethers::signers::LocalWallet;
use ethers::types::{H256, RecoveryMessage};
use ethers::utils::{hash_message, keccak256};

use super::proof::PaymentProof;
use crate::domain_types::{EthAddress, TokenAmount};

/// Byte sequence a payer signs for a payment
pub fn canonical_message(
    nonce: H256,
    amount: TokenAmount,
    token: &EthAddress,
    payer: &EthAddress,
    recipient: &EthAddress,
) -> Vec<u8> {
    let mut amount_be = [0u8; 32];
    amount.0.to_big_endian(&mut amount_be);

    let mut message = Vec::with_capacity(32 + 32 + 20 * 3);
    message.extend_from_slice(nonce.as_bytes());
    message.extend_from_slice(&amount_be);
    message.extend_from_slice(token.as_bytes());
    message.extend_from_slice(payer.as_bytes());
    message.extend_from_slice(recipient.as_bytes());
    message
}

/// keccak256 of the canonical message
pub fn canonical_digest(
    nonce: H256,
    amount: TokenAmount,
    token: &EthAddress,
    payer: &EthAddress,
    recipient: &EthAddress,
) -> H256 {
    H256::from(keccak256(canonical_message(
        nonce, amount, token, payer, recipient,
    )))
}

/// Stateless verifier. Runs before anything that costs gas or network.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureVerifier;

impl SignatureVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Recover the address that signed this proof's canonical digest
    pub fn recover(&self, proof: &PaymentProof) -> Result<EthAddress, String> {
        let digest = proof_digest(proof);
        // Data variant applies the EIP-191 prefix before recovery
        proof
            .signature()
            .recover(RecoveryMessage::Data(digest.as_bytes().to_vec()))
            .map(EthAddress::from)
            .map_err(|e| format!("Signature recovery failed: {}", e))
    }

    /// True only if the signature recovers to the claimed payer
    pub fn verify(&self, proof: &PaymentProof) -> bool {
        match self.recover(proof) {
            Ok(recovered) => recovered == proof.payer(),
            Err(e) => {
                log::debug!("[Verifier] {} for nonce {}", e, proof.nonce_hex());
                false
            }
        }
    }
}

fn proof_digest(proof: &PaymentProof) -> H256 {
    canonical_digest(
        proof.nonce(),
        proof.amount(),
        &proof.token(),
        &proof.payer(),
        &proof.recipient(),
    )
}

/// Generate a random 32-byte payment nonce
pub fn generate_nonce() -> Result<H256, String> {
    let mut bytes = [0u8; 32];
    getrandom::getrandom(&mut bytes).map_err(|e| format!("Failed to generate nonce: {}", e))?;
    Ok(H256::from(keccak256(bytes)))
}

/// Sign a payment from `wallet` to `recipient`, producing a proof the gate accepts
pub fn sign_payment(
    wallet: &LocalWallet,
    nonce: H256,
    amount: TokenAmount,
    token: EthAddress,
    recipient: EthAddress,
    timestamp: u64,
) -> Result<PaymentProof, String> {
    use ethers::signers::Signer;

    let payer = EthAddress::from(wallet.address());
    let digest = canonical_digest(nonce, amount, &token, &payer, &recipient);

    let signature = wallet
        .sign_hash(hash_message(digest.as_bytes()))
        .map_err(|e| format!("Failed to sign payment: {}", e))?;

    Ok(PaymentProof::new(
        nonce, amount, token, payer, recipient, signature, timestamp,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    // Hardhat accounts #0 and #1
    const PAYER_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const PAYER: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";
    const OTHER_KEY: &str = "59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
    const RECIPIENT: &str = "0x70997970c51812dc3a010c7d01b50e0d17dc79c8";
    const USDC: &str = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913";

    fn wallet(key: &str) -> LocalWallet {
        LocalWallet::from_str(key).unwrap()
    }

    fn signed(key: &str, amount: u64) -> PaymentProof {
        sign_payment(
            &wallet(key),
            generate_nonce().unwrap(),
            TokenAmount::from(amount),
            EthAddress::parse(USDC).unwrap(),
            EthAddress::parse(RECIPIENT).unwrap(),
            1_700_000_000,
        )
        .unwrap()
    }

    #[test]
    fn test_canonical_message_layout() {
        let nonce = H256::repeat_byte(0xab);
        let msg = canonical_message(
            nonce,
            TokenAmount::from(10_000),
            &EthAddress::parse(USDC).unwrap(),
            &EthAddress::parse(PAYER).unwrap(),
            &EthAddress::parse(RECIPIENT).unwrap(),
        );
        assert_eq!(msg.len(), 124);
        assert_eq!(&msg[0..32], nonce.as_bytes());
        assert_eq!(&msg[62..64], &[0x27, 0x10]);
        assert_eq!(hex::encode(&msg[104..124]), &RECIPIENT[2..]);
    }

    #[test]
    fn test_signed_proof_verifies() {
        let proof = signed(PAYER_KEY, 10_000);
        assert_eq!(proof.payer(), EthAddress::parse(PAYER).unwrap());
        assert!(SignatureVerifier::new().verify(&proof));
    }

    #[test]
    fn test_claimed_payer_mismatch_fails() {
        let proof = signed(OTHER_KEY, 10_000);
        // re-label the proof as coming from account #0
        let mut payload = proof.to_payload();
        payload.payer = PAYER.to_string();
        let forged = PaymentProof::from_payload(&payload).unwrap();

        let verifier = SignatureVerifier::new();
        assert!(!verifier.verify(&forged));
        assert_ne!(verifier.recover(&forged).unwrap(), forged.payer());
    }

    #[test]
    fn test_tampered_amount_fails() {
        let proof = signed(PAYER_KEY, 10_000);
        let mut payload = proof.to_payload();
        payload.amount = "1".to_string();
        let tampered = PaymentProof::from_payload(&payload).unwrap();
        assert!(!SignatureVerifier::new().verify(&tampered));
    }

    #[test]
    fn test_timestamp_not_signed() {
        let proof = signed(PAYER_KEY, 10_000);
        let mut payload = proof.to_payload();
        payload.timestamp += 30;
        let shifted = PaymentProof::from_payload(&payload).unwrap();
        assert!(SignatureVerifier::new().verify(&shifted));
    }

    #[test]
    fn test_nonces_are_unique() {
        assert_ne!(generate_nonce().unwrap(), generate_nonce().unwrap());
    }
}
