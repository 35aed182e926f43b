//! Settlement contract and ERC20 ABI helpers
//!
//! Manual ABI encoding without the abigen! macro.

use ethers::abi::{AbiDecode, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;

use crate::payment::PaymentProof;

/// Function selector for balanceOf(address)
pub const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

/// Function selector for transfer(address,uint256)
pub const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// Function selector for approve(address,uint256)
pub const APPROVE_SELECTOR: [u8; 4] = [0x09, 0x5e, 0xa7, 0xb3];

/// Function selector for allowance(address,address)
pub const ALLOWANCE_SELECTOR: [u8; 4] = [0xdd, 0x62, 0xed, 0x3e];

pub const VERIFY_PAYMENT_SIGNATURE: &str =
    "verifyPayment(bytes32,uint256,address,address,address,bytes)";
pub const SETTLE_PAYMENT_SIGNATURE: &str =
    "settlePayment(bytes32,uint256,address,address,address,bytes)";
pub const IS_NONCE_USED_SIGNATURE: &str = "isNonceUsed(bytes32)";

/// First four bytes of keccak256 of a function signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn with_selector(selector: [u8; 4], tokens: &[Token]) -> Bytes {
    let mut data = selector.to_vec();
    data.extend_from_slice(&ethers::abi::encode(tokens));
    Bytes::from(data)
}

fn proof_tokens(proof: &PaymentProof) -> Vec<Token> {
    vec![
        Token::FixedBytes(proof.nonce().as_bytes().to_vec()),
        Token::Uint(proof.amount().0),
        Token::Address(proof.token().0),
        Token::Address(proof.payer().0),
        Token::Address(proof.recipient().0),
        Token::Bytes(proof.signature_bytes()),
    ]
}

/// Encode verifyPayment(nonce, amount, token, payer, recipient, signature)
pub fn encode_verify_payment(proof: &PaymentProof) -> Bytes {
    with_selector(selector(VERIFY_PAYMENT_SIGNATURE), &proof_tokens(proof))
}

/// Encode settlePayment(nonce, amount, token, payer, recipient, signature)
pub fn encode_settle_payment(proof: &PaymentProof) -> Bytes {
    with_selector(selector(SETTLE_PAYMENT_SIGNATURE), &proof_tokens(proof))
}

/// Encode isNonceUsed(bytes32)
pub fn encode_is_nonce_used(nonce: H256) -> Bytes {
    with_selector(
        selector(IS_NONCE_USED_SIGNATURE),
        &[Token::FixedBytes(nonce.as_bytes().to_vec())],
    )
}

/// Encode a balanceOf(address) call
pub fn encode_balance_of(address: Address) -> Bytes {
    with_selector(BALANCE_OF_SELECTOR, &[Token::Address(address)])
}

/// Encode transfer(address,uint256)
pub fn encode_transfer(to: Address, amount: U256) -> Bytes {
    with_selector(TRANSFER_SELECTOR, &[Token::Address(to), Token::Uint(amount)])
}

/// Encode approve(address,uint256)
pub fn encode_approve(spender: Address, amount: U256) -> Bytes {
    with_selector(
        APPROVE_SELECTOR,
        &[Token::Address(spender), Token::Uint(amount)],
    )
}

/// Encode allowance(address,address)
pub fn encode_allowance(owner: Address, spender: Address) -> Bytes {
    with_selector(
        ALLOWANCE_SELECTOR,
        &[Token::Address(owner), Token::Address(spender)],
    )
}

/// Decode a uint256 return value
pub fn decode_uint(data: &[u8]) -> Result<U256, String> {
    if data.len() < 32 {
        return Err(format!("uint256 response too short: {} bytes", data.len()));
    }
    U256::decode(&data[..32]).map_err(|e| format!("Failed to decode uint256: {}", e))
}

/// Decode a bool return value
pub fn decode_bool(data: &[u8]) -> Result<bool, String> {
    let tokens = ethers::abi::decode(&[ParamType::Bool], data)
        .map_err(|e| format!("Failed to decode bool: {}", e))?;
    match tokens.first() {
        Some(Token::Bool(value)) => Ok(*value),
        other => Err(format!("Expected bool, got {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::AbiEncode;
    use std::str::FromStr;

    #[test]
    fn test_erc20_selectors() {
        assert_eq!(BALANCE_OF_SELECTOR, selector("balanceOf(address)"));
        assert_eq!(TRANSFER_SELECTOR, selector("transfer(address,uint256)"));
        assert_eq!(APPROVE_SELECTOR, selector("approve(address,uint256)"));
        assert_eq!(ALLOWANCE_SELECTOR, selector("allowance(address,address)"));
    }

    #[test]
    fn test_encode_transfer_layout() {
        let to = Address::from_str("0x70997970c51812dc3a010c7d01b50e0d17dc79c8").unwrap();
        let data = encode_transfer(to, U256::from(10_000u64));
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(&data[0..4], &TRANSFER_SELECTOR);
        assert_eq!(&data[16..36], to.as_bytes());
        assert_eq!(U256::from_big_endian(&data[36..68]), U256::from(10_000u64));
    }

    #[test]
    fn test_is_nonce_used_calldata() {
        let nonce = H256::repeat_byte(0x11);
        let data = encode_is_nonce_used(nonce);
        assert_eq!(data.len(), 36);
        assert_eq!(&data[4..36], nonce.as_bytes());
    }

    #[test]
    fn test_decode_return_values() {
        assert_eq!(
            decode_uint(&U256::from(1_000_000u64).encode()).unwrap(),
            U256::from(1_000_000u64)
        );
        assert!(decode_bool(&U256::one().encode()).unwrap());
        assert!(!decode_bool(&U256::zero().encode()).unwrap());
        assert!(decode_uint(&[0u8; 4]).is_err());
    }
}
