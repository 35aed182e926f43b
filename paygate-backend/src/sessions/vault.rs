//! Encrypted-at-rest session keys
//!
//! Keys are sealed with AES-256-GCM under a key derived from
//! `SESSION_KEY_ENCRYPTION_SECRET` with HKDF-SHA256, a fresh 96-bit IV per
//! record and the session address as associated data, so a ciphertext
//! cannot be moved onto another record. Decrypted keys only exist inside an [`UnlockedKey`],
//! which is dropped at the end of the operation that needed it.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use ethers::signers::{LocalWallet, Signer};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::domain_types::EthAddress;

pub const IV_SIZE: usize = 12;

const KEY_DERIVATION_SALT: &[u8] = b"paygate-session-keys";
const KEY_DERIVATION_INFO: &[u8] = b"aes-256-gcm session key";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error("session key encryption secret is not configured")]
    MissingSecret,

    #[error("random generation failed: {0}")]
    Random(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    /// Wrong secret, tampered ciphertext, or ciphertext from another record
    #[error("decryption failed for {0}")]
    Decrypt(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// Sealed private key as stored
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedKey {
    pub iv: [u8; IV_SIZE],
    pub ciphertext: Vec<u8>,
}

impl EncryptedKey {
    pub fn iv_hex(&self) -> String {
        hex::encode(self.iv)
    }

    pub fn ciphertext_hex(&self) -> String {
        hex::encode(&self.ciphertext)
    }

    pub fn from_hex(iv: &str, ciphertext: &str) -> Result<Self, VaultError> {
        let iv_bytes = hex::decode(iv).map_err(|e| VaultError::InvalidKey(format!("iv: {}", e)))?;
        let iv: [u8; IV_SIZE] = iv_bytes
            .try_into()
            .map_err(|_| VaultError::InvalidKey("iv must be 12 bytes".to_string()))?;
        let ciphertext = hex::decode(ciphertext)
            .map_err(|e| VaultError::InvalidKey(format!("ciphertext: {}", e)))?;
        Ok(Self { iv, ciphertext })
    }
}

impl std::fmt::Debug for EncryptedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedKey")
            .field("iv", &self.iv_hex())
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

/// A decrypted session key, usable for the current operation only
pub struct UnlockedKey {
    wallet: LocalWallet,
}

impl UnlockedKey {
    pub fn wallet(&self) -> &LocalWallet {
        &self.wallet
    }

    pub fn address(&self) -> EthAddress {
        EthAddress::from(self.wallet.address())
    }
}

impl std::fmt::Debug for UnlockedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockedKey")
            .field("address", &self.address())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

pub struct KeyVault {
    cipher: Aes256Gcm,
}

fn derive_key(secret: &str) -> Result<Zeroizing<[u8; 32]>, VaultError> {
    let hkdf = Hkdf::<Sha256>::new(Some(KEY_DERIVATION_SALT), secret.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf.expand(KEY_DERIVATION_INFO, &mut key[..])
        .map_err(|e| VaultError::InvalidKey(format!("key derivation failed: {}", e)))?;
    Ok(key)
}

impl KeyVault {
    pub fn from_secret(secret: &str) -> Result<Self, VaultError> {
        if secret.trim().is_empty() {
            return Err(VaultError::MissingSecret);
        }
        let key = derive_key(secret)?;
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| VaultError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Generate a fresh session keypair, returning its address and sealed key
    pub fn generate(&self) -> Result<(EthAddress, EncryptedKey), VaultError> {
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let address = EthAddress::from(wallet.address());
        let secret = Zeroizing::new(wallet.signer().to_bytes().to_vec());
        let sealed = self.seal(&address, &secret)?;
        Ok((address, sealed))
    }

    pub fn seal(&self, address: &EthAddress, secret: &[u8]) -> Result<EncryptedKey, VaultError> {
        let mut iv = [0u8; IV_SIZE];
        getrandom::getrandom(&mut iv).map_err(|e| VaultError::Random(e.to_string()))?;

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: secret,
                    aad: address.as_bytes(),
                },
            )
            .map_err(|e| VaultError::Encrypt(e.to_string()))?;

        Ok(EncryptedKey { iv, ciphertext })
    }

    /// Decrypt for one operation. Fails if the key does not belong to `address`.
    pub fn unlock(
        &self,
        address: &EthAddress,
        sealed: &EncryptedKey,
    ) -> Result<UnlockedKey, VaultError> {
        let plaintext = Zeroizing::new(
            self.cipher
                .decrypt(
                    Nonce::from_slice(&sealed.iv),
                    Payload {
                        msg: &sealed.ciphertext,
                        aad: address.as_bytes(),
                    },
                )
                .map_err(|_| VaultError::Decrypt(address.to_checksum()))?,
        );

        let wallet = LocalWallet::from_bytes(&plaintext)
            .map_err(|e| VaultError::InvalidKey(e.to_string()))?;
        if EthAddress::from(wallet.address()) != *address {
            return Err(VaultError::InvalidKey(format!(
                "key does not derive {}",
                address
            )));
        }
        Ok(UnlockedKey { wallet })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_unlock() {
        let vault = KeyVault::from_secret("test-secret").unwrap();
        let (address, sealed) = vault.generate().unwrap();
        let key = vault.unlock(&address, &sealed).unwrap();
        assert_eq!(key.address(), address);
    }

    #[test]
    fn test_key_is_derived_not_hashed() {
        use sha2::Digest;
        let derived = derive_key("test-secret").unwrap();
        assert_ne!(derived[..], Sha256::digest(b"test-secret")[..]);
        assert_eq!(derived[..], derive_key("test-secret").unwrap()[..]);
        assert_ne!(derived[..], derive_key("other-secret").unwrap()[..]);
    }

    #[test]
    fn test_iv_differs_per_record() {
        let vault = KeyVault::from_secret("test-secret").unwrap();
        let (_, a) = vault.generate().unwrap();
        let (_, b) = vault.generate().unwrap();
        assert_ne!(a.iv, b.iv);
    }

    #[test]
    fn test_wrong_secret_or_address_fails() {
        let vault = KeyVault::from_secret("test-secret").unwrap();
        let (address, sealed) = vault.generate().unwrap();

        let other = KeyVault::from_secret("other-secret").unwrap();
        assert!(matches!(
            other.unlock(&address, &sealed).unwrap_err(),
            VaultError::Decrypt(_)
        ));

        let (other_address, _) = vault.generate().unwrap();
        assert!(vault.unlock(&other_address, &sealed).is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let vault = KeyVault::from_secret("test-secret").unwrap();
        let (address, sealed) = vault.generate().unwrap();
        let key = vault.unlock(&address, &sealed).unwrap();
        let printed = format!("{:?}", key);
        assert!(printed.contains("REDACTED"));
        let raw = hex::encode(key.wallet().signer().to_bytes());
        assert!(!printed.contains(&raw));
    }

    #[test]
    fn test_hex_round_trip_and_empty_secret() {
        let vault = KeyVault::from_secret("s").unwrap();
        let (address, sealed) = vault.generate().unwrap();
        let restored = EncryptedKey::from_hex(&sealed.iv_hex(), &sealed.ciphertext_hex()).unwrap();
        assert!(vault.unlock(&address, &restored).is_ok());
        assert!(matches!(
            KeyVault::from_secret("  ").err(),
            Some(VaultError::MissingSecret)
        ));
    }
}
