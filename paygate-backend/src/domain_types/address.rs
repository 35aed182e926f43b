//! EthAddress - strictly parsed wrapper around the ethers Address
//!
//! `Address::from_str` accepts anything hex-shaped. Payment proofs need
//! more than that: exactly 20 bytes, a 0x prefix, and a valid EIP-55
//! checksum whenever the input is mixed-case.

use ethers::types::Address;
use ethers::utils::to_checksum;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct EthAddress(pub Address);

impl EthAddress {
    /// Parse a 0x-prefixed 40-hex-digit address, enforcing the checksum on mixed-case input
    pub fn parse(input: &str) -> Result<Self, String> {
        let hex_part = input
            .strip_prefix("0x")
            .ok_or_else(|| format!("Address '{}' must start with 0x", input))?;

        if hex_part.len() != 40 {
            return Err(format!(
                "Address '{}' must have 40 hex digits, got {}",
                input,
                hex_part.len()
            ));
        }
        if !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("Address '{}' contains non-hex characters", input));
        }

        let address = Address::from_str(hex_part)
            .map_err(|e| format!("Invalid address '{}': {}", input, e))?;

        let has_upper = hex_part.chars().any(|c| c.is_ascii_uppercase());
        let has_lower = hex_part.chars().any(|c| c.is_ascii_lowercase());
        if has_upper && has_lower && to_checksum(&address, None) != input {
            return Err(format!("Address '{}' has an invalid EIP-55 checksum", input));
        }

        Ok(Self(address))
    }

    /// EIP-55 checksummed form
    pub fn to_checksum(&self) -> String {
        to_checksum(&self.0, None)
    }

    /// Lowercase 0x form, used as a storage and map key
    pub fn to_lowercase_hex(&self) -> String {
        format!("{:?}", self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl FromStr for EthAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Address> for EthAddress {
    fn from(input: Address) -> Self {
        Self(input)
    }
}

impl From<EthAddress> for Address {
    fn from(input: EthAddress) -> Self {
        input.0
    }
}

impl std::ops::Deref for EthAddress {
    type Target = Address;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for EthAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_checksum())
    }
}

impl Serialize for EthAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_checksum())
    }
}

impl<'de> Deserialize<'de> for EthAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
