//! TokenAmount - value-token quantity in base units
//!
//! Parses from:
//! - Decimal strings: "10000" -> U256(10000)
//! - Hex strings with 0x prefix: "0x2710" -> U256(10000)
//! - Integers: 10000 -> U256(10000)
//!
//! ethers' `U256::from_str` treats every string as hex, so "10000" would
//! silently become 0x10000 = 65536. Decimal is tried explicitly first.

use ethers::types::U256;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TokenAmount(pub U256);

impl TokenAmount {
    pub const ZERO: TokenAmount = TokenAmount(U256([0, 0, 0, 0]));

    /// Parse a base-unit string (decimal, or hex with 0x prefix)
    pub fn parse_base_units(value: &str) -> Result<Self, String> {
        let cleaned = value.trim();
        if cleaned.is_empty() {
            return Err("Amount is empty".to_string());
        }
        if cleaned.starts_with('-') {
            return Err(format!("Amount '{}' is negative", cleaned));
        }

        if let Some(hex_digits) = cleaned
            .strip_prefix("0x")
            .or_else(|| cleaned.strip_prefix("0X"))
        {
            return U256::from_str(&format!("0x{}", hex_digits.to_lowercase()))
                .map(Self)
                .map_err(|e| format!("Failed to parse hex amount '{}': {}", cleaned, e));
        }

        U256::from_dec_str(cleaned)
            .map(Self)
            .map_err(|e| format!("Failed to parse amount '{}': {}", cleaned, e))
    }

    /// Parse a human decimal amount ("0.01") into base units for a token with `decimals`
    pub fn from_decimal_str(value: &str, decimals: u8) -> Result<Self, String> {
        let cleaned = value.trim();
        let (whole, frac) = match cleaned.split_once('.') {
            Some((w, f)) => (w, f),
            None => (cleaned, ""),
        };

        if whole.is_empty() && frac.is_empty() {
            return Err(format!("Amount '{}' has no digits", value));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("Amount '{}' is not a plain decimal number", value));
        }
        if frac.len() > decimals as usize {
            return Err(format!(
                "Amount '{}' has more than {} fractional digits",
                value, decimals
            ));
        }

        let padded = format!("{}{:0<width$}", whole, frac, width = decimals as usize);
        let digits = padded.trim_start_matches('0');
        if digits.is_empty() {
            return Ok(Self::ZERO);
        }
        U256::from_dec_str(digits)
            .map(Self)
            .map_err(|e| format!("Amount '{}' out of range: {}", value, e))
    }

    /// Human-readable form, e.g. "0.01 USDC"
    pub fn format(&self, decimals: u8, symbol: &str) -> String {
        let raw = self.0.to_string();
        let decimals = decimals as usize;
        let (whole, frac) = if raw.len() > decimals {
            let split = raw.len() - decimals;
            (raw[..split].to_string(), raw[split..].to_string())
        } else {
            ("0".to_string(), format!("{:0>width$}", raw, width = decimals))
        };
        let frac = frac.trim_end_matches('0');
        if frac.is_empty() {
            format!("{} {}", whole, symbol)
        } else {
            format!("{}.{} {}", whole, frac, symbol)
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TokenAmount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_base_units(s)
    }
}

impl From<U256> for TokenAmount {
    fn from(input: U256) -> Self {
        Self(input)
    }
}

impl From<u64> for TokenAmount {
    fn from(input: u64) -> Self {
        Self(U256::from(input))
    }
}

impl From<TokenAmount> for U256 {
    fn from(input: TokenAmount) -> Self {
        input.0
    }
}

impl std::ops::Deref for TokenAmount {
    type Target = U256;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Serialize for TokenAmount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct TokenAmountVisitor;

        impl<'de> Visitor<'de> for TokenAmountVisitor {
            type Value = TokenAmount;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a token amount in base units, as a decimal or 0x-hex string")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                TokenAmount::parse_base_units(value).map_err(de::Error::custom)
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(TokenAmount::from(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u64::try_from(value)
                    .map(TokenAmount::from)
                    .map_err(|_| de::Error::custom("negative value cannot be a token amount"))
            }
        }

        deserializer.deserialize_any(TokenAmountVisitor)
    }
}
