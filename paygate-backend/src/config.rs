use ethers::types::{Address, U256};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use strum::{Display, EnumString};

use crate::domain_types::{EthAddress, TokenAmount};
use crate::payment::{GateConfig, PricingTable};
use crate::sessions::{DEFAULT_TRANSFER_POLICIES, RetryPolicy, SessionConfig};

/// Environment variable names
pub mod env_vars {
    pub const PORT: &str = "PORT";
    pub const DATABASE_URL: &str = "DATABASE_URL";
    pub const PAYGATE_MODE: &str = "PAYGATE_MODE";
    pub const RPC_URL: &str = "RPC_URL";
    pub const CHAIN_ID: &str = "CHAIN_ID";
    pub const NETWORK_ID: &str = "NETWORK_ID";
    pub const TOKEN_ADDRESS: &str = "TOKEN_ADDRESS";
    pub const TOKEN_DECIMALS: &str = "TOKEN_DECIMALS";
    pub const TOKEN_SYMBOL: &str = "TOKEN_SYMBOL";
    pub const SETTLEMENT_CONTRACT_ADDRESS: &str = "SETTLEMENT_CONTRACT_ADDRESS";
    pub const SETTLEMENT_OPERATOR_PRIVATE_KEY: &str = "SETTLEMENT_OPERATOR_PRIVATE_KEY";
    pub const PAYMENT_RECIPIENT: &str = "PAYMENT_RECIPIENT";
    pub const PRICING_FILE: &str = "PRICING_FILE";
    pub const FRESHNESS_WINDOW_SECS: &str = "FRESHNESS_WINDOW_SECS";
    pub const SETTLEMENT_TIMEOUT_SECS: &str = "SETTLEMENT_TIMEOUT_SECS";
    pub const NONCE_EVICTION_INTERVAL_SECS: &str = "NONCE_EVICTION_INTERVAL_SECS";
    pub const SESSION_KEY_ENCRYPTION_SECRET: &str = "SESSION_KEY_ENCRYPTION_SECRET";
    pub const SESSION_DUST_THRESHOLD: &str = "SESSION_DUST_THRESHOLD";
    pub const SESSION_MIN_GAS_FUNDING: &str = "SESSION_MIN_GAS_FUNDING";
}

/// Where settlement and wallet transactions go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum PaygateMode {
    /// Real settlement contract over JSON-RPC
    Contract,
    /// In-process chain, nothing leaves the host
    Sandbox,
}

// Sandbox placeholders. Nothing is deployed at these addresses.
const SANDBOX_TOKEN: &str = "0x036cbd53842c5426634e7929541ec2318f3dcf7e";
const SANDBOX_CONTRACT: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";
const SANDBOX_RECIPIENT: &str = "0x70997970c51812dc3a010c7d01b50e0d17dc79c8";

/// Served when no pricing file is configured
const DEFAULT_PRICING: &str = r#"
[[operation]]
id = "demo.echo"
price = "0.01"
description = "Echoes the request body back"
"#;

/// Clock skew accepted on proof timestamps
const FUTURE_TOLERANCE: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub mode: PaygateMode,
    pub network: String,
    pub chain_id: u64,
    pub rpc_url: Option<String>,
    pub token: EthAddress,
    pub token_decimals: u8,
    pub token_symbol: String,
    pub settlement_contract: EthAddress,
    pub operator_private_key: Option<String>,
    pub payment_recipient: EthAddress,
    pub pricing_file: Option<String>,
    pub freshness_window: Duration,
    pub settlement_timeout: Duration,
    pub nonce_eviction_interval: Duration,
    pub session_secret: Option<String>,
    pub session_dust_threshold: TokenAmount,
    pub session_min_gas_funding: U256,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("mode", &self.mode)
            .field("network", &self.network)
            .field("chain_id", &self.chain_id)
            .field("token", &self.token)
            .field("settlement_contract", &self.settlement_contract)
            .field("operator_private_key", &self.operator_private_key.as_ref().map(|_| "[REDACTED]"))
            .field("session_secret", &self.session_secret.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mode: PaygateMode = parse_or(&get, env_vars::PAYGATE_MODE, PaygateMode::Sandbox)?;
        let sandbox = mode == PaygateMode::Sandbox;

        // Contract mode has no safe defaults for where money goes
        let address = |name: &str, sandbox_default: &str| -> Result<EthAddress, String> {
            match get(name) {
                Some(v) => EthAddress::parse(&v).map_err(|e| format!("{}: {}", name, e)),
                None if sandbox => EthAddress::parse(sandbox_default),
                None => Err(format!("{} must be set in contract mode", name)),
            }
        };

        let token = address(env_vars::TOKEN_ADDRESS, SANDBOX_TOKEN)?;
        let settlement_contract = address(env_vars::SETTLEMENT_CONTRACT_ADDRESS, SANDBOX_CONTRACT)?;
        let payment_recipient = address(env_vars::PAYMENT_RECIPIENT, SANDBOX_RECIPIENT)?;

        let rpc_url = get(env_vars::RPC_URL);
        let operator_private_key = get(env_vars::SETTLEMENT_OPERATOR_PRIVATE_KEY);
        if !sandbox {
            if rpc_url.is_none() {
                return Err(format!("{} must be set in contract mode", env_vars::RPC_URL));
            }
            if operator_private_key.is_none() {
                return Err(format!(
                    "{} must be set in contract mode",
                    env_vars::SETTLEMENT_OPERATOR_PRIVATE_KEY
                ));
            }
        }

        let session_dust_threshold = match get(env_vars::SESSION_DUST_THRESHOLD) {
            Some(v) => TokenAmount::parse_base_units(&v)
                .map_err(|e| format!("{}: {}", env_vars::SESSION_DUST_THRESHOLD, e))?,
            None => TokenAmount::from(100u64),
        };
        let session_min_gas_funding = match get(env_vars::SESSION_MIN_GAS_FUNDING) {
            Some(v) => U256::from_dec_str(&v)
                .map_err(|e| format!("{}: {}", env_vars::SESSION_MIN_GAS_FUNDING, e))?,
            // 0.0001 ETH
            None => U256::from(100_000_000_000_000u64),
        };

        let freshness_secs: u64 = parse_or(&get, env_vars::FRESHNESS_WINDOW_SECS, 300)?;
        if freshness_secs == 0 {
            return Err(format!("{} must be positive", env_vars::FRESHNESS_WINDOW_SECS));
        }

        Ok(Self {
            port: parse_or(&get, env_vars::PORT, 8080)?,
            database_url: get(env_vars::DATABASE_URL)
                .unwrap_or_else(|| "./.db/paygate.db".to_string()),
            mode,
            network: get(env_vars::NETWORK_ID).unwrap_or_else(|| "base-sepolia".to_string()),
            chain_id: parse_or(&get, env_vars::CHAIN_ID, 84532)?,
            rpc_url,
            token,
            token_decimals: parse_or(&get, env_vars::TOKEN_DECIMALS, 6)?,
            token_symbol: get(env_vars::TOKEN_SYMBOL).unwrap_or_else(|| "USDC".to_string()),
            settlement_contract,
            operator_private_key,
            payment_recipient,
            pricing_file: get(env_vars::PRICING_FILE),
            freshness_window: Duration::from_secs(freshness_secs),
            settlement_timeout: Duration::from_secs(parse_or(
                &get,
                env_vars::SETTLEMENT_TIMEOUT_SECS,
                60,
            )?),
            nonce_eviction_interval: Duration::from_secs(parse_or(
                &get,
                env_vars::NONCE_EVICTION_INTERVAL_SECS,
                60,
            )?),
            session_secret: get(env_vars::SESSION_KEY_ENCRYPTION_SECRET),
            session_dust_threshold,
            session_min_gas_funding,
        })
    }

    /// Deterministic in-memory configuration
    pub fn sandbox() -> Self {
        let fixed = |value: &str| {
            EthAddress::parse(value).unwrap_or_else(|_| EthAddress::from(Address::zero()))
        };
        Self {
            port: 8080,
            database_url: ":memory:".to_string(),
            mode: PaygateMode::Sandbox,
            network: "sandbox".to_string(),
            chain_id: 31337,
            rpc_url: None,
            token: fixed(SANDBOX_TOKEN),
            token_decimals: 6,
            token_symbol: "USDC".to_string(),
            settlement_contract: fixed(SANDBOX_CONTRACT),
            operator_private_key: None,
            payment_recipient: fixed(SANDBOX_RECIPIENT),
            pricing_file: None,
            freshness_window: Duration::from_secs(300),
            settlement_timeout: Duration::from_secs(5),
            nonce_eviction_interval: Duration::from_secs(60),
            session_secret: Some("sandbox-session-secret".to_string()),
            session_dust_threshold: TokenAmount::from(100u64),
            session_min_gas_funding: U256::from(100_000_000_000_000u64),
        }
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            network: self.network.clone(),
            token: self.token,
            token_decimals: self.token_decimals,
            token_symbol: self.token_symbol.clone(),
            freshness_window: self.freshness_window,
            future_tolerance: FUTURE_TOLERANCE,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            token: self.token,
            settlement_contract: self.settlement_contract,
            dust_threshold: self.session_dust_threshold,
            min_gas_funding: self.session_min_gas_funding,
            transfer_policies: DEFAULT_TRANSFER_POLICIES.to_vec(),
            retry: RetryPolicy::default(),
            close_lease: self.settlement_timeout * 10,
            in_doubt_grace: self.in_doubt_age(),
        }
    }

    /// How long a payment claim may go unconfirmed before the chain is asked
    pub fn in_doubt_age(&self) -> Duration {
        self.settlement_timeout * 6
    }

    /// Pricing file if configured, otherwise the built-in demo table
    pub fn load_pricing(&self) -> Result<PricingTable, String> {
        match &self.pricing_file {
            Some(path) => {
                PricingTable::from_file(Path::new(path), self.token_decimals, self.payment_recipient)
            }
            None => {
                log::warn!("[Pricing] No {} set, serving the demo price list", env_vars::PRICING_FILE);
                PricingTable::from_toml_str(DEFAULT_PRICING, self.token_decimals, self.payment_recipient)
            }
        }
    }
}

fn parse_or<T, G>(get: &G, name: &str, default: T) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| format!("{} is invalid: {}", name, e)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_to_sandbox() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.mode, PaygateMode::Sandbox);
        assert_eq!(config.port, 8080);
        assert_eq!(config.freshness_window, Duration::from_secs(300));
        assert_eq!(config.settlement_timeout, Duration::from_secs(60));
        assert_eq!(config.token_decimals, 6);
        assert!(!config.token.is_zero());

        let sessions = config.session_config();
        assert_eq!(sessions.in_doubt_grace, Duration::from_secs(360));
        assert!(sessions.close_lease > config.settlement_timeout);
    }

    #[test]
    fn test_contract_mode_requires_chain_settings() {
        let err = Config::from_lookup(lookup(&[(env_vars::PAYGATE_MODE, "contract")])).unwrap_err();
        assert!(err.contains("contract mode"));

        let config = Config::from_lookup(lookup(&[
            (env_vars::PAYGATE_MODE, "contract"),
            (env_vars::RPC_URL, "http://localhost:8545"),
            (env_vars::TOKEN_ADDRESS, SANDBOX_TOKEN),
            (env_vars::SETTLEMENT_CONTRACT_ADDRESS, SANDBOX_CONTRACT),
            (env_vars::PAYMENT_RECIPIENT, SANDBOX_RECIPIENT),
            (env_vars::SETTLEMENT_OPERATOR_PRIVATE_KEY, "0x01"),
            (env_vars::FRESHNESS_WINDOW_SECS, "120"),
            (env_vars::SESSION_DUST_THRESHOLD, "500"),
        ]))
        .unwrap();
        assert_eq!(config.mode, PaygateMode::Contract);
        assert_eq!(config.freshness_window, Duration::from_secs(120));
        assert_eq!(config.session_dust_threshold, TokenAmount::from(500u64));
        assert!(!format!("{:?}", config).contains("0x01"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::from_lookup(lookup(&[(env_vars::PORT, "eighty")])).is_err());
        assert!(Config::from_lookup(lookup(&[(env_vars::PAYGATE_MODE, "mainnet")])).is_err());
        assert!(Config::from_lookup(lookup(&[(env_vars::FRESHNESS_WINDOW_SECS, "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[(env_vars::TOKEN_ADDRESS, "0x123")])).is_err());
    }

    #[test]
    fn test_default_pricing_uses_recipient() {
        let config = Config::sandbox();
        let pricing = config.load_pricing().unwrap();
        let entry = pricing.lookup("demo.echo").unwrap();
        assert_eq!(entry.price, TokenAmount::from(10_000u64));
        assert_eq!(entry.recipient, config.payment_recipient);
    }
}
