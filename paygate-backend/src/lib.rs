//! Pay-per-request gate for HTTP resources, settled on an EVM chain.
//!
//! A client attaches a signed payment proof to a request. The [`payment`]
//! gate checks it against the price list, claims its nonce in the
//! [`nonce_ledger`], settles it through a [`settlement`] client and only then
//! lets the request through. [`sessions`] lets the server hold short-lived,
//! capped wallets that pay on a user's behalf.

pub mod chain;
pub mod config;
pub mod controllers;
pub mod db;
pub mod domain_types;
pub mod error;
pub mod nonce_ledger;
pub mod payment;
pub mod sandbox;
pub mod sessions;
pub mod settlement;

use std::sync::Arc;

use chain::{EvmWalletChain, WalletChain};
use config::{Config, PaygateMode};
use db::Database;
use nonce_ledger::{MemoryNonceStore, NonceStore};
use payment::PaymentGate;
use sandbox::SandboxChain;
use sessions::{KeyVault, MemorySessionStore, SessionStore, SessionWalletManager};
use settlement::{ContractSettlementClient, SettlementClient};

pub struct AppState {
    pub config: Config,
    pub gate: Arc<PaymentGate>,
    /// None when no session key encryption secret is configured
    pub sessions: Option<Arc<SessionWalletManager>>,
    /// Handle on the in-process chain in sandbox mode, for funding and inspection
    pub sandbox: Option<Arc<SandboxChain>>,
}

/// Wire the gate and session manager for the configured mode
pub fn build_state(config: Config) -> Result<AppState, String> {
    let pricing = config.load_pricing()?;

    let (settlement, wallet_chain, sandbox): (
        Arc<dyn SettlementClient>,
        Arc<dyn WalletChain>,
        Option<Arc<SandboxChain>>,
    ) = match config.mode {
        PaygateMode::Sandbox => {
            let chain = Arc::new(SandboxChain::new(&config.network, config.settlement_contract));
            (chain.clone(), chain.clone(), Some(chain))
        }
        PaygateMode::Contract => {
            let rpc_url = config
                .rpc_url
                .as_deref()
                .ok_or("RPC_URL is required in contract mode")?;
            let operator_key = config
                .operator_private_key
                .as_deref()
                .ok_or("SETTLEMENT_OPERATOR_PRIVATE_KEY is required in contract mode")?;
            let settlement = ContractSettlementClient::new(
                rpc_url,
                config.chain_id,
                config.settlement_contract,
                operator_key,
                &config.network,
                config.settlement_timeout,
            )?;
            let chain = EvmWalletChain::new(
                rpc_url,
                config.chain_id,
                config.token,
                config.settlement_timeout,
            )?;
            (Arc::new(settlement), Arc::new(chain), None)
        }
    };

    // Instances in contract mode share one ledger; the sandbox keeps everything in memory
    let (nonces, session_store): (Arc<dyn NonceStore>, Arc<dyn SessionStore>) = match config.mode {
        PaygateMode::Sandbox => (
            Arc::new(MemoryNonceStore::new()),
            Arc::new(MemorySessionStore::new()),
        ),
        PaygateMode::Contract => {
            let db = Arc::new(Database::new(&config.database_url)?);
            (db.clone(), db)
        }
    };

    let gate = Arc::new(PaymentGate::new(
        config.gate_config(),
        pricing,
        nonces,
        settlement.clone(),
    ));

    let sessions = match &config.session_secret {
        Some(secret) => Some(Arc::new(SessionWalletManager::new(
            session_store,
            wallet_chain,
            settlement,
            KeyVault::from_secret(secret).map_err(|e| e.to_string())?,
            config.session_config(),
        ))),
        None => {
            log::warn!(
                "[Sessions] {} not set, session wallets disabled",
                config::env_vars::SESSION_KEY_ENCRYPTION_SECRET
            );
            None
        }
    };

    Ok(AppState {
        config,
        gate,
        sessions,
        sandbox,
    })
}
