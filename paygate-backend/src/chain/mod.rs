//! Wallet-side chain access for session wallets
//!
//! Balance reads and transfers signed by a session key. Settlement of
//! payments goes through [`crate::settlement::SettlementClient`] instead.

pub mod broadcast;
mod evm;

pub use evm::EvmWalletChain;

use async_trait::async_trait;
use ethers::signers::LocalWallet;
use ethers::types::U256;
use thiserror::Error;

use crate::domain_types::{EthAddress, TokenAmount};

/// Gas for a plain native transfer
pub const NATIVE_TRANSFER_GAS: u64 = 21_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// RPC / network failure; safe to retry after re-reading state
    #[error("transport error: {0}")]
    Transport(String),

    #[error("transaction {tx_hash} reverted: {reason}")]
    Reverted { tx_hash: String, reason: String },

    /// `tx_hash` is set once the signed transaction may have reached the node
    #[error("transaction not confirmed in time (tx {tx_hash:?})")]
    Timeout { tx_hash: Option<String> },

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("signing failed: {0}")]
    Signing(String),
}

impl ChainError {
    /// Safe to send again: nothing can have been broadcast
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout { tx_hash: None })
    }

    /// A transaction may still land; resolve it from chain state, never by resending
    pub fn is_in_doubt(&self) -> bool {
        matches!(self, Self::Timeout { tx_hash: Some(_) })
    }
}

#[async_trait]
pub trait WalletChain: Send + Sync {
    async fn token_balance(&self, owner: EthAddress) -> Result<TokenAmount, ChainError>;

    async fn native_balance(&self, owner: EthAddress) -> Result<U256, ChainError>;

    async fn gas_price(&self) -> Result<U256, ChainError>;

    async fn token_allowance(
        &self,
        owner: EthAddress,
        spender: EthAddress,
    ) -> Result<TokenAmount, ChainError>;

    /// ERC20 approve from `wallet`; returns the tx hash once confirmed
    async fn approve_token(
        &self,
        wallet: &LocalWallet,
        spender: EthAddress,
        amount: TokenAmount,
    ) -> Result<String, ChainError>;

    /// ERC20 transfer from `wallet`; returns the tx hash once confirmed
    async fn transfer_token(
        &self,
        wallet: &LocalWallet,
        to: EthAddress,
        amount: TokenAmount,
    ) -> Result<String, ChainError>;

    /// Native transfer with explicit gas parameters; returns the tx hash once confirmed
    async fn transfer_native(
        &self,
        wallet: &LocalWallet,
        to: EthAddress,
        value: U256,
        gas_limit: U256,
        gas_price: U256,
    ) -> Result<String, ChainError>;
}
