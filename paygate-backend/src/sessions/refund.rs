//! Returning a session's balances to its owner
//!
//! Token balance goes back through `settlePayment` when the session has
//! approved the settlement contract, and through a plain ERC20 transfer
//! otherwise (or when settlement fails before broadcast). The fee currency
//! goes back with a native transfer whose cost is not known exactly in
//! advance, so an ordered list of [`TransferPolicy`] values is tried, each
//! reserving more for gas than the last.
//!
//! A refund whose transaction may still land is returned as an in-doubt
//! error and never followed by another send; the next close attempt reads
//! the balances again.

use chrono::Utc;
use ethers::signers::LocalWallet;
use ethers::types::U256;

use super::backoff::RetryPolicy;
use super::types::RefundPath;
use crate::chain::{ChainError, NATIVE_TRANSFER_GAS, WalletChain};
use crate::domain_types::{EthAddress, TokenAmount};
use crate::payment::{generate_nonce, sign_payment};
use crate::settlement::{SettlementClient, SettlementError};

/// Gas parameters and amount formula for one native refund attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPolicy {
    pub name: &'static str,
    pub gas_limit: u64,
    /// Gas price as a percentage of the current network price
    pub gas_price_percent: u64,
}

pub const DEFAULT_TRANSFER_POLICIES: [TransferPolicy; 3] = [
    TransferPolicy {
        name: "exact",
        gas_limit: NATIVE_TRANSFER_GAS,
        gas_price_percent: 100,
    },
    TransferPolicy {
        name: "buffered",
        gas_limit: 26_250,
        gas_price_percent: 125,
    },
    TransferPolicy {
        name: "conservative",
        gas_limit: 30_000,
        gas_price_percent: 150,
    },
];

impl TransferPolicy {
    pub fn gas_price(&self, network_price: U256) -> U256 {
        network_price * U256::from(self.gas_price_percent) / U256::from(100u64)
    }

    /// Worst-case fee this policy reserves
    pub fn reserved_fee(&self, network_price: U256) -> U256 {
        U256::from(self.gas_limit) * self.gas_price(network_price)
    }

    /// Largest amount that can be sent from `balance`, if any
    pub fn transferable(&self, balance: U256, network_price: U256) -> Option<U256> {
        balance
            .checked_sub(self.reserved_fee(network_price))
            .filter(|amount| !amount.is_zero())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRefund {
    pub tx_hash: String,
    pub amount: TokenAmount,
    pub path: RefundPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeRefund {
    pub tx_hash: String,
    pub amount: U256,
    pub policy: &'static str,
}

/// Everything a refund needs to reach the chain
pub struct RefundContext<'a> {
    pub chain: &'a dyn WalletChain,
    pub settlement: &'a dyn SettlementClient,
    pub wallet: &'a LocalWallet,
    pub session: EthAddress,
    pub owner: EthAddress,
    pub token: EthAddress,
    pub settlement_contract: EthAddress,
    pub retry: RetryPolicy,
}

impl RefundContext<'_> {
    /// Send `amount` of token back to the owner
    pub async fn refund_token(&self, amount: TokenAmount) -> Result<TokenRefund, ChainError> {
        let allowance = self
            .retry
            .run("allowance read", || {
                self.chain
                    .token_allowance(self.session, self.settlement_contract)
            })
            .await?;

        if allowance >= amount {
            match self.refund_via_settlement(amount).await {
                Ok(refund) => return Ok(refund),
                Err(e) if e.is_in_doubt() => {
                    log::error!(
                        "[Refund] Settlement refund from {} is in flight: {}",
                        self.session,
                        e
                    );
                    return Err(e);
                }
                Err(e) => log::warn!(
                    "[Refund] Settlement refund from {} failed, falling back to transfer: {}",
                    self.session,
                    e
                ),
            }
        }

        let tx_hash = self
            .retry
            .run("token transfer", || {
                self.chain.transfer_token(self.wallet, self.owner, amount)
            })
            .await?;
        log::info!(
            "[Refund] Returned {} token units from {} to {} by transfer (tx {})",
            amount,
            self.session,
            self.owner,
            tx_hash
        );
        Ok(TokenRefund {
            tx_hash,
            amount,
            path: RefundPath::Transfer,
        })
    }

    async fn refund_via_settlement(&self, amount: TokenAmount) -> Result<TokenRefund, ChainError> {
        let nonce = generate_nonce().map_err(ChainError::Signing)?;
        let proof = sign_payment(
            self.wallet,
            nonce,
            amount,
            self.token,
            self.owner,
            Utc::now().timestamp().max(0) as u64,
        )
        .map_err(ChainError::Signing)?;
        let receipt = self
            .settlement
            .settle(&proof)
            .await
            .map_err(settlement_to_chain)?;
        log::info!(
            "[Refund] Returned {} token units from {} to {} via settlement (tx {})",
            amount,
            self.session,
            self.owner,
            receipt.tx_hash
        );
        Ok(TokenRefund {
            tx_hash: receipt.tx_hash,
            amount,
            path: RefundPath::Settlement,
        })
    }

    /// Try each policy in order until one transfer confirms. Returns None
    /// when the balance cannot even cover the cheapest policy's fee.
    pub async fn refund_native(
        &self,
        policies: &[TransferPolicy],
    ) -> Result<Option<NativeRefund>, ChainError> {
        let mut last_error = None;

        for policy in policies {
            let balance = self
                .retry
                .run("native balance read", || self.chain.native_balance(self.session))
                .await?;
            let network_price = self
                .retry
                .run("gas price read", || self.chain.gas_price())
                .await?;

            let Some(amount) = policy.transferable(balance, network_price) else {
                log::debug!(
                    "[Refund] {} wei on {} does not cover the '{}' fee",
                    balance,
                    self.session,
                    policy.name
                );
                continue;
            };

            let gas_price = policy.gas_price(network_price);
            let result = self
                .retry
                .run("native transfer", || {
                    self.chain.transfer_native(
                        self.wallet,
                        self.owner,
                        amount,
                        U256::from(policy.gas_limit),
                        gas_price,
                    )
                })
                .await;

            match result {
                Ok(tx_hash) => {
                    log::info!(
                        "[Refund] Returned {} wei from {} to {} with '{}' policy (tx {})",
                        amount,
                        self.session,
                        self.owner,
                        policy.name,
                        tx_hash
                    );
                    return Ok(Some(NativeRefund {
                        tx_hash,
                        amount,
                        policy: policy.name,
                    }));
                }
                Err(e) if e.is_in_doubt() => {
                    log::error!(
                        "[Refund] '{}' native refund from {} is in flight: {}",
                        policy.name,
                        self.session,
                        e
                    );
                    return Err(e);
                }
                Err(e) => {
                    log::warn!(
                        "[Refund] '{}' native refund from {} failed: {}",
                        policy.name,
                        self.session,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

fn settlement_to_chain(e: SettlementError) -> ChainError {
    match e {
        SettlementError::Timeout { tx_hash, .. } => ChainError::Timeout { tx_hash },
        SettlementError::Reverted { reason, tx_hash } => ChainError::Reverted { tx_hash, reason },
        SettlementError::Provider(message) => ChainError::Transport(message),
        SettlementError::Rejected(message) => ChainError::Transport(format!("rejected: {}", message)),
    }
}
