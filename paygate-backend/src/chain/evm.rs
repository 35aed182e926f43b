//! JSON-RPC implementation of [`WalletChain`]

use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Bytes, TransactionRequest, U64, U256};
use std::sync::Arc;
use std::time::Duration;

use super::broadcast::{self, BroadcastError};
use super::{ChainError, WalletChain};
use crate::domain_types::{EthAddress, TokenAmount};
use crate::settlement::abi;

pub struct EvmWalletChain {
    provider: Arc<Provider<Http>>,
    chain_id: u64,
    token: EthAddress,
    timeout: Duration,
}

impl EvmWalletChain {
    pub fn new(
        rpc_url: &str,
        chain_id: u64,
        token: EthAddress,
        timeout: Duration,
    ) -> Result<Self, String> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| format!("Invalid RPC URL '{}': {}", rpc_url, e))?;
        Ok(Self {
            provider: Arc::new(provider),
            chain_id,
            token,
            timeout,
        })
    }

    async fn call_token(&self, data: Bytes) -> Result<Bytes, ChainError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.token.0)
            .data(data)
            .into();
        match tokio::time::timeout(self.timeout, self.provider.call(&tx, None)).await {
            Ok(result) => result.map_err(|e| ChainError::Transport(e.to_string())),
            Err(_) => Err(ChainError::Transport(format!(
                "eth_call timed out after {:?}",
                self.timeout
            ))),
        }
    }

    /// Sign with `wallet`, broadcast and wait for a successful receipt.
    /// The hash is fixed before sending, so a failure after that point is
    /// reported in doubt rather than as safe to resend.
    async fn send(&self, wallet: &LocalWallet, tx: TransactionRequest) -> Result<String, ChainError> {
        let client = SignerMiddleware::new(
            self.provider.clone(),
            wallet.clone().with_chain_id(self.chain_id),
        );

        let signed = match broadcast::prepare(&client, tx.into(), self.timeout).await {
            Ok(signed) => signed,
            Err(e) => return Err(broadcast_error(e)),
        };
        let tx_hash = signed.hash_hex();

        let pending = broadcast::broadcast(&self.provider, &signed, self.timeout)
            .await
            .map_err(broadcast_error)?;

        match tokio::time::timeout(self.timeout, pending).await {
            Ok(Ok(Some(receipt))) if receipt.status == Some(U64::from(1)) => Ok(tx_hash),
            Ok(Ok(Some(receipt))) => Err(ChainError::Reverted {
                tx_hash,
                reason: format!("receipt status {:?}", receipt.status),
            }),
            Ok(Ok(None)) | Ok(Err(_)) | Err(_) => Err(ChainError::Timeout {
                tx_hash: Some(tx_hash),
            }),
        }
    }
}

fn broadcast_error(e: BroadcastError) -> ChainError {
    match e {
        BroadcastError::Prepare(msg) | BroadcastError::Rejected(msg) => classify_send_error(&msg),
        BroadcastError::InDoubt { tx_hash, reason } => {
            log::warn!("[Chain] Transaction {:?} in doubt: {}", tx_hash, reason);
            ChainError::Timeout {
                tx_hash: Some(format!("{:?}", tx_hash)),
            }
        }
    }
}

fn classify_send_error(msg: &str) -> ChainError {
    let lower = msg.to_lowercase();
    if lower.contains("insufficient funds") {
        ChainError::InsufficientFunds(msg.to_string())
    } else if lower.contains("revert") || lower.contains("intrinsic gas") {
        ChainError::Reverted {
            tx_hash: String::new(),
            reason: msg.to_string(),
        }
    } else if lower.contains("signer") || lower.contains("signature") {
        ChainError::Signing(msg.to_string())
    } else {
        ChainError::Transport(msg.to_string())
    }
}

#[async_trait]
impl WalletChain for EvmWalletChain {
    async fn token_balance(&self, owner: EthAddress) -> Result<TokenAmount, ChainError> {
        let data = self.call_token(abi::encode_balance_of(owner.0)).await?;
        abi::decode_uint(&data)
            .map(TokenAmount::from)
            .map_err(ChainError::Transport)
    }

    async fn native_balance(&self, owner: EthAddress) -> Result<U256, ChainError> {
        self.provider
            .get_balance(owner.0, None)
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))
    }

    async fn gas_price(&self) -> Result<U256, ChainError> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))
    }

    async fn token_allowance(
        &self,
        owner: EthAddress,
        spender: EthAddress,
    ) -> Result<TokenAmount, ChainError> {
        let data = self
            .call_token(abi::encode_allowance(owner.0, spender.0))
            .await?;
        abi::decode_uint(&data)
            .map(TokenAmount::from)
            .map_err(ChainError::Transport)
    }

    async fn approve_token(
        &self,
        wallet: &LocalWallet,
        spender: EthAddress,
        amount: TokenAmount,
    ) -> Result<String, ChainError> {
        let tx = TransactionRequest::new()
            .to(self.token.0)
            .data(abi::encode_approve(spender.0, amount.0));
        self.send(wallet, tx).await
    }

    async fn transfer_token(
        &self,
        wallet: &LocalWallet,
        to: EthAddress,
        amount: TokenAmount,
    ) -> Result<String, ChainError> {
        let tx = TransactionRequest::new()
            .to(self.token.0)
            .data(abi::encode_transfer(to.0, amount.0));
        self.send(wallet, tx).await
    }

    async fn transfer_native(
        &self,
        wallet: &LocalWallet,
        to: EthAddress,
        value: U256,
        gas_limit: U256,
        gas_price: U256,
    ) -> Result<String, ChainError> {
        let tx = TransactionRequest::new()
            .to(to.0)
            .value(value)
            .gas(gas_limit)
            .gas_price(gas_price);
        self.send(wallet, tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_send_error() {
        assert!(matches!(
            classify_send_error("insufficient funds for gas * price + value"),
            ChainError::InsufficientFunds(_)
        ));
        assert!(matches!(
            classify_send_error("execution reverted: ERC20: transfer amount exceeds balance"),
            ChainError::Reverted { .. }
        ));
        assert!(classify_send_error("error sending request: connection refused").is_transient());
    }

    #[test]
    fn test_failures_after_send_are_in_doubt() {
        let hash = ethers::types::H256::repeat_byte(0xab);
        let lost = broadcast_error(BroadcastError::InDoubt {
            tx_hash: hash,
            reason: "connection reset".to_string(),
        });
        assert!(lost.is_in_doubt());
        assert_eq!(
            lost,
            ChainError::Timeout {
                tx_hash: Some(format!("{:?}", hash))
            }
        );

        let refused = broadcast_error(BroadcastError::Rejected(
            "insufficient funds for gas * price + value".to_string(),
        ));
        assert!(matches!(refused, ChainError::InsufficientFunds(_)));
        assert!(broadcast_error(BroadcastError::Prepare("connection refused".to_string())).is_transient());
    }

    #[test]
    fn test_rejects_bad_rpc_url() {
        let token = EthAddress::parse("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913").unwrap();
        assert!(EvmWalletChain::new("not a url", 8453, token, Duration::from_secs(5)).is_err());
    }
}
