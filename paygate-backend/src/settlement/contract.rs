//! Settlement client backed by a live settlement contract

use async_trait::async_trait;
use chrono::Utc;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Bytes, H256, TransactionRequest, U64};
use std::sync::Arc;
use std::time::Duration;

use super::{SettlementClient, SettlementError, SettlementReceipt, abi};
use crate::chain::broadcast::{self, BroadcastError};
use crate::domain_types::EthAddress;
use crate::payment::PaymentProof;

type OperatorClient = SignerMiddleware<Arc<Provider<Http>>, LocalWallet>;

pub struct ContractSettlementClient {
    provider: Arc<Provider<Http>>,
    operator: OperatorClient,
    contract: EthAddress,
    network: String,
    timeout: Duration,
}

impl ContractSettlementClient {
    /// `operator_key` pays gas for `settlePayment`; it never holds payer funds.
    pub fn new(
        rpc_url: &str,
        chain_id: u64,
        contract: EthAddress,
        operator_key: &str,
        network: &str,
        timeout: Duration,
    ) -> Result<Self, String> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| format!("Invalid RPC URL '{}': {}", rpc_url, e))?;
        let provider = Arc::new(provider);

        let key_hex = operator_key.strip_prefix("0x").unwrap_or(operator_key);
        let wallet: LocalWallet = key_hex
            .parse()
            .map_err(|e| format!("Invalid settlement operator key: {}", e))?;
        let wallet = wallet.with_chain_id(chain_id);

        log::info!(
            "[Settlement] Contract client for {} on {} (operator {:?}, timeout {:?})",
            contract,
            network,
            wallet.address(),
            timeout
        );

        Ok(Self {
            operator: SignerMiddleware::new(provider.clone(), wallet),
            provider,
            contract,
            network: network.to_string(),
            timeout,
        })
    }

    fn settle_error(&self, e: BroadcastError) -> SettlementError {
        match e {
            BroadcastError::Prepare(msg) if msg.to_lowercase().contains("revert") => {
                SettlementError::Rejected(msg)
            }
            BroadcastError::Prepare(msg) => SettlementError::Provider(msg),
            BroadcastError::Rejected(msg) => SettlementError::Rejected(msg),
            BroadcastError::InDoubt { tx_hash, reason } => {
                log::warn!("[Settlement] settlePayment {:?} in doubt: {}", tx_hash, reason);
                SettlementError::Timeout {
                    timeout_secs: self.timeout.as_secs(),
                    tx_hash: Some(format!("{:?}", tx_hash)),
                }
            }
        }
    }

    async fn read(&self, data: Bytes) -> Result<Bytes, SettlementError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.contract.0)
            .data(data)
            .into();
        let call = self.provider.call(&tx, None);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => Err(SettlementError::Provider(e.to_string())),
            Err(_) => Err(SettlementError::Provider(format!(
                "eth_call timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

#[async_trait]
impl SettlementClient for ContractSettlementClient {
    async fn verify_payment(&self, proof: &PaymentProof) -> Result<bool, SettlementError> {
        let result = self.read(abi::encode_verify_payment(proof)).await?;
        abi::decode_bool(&result).map_err(SettlementError::Provider)
    }

    async fn is_nonce_used(&self, nonce: H256) -> Result<bool, SettlementError> {
        let result = self.read(abi::encode_is_nonce_used(nonce)).await?;
        abi::decode_bool(&result).map_err(SettlementError::Provider)
    }

    async fn settle(&self, proof: &PaymentProof) -> Result<SettlementReceipt, SettlementError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.contract.0)
            .data(abi::encode_settle_payment(proof))
            .into();

        // estimateGas runs the call while filling, so a revert here means nothing was sent
        let signed = broadcast::prepare(&self.operator, tx, self.timeout)
            .await
            .map_err(|e| self.settle_error(e))?;
        let tx_hash = signed.hash_hex();

        let pending = broadcast::broadcast(&self.provider, &signed, self.timeout)
            .await
            .map_err(|e| self.settle_error(e))?;
        log::info!(
            "[Settlement] Broadcast settlePayment {} for nonce {}",
            tx_hash,
            proof.nonce_hex()
        );

        let receipt = match tokio::time::timeout(self.timeout, pending).await {
            Ok(Ok(Some(receipt))) => receipt,
            Ok(Ok(None)) => {
                // Dropped from the mempool; it could still be re-mined
                return Err(SettlementError::Timeout {
                    timeout_secs: self.timeout.as_secs(),
                    tx_hash: Some(tx_hash),
                });
            }
            Ok(Err(e)) => {
                log::warn!("[Settlement] Receipt polling failed for {}: {}", tx_hash, e);
                return Err(SettlementError::Timeout {
                    timeout_secs: self.timeout.as_secs(),
                    tx_hash: Some(tx_hash),
                });
            }
            Err(_) => {
                return Err(SettlementError::Timeout {
                    timeout_secs: self.timeout.as_secs(),
                    tx_hash: Some(tx_hash),
                });
            }
        };

        if receipt.status != Some(U64::from(1)) {
            return Err(SettlementError::Reverted {
                reason: format!("receipt status {:?}", receipt.status),
                tx_hash,
            });
        }

        Ok(SettlementReceipt {
            tx_hash,
            block_number: receipt.block_number.map(|b| b.as_u64()),
            nonce: proof.nonce(),
            payer: proof.payer(),
            recipient: proof.recipient(),
            amount: proof.amount(),
            settled_at: Utc::now(),
        })
    }

    fn network(&self) -> &str {
        &self.network
    }

    fn mode_name(&self) -> &'static str {
        "contract"
    }
}
