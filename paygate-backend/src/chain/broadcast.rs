//! Local signing and raw broadcast
//!
//! Transactions are filled and signed here before anything is sent, so the
//! hash is known up front. Once `eth_sendRawTransaction` has been attempted,
//! every failure except an explicit rejection by the node leaves the
//! transaction in doubt under that hash.

use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, PendingTransaction, Provider, RpcError};
use ethers::signers::Signer;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Bytes, H256};
use ethers::utils::keccak256;
use std::time::Duration;

/// A signed transaction ready for `eth_sendRawTransaction`
#[derive(Debug, Clone)]
pub struct SignedTx {
    pub hash: H256,
    pub raw: Bytes,
}

impl SignedTx {
    pub fn hash_hex(&self) -> String {
        format!("{:?}", self.hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    /// Filling or signing failed; nothing left this process
    Prepare(String),
    /// The node refused the raw transaction
    Rejected(String),
    /// Sent, but the node's answer never arrived or was not a refusal
    InDoubt { tx_hash: H256, reason: String },
}

/// Sign an already filled transaction
pub async fn sign_filled<S: Signer>(signer: &S, tx: &TypedTransaction) -> Result<SignedTx, BroadcastError> {
    let signature = signer
        .sign_transaction(tx)
        .await
        .map_err(|e| BroadcastError::Prepare(format!("Failed to sign transaction: {}", e)))?;
    let raw = tx.rlp_signed(&signature);
    Ok(SignedTx {
        hash: H256::from(keccak256(&raw)),
        raw,
    })
}

/// Fill nonce, gas and fees through `client`, then sign with its signer
pub async fn prepare<M, S>(
    client: &SignerMiddleware<M, S>,
    mut tx: TypedTransaction,
    timeout: Duration,
) -> Result<SignedTx, BroadcastError>
where
    M: Middleware,
    S: Signer,
{
    match tokio::time::timeout(timeout, client.fill_transaction(&mut tx, None)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(BroadcastError::Prepare(e.to_string())),
        Err(_) => {
            return Err(BroadcastError::Prepare(format!(
                "filling transaction timed out after {:?}",
                timeout
            )));
        }
    }
    sign_filled(client.signer(), &tx).await
}

/// Submit a signed transaction
pub async fn broadcast<'a>(
    provider: &'a Provider<Http>,
    signed: &SignedTx,
    timeout: Duration,
) -> Result<PendingTransaction<'a, Http>, BroadcastError> {
    let send = provider.send_raw_transaction(signed.raw.clone());
    match tokio::time::timeout(timeout, send).await {
        Ok(Ok(pending)) => Ok(pending),
        Ok(Err(e)) => {
            let rpc_message = e.as_error_response().map(|r| r.message.clone());
            Err(send_failure(rpc_message.as_deref(), e.to_string(), signed.hash))
        }
        Err(_) => Err(BroadcastError::InDoubt {
            tx_hash: signed.hash,
            reason: format!("eth_sendRawTransaction timed out after {:?}", timeout),
        }),
    }
}

/// Classify a failed `eth_sendRawTransaction`. Only a JSON-RPC error from
/// the node proves the transaction is not pending, and "already known"
/// proves that it is.
pub fn send_failure(rpc_message: Option<&str>, error: String, tx_hash: H256) -> BroadcastError {
    match rpc_message {
        Some(message) => {
            let lower = message.to_lowercase();
            if lower.contains("already known") || lower.contains("known transaction") {
                BroadcastError::InDoubt {
                    tx_hash,
                    reason: message.to_string(),
                }
            } else {
                BroadcastError::Rejected(message.to_string())
            }
        }
        None => BroadcastError::InDoubt {
            tx_hash,
            reason: error,
        },
    }
}
