//! Nonce Ledger
//!
//! Tracks per-nonce claim state so each payment nonce authorizes at most one
//! settlement.
//!
//! ## State machine
//! ```text
//! (absent) ──claim──▶ claimed ──confirm──▶ confirmed   (terminal)
//!                      │   ▲
//!               release│   │claim
//!                      ▼   │
//!                    unclaimed
//! ```
//! `claim` is the only operation that needs exclusivity; stores implement it
//! as a compare-and-swap on the single nonce record. Eviction drops
//! confirmed/unclaimed records older than the horizon and never touches a
//! claimed one, because a claimed nonce may have a settlement in flight.
//!
//! The store is injected, so several service instances can share one backing
//! store (see [`crate::db::Database`]).

mod memory;

pub use memory::MemoryNonceStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::H256;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use strum::{Display, EnumString};
use thiserror::Error;
use tokio::task::JoinHandle;

/// Claimant prefix for nonces that consume owner signatures rather than
/// payments; they never have a settlement to resolve.
pub const AUTH_CLAIMANT_PREFIX: &str = "owner-auth:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NonceState {
    Unclaimed,
    Claimed,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonceRecord {
    pub nonce: H256,
    /// Who holds (or last held) the claim, usually the payer address
    pub claimant: String,
    pub state: NonceState,
    pub claimed_at: DateTime<Utc>,
    /// Time of the last state transition; eviction age is measured from here
    pub updated_at: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("nonce {nonce:?} is {state}, not claimed")]
    NotClaimed { nonce: H256, state: NonceState },

    #[error("nonce {0:?} has no ledger record")]
    Unknown(H256),

    #[error("nonce {0:?} is confirmed and cannot be released")]
    AlreadyConfirmed(H256),

    #[error("nonce store error: {0}")]
    Storage(String),
}

/// Backing store for nonce claim state
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Atomically move `nonce` to claimed. Returns false if any claim or
    /// confirmation already exists, including a concurrent duplicate from the
    /// same claimant.
    async fn claim(&self, nonce: H256, claimant: &str) -> Result<bool, LedgerError>;

    /// claimed -> confirmed. A no-op if already confirmed.
    async fn confirm(&self, nonce: H256) -> Result<(), LedgerError>;

    /// claimed -> unclaimed so the payment can be retried.
    /// A no-op for unclaimed or unknown nonces; fails for confirmed ones.
    async fn release(&self, nonce: H256) -> Result<(), LedgerError>;

    /// Remove confirmed/unclaimed records whose last transition is older than `horizon`
    async fn evict_expired(&self, horizon: Duration) -> Result<usize, LedgerError>;

    async fn get(&self, nonce: H256) -> Result<Option<NonceRecord>, LedgerError>;

    /// Claims whose last transition is older than `age`, oldest first.
    /// These are settlements that were broadcast and never confirmed.
    async fn list_claimed_before(&self, age: Duration) -> Result<Vec<NonceRecord>, LedgerError>;

    /// Name for logging
    fn store_name(&self) -> &'static str;
}

/// Cutoff timestamp for an eviction horizon
pub(crate) fn eviction_cutoff(horizon: Duration) -> DateTime<Utc> {
    let horizon = chrono::Duration::from_std(horizon).unwrap_or(chrono::Duration::zero());
    Utc::now() - horizon
}

/// Run `evict_expired` every `interval` until the task is aborted
pub fn spawn_eviction_task(
    store: Arc<dyn NonceStore>,
    interval: Duration,
    horizon: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        log::info!(
            "[NonceLedger] Eviction task started on {} store (every {:?}, horizon {:?})",
            store.store_name(),
            interval,
            horizon
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.evict_expired(horizon).await {
                Ok(0) => {}
                Ok(n) => log::info!("[NonceLedger] Evicted {} expired nonce records", n),
                Err(e) => log::error!("[NonceLedger] Eviction failed: {}", e),
            }
        }
    })
}
