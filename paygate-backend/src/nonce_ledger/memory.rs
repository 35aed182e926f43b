//! In-process nonce store
//!
//! DashMap's entry API holds the shard write lock for the duration of the
//! match, which is what makes `claim` a compare-and-swap.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ethers::types::H256;
use std::time::Duration;

use super::{LedgerError, NonceRecord, NonceState, NonceStore, eviction_cutoff};

#[derive(Default)]
pub struct MemoryNonceStore {
    records: DashMap<H256, NonceRecord>,
}

impl MemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl NonceStore for MemoryNonceStore {
    async fn claim(&self, nonce: H256, claimant: &str) -> Result<bool, LedgerError> {
        let now = Utc::now();
        match self.records.entry(nonce) {
            Entry::Vacant(vacant) => {
                vacant.insert(NonceRecord {
                    nonce,
                    claimant: claimant.to_string(),
                    state: NonceState::Claimed,
                    claimed_at: now,
                    updated_at: now,
                });
                Ok(true)
            }
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.state != NonceState::Unclaimed {
                    return Ok(false);
                }
                record.claimant = claimant.to_string();
                record.state = NonceState::Claimed;
                record.claimed_at = now;
                record.updated_at = now;
                Ok(true)
            }
        }
    }

    async fn confirm(&self, nonce: H256) -> Result<(), LedgerError> {
        let mut record = self
            .records
            .get_mut(&nonce)
            .ok_or(LedgerError::Unknown(nonce))?;
        let state = record.state;
        match state {
            NonceState::Confirmed => Ok(()),
            NonceState::Claimed => {
                record.state = NonceState::Confirmed;
                record.updated_at = Utc::now();
                Ok(())
            }
            state @ NonceState::Unclaimed => Err(LedgerError::NotClaimed { nonce, state }),
        }
    }

    async fn release(&self, nonce: H256) -> Result<(), LedgerError> {
        let Some(mut record) = self.records.get_mut(&nonce) else {
            log::debug!("[NonceLedger] release of unknown nonce {:?} ignored", nonce);
            return Ok(());
        };
        let state = record.state;
        match state {
            NonceState::Confirmed => Err(LedgerError::AlreadyConfirmed(nonce)),
            NonceState::Unclaimed => Ok(()),
            NonceState::Claimed => {
                record.state = NonceState::Unclaimed;
                record.updated_at = Utc::now();
                Ok(())
            }
        }
    }

    async fn evict_expired(&self, horizon: Duration) -> Result<usize, LedgerError> {
        let cutoff = eviction_cutoff(horizon);
        let before = self.records.len();
        self.records
            .retain(|_, record| record.state == NonceState::Claimed || record.updated_at >= cutoff);
        Ok(before.saturating_sub(self.records.len()))
    }

    async fn get(&self, nonce: H256) -> Result<Option<NonceRecord>, LedgerError> {
        Ok(self.records.get(&nonce).map(|r| r.value().clone()))
    }

    async fn list_claimed_before(&self, age: Duration) -> Result<Vec<NonceRecord>, LedgerError> {
        let cutoff = eviction_cutoff(age);
        let mut claimed: Vec<NonceRecord> = self
            .records
            .iter()
            .filter(|r| r.state == NonceState::Claimed && r.updated_at < cutoff)
            .map(|r| r.value().clone())
            .collect();
        claimed.sort_by_key(|r| r.updated_at);
        Ok(claimed)
    }

    fn store_name(&self) -> &'static str {
        "memory"
    }
}
