//! Payment nonce ledger
//!
//! Shared-store implementation of [`NonceStore`]. The claim is a single
//! upsert whose update arm only fires while the row is `unclaimed`, so two
//! instances racing on one nonce see exactly one changed row between them.

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::H256;
use rusqlite::OptionalExtension;
use std::str::FromStr;
use std::time::Duration;

use super::super::Database;
use super::super::sqlite::{conversion_error, format_ts, parse_ts};
use crate::nonce_ledger::{LedgerError, NonceRecord, NonceState, NonceStore, eviction_cutoff};

fn nonce_key(nonce: &H256) -> String {
    format!("{:?}", nonce)
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<NonceRecord> {
    let nonce_str: String = row.get(0)?;
    let state_str: String = row.get(2)?;
    let claimed_at_str: String = row.get(3)?;
    let updated_at_str: String = row.get(4)?;

    Ok(NonceRecord {
        nonce: H256::from_str(&nonce_str)
            .map_err(|e| conversion_error(0, format!("bad nonce '{}': {}", nonce_str, e)))?,
        claimant: row.get(1)?,
        state: state_str
            .parse()
            .map_err(|_| conversion_error(2, format!("unknown nonce state '{}'", state_str)))?,
        claimed_at: parse_ts(3, &claimed_at_str)?,
        updated_at: parse_ts(4, &updated_at_str)?,
    })
}

impl Database {
    /// Returns true if this call moved the nonce to claimed
    pub fn claim_payment_nonce(&self, nonce: &H256, claimant: &str) -> Result<bool, String> {
        let conn = self.conn()?;
        let now = format_ts(&Utc::now());

        let changed = conn
            .execute(
                "INSERT INTO payment_nonces (nonce, claimant, state, claimed_at, updated_at)
                 VALUES (?1, ?2, 'claimed', ?3, ?3)
                 ON CONFLICT(nonce) DO UPDATE SET
                     claimant = excluded.claimant,
                     state = 'claimed',
                     claimed_at = excluded.claimed_at,
                     updated_at = excluded.updated_at
                 WHERE payment_nonces.state = 'unclaimed'",
                rusqlite::params![nonce_key(nonce), claimant, now],
            )
            .map_err(|e| format!("Failed to claim nonce: {}", e))?;

        Ok(changed == 1)
    }

    /// Move a nonce out of `from` into `to`. Returns false if no row was in `from`.
    fn transition_payment_nonce(
        &self,
        nonce: &H256,
        from: NonceState,
        to: NonceState,
    ) -> Result<bool, String> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE payment_nonces SET state = ?1, updated_at = ?2
                 WHERE nonce = ?3 AND state = ?4",
                rusqlite::params![
                    to.to_string(),
                    format_ts(&Utc::now()),
                    nonce_key(nonce),
                    from.to_string()
                ],
            )
            .map_err(|e| format!("Failed to update nonce: {}", e))?;
        Ok(changed == 1)
    }

    pub fn get_payment_nonce(&self, nonce: &H256) -> Result<Option<NonceRecord>, String> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT nonce, claimant, state, claimed_at, updated_at
             FROM payment_nonces WHERE nonce = ?1",
            [nonce_key(nonce)],
            row_to_record,
        )
        .optional()
        .map_err(|e| format!("Failed to read nonce: {}", e))
    }

    /// Claimed nonces last touched before `age` ago, oldest first
    pub fn list_claimed_payment_nonces(&self, age: Duration) -> Result<Vec<NonceRecord>, String> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT nonce, claimant, state, claimed_at, updated_at
                 FROM payment_nonces WHERE state = 'claimed' AND updated_at < ?1
                 ORDER BY updated_at ASC",
            )
            .map_err(|e| format!("Failed to prepare claimed nonce query: {}", e))?;
        let rows = stmt
            .query_map([format_ts(&eviction_cutoff(age))], row_to_record)
            .map_err(|e| format!("Failed to list claimed nonces: {}", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("Failed to read claimed nonce: {}", e))
    }

    /// Delete settled or abandoned nonces last touched before `horizon`
    pub fn evict_payment_nonces(&self, horizon: Duration) -> Result<usize, String> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM payment_nonces WHERE state != 'claimed' AND updated_at < ?1",
            [format_ts(&eviction_cutoff(horizon))],
        )
        .map_err(|e| format!("Failed to evict nonces: {}", e))
    }
}

#[async_trait]
impl NonceStore for Database {
    async fn claim(&self, nonce: H256, claimant: &str) -> Result<bool, LedgerError> {
        let claimant = claimant.to_string();
        self.run_blocking(move |db| db.claim_payment_nonce(&nonce, &claimant))
            .await
            .map_err(LedgerError::Storage)
    }

    async fn confirm(&self, nonce: H256) -> Result<(), LedgerError> {
        let moved = self
            .run_blocking(move |db| {
                db.transition_payment_nonce(&nonce, NonceState::Claimed, NonceState::Confirmed)
            })
            .await
            .map_err(LedgerError::Storage)?;
        if moved {
            return Ok(());
        }

        match self.get(nonce).await? {
            None => Err(LedgerError::Unknown(nonce)),
            Some(record) => match record.state {
                NonceState::Confirmed => Ok(()),
                state => Err(LedgerError::NotClaimed { nonce, state }),
            },
        }
    }

    async fn release(&self, nonce: H256) -> Result<(), LedgerError> {
        let moved = self
            .run_blocking(move |db| {
                db.transition_payment_nonce(&nonce, NonceState::Claimed, NonceState::Unclaimed)
            })
            .await
            .map_err(LedgerError::Storage)?;
        if moved {
            return Ok(());
        }

        match self.get(nonce).await? {
            Some(record) if record.state == NonceState::Confirmed => {
                Err(LedgerError::AlreadyConfirmed(nonce))
            }
            _ => Ok(()),
        }
    }

    async fn evict_expired(&self, horizon: Duration) -> Result<usize, LedgerError> {
        self.run_blocking(move |db| db.evict_payment_nonces(horizon))
            .await
            .map_err(LedgerError::Storage)
    }

    async fn get(&self, nonce: H256) -> Result<Option<NonceRecord>, LedgerError> {
        self.run_blocking(move |db| db.get_payment_nonce(&nonce))
            .await
            .map_err(LedgerError::Storage)
    }

    async fn list_claimed_before(&self, age: Duration) -> Result<Vec<NonceRecord>, LedgerError> {
        self.run_blocking(move |db| db.list_claimed_payment_nonces(age))
            .await
            .map_err(LedgerError::Storage)
    }

    fn store_name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn nonce(n: u8) -> H256 {
        H256::repeat_byte(n)
    }

    #[tokio::test]
    async fn test_claim_confirm_release_cycle() {
        let db = Database::open_in_memory().unwrap();

        assert!(db.claim(nonce(1), "alice").await.unwrap());
        assert!(!db.claim(nonce(1), "bob").await.unwrap());

        db.release(nonce(1)).await.unwrap();
        assert!(db.claim(nonce(1), "bob").await.unwrap());
        assert_eq!(db.get(nonce(1)).await.unwrap().unwrap().claimant, "bob");

        db.confirm(nonce(1)).await.unwrap();
        db.confirm(nonce(1)).await.unwrap();
        assert!(!db.claim(nonce(1), "alice").await.unwrap());
        assert_eq!(
            db.release(nonce(1)).await.unwrap_err(),
            LedgerError::AlreadyConfirmed(nonce(1))
        );
    }

    #[tokio::test]
    async fn test_confirm_unknown_or_released() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(
            db.confirm(nonce(2)).await.unwrap_err(),
            LedgerError::Unknown(nonce(2))
        );
        db.claim(nonce(2), "alice").await.unwrap();
        db.release(nonce(2)).await.unwrap();
        assert!(matches!(
            db.confirm(nonce(2)).await.unwrap_err(),
            LedgerError::NotClaimed { state: NonceState::Unclaimed, .. }
        ));
        // releasing something never claimed is a no-op
        db.release(nonce(9)).await.unwrap();
    }

    #[tokio::test]
    async fn test_two_instances_share_one_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let a = Arc::new(Database::new(path.to_str().unwrap()).unwrap());
        let b = Arc::new(Database::new(path.to_str().unwrap()).unwrap());

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = if i % 2 == 0 { a.clone() } else { b.clone() };
            handles.push(tokio::spawn(async move {
                store.claim(nonce(3), &format!("caller-{}", i)).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        a.confirm(nonce(3)).await.unwrap();
        assert_eq!(
            b.get(nonce(3)).await.unwrap().unwrap().state,
            NonceState::Confirmed
        );
    }

    #[tokio::test]
    async fn test_eviction_spares_claimed() {
        let db = Database::open_in_memory().unwrap();
        db.claim(nonce(1), "a").await.unwrap();
        db.claim(nonce(2), "b").await.unwrap();
        db.confirm(nonce(2)).await.unwrap();
        db.claim(nonce(3), "c").await.unwrap();
        db.release(nonce(3)).await.unwrap();

        assert_eq!(db.evict_expired(Duration::from_secs(300)).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(db.evict_expired(Duration::from_millis(1)).await.unwrap(), 2);
        assert_eq!(
            db.get(nonce(1)).await.unwrap().unwrap().state,
            NonceState::Claimed
        );
        assert!(db.get(nonce(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_claims_listed_oldest_first() {
        let db = Database::open_in_memory().unwrap();
        db.claim(nonce(1), "a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        db.claim(nonce(2), "b").await.unwrap();
        db.claim(nonce(3), "c").await.unwrap();
        db.confirm(nonce(3)).await.unwrap();

        assert!(db.list_claimed_before(Duration::from_secs(60)).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let stale: Vec<H256> = db
            .list_claimed_before(Duration::from_millis(1))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.nonce)
            .collect();
        assert_eq!(stale, vec![nonce(1), nonce(2)]);
    }
}
