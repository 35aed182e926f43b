//! Session persistence
//!
//! Writes are optimistic: `update` only succeeds if the stored record still
//! has the version the caller read, which gives every read-modify-write on a
//! session (spent amount, status) compare-and-swap semantics.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::types::SessionRecord;
use crate::domain_types::EthAddress;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, record: &SessionRecord) -> Result<(), String>;

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, String>;

    /// Newest first
    async fn list_by_owner(&self, owner: &EthAddress) -> Result<Vec<SessionRecord>, String>;

    /// Replace the stored record if its version is still `expected_version`.
    /// `record.version` must already be bumped. Returns false on a lost race.
    async fn update(&self, record: &SessionRecord, expected_version: u64) -> Result<bool, String>;

    fn store_name(&self) -> &'static str;
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, SessionRecord>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, record: &SessionRecord) -> Result<(), String> {
        match self.sessions.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(format!("Session {} already exists", record.id)),
            Entry::Vacant(vacant) => {
                vacant.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, String> {
        Ok(self.sessions.get(id).map(|r| r.value().clone()))
    }

    async fn list_by_owner(&self, owner: &EthAddress) -> Result<Vec<SessionRecord>, String> {
        let mut sessions: Vec<SessionRecord> = self
            .sessions
            .iter()
            .filter(|r| r.value().owner == *owner)
            .map(|r| r.value().clone())
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn update(&self, record: &SessionRecord, expected_version: u64) -> Result<bool, String> {
        let Some(mut stored) = self.sessions.get_mut(&record.id) else {
            return Err(format!("Session {} not found", record.id));
        };
        if stored.version != expected_version {
            return Ok(false);
        }
        *stored = record.clone();
        Ok(true)
    }

    fn store_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::TokenAmount;
    use crate::sessions::types::{RefundRecord, SessionStatus};
    use chrono::Utc;
    use ethers::types::Address;

    fn record(id: &str, owner: u8) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            id: id.to_string(),
            owner: EthAddress::from(Address::repeat_byte(owner)),
            session_address: EthAddress::from(Address::repeat_byte(0xee)),
            encrypted_key: None,
            spending_cap: TokenAmount::from(1_000_000),
            spent: TokenAmount::ZERO,
            status: SessionStatus::Funding,
            approval_tx: None,
            refund: RefundRecord::default(),
            in_doubt: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    #[tokio::test]
    async fn test_update_is_compare_and_swap() {
        let store = MemorySessionStore::new();
        store.insert(&record("s1", 1)).await.unwrap();

        let mut first = store.get("s1").await.unwrap().unwrap();
        let mut second = first.clone();

        first.spent = TokenAmount::from(10);
        first.version += 1;
        assert!(store.update(&first, 0).await.unwrap());

        second.spent = TokenAmount::from(20);
        second.version += 1;
        assert!(!store.update(&second, 0).await.unwrap());

        assert_eq!(store.get("s1").await.unwrap().unwrap().spent, TokenAmount::from(10));
    }

    #[tokio::test]
    async fn test_list_by_owner_and_duplicate_insert() {
        let store = MemorySessionStore::new();
        store.insert(&record("a", 1)).await.unwrap();
        store.insert(&record("b", 1)).await.unwrap();
        store.insert(&record("c", 2)).await.unwrap();
        assert!(store.insert(&record("a", 1)).await.is_err());

        let owner = EthAddress::from(Address::repeat_byte(1));
        assert_eq!(store.list_by_owner(&owner).await.unwrap().len(), 2);
        assert!(store.get("zzz").await.unwrap().is_none());
    }
}
