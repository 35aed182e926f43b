//! Session wallet records
//!
//! Every update is guarded by the `version` column, giving the same
//! compare-and-swap contract as the in-memory store.

use async_trait::async_trait;
use ethers::types::U256;
use rusqlite::OptionalExtension;

use super::super::Database;
use super::super::sqlite::{conversion_error, format_ts, parse_ts};
use crate::domain_types::{EthAddress, TokenAmount};
use crate::sessions::{EncryptedKey, RefundRecord, SessionRecord, SessionStore};

const SELECT_COLUMNS: &str = "SELECT id, owner, session_address, key_iv, key_ciphertext,
        spending_cap, spent, status, approval_tx,
        refund_token_tx, refund_token_amount, refund_token_path,
        refund_native_tx, refund_native_amount, refund_native_dust,
        refunded_at, last_error, created_at, updated_at, version, in_doubt_payments
    FROM session_wallets";

fn parse_address(idx: usize, value: &str) -> rusqlite::Result<EthAddress> {
    EthAddress::parse(value).map_err(|e| conversion_error(idx, e))
}

fn parse_amount(idx: usize, value: &str) -> rusqlite::Result<TokenAmount> {
    TokenAmount::parse_base_units(value).map_err(|e| conversion_error(idx, e))
}

fn parse_wei(idx: usize, value: &str) -> rusqlite::Result<U256> {
    U256::from_dec_str(value).map_err(|e| conversion_error(idx, e.to_string()))
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<SessionRecord> {
    let owner: String = row.get(1)?;
    let session_address: String = row.get(2)?;
    let key_iv: Option<String> = row.get(3)?;
    let key_ciphertext: Option<String> = row.get(4)?;
    let spending_cap: String = row.get(5)?;
    let spent: String = row.get(6)?;
    let status: String = row.get(7)?;
    let token_amount: String = row.get(10)?;
    let token_path: Option<String> = row.get(11)?;
    let native_amount: String = row.get(13)?;
    let native_dust: String = row.get(14)?;
    let refunded_at: Option<String> = row.get(15)?;
    let created_at: String = row.get(17)?;
    let updated_at: String = row.get(18)?;
    let version: i64 = row.get(19)?;
    let in_doubt: String = row.get(20)?;

    let encrypted_key = match (key_iv, key_ciphertext) {
        (Some(iv), Some(ciphertext)) => Some(
            EncryptedKey::from_hex(&iv, &ciphertext)
                .map_err(|e| conversion_error(4, e.to_string()))?,
        ),
        _ => None,
    };

    Ok(SessionRecord {
        id: row.get(0)?,
        owner: parse_address(1, &owner)?,
        session_address: parse_address(2, &session_address)?,
        encrypted_key,
        spending_cap: parse_amount(5, &spending_cap)?,
        spent: parse_amount(6, &spent)?,
        status: status
            .parse()
            .map_err(|_| conversion_error(7, format!("unknown session status '{}'", status)))?,
        approval_tx: row.get(8)?,
        refund: RefundRecord {
            token_tx: row.get(9)?,
            token_amount: parse_amount(10, &token_amount)?,
            token_path: token_path
                .map(|p| {
                    p.parse()
                        .map_err(|_| conversion_error(11, format!("unknown refund path '{}'", p)))
                })
                .transpose()?,
            native_tx: row.get(12)?,
            native_amount: parse_wei(13, &native_amount)?,
            native_dust: parse_wei(14, &native_dust)?,
            refunded_at: refunded_at.map(|ts| parse_ts(15, &ts)).transpose()?,
            last_error: row.get(16)?,
        },
        in_doubt: serde_json::from_str(&in_doubt).map_err(|e| conversion_error(20, e.to_string()))?,
        created_at: parse_ts(17, &created_at)?,
        updated_at: parse_ts(18, &updated_at)?,
        version: version.max(0) as u64,
    })
}

fn in_doubt_json(record: &SessionRecord) -> Result<String, String> {
    serde_json::to_string(&record.in_doubt)
        .map_err(|e| format!("Failed to encode in-doubt payments for {}: {}", record.id, e))
}

impl Database {
    pub fn insert_session_wallet(&self, record: &SessionRecord) -> Result<(), String> {
        let in_doubt = in_doubt_json(record)?;
        let conn = self.conn()?;
        let key = record.encrypted_key.as_ref();
        conn.execute(
            "INSERT INTO session_wallets
             (id, owner, session_address, key_iv, key_ciphertext, spending_cap, spent,
              status, approval_tx, created_at, updated_at, version, in_doubt_payments)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                record.id,
                record.owner.to_lowercase_hex(),
                record.session_address.to_lowercase_hex(),
                key.map(|k| k.iv_hex()),
                key.map(|k| k.ciphertext_hex()),
                record.spending_cap.to_string(),
                record.spent.to_string(),
                record.status.to_string(),
                record.approval_tx,
                format_ts(&record.created_at),
                format_ts(&record.updated_at),
                record.version as i64,
                in_doubt,
            ],
        )
        .map_err(|e| format!("Failed to insert session {}: {}", record.id, e))?;
        Ok(())
    }

    pub fn get_session_wallet(&self, id: &str) -> Result<Option<SessionRecord>, String> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{} WHERE id = ?1", SELECT_COLUMNS),
            [id],
            row_to_session,
        )
        .optional()
        .map_err(|e| format!("Failed to read session {}: {}", id, e))
    }

    pub fn list_session_wallets(&self, owner: &EthAddress) -> Result<Vec<SessionRecord>, String> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "{} WHERE owner = ?1 ORDER BY created_at DESC",
                SELECT_COLUMNS
            ))
            .map_err(|e| format!("Failed to prepare query: {}", e))?;

        let sessions = stmt
            .query_map([owner.to_lowercase_hex()], row_to_session)
            .map_err(|e| format!("Failed to query sessions: {}", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| format!("Failed to read session row: {}", e))?;
        Ok(sessions)
    }

    /// Write `record` if the stored version is still `expected_version`
    pub fn update_session_wallet(
        &self,
        record: &SessionRecord,
        expected_version: u64,
    ) -> Result<bool, String> {
        let in_doubt = in_doubt_json(record)?;
        let conn = self.conn()?;
        let key = record.encrypted_key.as_ref();
        let refund = &record.refund;

        let changed = conn
            .execute(
                "UPDATE session_wallets SET
                     key_iv = ?1, key_ciphertext = ?2, spent = ?3, status = ?4,
                     approval_tx = ?5, refund_token_tx = ?6, refund_token_amount = ?7,
                     refund_token_path = ?8, refund_native_tx = ?9,
                     refund_native_amount = ?10, refund_native_dust = ?11,
                     refunded_at = ?12, last_error = ?13, updated_at = ?14, version = ?15,
                     in_doubt_payments = ?16
                 WHERE id = ?17 AND version = ?18",
                rusqlite::params![
                    key.map(|k| k.iv_hex()),
                    key.map(|k| k.ciphertext_hex()),
                    record.spent.to_string(),
                    record.status.to_string(),
                    record.approval_tx,
                    refund.token_tx,
                    refund.token_amount.to_string(),
                    refund.token_path.map(|p| p.to_string()),
                    refund.native_tx,
                    refund.native_amount.to_string(),
                    refund.native_dust.to_string(),
                    refund.refunded_at.as_ref().map(format_ts),
                    refund.last_error,
                    format_ts(&record.updated_at),
                    record.version as i64,
                    in_doubt,
                    record.id,
                    expected_version as i64,
                ],
            )
            .map_err(|e| format!("Failed to update session {}: {}", record.id, e))?;

        if changed == 1 {
            return Ok(true);
        }
        let exists: Option<i64> = conn
            .query_row(
                "SELECT version FROM session_wallets WHERE id = ?1",
                [&record.id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| format!("Failed to read session {}: {}", record.id, e))?;
        match exists {
            Some(_) => Ok(false),
            None => Err(format!("Session {} not found", record.id)),
        }
    }
}

#[async_trait]
impl SessionStore for Database {
    async fn insert(&self, record: &SessionRecord) -> Result<(), String> {
        let record = record.clone();
        self.run_blocking(move |db| db.insert_session_wallet(&record))
            .await
    }

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, String> {
        let id = id.to_string();
        self.run_blocking(move |db| db.get_session_wallet(&id)).await
    }

    async fn list_by_owner(&self, owner: &EthAddress) -> Result<Vec<SessionRecord>, String> {
        let owner = *owner;
        self.run_blocking(move |db| db.list_session_wallets(&owner))
            .await
    }

    async fn update(&self, record: &SessionRecord, expected_version: u64) -> Result<bool, String> {
        let record = record.clone();
        self.run_blocking(move |db| db.update_session_wallet(&record, expected_version))
            .await
    }

    fn store_name(&self) -> &'static str {
        "sqlite"
    }
}
