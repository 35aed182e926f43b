//! Session Wallet Manager
//!
//! Creates capped-spending session wallets, signs payments with them, and
//! hands their balances back to the owner before retiring them.

use chrono::{DateTime, Utc};
use ethers::types::{H256, U256};
use std::sync::Arc;
use std::time::Duration;

use super::backoff::RetryPolicy;
use super::refund::{RefundContext, TransferPolicy};
use super::store::SessionStore;
use super::types::{InDoubtPayment, RefundRecord, SessionRecord, SessionStatus};
use super::vault::{KeyVault, UnlockedKey};
use crate::chain::{ChainError, WalletChain};
use crate::domain_types::{EthAddress, TokenAmount};
use crate::error::{CustodyError, GateRejection, SessionError};
use crate::nonce_ledger::NonceState;
use crate::payment::{AuthorizedContext, PaymentQuote, ProofSink, generate_nonce, sign_payment};
use crate::settlement::SettlementClient;

/// Optimistic update attempts before reporting contention
const CAS_ATTEMPTS: u32 = 8;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub token: EthAddress,
    /// Spender the session approves so settlement can pull payments
    pub settlement_contract: EthAddress,
    /// Token balances at or below this are not worth refunding
    pub dust_threshold: TokenAmount,
    /// Native balance required before a session can go active
    pub min_gas_funding: U256,
    pub transfer_policies: Vec<TransferPolicy>,
    pub retry: RetryPolicy,
    /// How long a `closing` record is held by the close that wrote it
    pub close_lease: Duration,
    /// Age before an in-doubt payment is looked up again
    pub in_doubt_grace: Duration,
}

/// True once more than `lease` has passed since `since`
fn lease_expired(since: DateTime<Utc>, lease: Duration) -> bool {
    (Utc::now() - since)
        .to_std()
        .map(|age| age > lease)
        .unwrap_or(false)
}

pub struct SessionWalletManager {
    store: Arc<dyn SessionStore>,
    chain: Arc<dyn WalletChain>,
    settlement: Arc<dyn SettlementClient>,
    vault: KeyVault,
    config: SessionConfig,
}

impl SessionWalletManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        chain: Arc<dyn WalletChain>,
        settlement: Arc<dyn SettlementClient>,
        vault: KeyVault,
        config: SessionConfig,
    ) -> Self {
        log::info!(
            "[Sessions] Manager ready (store: {}, dust threshold: {}, {} refund policies)",
            store.store_name(),
            config.dust_threshold,
            config.transfer_policies.len()
        );
        Self {
            store,
            chain,
            settlement,
            vault,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// New session in `funding`; the owner deposits to `session_address`
    pub async fn create_session(
        &self,
        owner: EthAddress,
        spending_cap: TokenAmount,
    ) -> Result<SessionRecord, SessionError> {
        if spending_cap.is_zero() {
            return Err(SessionError::InvalidRequest(
                "spending cap must be greater than zero".to_string(),
            ));
        }
        if owner.is_zero() {
            return Err(SessionError::InvalidRequest(
                "owner must not be the zero address".to_string(),
            ));
        }

        let (session_address, encrypted_key) = self.vault.generate()?;
        let now = Utc::now();
        let record = SessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            owner,
            session_address,
            encrypted_key: Some(encrypted_key),
            spending_cap,
            spent: TokenAmount::ZERO,
            status: SessionStatus::Funding,
            approval_tx: None,
            refund: RefundRecord::default(),
            in_doubt: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        };
        self.store
            .insert(&record)
            .await
            .map_err(SessionError::Store)?;

        log::info!(
            "[Sessions] Created session {} for {} at {} (cap {})",
            record.id,
            owner,
            session_address,
            spending_cap
        );
        Ok(record)
    }

    pub async fn get(&self, id: &str, owner: EthAddress) -> Result<SessionRecord, SessionError> {
        self.load_owned(id, owner).await
    }

    pub async fn list(&self, owner: EthAddress) -> Result<Vec<SessionRecord>, SessionError> {
        self.store
            .list_by_owner(&owner)
            .await
            .map_err(SessionError::Store)
    }

    /// funding -> active once token and gas deposits have landed
    pub async fn confirm_funding(
        &self,
        id: &str,
        owner: EthAddress,
    ) -> Result<SessionRecord, SessionError> {
        let record = self.load_owned(id, owner).await?;
        require_status(&record, SessionStatus::Funding, "confirm funding")?;

        let token_balance = self
            .config
            .retry
            .run("token balance read", || {
                self.chain.token_balance(record.session_address)
            })
            .await?;
        if token_balance < record.spending_cap {
            return Err(SessionError::NotFunded(format!(
                "token balance {} is below the spending cap {}",
                token_balance, record.spending_cap
            )));
        }

        let native_balance = self
            .config
            .retry
            .run("native balance read", || {
                self.chain.native_balance(record.session_address)
            })
            .await?;
        if native_balance < self.config.min_gas_funding {
            return Err(SessionError::NotFunded(format!(
                "gas balance {} wei is below the required {} wei",
                native_balance, self.config.min_gas_funding
            )));
        }

        let active = self
            .mutate(id, owner, |r| {
                require_status(r, SessionStatus::Funding, "confirm funding")?;
                r.status = SessionStatus::Active;
                Ok(())
            })
            .await?;
        log::info!("[Sessions] Session {} funded and active", id);
        Ok(active)
    }

    /// Approve the settlement contract for the whole token balance so
    /// payments skip the per-payment approval
    pub async fn activate(&self, id: &str, owner: EthAddress) -> Result<SessionRecord, SessionError> {
        let record = self.load_owned(id, owner).await?;
        require_status(&record, SessionStatus::Active, "activate")?;
        let key = self.unlock(&record)?;

        let balance = self
            .config
            .retry
            .run("token balance read", || {
                self.chain.token_balance(record.session_address)
            })
            .await?;
        let tx_hash = self
            .config
            .retry
            .run("approve", || {
                self.chain
                    .approve_token(key.wallet(), self.config.settlement_contract, balance)
            })
            .await?;
        drop(key);

        log::info!(
            "[Sessions] Session {} approved settlement for {} (tx {})",
            id,
            balance,
            tx_hash
        );
        self.mutate(id, owner, |r| {
            r.approval_tx = Some(tx_hash.clone());
            Ok(())
        })
        .await
    }

    /// Pay for `operation` from the session. The amount is reserved against
    /// the cap before anything is signed and released again if the payment
    /// fails. If the settlement outcome is unknown the reservation is kept
    /// and the nonce recorded, to be resolved by a later spend.
    pub async fn spend(
        &self,
        id: &str,
        owner: EthAddress,
        operation: &str,
        sink: &dyn ProofSink,
    ) -> Result<AuthorizedContext, SessionError> {
        let quote = sink.quote(operation)?;
        if quote.token != self.config.token {
            return Err(SessionError::InvalidRequest(format!(
                "operation '{}' is priced in {}, sessions hold {}",
                operation, quote.token, self.config.token
            )));
        }

        if let Err(e) = self.reconcile_in_doubt(id, owner, sink).await {
            log::warn!("[Sessions] Could not reconcile in-doubt payments on {}: {}", id, e);
        }

        let amount = quote.amount;
        let nonce = generate_nonce().map_err(ChainError::Signing)?;
        let reserved = self
            .mutate(id, owner, |r| {
                require_status(r, SessionStatus::Active, "spend")?;
                let spent = r
                    .spent
                    .checked_add(amount)
                    .filter(|total| *total <= r.spending_cap)
                    .ok_or(SessionError::CapExceeded {
                        cap: r.spending_cap,
                        spent: r.spent,
                        requested: amount,
                    })?;
                r.spent = spent;
                Ok(())
            })
            .await?;

        match self.pay_reserved(&reserved, &quote, nonce, sink).await {
            Ok(ctx) => {
                log::info!(
                    "[Sessions] Session {} paid {} for '{}' ({} of {} spent)",
                    id,
                    amount,
                    operation,
                    reserved.spent,
                    reserved.spending_cap
                );
                Ok(ctx)
            }
            Err(e) => {
                let in_doubt = matches!(
                    e,
                    SessionError::Payment(GateRejection::SettlementFailed { in_doubt: true, .. })
                );
                if in_doubt {
                    log::warn!(
                        "[Sessions] Session {} payment in doubt, keeping {} reserved",
                        id,
                        amount
                    );
                    let recorded = self
                        .mutate(id, owner, |r| {
                            r.in_doubt.push(InDoubtPayment {
                                nonce,
                                amount,
                                recorded_at: Utc::now(),
                            });
                            Ok(())
                        })
                        .await;
                    if let Err(store_err) = recorded {
                        log::error!(
                            "[Sessions] Failed to record in-doubt nonce {:?} on session {}: {}",
                            nonce,
                            id,
                            store_err
                        );
                    }
                } else if let Err(rollback) = self
                    .mutate(id, owner, |r| {
                        r.spent = r.spent.saturating_sub(amount);
                        Ok(())
                    })
                    .await
                {
                    log::error!(
                        "[Sessions] Failed to release {} reserved on session {}: {}",
                        amount,
                        id,
                        rollback
                    );
                }
                Err(e)
            }
        }
    }

    /// Look up in-doubt payments older than the grace period. Landed ones
    /// stay spent, ones that never landed go back to the cap, and unknown
    /// ones are left for next time. Returns how many were settled.
    pub async fn reconcile_in_doubt(
        &self,
        id: &str,
        owner: EthAddress,
        sink: &dyn ProofSink,
    ) -> Result<usize, SessionError> {
        let record = self.load_owned(id, owner).await?;
        let due: Vec<&InDoubtPayment> = record
            .in_doubt
            .iter()
            .filter(|p| lease_expired(p.recorded_at, self.config.in_doubt_grace))
            .collect();
        if due.is_empty() {
            return Ok(0);
        }

        let mut landed = Vec::new();
        let mut refunded = Vec::new();
        for payment in due {
            match sink.resolve(payment.nonce).await {
                Ok(NonceState::Confirmed) => landed.push(payment.nonce),
                Ok(NonceState::Unclaimed) => refunded.push(payment.nonce),
                Ok(NonceState::Claimed) => {}
                Err(e) => log::warn!(
                    "[Sessions] In-doubt nonce {:?} on session {} still unresolved: {}",
                    payment.nonce,
                    id,
                    e
                ),
            }
        }
        if landed.is_empty() && refunded.is_empty() {
            return Ok(0);
        }

        let mut settled = 0;
        self.mutate(id, owner, |r| {
            settled = 0;
            let mut kept = Vec::with_capacity(r.in_doubt.len());
            for payment in r.in_doubt.drain(..) {
                if refunded.contains(&payment.nonce) {
                    r.spent = r.spent.saturating_sub(payment.amount);
                    settled += 1;
                } else if landed.contains(&payment.nonce) {
                    settled += 1;
                } else {
                    kept.push(payment);
                }
            }
            r.in_doubt = kept;
            Ok(())
        })
        .await?;
        log::info!(
            "[Sessions] Session {}: {} in-doubt payments landed, {} returned to the cap",
            id,
            landed.len(),
            refunded.len()
        );
        Ok(settled)
    }

    async fn pay_reserved(
        &self,
        record: &SessionRecord,
        quote: &PaymentQuote,
        nonce: H256,
        sink: &dyn ProofSink,
    ) -> Result<AuthorizedContext, SessionError> {
        let key = self.unlock(record)?;

        let allowance = self
            .config
            .retry
            .run("allowance read", || {
                self.chain
                    .token_allowance(record.session_address, self.config.settlement_contract)
            })
            .await?;
        if allowance < quote.amount {
            self.config
                .retry
                .run("approve", || {
                    self.chain.approve_token(
                        key.wallet(),
                        self.config.settlement_contract,
                        quote.amount,
                    )
                })
                .await?;
        }

        let proof = sign_payment(
            key.wallet(),
            nonce,
            quote.amount,
            quote.token,
            quote.recipient,
            Utc::now().timestamp().max(0) as u64,
        )
        .map_err(ChainError::Signing)?;
        drop(key);

        Ok(sink.submit(&quote.operation, proof).await?)
    }

    /// Return all funds to the owner and retire the session. Any failure
    /// leaves the session `stuck` with its key so close can run again, and
    /// a `closing` record older than the close lease is taken over from a
    /// close that never finished.
    pub async fn close(&self, id: &str, owner: EthAddress) -> Result<SessionRecord, SessionError> {
        let lease = self.config.close_lease;
        let closing = self
            .mutate(id, owner, |r| {
                let abandoned =
                    r.status == SessionStatus::Closing && lease_expired(r.updated_at, lease);
                if !r.status.can_close() && !abandoned {
                    return Err(SessionError::InvalidState {
                        session_id: r.id.clone(),
                        status: r.status,
                        operation: "close",
                    });
                }
                if abandoned {
                    log::warn!("[Sessions] Resuming abandoned close of session {}", r.id);
                }
                r.status = SessionStatus::Closing;
                Ok(())
            })
            .await?;

        let mut refund = closing.refund.clone();
        refund.last_error = None;

        let result = match self.drain(&closing, &mut refund).await {
            Ok(()) => {
                refund.refunded_at = Some(Utc::now());
                self.mutate(id, owner, |r| {
                    require_status(r, SessionStatus::Closing, "close")?;
                    r.refund = refund.clone();
                    r.encrypted_key = None;
                    r.status = SessionStatus::Closed;
                    Ok(())
                })
                .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(closed) => {
                log::info!(
                    "[Sessions] Session {} closed: {} token units (tx {:?}), {} wei (tx {:?}), {} wei left",
                    id,
                    closed.refund.token_amount,
                    closed.refund.token_tx,
                    closed.refund.native_amount,
                    closed.refund.native_tx,
                    closed.refund.native_dust
                );
                Ok(closed)
            }
            Err(e) => {
                log::error!("[Sessions] Session {} cannot be closed: {}", id, e);
                refund.refunded_at = None;
                refund.last_error = Some(e.to_string());
                self.mark_stuck(id, owner, &refund).await;
                Err(e)
            }
        }
    }

    /// Best effort: a session that fails to close keeps its key and waits
    /// for another close
    async fn mark_stuck(&self, id: &str, owner: EthAddress, refund: &RefundRecord) {
        let marked = self
            .mutate(id, owner, |r| {
                require_status(r, SessionStatus::Closing, "mark stuck")?;
                r.refund = refund.clone();
                r.status = SessionStatus::Stuck;
                Ok(())
            })
            .await;
        if let Err(store_err) = marked {
            log::error!("[Sessions] Failed to mark session {} stuck: {}", id, store_err);
        }
    }

    /// Persist refund progress while the key is still held
    async fn checkpoint(&self, record: &SessionRecord, refund: &RefundRecord) -> Result<(), SessionError> {
        self.mutate(&record.id, record.owner, |r| {
            require_status(r, SessionStatus::Closing, "close")?;
            r.refund = refund.clone();
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn drain(&self, record: &SessionRecord, refund: &mut RefundRecord) -> Result<(), SessionError> {
        let dust = self.config.dust_threshold;
        let session = record.session_address;
        let retry = self.config.retry;

        let token_balance = retry
            .run("token balance read", || self.chain.token_balance(session))
            .await?;

        let mut key: Option<UnlockedKey> = None;

        if token_balance > dust {
            if record.encrypted_key.is_none() {
                return Err(CustodyError::KeyUnavailable {
                    session_id: record.id.clone(),
                }
                .into());
            }
            let unlocked = self.unlock(record)?;
            let ctx = self.refund_context(record, &unlocked);

            let mut last_error = String::from("balance unchanged after refund");
            let mut in_flight = None;
            match ctx.refund_token(token_balance).await {
                Ok(token_refund) => {
                    refund.token_amount = refund
                        .token_amount
                        .checked_add(token_refund.amount)
                        .unwrap_or(refund.token_amount);
                    refund.token_tx = Some(token_refund.tx_hash);
                    refund.token_path = Some(token_refund.path);
                }
                Err(e) => {
                    if let ChainError::Timeout { tx_hash: Some(tx_hash) } = &e {
                        in_flight = Some(tx_hash.clone());
                    }
                    last_error = e.to_string();
                }
            }

            // an in-flight refund is judged by the balance it leaves behind
            let remaining = retry
                .run("token balance read", || self.chain.token_balance(session))
                .await?;
            if remaining > dust {
                return Err(CustodyError::TokenNotDrained {
                    session_id: record.id.clone(),
                    remaining,
                    dust,
                    last_error,
                }
                .into());
            }
            if let Some(tx_hash) = in_flight {
                refund.token_amount = refund
                    .token_amount
                    .checked_add(token_balance.saturating_sub(remaining))
                    .unwrap_or(refund.token_amount);
                refund.token_tx = Some(tx_hash);
            }
            self.checkpoint(record, refund).await?;
            key = Some(unlocked);
        }

        if key.is_none() && record.encrypted_key.is_some() {
            match self.unlock(record) {
                Ok(unlocked) => key = Some(unlocked),
                Err(e) => log::warn!(
                    "[Refund] Cannot unlock session {} for native refund: {}",
                    record.id,
                    e
                ),
            }
        }

        if let Some(unlocked) = &key {
            let ctx = self.refund_context(record, unlocked);
            match ctx.refund_native(&self.config.transfer_policies).await {
                Ok(Some(native)) => {
                    refund.native_amount = refund.native_amount.saturating_add(native.amount);
                    refund.native_tx = Some(native.tx_hash);
                    self.checkpoint(record, refund).await?;
                }
                Ok(None) => {}
                // residual gas never blocks closing
                Err(e) => log::warn!(
                    "[Refund] Native refund for session {} failed on every policy: {}",
                    record.id,
                    e
                ),
            }
        }
        drop(key);

        match retry
            .run("native balance read", || self.chain.native_balance(session))
            .await
        {
            Ok(residual) => refund.native_dust = residual,
            Err(e) => log::warn!(
                "[Refund] Could not read residual gas for session {}: {}",
                record.id,
                e
            ),
        }
        Ok(())
    }

    fn refund_context<'a>(
        &'a self,
        record: &SessionRecord,
        key: &'a UnlockedKey,
    ) -> RefundContext<'a> {
        RefundContext {
            chain: self.chain.as_ref(),
            settlement: self.settlement.as_ref(),
            wallet: key.wallet(),
            session: record.session_address,
            owner: record.owner,
            token: self.config.token,
            settlement_contract: self.config.settlement_contract,
            retry: self.config.retry,
        }
    }

    fn unlock(&self, record: &SessionRecord) -> Result<UnlockedKey, SessionError> {
        let sealed = record
            .encrypted_key
            .as_ref()
            .ok_or_else(|| CustodyError::KeyUnavailable {
                session_id: record.id.clone(),
            })?;
        Ok(self.vault.unlock(&record.session_address, sealed)?)
    }

    async fn load_owned(&self, id: &str, owner: EthAddress) -> Result<SessionRecord, SessionError> {
        let record = self
            .store
            .get(id)
            .await
            .map_err(SessionError::Store)?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if record.owner != owner {
            return Err(SessionError::NotOwner {
                session_id: id.to_string(),
                caller: owner.to_checksum(),
            });
        }
        Ok(record)
    }

    /// Read-modify-write with compare-and-swap, retried on lost races
    async fn mutate<F>(&self, id: &str, owner: EthAddress, mut apply: F) -> Result<SessionRecord, SessionError>
    where
        F: FnMut(&mut SessionRecord) -> Result<(), SessionError>,
    {
        for _ in 0..CAS_ATTEMPTS {
            let mut record = self.load_owned(id, owner).await?;
            let expected = record.version;
            apply(&mut record)?;
            record.version += 1;
            record.updated_at = Utc::now();
            if self
                .store
                .update(&record, expected)
                .await
                .map_err(SessionError::Store)?
            {
                return Ok(record);
            }
            log::debug!("[Sessions] Lost update race on session {}, retrying", id);
        }
        Err(SessionError::Contention(id.to_string()))
    }
}

fn require_status(
    record: &SessionRecord,
    expected: SessionStatus,
    operation: &'static str,
) -> Result<(), SessionError> {
    if record.status != expected {
        return Err(SessionError::InvalidState {
            session_id: record.id.clone(),
            status: record.status,
            operation,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonce_ledger::MemoryNonceStore;
    use crate::payment::{GateConfig, PaymentGate, PriceEntry, PricingTable};
    use crate::sandbox::{SandboxChain, SandboxFailure};
    use crate::sessions::refund::DEFAULT_TRANSFER_POLICIES;
    use crate::sessions::store::MemorySessionStore;
    use async_trait::async_trait;
    use ethers::types::Address;
    use std::sync::atomic::{AtomicU32, Ordering};

    const PRICE: u64 = 100_000; // 0.10 with 6 decimals
    const CAP: u64 = 1_000_000; // 1.00
    const DUST: u64 = 100;

    struct Harness {
        chain: Arc<SandboxChain>,
        gate: PaymentGate,
        manager: SessionWalletManager,
        store: Arc<dyn SessionStore>,
        owner: EthAddress,
    }

    /// Fails the next `failures` writes that would mark a session closed
    struct FailingCloseStore {
        inner: MemorySessionStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl SessionStore for FailingCloseStore {
        async fn insert(&self, record: &SessionRecord) -> Result<(), String> {
            self.inner.insert(record).await
        }

        async fn get(&self, id: &str) -> Result<Option<SessionRecord>, String> {
            self.inner.get(id).await
        }

        async fn list_by_owner(&self, owner: &EthAddress) -> Result<Vec<SessionRecord>, String> {
            self.inner.list_by_owner(owner).await
        }

        async fn update(&self, record: &SessionRecord, expected_version: u64) -> Result<bool, String> {
            if record.status == SessionStatus::Closed
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err("database is locked".to_string());
            }
            self.inner.update(record, expected_version).await
        }

        fn store_name(&self) -> &'static str {
            "failing-close"
        }
    }

    fn token() -> EthAddress {
        EthAddress::from(Address::repeat_byte(0xaa))
    }

    fn recipient() -> EthAddress {
        EthAddress::from(Address::repeat_byte(0xbb))
    }

    fn gas_funding() -> U256 {
        U256::from(10u64).pow(U256::from(16u64))
    }

    fn harness() -> Harness {
        harness_with_store(Arc::new(MemorySessionStore::new()))
    }

    fn harness_with_store(store: Arc<dyn SessionStore>) -> Harness {
        let contract = EthAddress::from(Address::repeat_byte(0xcc));
        let chain = Arc::new(SandboxChain::new("sandbox", contract));

        let pricing = PricingTable::new().with_entry(PriceEntry {
            operation: "api.call".to_string(),
            price: TokenAmount::from(PRICE),
            recipient: recipient(),
            description: None,
        });
        let gate = PaymentGate::new(
            GateConfig {
                network: "sandbox".to_string(),
                token: token(),
                token_decimals: 6,
                token_symbol: "USDC".to_string(),
                freshness_window: Duration::from_secs(300),
                future_tolerance: Duration::from_secs(30),
            },
            pricing,
            Arc::new(MemoryNonceStore::new()),
            chain.clone(),
        );

        let manager = SessionWalletManager::new(
            store.clone(),
            chain.clone(),
            chain.clone(),
            KeyVault::from_secret("test-secret").unwrap(),
            SessionConfig {
                token: token(),
                settlement_contract: contract,
                dust_threshold: TokenAmount::from(DUST),
                min_gas_funding: U256::from(10u64).pow(U256::from(15u64)),
                transfer_policies: DEFAULT_TRANSFER_POLICIES.to_vec(),
                retry: RetryPolicy::immediate(3),
                close_lease: Duration::from_secs(60),
                in_doubt_grace: Duration::ZERO,
            },
        );

        Harness {
            chain,
            gate,
            manager,
            store,
            owner: EthAddress::from(Address::repeat_byte(0x0a)),
        }
    }

    /// Created, funded with `cap` tokens plus gas, and confirmed
    async fn funded(h: &Harness, cap: u64) -> SessionRecord {
        let session = h
            .manager
            .create_session(h.owner, TokenAmount::from(cap))
            .await
            .unwrap();
        h.chain
            .mint_token(session.session_address, TokenAmount::from(cap));
        h.chain.fund_native(session.session_address, gas_funding());
        h.manager.confirm_funding(&session.id, h.owner).await.unwrap()
    }

    #[tokio::test]
    async fn test_cap_enforced_before_settlement() {
        let h = harness();
        let session = funded(&h, CAP).await;
        h.manager.activate(&session.id, h.owner).await.unwrap();

        for _ in 0..10 {
            h.manager
                .spend(&session.id, h.owner, "api.call", &h.gate)
                .await
                .unwrap();
        }
        let record = h.manager.get(&session.id, h.owner).await.unwrap();
        assert_eq!(record.spent, TokenAmount::from(CAP));
        assert_eq!(h.chain.settle_attempts(), 10);
        assert_eq!(h.chain.token_balance_of(recipient()), TokenAmount::from(CAP));

        let err = h
            .manager
            .spend(&session.id, h.owner, "api.call", &h.gate)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::CapExceeded { .. }));
        assert_eq!(h.chain.settle_attempts(), 10);
        assert_eq!(
            h.manager.get(&session.id, h.owner).await.unwrap().spent,
            TokenAmount::from(CAP)
        );
    }

    #[tokio::test]
    async fn test_concurrent_spends_never_exceed_cap() {
        let h = harness();
        let session = funded(&h, PRICE * 3).await;
        h.manager.activate(&session.id, h.owner).await.unwrap();

        let attempts = (0..5).map(|_| h.manager.spend(&session.id, h.owner, "api.call", &h.gate));
        let results = futures_util::future::join_all(attempts).await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
        assert_eq!(
            h.manager.get(&session.id, h.owner).await.unwrap().spent,
            TokenAmount::from(PRICE * 3)
        );
    }

    #[tokio::test]
    async fn test_spend_without_activation_approves_per_payment() {
        let h = harness();
        let session = funded(&h, CAP).await;

        h.manager
            .spend(&session.id, h.owner, "api.call", &h.gate)
            .await
            .unwrap();
        assert_eq!(h.chain.token_balance_of(recipient()), TokenAmount::from(PRICE));
    }

    #[tokio::test]
    async fn test_failed_payment_releases_reservation() {
        let h = harness();
        let session = funded(&h, CAP).await;
        h.manager.activate(&session.id, h.owner).await.unwrap();
        h.chain.fail_next_settlement(SandboxFailure::Revert);

        let err = h
            .manager
            .spend(&session.id, h.owner, "api.call", &h.gate)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Payment(GateRejection::SettlementFailed { in_doubt: false, .. })
        ));
        assert_eq!(
            h.manager.get(&session.id, h.owner).await.unwrap().spent,
            TokenAmount::ZERO
        );
    }

    #[tokio::test]
    async fn test_in_doubt_payment_keeps_reservation() {
        let h = harness();
        let session = funded(&h, CAP).await;
        h.manager.activate(&session.id, h.owner).await.unwrap();
        h.chain
            .fail_next_settlement(SandboxFailure::TimeoutAfterBroadcast);

        assert!(
            h.manager
                .spend(&session.id, h.owner, "api.call", &h.gate)
                .await
                .is_err()
        );
        let record = h.manager.get(&session.id, h.owner).await.unwrap();
        assert_eq!(record.spent, TokenAmount::from(PRICE));
        assert_eq!(record.in_doubt.len(), 1);
        assert_eq!(record.in_doubt[0].amount, TokenAmount::from(PRICE));

        // the next spend finds the payment landed and keeps it counted
        h.manager
            .spend(&session.id, h.owner, "api.call", &h.gate)
            .await
            .unwrap();
        let record = h.manager.get(&session.id, h.owner).await.unwrap();
        assert!(record.in_doubt.is_empty());
        assert_eq!(record.spent, TokenAmount::from(2 * PRICE));
        assert_eq!(h.chain.token_balance_of(recipient()), TokenAmount::from(2 * PRICE));
    }

    #[tokio::test]
    async fn test_dropped_payment_returns_to_cap() {
        let h = harness();
        let session = funded(&h, CAP).await;
        h.manager.activate(&session.id, h.owner).await.unwrap();
        h.chain
            .fail_next_settlement(SandboxFailure::DroppedAfterBroadcast);

        assert!(
            h.manager
                .spend(&session.id, h.owner, "api.call", &h.gate)
                .await
                .is_err()
        );
        assert_eq!(
            h.manager.get(&session.id, h.owner).await.unwrap().spent,
            TokenAmount::from(PRICE)
        );

        let settled = h
            .manager
            .reconcile_in_doubt(&session.id, h.owner, &h.gate)
            .await
            .unwrap();
        assert_eq!(settled, 1);
        let record = h.manager.get(&session.id, h.owner).await.unwrap();
        assert!(record.in_doubt.is_empty());
        assert_eq!(record.spent, TokenAmount::ZERO);
        assert_eq!(h.chain.token_balance_of(recipient()), TokenAmount::ZERO);
    }

    #[tokio::test]
    async fn test_lifecycle_guards() {
        let h = harness();
        let session = h
            .manager
            .create_session(h.owner, TokenAmount::from(CAP))
            .await
            .unwrap();

        // nothing deposited yet
        assert!(matches!(
            h.manager.confirm_funding(&session.id, h.owner).await.unwrap_err(),
            SessionError::NotFunded(_)
        ));
        assert!(matches!(
            h.manager
                .spend(&session.id, h.owner, "api.call", &h.gate)
                .await
                .unwrap_err(),
            SessionError::InvalidState { .. }
        ));

        let stranger = EthAddress::from(Address::repeat_byte(0x0b));
        assert!(matches!(
            h.manager.get(&session.id, stranger).await.unwrap_err(),
            SessionError::NotOwner { .. }
        ));
        assert!(h.manager.list(stranger).await.unwrap().is_empty());
        assert_eq!(h.manager.list(h.owner).await.unwrap().len(), 1);

        assert!(matches!(
            h.manager
                .create_session(h.owner, TokenAmount::ZERO)
                .await
                .unwrap_err(),
            SessionError::InvalidRequest(_)
        ));
    }

    #[tokio::test]
    async fn test_close_refunds_through_settlement_and_erases_key() {
        let h = harness();
        let session = funded(&h, CAP).await;
        h.manager.activate(&session.id, h.owner).await.unwrap();
        for _ in 0..3 {
            h.manager
                .spend(&session.id, h.owner, "api.call", &h.gate)
                .await
                .unwrap();
        }

        let closed = h.manager.close(&session.id, h.owner).await.unwrap();
        let remaining = TokenAmount::from(CAP - 3 * PRICE);

        assert_eq!(closed.status, SessionStatus::Closed);
        assert!(closed.encrypted_key.is_none());
        assert_eq!(closed.refund.token_amount, remaining);
        assert_eq!(closed.refund.token_path, Some(crate::sessions::RefundPath::Settlement));
        assert!(closed.refund.token_tx.is_some());
        assert!(closed.refund.native_tx.is_some());
        assert!(closed.refund.refunded_at.is_some());
        assert_eq!(closed.refund.native_dust, U256::zero());

        assert_eq!(h.chain.token_balance_of(h.owner), remaining);
        assert_eq!(h.chain.token_balance_of(session.session_address), TokenAmount::ZERO);
        assert!(h.chain.native_balance_of(h.owner) > U256::zero());

        // closed is terminal
        assert!(matches!(
            h.manager.close(&session.id, h.owner).await.unwrap_err(),
            SessionError::InvalidState { .. }
        ));
    }

    #[tokio::test]
    async fn test_close_without_approval_uses_transfer() {
        let h = harness();
        let session = funded(&h, CAP).await;

        let closed = h.manager.close(&session.id, h.owner).await.unwrap();
        assert_eq!(closed.refund.token_path, Some(crate::sessions::RefundPath::Transfer));
        assert_eq!(h.chain.token_balance_of(h.owner), TokenAmount::from(CAP));
    }

    #[tokio::test]
    async fn test_undrainable_session_is_stuck_then_closable() {
        let h = harness();
        let session = funded(&h, CAP).await;
        h.chain.freeze(session.session_address);

        let err = h.manager.close(&session.id, h.owner).await.unwrap_err();
        match err {
            SessionError::Custody(CustodyError::TokenNotDrained { remaining, .. }) => {
                assert_eq!(remaining, TokenAmount::from(CAP));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        let stuck = h.manager.get(&session.id, h.owner).await.unwrap();
        assert_eq!(stuck.status, SessionStatus::Stuck);
        assert!(stuck.encrypted_key.is_some());
        assert!(stuck.refund.last_error.is_some());

        h.chain.unfreeze(session.session_address);
        let closed = h.manager.close(&session.id, h.owner).await.unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert!(closed.refund.last_error.is_none());
    }

    #[tokio::test]
    async fn test_native_refund_falls_back_to_next_policy() {
        let h = harness();
        h.chain.set_native_transfer_overhead(2_000);
        let session = funded(&h, CAP).await;

        let closed = h.manager.close(&session.id, h.owner).await.unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert!(closed.refund.native_tx.is_some());
        assert!(closed.refund.native_dust > U256::zero());
        assert_eq!(
            h.chain.native_balance_of(h.owner),
            closed.refund.native_amount
        );
    }

    #[tokio::test]
    async fn test_close_retries_transient_errors() {
        let h = harness();
        let session = funded(&h, CAP).await;
        h.chain.fail_next_wallet_calls(2);

        let closed = h.manager.close(&session.id, h.owner).await.unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert_eq!(h.chain.token_balance_of(h.owner), TokenAmount::from(CAP));
    }

    #[tokio::test]
    async fn test_dust_balance_closes_without_token_refund() {
        let h = harness();
        let session = h
            .manager
            .create_session(h.owner, TokenAmount::from(CAP))
            .await
            .unwrap();
        h.chain
            .mint_token(session.session_address, TokenAmount::from(DUST));

        let closed = h.manager.close(&session.id, h.owner).await.unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert!(closed.refund.token_tx.is_none());
        assert_eq!(closed.refund.token_amount, TokenAmount::ZERO);
    }

    #[tokio::test]
    async fn test_failed_final_write_leaves_session_stuck_and_closable() {
        let store = Arc::new(FailingCloseStore {
            inner: MemorySessionStore::new(),
            failures: AtomicU32::new(1),
        });
        let h = harness_with_store(store);
        let session = funded(&h, CAP).await;

        let err = h.manager.close(&session.id, h.owner).await.unwrap_err();
        assert!(matches!(err, SessionError::Store(_)));

        let stuck = h.manager.get(&session.id, h.owner).await.unwrap();
        assert_eq!(stuck.status, SessionStatus::Stuck);
        assert!(stuck.encrypted_key.is_some());
        assert!(stuck.refund.token_tx.is_some());
        assert_eq!(stuck.refund.token_amount, TokenAmount::from(CAP));
        assert!(stuck.refund.last_error.is_some());
        assert_eq!(h.chain.token_balance_of(h.owner), TokenAmount::from(CAP));

        let closed = h.manager.close(&session.id, h.owner).await.unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert!(closed.encrypted_key.is_none());
        assert_eq!(closed.refund.token_amount, TokenAmount::from(CAP));
        assert!(closed.refund.native_tx.is_some());
        assert_eq!(h.chain.token_balance_of(h.owner), TokenAmount::from(CAP));
    }

    /// Put the stored session in `closing` as of `age` ago
    async fn abandon_close(h: &Harness, id: &str, age: chrono::Duration) {
        let mut record = h.store.get(id).await.unwrap().unwrap();
        let expected = record.version;
        record.status = SessionStatus::Closing;
        record.updated_at = Utc::now() - age;
        record.version += 1;
        assert!(h.store.update(&record, expected).await.unwrap());
    }

    #[tokio::test]
    async fn test_abandoned_close_resumes_after_lease() {
        let h = harness();
        let session = funded(&h, CAP).await;
        abandon_close(&h, &session.id, chrono::Duration::minutes(10)).await;

        let closed = h.manager.close(&session.id, h.owner).await.unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert_eq!(h.chain.token_balance_of(h.owner), TokenAmount::from(CAP));
    }

    #[tokio::test]
    async fn test_close_in_progress_is_not_taken_over() {
        let h = harness();
        let session = funded(&h, CAP).await;
        abandon_close(&h, &session.id, chrono::Duration::seconds(1)).await;

        assert!(matches!(
            h.manager.close(&session.id, h.owner).await.unwrap_err(),
            SessionError::InvalidState {
                status: SessionStatus::Closing,
                ..
            }
        ));
        assert_eq!(h.chain.token_balance_of(h.owner), TokenAmount::ZERO);
    }

    #[tokio::test]
    async fn test_in_flight_token_refund_is_read_back_from_balance() {
        let h = harness();
        let session = funded(&h, CAP).await;
        h.chain.stall_next_wallet_txs(1);

        let closed = h.manager.close(&session.id, h.owner).await.unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert_eq!(closed.refund.token_amount, TokenAmount::from(CAP));
        assert!(closed.refund.token_tx.is_some());
        assert_eq!(h.chain.token_balance_of(h.owner), TokenAmount::from(CAP));
    }
}
