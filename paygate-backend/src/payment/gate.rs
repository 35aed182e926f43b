//! Payment Gate
//!
//! `authorize` runs a proof through the pipeline in a fixed order:
//!
//! 1. parse the header (missing -> challenge, unparsable -> MalformedProof)
//! 2. price / token / recipient / freshness policy
//! 3. exclusive nonce claim
//! 4. local signature recovery
//! 5. on-chain verification, then settlement
//! 6. confirm the nonce and record usage
//!
//! Steps 1-2 never touch the ledger and 1-4 never touch the network. Any
//! failure in 4-5 releases the claim, except a settlement that was broadcast
//! and never confirmed: that nonce stays claimed until
//! [`PaymentGate::resolve_in_doubt`] settles its fate.

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::H256;
use paygate_types::{PaymentChallenge, SettlementResponse};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::challenge::build_challenge;
use super::pricing::{PriceEntry, PricingTable};
use super::proof::PaymentProof;
use super::usage::UsageTracker;
use super::verifier::SignatureVerifier;
use crate::domain_types::{EthAddress, TokenAmount};
use crate::error::{GateRejection, PolicyViolation, ReplaySource};
use crate::nonce_ledger::{AUTH_CLAIMANT_PREFIX, NonceState, NonceStore};
use crate::settlement::{OnChainVerdict, SettlementClient, SettlementReceipt};

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub network: String,
    pub token: EthAddress,
    pub token_decimals: u8,
    pub token_symbol: String,
    /// Maximum proof age
    pub freshness_window: Duration,
    /// Allowed clock skew for timestamps ahead of ours
    pub future_tolerance: Duration,
}

/// One incoming request for a paid operation
#[derive(Debug, Clone, Copy)]
pub struct PaymentRequest<'a> {
    pub operation: &'a str,
    /// Path advertised in the challenge
    pub resource: &'a str,
    /// Raw `X-PAYMENT` header value
    pub header: Option<&'a str>,
}

/// A settled payment, handed to the code that performs the operation
#[derive(Debug, Clone)]
pub struct AuthorizedContext {
    pub operation: String,
    pub price: TokenAmount,
    pub proof: PaymentProof,
    pub receipt: SettlementReceipt,
}

impl AuthorizedContext {
    /// Body of the `X-PAYMENT-RESPONSE` header
    pub fn settlement_response(&self, network: &str) -> SettlementResponse {
        SettlementResponse {
            success: true,
            transaction: self.receipt.tx_hash.clone(),
            network: network.to_string(),
            payer: self.proof.payer().to_checksum(),
        }
    }
}

/// What a caller must pay for an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentQuote {
    pub operation: String,
    pub amount: TokenAmount,
    pub token: EthAddress,
    pub recipient: EthAddress,
}

/// Accepts signed proofs produced in-process (session wallets)
#[async_trait]
pub trait ProofSink: Send + Sync {
    fn quote(&self, operation: &str) -> Result<PaymentQuote, GateRejection>;

    async fn submit(
        &self,
        operation: &str,
        proof: PaymentProof,
    ) -> Result<AuthorizedContext, GateRejection>;

    /// Settle the fate of a nonce whose submission ended in doubt
    async fn resolve(&self, nonce: H256) -> Result<NonceState, GateRejection>;
}

pub struct PaymentGate {
    config: GateConfig,
    pricing: PricingTable,
    nonces: Arc<dyn NonceStore>,
    verifier: SignatureVerifier,
    settlement: Arc<dyn SettlementClient>,
    usage: UsageTracker,
}

impl PaymentGate {
    pub fn new(
        config: GateConfig,
        pricing: PricingTable,
        nonces: Arc<dyn NonceStore>,
        settlement: Arc<dyn SettlementClient>,
    ) -> Self {
        log::info!(
            "[Gate] {} paid operations, nonce store: {}, settlement: {}",
            pricing.len(),
            nonces.store_name(),
            settlement.mode_name()
        );
        Self {
            config,
            pricing,
            nonces,
            verifier: SignatureVerifier::new(),
            settlement,
            usage: UsageTracker::new(),
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    pub fn nonce_store(&self) -> Arc<dyn NonceStore> {
        self.nonces.clone()
    }

    fn price_for(&self, operation: &str) -> Result<&PriceEntry, GateRejection> {
        self.pricing
            .lookup(operation)
            .ok_or_else(|| GateRejection::UnknownOperation(operation.to_string()))
    }

    pub fn challenge(&self, operation: &str, resource: &str) -> Result<PaymentChallenge, GateRejection> {
        let entry = self.price_for(operation)?;
        Ok(build_challenge(entry, &self.config, resource, "payment required"))
    }

    /// Full pipeline from a raw header
    pub async fn authorize(
        &self,
        request: &PaymentRequest<'_>,
    ) -> Result<AuthorizedContext, GateRejection> {
        let result = self.authorize_header(request).await;
        if let Err(rejection) = &result {
            self.usage.record_rejection(rejection.code());
        }
        result
    }

    async fn authorize_header(
        &self,
        request: &PaymentRequest<'_>,
    ) -> Result<AuthorizedContext, GateRejection> {
        let entry = self.price_for(request.operation)?;

        let Some(header) = request.header else {
            return Err(GateRejection::ChallengeRequired(Box::new(build_challenge(
                entry,
                &self.config,
                request.resource,
                "X-PAYMENT header is required",
            ))));
        };

        let proof = PaymentProof::from_header(header).map_err(|reason| {
            let challenge = build_challenge(entry, &self.config, request.resource, &reason);
            GateRejection::MalformedProof {
                reason,
                challenge: Box::new(challenge),
            }
        })?;

        self.process(entry, proof).await
    }

    /// Pipeline from step 2 for an already-parsed proof
    pub async fn authorize_proof(
        &self,
        operation: &str,
        proof: PaymentProof,
    ) -> Result<AuthorizedContext, GateRejection> {
        let result = match self.price_for(operation) {
            Ok(entry) => self.process(entry, proof).await,
            Err(e) => Err(e),
        };
        if let Err(rejection) = &result {
            self.usage.record_rejection(rejection.code());
        }
        result
    }

    async fn process(
        &self,
        entry: &PriceEntry,
        proof: PaymentProof,
    ) -> Result<AuthorizedContext, GateRejection> {
        self.check_policy(entry, &proof, Utc::now().timestamp().max(0) as u64)
            .map_err(GateRejection::PolicyViolation)?;

        let nonce = proof.nonce();
        let claimant = proof.payer().to_lowercase_hex();
        match self.nonces.claim(nonce, &claimant).await {
            Ok(true) => {}
            Ok(false) => {
                log::warn!(
                    "[Gate] Replay attempt: nonce {} from {} for '{}'",
                    proof.nonce_hex(),
                    claimant,
                    entry.operation
                );
                return Err(GateRejection::ReplayDetected {
                    nonce: proof.nonce_hex(),
                    detected_by: ReplaySource::Ledger,
                });
            }
            Err(e) => return Err(GateRejection::LedgerUnavailable(e.to_string())),
        }

        match self.verify_and_settle(&proof).await {
            Ok(receipt) => {
                if let Err(e) = self.nonces.confirm(nonce).await {
                    // Funds moved and the contract now refuses the nonce
                    log::error!(
                        "[Gate] Settled {} but failed to confirm nonce {}: {}",
                        receipt.tx_hash,
                        proof.nonce_hex(),
                        e
                    );
                }
                self.usage.record_payment(proof.payer(), proof.amount());
                log::info!(
                    "[Gate] '{}' paid {} by {} (tx {})",
                    entry.operation,
                    proof.amount().format(self.config.token_decimals, &self.config.token_symbol),
                    proof.payer(),
                    receipt.tx_hash
                );
                Ok(AuthorizedContext {
                    operation: entry.operation.clone(),
                    price: entry.price,
                    proof,
                    receipt,
                })
            }
            Err(Outcome::KeepClaimed(rejection)) => Err(rejection),
            Err(Outcome::ConfirmAndReject(rejection)) => {
                if let Err(e) = self.nonces.confirm(nonce).await {
                    log::error!("[Gate] Failed to confirm on-chain-used nonce {}: {}", proof.nonce_hex(), e);
                }
                Err(rejection)
            }
            Err(Outcome::Release(rejection)) => {
                if let Err(e) = self.nonces.release(nonce).await {
                    log::error!("[Gate] Failed to release nonce {}: {}", proof.nonce_hex(), e);
                }
                Err(rejection)
            }
        }
    }

    /// Steps 4-5. The error says what to do with the claim.
    async fn verify_and_settle(&self, proof: &PaymentProof) -> Result<SettlementReceipt, Outcome> {
        if !self.verifier.verify(proof) {
            let recovered = self.verifier.recover(proof).ok();
            log::warn!(
                "[Gate] Signature for nonce {} does not recover to {}",
                proof.nonce_hex(),
                proof.payer()
            );
            return Err(Outcome::Release(GateRejection::SignatureInvalid {
                claimed: proof.payer(),
                recovered,
            }));
        }

        match self.settlement.verify_on_chain(proof).await {
            Ok(OnChainVerdict::Valid) => {}
            Ok(OnChainVerdict::NonceUsed) => {
                log::warn!("[Gate] Nonce {} already used on-chain", proof.nonce_hex());
                return Err(Outcome::ConfirmAndReject(GateRejection::ReplayDetected {
                    nonce: proof.nonce_hex(),
                    detected_by: ReplaySource::OnChain,
                }));
            }
            Ok(OnChainVerdict::Invalid) => {
                return Err(Outcome::Release(GateRejection::SettlementFailed {
                    reason: "settlement contract rejected the proof".to_string(),
                    in_doubt: false,
                    tx_hash: None,
                }));
            }
            Err(e) => {
                return Err(Outcome::Release(GateRejection::SettlementFailed {
                    reason: format!("on-chain verification unavailable: {}", e),
                    in_doubt: false,
                    tx_hash: None,
                }));
            }
        }

        self.settlement.settle(proof).await.map_err(|e| {
            let rejection = GateRejection::SettlementFailed {
                reason: e.to_string(),
                in_doubt: e.is_in_doubt(),
                tx_hash: e.tx_hash().map(str::to_string),
            };
            if e.is_in_doubt() {
                log::warn!(
                    "[Gate] Settlement for nonce {} is in doubt ({}); nonce stays claimed",
                    proof.nonce_hex(),
                    e
                );
                Outcome::KeepClaimed(rejection)
            } else {
                log::warn!("[Gate] Settlement for nonce {} failed: {}", proof.nonce_hex(), e);
                Outcome::Release(rejection)
            }
        })
    }

    pub(crate) fn check_policy(
        &self,
        entry: &PriceEntry,
        proof: &PaymentProof,
        now: u64,
    ) -> Result<(), PolicyViolation> {
        if proof.amount() < entry.price {
            return Err(PolicyViolation::AmountTooLow {
                expected: entry.price,
                received: proof.amount(),
            });
        }
        if proof.token() != self.config.token {
            return Err(PolicyViolation::WrongToken {
                expected: self.config.token,
                received: proof.token(),
            });
        }
        if proof.recipient() != entry.recipient {
            return Err(PolicyViolation::WrongRecipient {
                expected: entry.recipient,
                received: proof.recipient(),
            });
        }
        if proof.payer().is_zero() {
            return Err(PolicyViolation::ZeroPayer);
        }

        let timestamp = proof.timestamp();
        let tolerance = self.config.future_tolerance.as_secs();
        if timestamp > now.saturating_add(tolerance) {
            return Err(PolicyViolation::FromFuture {
                ahead_secs: timestamp - now,
                tolerance_secs: tolerance,
            });
        }
        let window = self.config.freshness_window.as_secs();
        let age = now.saturating_sub(timestamp);
        if age > window {
            return Err(PolicyViolation::Expired {
                age_secs: age,
                window_secs: window,
            });
        }
        Ok(())
    }

    /// Decide a nonce left claimed by an unconfirmed settlement: confirm it if
    /// the contract has marked it used, otherwise release it for retry.
    /// A nonce with no ledger record (evicted) is answered from the chain.
    pub async fn resolve_in_doubt(&self, nonce: H256) -> Result<NonceState, GateRejection> {
        let record = self
            .nonces
            .get(nonce)
            .await
            .map_err(|e| GateRejection::LedgerUnavailable(e.to_string()))?;
        if let Some(record) = &record {
            if record.state != NonceState::Claimed {
                return Ok(record.state);
            }
        }

        let used = self
            .settlement
            .is_nonce_used(nonce)
            .await
            .map_err(|e| GateRejection::SettlementFailed {
                reason: format!("cannot resolve in-doubt nonce: {}", e),
                in_doubt: true,
                tx_hash: None,
            })?;

        if record.is_none() {
            return Ok(if used {
                NonceState::Confirmed
            } else {
                NonceState::Unclaimed
            });
        }

        if used {
            self.nonces
                .confirm(nonce)
                .await
                .map_err(|e| GateRejection::LedgerUnavailable(e.to_string()))?;
            log::info!("[Gate] In-doubt nonce {:?} landed on-chain, confirmed", nonce);
            Ok(NonceState::Confirmed)
        } else {
            self.nonces
                .release(nonce)
                .await
                .map_err(|e| GateRejection::LedgerUnavailable(e.to_string()))?;
            log::info!("[Gate] In-doubt nonce {:?} not used on-chain, released", nonce);
            Ok(NonceState::Unclaimed)
        }
    }

    /// Resolve every payment claim untouched for longer than `age`.
    /// Returns how many were confirmed or released.
    pub async fn resolve_stale_claims(&self, age: Duration) -> Result<usize, GateRejection> {
        let stale = self
            .nonces
            .list_claimed_before(age)
            .await
            .map_err(|e| GateRejection::LedgerUnavailable(e.to_string()))?;

        let mut resolved = 0;
        for record in stale {
            if record.claimant.starts_with(AUTH_CLAIMANT_PREFIX) {
                continue;
            }
            match self.resolve_in_doubt(record.nonce).await {
                Ok(NonceState::Claimed) => {}
                Ok(_) => resolved += 1,
                Err(e) => log::warn!(
                    "[Gate] Could not resolve in-doubt nonce {:?} from {}: {}",
                    record.nonce,
                    record.claimant,
                    e
                ),
            }
        }
        Ok(resolved)
    }
}

/// Periodically resolve claims left behind by settlements that timed out
/// after broadcast. `age` must exceed the longest a live `authorize` can
/// hold a claim, or in-progress payments would be released under it.
pub fn spawn_in_doubt_resolver(
    gate: Arc<PaymentGate>,
    interval: Duration,
    age: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        log::info!(
            "[Gate] In-doubt resolver started (every {:?}, claims older than {:?})",
            interval,
            age
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match gate.resolve_stale_claims(age).await {
                Ok(0) => {}
                Ok(n) => log::info!("[Gate] Resolved {} in-doubt settlements", n),
                Err(e) => log::error!("[Gate] In-doubt resolution failed: {}", e),
            }
        }
    })
}

/// Failure after the claim, tagged with what happens to the nonce
enum Outcome {
    Release(GateRejection),
    ConfirmAndReject(GateRejection),
    KeepClaimed(GateRejection),
}

#[async_trait]
impl ProofSink for PaymentGate {
    fn quote(&self, operation: &str) -> Result<PaymentQuote, GateRejection> {
        let entry = self.price_for(operation)?;
        Ok(PaymentQuote {
            operation: entry.operation.clone(),
            amount: entry.price,
            token: self.config.token,
            recipient: entry.recipient,
        })
    }

    async fn submit(
        &self,
        operation: &str,
        proof: PaymentProof,
    ) -> Result<AuthorizedContext, GateRejection> {
        self.authorize_proof(operation, proof).await
    }

    async fn resolve(&self, nonce: H256) -> Result<NonceState, GateRejection> {
        self.resolve_in_doubt(nonce).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonce_ledger::MemoryNonceStore;
    use crate::payment::{generate_nonce, sign_payment};
    use crate::sandbox::{SandboxChain, SandboxFailure};
    use ethers::signers::{LocalWallet, Signer};
    use paygate_types::RejectionCode;
    use std::str::FromStr;

    const PAYER_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const OTHER_KEY: &str = "59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
    const RECIPIENT: &str = "0x70997970c51812dc3a010c7d01b50e0d17dc79c8";
    const USDC: &str = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913";
    const CONTRACT: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";
    const PRICE: u64 = 10_000; // 0.01 with 6 decimals

    struct Harness {
        gate: PaymentGate,
        chain: Arc<SandboxChain>,
        nonces: Arc<MemoryNonceStore>,
        wallet: LocalWallet,
    }

    fn harness() -> Harness {
        let chain = Arc::new(SandboxChain::new(
            "sandbox",
            EthAddress::parse(CONTRACT).unwrap(),
        ));
        let nonces = Arc::new(MemoryNonceStore::new());
        let pricing = PricingTable::new().with_entry(PriceEntry {
            operation: "weather.current".to_string(),
            price: TokenAmount::from(PRICE),
            recipient: EthAddress::parse(RECIPIENT).unwrap(),
            description: None,
        });
        let config = GateConfig {
            network: "sandbox".to_string(),
            token: EthAddress::parse(USDC).unwrap(),
            token_decimals: 6,
            token_symbol: "USDC".to_string(),
            freshness_window: Duration::from_secs(300),
            future_tolerance: Duration::from_secs(30),
        };
        let gate = PaymentGate::new(config, pricing, nonces.clone(), chain.clone());

        let wallet = LocalWallet::from_str(PAYER_KEY).unwrap();
        let payer = EthAddress::from(wallet.address());
        chain.mint_token(payer, TokenAmount::from(1_000_000));
        chain.approve(payer, chain.contract(), TokenAmount::from(1_000_000));

        Harness {
            gate,
            chain,
            nonces,
            wallet,
        }
    }

    fn now() -> u64 {
        Utc::now().timestamp() as u64
    }

    fn proof_with(wallet: &LocalWallet, amount: u64, recipient: &str, timestamp: u64) -> PaymentProof {
        sign_payment(
            wallet,
            generate_nonce().unwrap(),
            TokenAmount::from(amount),
            EthAddress::parse(USDC).unwrap(),
            EthAddress::parse(recipient).unwrap(),
            timestamp,
        )
        .unwrap()
    }

    fn header(proof: &PaymentProof) -> String {
        proof.to_payload().to_base64().unwrap()
    }

    async fn authorize(gate: &PaymentGate, header: Option<&str>) -> Result<AuthorizedContext, GateRejection> {
        gate.authorize(&PaymentRequest {
            operation: "weather.current",
            resource: "/api/paid/weather.current",
            header,
        })
        .await
    }

    #[tokio::test]
    async fn test_pays_once_then_replay_detected() {
        let h = harness();
        let proof = proof_with(&h.wallet, PRICE, RECIPIENT, now());
        let value = header(&proof);

        let ctx = authorize(&h.gate, Some(&value)).await.unwrap();
        assert_eq!(ctx.proof.nonce(), proof.nonce());
        assert_eq!(ctx.receipt.amount, TokenAmount::from(PRICE));
        assert_eq!(
            h.nonces.get(proof.nonce()).await.unwrap().unwrap().state,
            NonceState::Confirmed
        );

        let err = authorize(&h.gate, Some(&value)).await.unwrap_err();
        assert!(matches!(
            err,
            GateRejection::ReplayDetected {
                detected_by: ReplaySource::Ledger,
                ..
            }
        ));
        assert_eq!(h.chain.settle_attempts(), 1);

        let usage = h.gate.usage().payer(&proof.payer()).unwrap();
        assert_eq!(usage.payments, 1);
        assert_eq!(h.gate.usage().rejections(RejectionCode::ReplayDetected), 1);
    }

    #[tokio::test]
    async fn test_missing_header_yields_challenge() {
        let h = harness();
        let err = authorize(&h.gate, None).await.unwrap_err();
        let challenge = err.challenge().unwrap();
        assert_eq!(challenge.accepts[0].max_amount_required, "10000");
        assert_eq!(err.code(), RejectionCode::ChallengeRequired);
        assert!(h.nonces.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_header_carries_challenge() {
        let h = harness();
        let err = authorize(&h.gate, Some("{\"nonce\": 1}")).await.unwrap_err();
        assert!(matches!(err, GateRejection::MalformedProof { .. }));
        assert!(err.challenge().is_some());
        assert!(h.nonces.is_empty());
    }

    #[tokio::test]
    async fn test_underpayment_never_reaches_ledger() {
        let h = harness();
        let proof = proof_with(&h.wallet, PRICE - 1, RECIPIENT, now());
        let err = authorize(&h.gate, Some(&header(&proof))).await.unwrap_err();

        match err {
            GateRejection::PolicyViolation(PolicyViolation::AmountTooLow { expected, received }) => {
                assert_eq!(expected, TokenAmount::from(PRICE));
                assert_eq!(received, TokenAmount::from(PRICE - 1));
            }
            other => panic!("unexpected rejection: {:?}", other),
        }
        assert!(h.nonces.is_empty());
        assert_eq!(h.chain.settle_attempts(), 0);
    }

    #[tokio::test]
    async fn test_overpayment_accepted() {
        let h = harness();
        let proof = proof_with(&h.wallet, PRICE * 2, RECIPIENT, now());
        assert!(authorize(&h.gate, Some(&header(&proof))).await.is_ok());
    }

    #[tokio::test]
    async fn test_wrong_recipient_and_stale_proofs_rejected() {
        let h = harness();
        let wrong = proof_with(&h.wallet, PRICE, "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266", now());
        assert!(matches!(
            authorize(&h.gate, Some(&header(&wrong))).await.unwrap_err(),
            GateRejection::PolicyViolation(PolicyViolation::WrongRecipient { .. })
        ));

        let stale = proof_with(&h.wallet, PRICE, RECIPIENT, now() - 301);
        assert!(matches!(
            authorize(&h.gate, Some(&header(&stale))).await.unwrap_err(),
            GateRejection::PolicyViolation(PolicyViolation::Expired { .. })
        ));

        let future = proof_with(&h.wallet, PRICE, RECIPIENT, now() + 600);
        assert!(matches!(
            authorize(&h.gate, Some(&header(&future))).await.unwrap_err(),
            GateRejection::PolicyViolation(PolicyViolation::FromFuture { .. })
        ));
        assert!(h.nonces.is_empty());
    }

    #[tokio::test]
    async fn test_bad_signature_leaves_nonce_claimable() {
        let h = harness();
        let other = LocalWallet::from_str(OTHER_KEY).unwrap();
        let signed_by_other = proof_with(&other, PRICE, RECIPIENT, now());
        let mut payload = signed_by_other.to_payload();
        payload.payer = format!("{:?}", h.wallet.address());
        let forged = PaymentProof::from_payload(&payload).unwrap();

        let err = authorize(&h.gate, Some(&payload.to_base64().unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, GateRejection::SignatureInvalid { .. }));
        assert_eq!(h.chain.settle_attempts(), 0);
        assert_eq!(h.chain.verify_calls(), 0);
        assert!(h.nonces.claim(forged.nonce(), "anyone").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_settlement_releases_nonce() {
        let h = harness();
        h.chain.fail_next_settlement(SandboxFailure::Revert);
        let proof = proof_with(&h.wallet, PRICE, RECIPIENT, now());
        let value = header(&proof);

        let err = authorize(&h.gate, Some(&value)).await.unwrap_err();
        match &err {
            GateRejection::SettlementFailed { in_doubt, tx_hash, .. } => {
                assert!(!in_doubt);
                assert!(tx_hash.is_some());
            }
            other => panic!("unexpected rejection: {:?}", other),
        }
        assert_eq!(
            h.nonces.get(proof.nonce()).await.unwrap().unwrap().state,
            NonceState::Unclaimed
        );

        // same proof succeeds on retry
        assert!(authorize(&h.gate, Some(&value)).await.is_ok());
    }

    #[tokio::test]
    async fn test_in_doubt_settlement_keeps_claim_until_resolved() {
        let h = harness();
        h.chain
            .fail_next_settlement(SandboxFailure::TimeoutAfterBroadcast);
        let proof = proof_with(&h.wallet, PRICE, RECIPIENT, now());
        let value = header(&proof);

        let err = authorize(&h.gate, Some(&value)).await.unwrap_err();
        assert!(matches!(err, GateRejection::SettlementFailed { in_doubt: true, .. }));
        assert_eq!(
            h.nonces.get(proof.nonce()).await.unwrap().unwrap().state,
            NonceState::Claimed
        );

        // resubmitting must not re-broadcast
        assert!(matches!(
            authorize(&h.gate, Some(&value)).await.unwrap_err(),
            GateRejection::ReplayDetected { .. }
        ));
        assert_eq!(h.chain.settle_attempts(), 1);

        let state = h.gate.resolve_in_doubt(proof.nonce()).await.unwrap();
        assert_eq!(state, NonceState::Confirmed);
    }

    #[tokio::test]
    async fn test_timeout_before_broadcast_releases() {
        let h = harness();
        h.chain
            .fail_next_settlement(SandboxFailure::TimeoutBeforeBroadcast);
        let proof = proof_with(&h.wallet, PRICE, RECIPIENT, now());

        let err = authorize(&h.gate, Some(&header(&proof))).await.unwrap_err();
        assert!(matches!(err, GateRejection::SettlementFailed { in_doubt: false, .. }));
        assert_eq!(
            h.gate.resolve_in_doubt(proof.nonce()).await.unwrap(),
            NonceState::Unclaimed
        );
    }

    #[tokio::test]
    async fn test_on_chain_used_nonce_is_replay() {
        let h = harness();
        let proof = proof_with(&h.wallet, PRICE, RECIPIENT, now());
        // settled elsewhere, unknown to this ledger
        h.chain.settle(&proof).await.unwrap();

        let err = authorize(&h.gate, Some(&header(&proof))).await.unwrap_err();
        assert!(matches!(
            err,
            GateRejection::ReplayDetected {
                detected_by: ReplaySource::OnChain,
                ..
            }
        ));
        assert_eq!(
            h.nonces.get(proof.nonce()).await.unwrap().unwrap().state,
            NonceState::Confirmed
        );
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let h = harness();
        let err = h
            .gate
            .authorize(&PaymentRequest {
                operation: "nope",
                resource: "/api/paid/nope",
                header: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn test_proof_sink_quote_and_submit() {
        let h = harness();
        let quote = h.gate.quote("weather.current").unwrap();
        assert_eq!(quote.amount, TokenAmount::from(PRICE));
        assert_eq!(quote.recipient, EthAddress::parse(RECIPIENT).unwrap());

        let proof = proof_with(&h.wallet, PRICE, RECIPIENT, now());
        let ctx = h.gate.submit("weather.current", proof).await.unwrap();
        let response = ctx.settlement_response("sandbox");
        assert!(response.success);
        assert_eq!(response.transaction, ctx.receipt.tx_hash);
    }

    #[tokio::test]
    async fn test_stale_claims_resolved_in_background() {
        let h = harness();
        h.chain
            .fail_next_settlement(SandboxFailure::TimeoutAfterBroadcast);
        let landed = proof_with(&h.wallet, PRICE, RECIPIENT, now());
        assert!(authorize(&h.gate, Some(&header(&landed))).await.is_err());

        // claimed by a process that died before broadcasting
        let abandoned = generate_nonce().unwrap();
        h.nonces.claim(abandoned, "0xpayer").await.unwrap();
        let auth = generate_nonce().unwrap();
        let auth_claimant = format!("{}0xowner", AUTH_CLAIMANT_PREFIX);
        h.nonces.claim(auth, &auth_claimant).await.unwrap();

        // too young to touch
        assert_eq!(h.gate.resolve_stale_claims(Duration::from_secs(60)).await.unwrap(), 0);

        let nonces = h.nonces.clone();
        let handle = spawn_in_doubt_resolver(
            Arc::new(h.gate),
            Duration::from_millis(10),
            Duration::from_millis(1),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.abort();

        let state = |n: H256| {
            let nonces = nonces.clone();
            async move { nonces.get(n).await.unwrap().unwrap().state }
        };
        assert_eq!(state(landed.nonce()).await, NonceState::Confirmed);
        assert_eq!(state(abandoned).await, NonceState::Unclaimed);
        assert_eq!(state(auth).await, NonceState::Claimed);
        assert_eq!(h.chain.settle_attempts(), 1);
    }

    #[tokio::test]
    async fn test_resolve_evicted_nonce_asks_the_chain() {
        let h = harness();
        let proof = proof_with(&h.wallet, PRICE, RECIPIENT, now());
        h.chain.settle(&proof).await.unwrap();

        assert_eq!(
            h.gate.resolve_in_doubt(proof.nonce()).await.unwrap(),
            NonceState::Confirmed
        );
        assert_eq!(
            h.gate.resolve_in_doubt(generate_nonce().unwrap()).await.unwrap(),
            NonceState::Unclaimed
        );
        assert!(h.nonces.is_empty());
    }
}
