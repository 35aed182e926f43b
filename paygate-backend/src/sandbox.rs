//! Deterministic in-process chain
//!
//! Stands in for both the settlement contract and the token / native
//! currency ledgers when `PAYGATE_MODE=sandbox`, and in tests. Settlement
//! enforces what the contract enforces (unused nonce, valid signature,
//! balance and allowance) and wallet transactions pay gas from the native
//! balance, so refund logic sees realistic fee pressure.
//!
//! Failures can be injected per call: settlement outcomes, transient
//! transport errors on wallet calls, wallet transactions that land without
//! a confirmation, and frozen addresses whose tokens cannot move.

use async_trait::async_trait;
use chrono::Utc;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H256, U256};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::chain::{ChainError, NATIVE_TRANSFER_GAS, WalletChain};
use crate::domain_types::{EthAddress, TokenAmount};
use crate::payment::{PaymentProof, SignatureVerifier};
use crate::settlement::{SettlementClient, SettlementError, SettlementReceipt};

/// Gas charged for an ERC20 approve / transfer sent from a wallet
pub const TOKEN_TX_GAS: u64 = 50_000;

/// Injected outcome for the next `settle` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxFailure {
    /// Mined and reverted, nothing moves
    Revert,
    /// Node unreachable, nothing broadcast
    Provider,
    /// Send timed out, nothing broadcast
    TimeoutBeforeBroadcast,
    /// Transfer lands but confirmation is never observed
    TimeoutAfterBroadcast,
    /// Broadcast, then dropped from the mempool without being mined
    DroppedAfterBroadcast,
}

struct SandboxState {
    tokens: HashMap<Address, U256>,
    native: HashMap<Address, U256>,
    allowances: HashMap<(Address, Address), U256>,
    used_nonces: HashSet<H256>,
    frozen: HashSet<Address>,
    pending_failures: VecDeque<SandboxFailure>,
    transient_wallet_failures: u32,
    /// Wallet transactions that take effect but report a timeout
    stalled_wallet_txs: u32,
    wallet_txs: u64,
    settle_attempts: u64,
    verify_calls: u64,
    gas_price: U256,
    /// Extra gas a native transfer burns beyond 21000 (e.g. contract recipients)
    native_transfer_overhead: u64,
    block: u64,
    tx_counter: u64,
}

impl SandboxState {
    fn next_tx_hash(&mut self) -> String {
        self.tx_counter += 1;
        self.block += 1;
        format!("{:?}", H256::from_low_u64_be(self.tx_counter))
    }

    /// Count a mined wallet transaction and report it, or its timeout
    fn finish_wallet_tx(&mut self, tx_hash: String) -> Result<String, ChainError> {
        self.wallet_txs += 1;
        if self.stalled_wallet_txs > 0 {
            self.stalled_wallet_txs -= 1;
            return Err(ChainError::Timeout {
                tx_hash: Some(tx_hash),
            });
        }
        Ok(tx_hash)
    }

    fn token(&self, addr: &Address) -> U256 {
        self.tokens.get(addr).copied().unwrap_or_default()
    }

    fn native(&self, addr: &Address) -> U256 {
        self.native.get(addr).copied().unwrap_or_default()
    }

    fn charge_gas(&mut self, from: Address, gas: u64) -> Result<(), ChainError> {
        let fee = U256::from(gas) * self.gas_price;
        let balance = self.native(&from);
        if balance < fee {
            return Err(ChainError::InsufficientFunds(format!(
                "{:?} has {} wei, needs {} for gas",
                from, balance, fee
            )));
        }
        self.native.insert(from, balance - fee);
        Ok(())
    }

    fn move_tokens(&mut self, from: Address, to: Address, amount: U256) -> Result<(), String> {
        if self.frozen.contains(&from) {
            return Err(format!("token transfers from {:?} are frozen", from));
        }
        let balance = self.token(&from);
        if balance < amount {
            return Err("ERC20: transfer amount exceeds balance".to_string());
        }
        self.tokens.insert(from, balance - amount);
        let to_balance = self.token(&to);
        self.tokens.insert(to, to_balance + amount);
        Ok(())
    }
}

pub struct SandboxChain {
    network: String,
    contract: EthAddress,
    verifier: SignatureVerifier,
    state: Mutex<SandboxState>,
}

impl SandboxChain {
    pub fn new(network: &str, contract: EthAddress) -> Self {
        Self {
            network: network.to_string(),
            contract,
            verifier: SignatureVerifier::new(),
            state: Mutex::new(SandboxState {
                tokens: HashMap::new(),
                native: HashMap::new(),
                allowances: HashMap::new(),
                used_nonces: HashSet::new(),
                frozen: HashSet::new(),
                pending_failures: VecDeque::new(),
                transient_wallet_failures: 0,
                stalled_wallet_txs: 0,
                wallet_txs: 0,
                settle_attempts: 0,
                verify_calls: 0,
                gas_price: U256::from(1_000_000_000u64),
                native_transfer_overhead: 0,
                block: 0,
                tx_counter: 0,
            }),
        }
    }

    /// Address of the simulated settlement contract (the allowance spender)
    pub fn contract(&self) -> EthAddress {
        self.contract
    }

    pub fn mint_token(&self, to: EthAddress, amount: TokenAmount) {
        let mut state = self.state.lock();
        let balance = state.token(&to.0);
        state.tokens.insert(to.0, balance + amount.0);
    }

    pub fn fund_native(&self, to: EthAddress, wei: U256) {
        let mut state = self.state.lock();
        let balance = state.native(&to.0);
        state.native.insert(to.0, balance + wei);
    }

    /// Set an allowance directly, without a transaction
    pub fn approve(&self, owner: EthAddress, spender: EthAddress, amount: TokenAmount) {
        self.state
            .lock()
            .allowances
            .insert((owner.0, spender.0), amount.0);
    }

    pub fn token_balance_of(&self, owner: EthAddress) -> TokenAmount {
        TokenAmount(self.state.lock().token(&owner.0))
    }

    pub fn native_balance_of(&self, owner: EthAddress) -> U256 {
        self.state.lock().native(&owner.0)
    }

    pub fn fail_next_settlement(&self, failure: SandboxFailure) {
        self.state.lock().pending_failures.push_back(failure);
    }

    /// The next `n` wallet calls fail with a transport error
    pub fn fail_next_wallet_calls(&self, n: u32) {
        self.state.lock().transient_wallet_failures = n;
    }

    /// The next `n` wallet transactions land but never report a receipt
    pub fn stall_next_wallet_txs(&self, n: u32) {
        self.state.lock().stalled_wallet_txs = n;
    }

    /// Wallet transactions mined so far, including reverted ones
    pub fn wallet_txs(&self) -> u64 {
        self.state.lock().wallet_txs
    }

    pub fn freeze(&self, addr: EthAddress) {
        self.state.lock().frozen.insert(addr.0);
    }

    pub fn unfreeze(&self, addr: EthAddress) {
        self.state.lock().frozen.remove(&addr.0);
    }

    pub fn set_gas_price(&self, wei: U256) {
        self.state.lock().gas_price = wei;
    }

    pub fn set_native_transfer_overhead(&self, gas: u64) {
        self.state.lock().native_transfer_overhead = gas;
    }

    pub fn settle_attempts(&self) -> u64 {
        self.state.lock().settle_attempts
    }

    pub fn verify_calls(&self) -> u64 {
        self.state.lock().verify_calls
    }

    pub fn nonce_used(&self, nonce: H256) -> bool {
        self.state.lock().used_nonces.contains(&nonce)
    }

    fn take_transient_failure(&self) -> Result<(), ChainError> {
        let mut state = self.state.lock();
        if state.transient_wallet_failures > 0 {
            state.transient_wallet_failures -= 1;
            return Err(ChainError::Transport(
                "sandbox: injected transport failure".to_string(),
            ));
        }
        Ok(())
    }

    /// What the contract's settlePayment does, atomically
    fn apply_settlement(&self, state: &mut SandboxState, proof: &PaymentProof) -> Result<(), String> {
        if state.used_nonces.contains(&proof.nonce()) {
            return Err("nonce already used".to_string());
        }
        if !self.verifier.verify(proof) {
            return Err("invalid signature".to_string());
        }

        let payer = proof.payer().0;
        let amount = proof.amount().0;
        let key = (payer, self.contract.0);
        let allowance = state.allowances.get(&key).copied().unwrap_or_default();
        if allowance < amount {
            return Err("ERC20: insufficient allowance".to_string());
        }

        state.move_tokens(payer, proof.recipient().0, amount)?;
        if allowance != U256::MAX {
            state.allowances.insert(key, allowance - amount);
        }
        state.used_nonces.insert(proof.nonce());
        Ok(())
    }
}

#[async_trait]
impl SettlementClient for SandboxChain {
    async fn verify_payment(&self, proof: &PaymentProof) -> Result<bool, SettlementError> {
        let mut state = self.state.lock();
        state.verify_calls += 1;
        Ok(!state.used_nonces.contains(&proof.nonce()) && self.verifier.verify(proof))
    }

    async fn is_nonce_used(&self, nonce: H256) -> Result<bool, SettlementError> {
        Ok(self.state.lock().used_nonces.contains(&nonce))
    }

    async fn settle(&self, proof: &PaymentProof) -> Result<SettlementReceipt, SettlementError> {
        let mut state = self.state.lock();
        state.settle_attempts += 1;

        match state.pending_failures.pop_front() {
            Some(SandboxFailure::Provider) => {
                return Err(SettlementError::Provider(
                    "sandbox: node unreachable".to_string(),
                ));
            }
            Some(SandboxFailure::TimeoutBeforeBroadcast) => {
                return Err(SettlementError::Timeout {
                    timeout_secs: 0,
                    tx_hash: None,
                });
            }
            Some(SandboxFailure::Revert) => {
                let tx_hash = state.next_tx_hash();
                return Err(SettlementError::Reverted {
                    reason: "sandbox: injected revert".to_string(),
                    tx_hash,
                });
            }
            Some(SandboxFailure::TimeoutAfterBroadcast) => {
                let tx_hash = state.next_tx_hash();
                if let Err(reason) = self.apply_settlement(&mut state, proof) {
                    log::debug!("[Settlement] sandbox in-flight settlement failed: {}", reason);
                }
                return Err(SettlementError::Timeout {
                    timeout_secs: 0,
                    tx_hash: Some(tx_hash),
                });
            }
            Some(SandboxFailure::DroppedAfterBroadcast) => {
                let tx_hash = state.next_tx_hash();
                return Err(SettlementError::Timeout {
                    timeout_secs: 0,
                    tx_hash: Some(tx_hash),
                });
            }
            None => {}
        }

        let tx_hash = state.next_tx_hash();
        if let Err(reason) = self.apply_settlement(&mut state, proof) {
            return Err(SettlementError::Reverted { reason, tx_hash });
        }

        Ok(SettlementReceipt {
            tx_hash,
            block_number: Some(state.block),
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
        "sandbox"
    }
}

#[async_trait]
impl WalletChain for SandboxChain {
    async fn token_balance(&self, owner: EthAddress) -> Result<TokenAmount, ChainError> {
        self.take_transient_failure()?;
        Ok(self.token_balance_of(owner))
    }

    async fn native_balance(&self, owner: EthAddress) -> Result<U256, ChainError> {
        self.take_transient_failure()?;
        Ok(self.native_balance_of(owner))
    }

    async fn gas_price(&self) -> Result<U256, ChainError> {
        self.take_transient_failure()?;
        Ok(self.state.lock().gas_price)
    }

    async fn token_allowance(
        &self,
        owner: EthAddress,
        spender: EthAddress,
    ) -> Result<TokenAmount, ChainError> {
        self.take_transient_failure()?;
        let state = self.state.lock();
        Ok(TokenAmount(
            state
                .allowances
                .get(&(owner.0, spender.0))
                .copied()
                .unwrap_or_default(),
        ))
    }

    async fn approve_token(
        &self,
        wallet: &LocalWallet,
        spender: EthAddress,
        amount: TokenAmount,
    ) -> Result<String, ChainError> {
        self.take_transient_failure()?;
        let from = wallet.address();
        let mut state = self.state.lock();
        state.charge_gas(from, TOKEN_TX_GAS)?;
        state.allowances.insert((from, spender.0), amount.0);
        let tx_hash = state.next_tx_hash();
        state.finish_wallet_tx(tx_hash)
    }

    async fn transfer_token(
        &self,
        wallet: &LocalWallet,
        to: EthAddress,
        amount: TokenAmount,
    ) -> Result<String, ChainError> {
        self.take_transient_failure()?;
        let from = wallet.address();
        let mut state = self.state.lock();
        state.charge_gas(from, TOKEN_TX_GAS)?;
        let tx_hash = state.next_tx_hash();
        if let Err(reason) = state.move_tokens(from, to.0, amount.0) {
            state.wallet_txs += 1;
            return Err(ChainError::Reverted { tx_hash, reason });
        }
        state.finish_wallet_tx(tx_hash)
    }

    async fn transfer_native(
        &self,
        wallet: &LocalWallet,
        to: EthAddress,
        value: U256,
        gas_limit: U256,
        gas_price: U256,
    ) -> Result<String, ChainError> {
        self.take_transient_failure()?;
        let from = wallet.address();
        let mut state = self.state.lock();

        if gas_limit < U256::from(NATIVE_TRANSFER_GAS) {
            return Err(ChainError::Reverted {
                tx_hash: String::new(),
                reason: "intrinsic gas too low".to_string(),
            });
        }
        if gas_price < state.gas_price {
            return Err(ChainError::Reverted {
                tx_hash: String::new(),
                reason: "max fee per gas less than block base fee".to_string(),
            });
        }

        let balance = state.native(&from);
        let upfront = value + gas_limit * gas_price;
        if upfront > balance {
            return Err(ChainError::InsufficientFunds(format!(
                "{:?} has {} wei, transfer needs {}",
                from, balance, upfront
            )));
        }

        let gas_used = U256::from(NATIVE_TRANSFER_GAS + state.native_transfer_overhead);
        let tx_hash = state.next_tx_hash();
        if gas_used > gas_limit {
            state.wallet_txs += 1;
            // out of gas: the whole limit is burned, value stays
            state.native.insert(from, balance - gas_limit * gas_price);
            return Err(ChainError::Reverted {
                tx_hash,
                reason: "out of gas".to_string(),
            });
        }

        state
            .native
            .insert(from, balance - value - gas_used * gas_price);
        let to_balance = state.native(&to.0);
        state.native.insert(to.0, to_balance + value);
        state.finish_wallet_tx(tx_hash)
    }
}
