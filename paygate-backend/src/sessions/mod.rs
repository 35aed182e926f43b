//! Session wallets: server-custodied keys that spend against a cap
//!
//! A user funds a freshly generated address, the server signs payments from
//! it on their behalf until the cap is reached, and on close everything left
//! goes back to the owner.

mod backoff;
mod manager;
mod refund;
mod store;
mod types;
mod vault;

pub use backoff::{Backoff, RetryPolicy};
pub use manager::{SessionConfig, SessionWalletManager};
pub use refund::{DEFAULT_TRANSFER_POLICIES, NativeRefund, RefundContext, TokenRefund, TransferPolicy};
pub use store::{MemorySessionStore, SessionStore};
pub use types::{InDoubtPayment, RefundPath, RefundRecord, SessionRecord, SessionStatus};
pub use vault::{EncryptedKey, IV_SIZE, KeyVault, UnlockedKey, VaultError};
