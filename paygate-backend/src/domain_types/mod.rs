//! Domain types for paygate-backend
//!
//! Strictly-parsed chain values shared by the gate and the session manager.

pub mod address;
pub mod amount;

pub use address::EthAddress;
pub use amount::TokenAmount;
