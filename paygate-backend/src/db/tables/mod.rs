//! Table-level operations, one file per table, each adding methods to
//! [`Database`](super::Database)

pub mod payment_nonces;
pub mod session_wallets;
