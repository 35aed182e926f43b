//! Payment verification pipeline

mod challenge;
mod gate;
mod pricing;
mod proof;
mod usage;
mod verifier;

pub use challenge::build_challenge;
pub use gate::{
    AuthorizedContext, GateConfig, PaymentGate, PaymentQuote, PaymentRequest, ProofSink,
    spawn_in_doubt_resolver,
};
pub use pricing::{PriceEntry, PricingTable};
pub use proof::PaymentProof;
pub use usage::{PayerUsage, RejectionCount, UsageSnapshot, UsageTracker};
pub use verifier::{SignatureVerifier, canonical_digest, canonical_message, generate_nonce, sign_payment};
