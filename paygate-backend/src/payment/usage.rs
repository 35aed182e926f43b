//! Per-payer usage counters
//!
//! Observability only: nothing in the authorization path reads these.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use paygate_types::RejectionCode;
use serde::Serialize;

use crate::domain_types::{EthAddress, TokenAmount};

#[derive(Debug, Clone, Serialize)]
pub struct PayerUsage {
    pub payer: EthAddress,
    pub payments: u64,
    pub volume: TokenAmount,
    pub last_payment_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectionCount {
    pub code: RejectionCode,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub payers: Vec<PayerUsage>,
    pub rejections: Vec<RejectionCount>,
}

/// Thread-safe usage counters keyed by payer address
#[derive(Default)]
pub struct UsageTracker {
    payers: DashMap<EthAddress, PayerUsage>,
    rejections: DashMap<RejectionCode, u64>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one settled payment
    pub fn record_payment(&self, payer: EthAddress, amount: TokenAmount) {
        let now = Utc::now();
        let mut entry = self.payers.entry(payer).or_insert_with(|| PayerUsage {
            payer,
            payments: 0,
            volume: TokenAmount::ZERO,
            last_payment_at: now,
        });
        entry.payments += 1;
        entry.volume = entry.volume.checked_add(amount).unwrap_or(entry.volume);
        entry.last_payment_at = now;
    }

    pub fn record_rejection(&self, code: RejectionCode) {
        *self.rejections.entry(code).or_insert(0) += 1;
    }

    pub fn payer(&self, payer: &EthAddress) -> Option<PayerUsage> {
        self.payers.get(payer).map(|r| r.value().clone())
    }

    pub fn rejections(&self, code: RejectionCode) -> u64 {
        self.rejections.get(&code).map(|r| *r.value()).unwrap_or(0)
    }

    /// Payers sorted by volume (largest first)
    pub fn snapshot(&self) -> UsageSnapshot {
        let mut payers: Vec<PayerUsage> = self.payers.iter().map(|r| r.value().clone()).collect();
        payers.sort_by(|a, b| b.volume.cmp(&a.volume));

        let rejections = self
            .rejections
            .iter()
            .map(|r| RejectionCount {
                code: *r.key(),
                count: *r.value(),
            })
            .collect();

        UsageSnapshot { payers, rejections }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payer(n: u8) -> EthAddress {
        EthAddress::from(ethers::types::Address::repeat_byte(n))
    }

    #[test]
    fn test_record_payment_accumulates() {
        let tracker = UsageTracker::new();
        tracker.record_payment(payer(1), TokenAmount::from(10_000));
        tracker.record_payment(payer(1), TokenAmount::from(5_000));

        let usage = tracker.payer(&payer(1)).unwrap();
        assert_eq!(usage.payments, 2);
        assert_eq!(usage.volume, TokenAmount::from(15_000));
        assert!(tracker.payer(&payer(2)).is_none());
    }

    #[test]
    fn test_snapshot_sorted_by_volume() {
        let tracker = UsageTracker::new();
        tracker.record_payment(payer(1), TokenAmount::from(1));
        tracker.record_payment(payer(2), TokenAmount::from(100));
        tracker.record_rejection(RejectionCode::ReplayDetected);
        tracker.record_rejection(RejectionCode::ReplayDetected);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.payers[0].payer, payer(2));
        assert_eq!(snapshot.rejections.len(), 1);
        assert_eq!(tracker.rejections(RejectionCode::ReplayDetected), 2);
        assert_eq!(tracker.rejections(RejectionCode::PolicyViolation), 0);
    }
}
