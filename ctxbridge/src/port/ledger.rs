//! Delivery receipts of in-flight requests.
//!
//! The relay keeps one ledger for every request it delivered; each spoke keeps
//! one for the requests it sent. A receipt leaves the ledger when the reply is
//! routed, or when its recipient's session ends.

use super::protocol::DeliveryReceipt;
use crate::endpoint::Fingerprint;

/// Receipts, at most one per transaction.
#[derive(Debug, Clone, Default)]
pub struct DeliveryLedger {
    receipts: Vec<DeliveryReceipt>,
}

impl DeliveryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a receipt, replacing any receipt for the same transaction.
    pub fn add(&mut self, receipt: DeliveryReceipt) {
        self.remove_transaction(&receipt.message.transaction_id);
        self.receipts.push(receipt);
    }

    /// Remove the receipt for a transaction.
    pub fn remove_transaction(&mut self, transaction_id: &str) -> Option<DeliveryReceipt> {
        let index = self
            .receipts
            .iter()
            .position(|receipt| receipt.message.transaction_id == transaction_id)?;
        Some(self.receipts.remove(index))
    }

    /// Remove and return every receipt addressed to `fingerprint`.
    pub fn take_addressed_to(&mut self, fingerprint: &Fingerprint) -> Vec<DeliveryReceipt> {
        let (taken, kept) = std::mem::take(&mut self.receipts)
            .into_iter()
            .partition(|receipt| receipt.to == *fingerprint);
        self.receipts = kept;
        taken
    }

    /// All receipts, oldest first.
    pub fn entries(&self) -> &[DeliveryReceipt] {
        &self.receipts
    }

    /// Number of receipts.
    pub fn len(&self) -> usize {
        self.receipts.len()
    }

    /// Whether the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.receipts.is_empty()
    }
}
