//! Outstanding request bookkeeping.
//!
//! ```text
//! send_message:  register(tid) -> oneshot::Receiver, forward envelope
//! reply:         complete(tid, Ok(data) | Err(Remote))
//! termination:   end(tid) -> Err(TransactionEnded)
//! forward error: discard(tid), error returned to the caller directly
//! ```

use crate::error::BridgeError;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;

/// Outcome delivered to a waiting caller.
pub type TransactionResult = Result<Value, BridgeError>;

/// One request awaiting its reply.
#[derive(Debug)]
pub struct Transaction {
    topic: String,
    sender: oneshot::Sender<TransactionResult>,
    started_at: Duration,
}

impl Transaction {
    /// Topic of the request.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Provider time when the request was sent.
    pub fn started_at(&self) -> Duration {
        self.started_at
    }

    /// Settle the transaction. A caller that stopped waiting is not an error.
    pub fn complete(self, result: TransactionResult) {
        let _ = self.sender.send(result);
    }
}

/// Transactions keyed by transaction id.
#[derive(Debug, Default)]
pub struct TransactionTable {
    open: HashMap<String, Transaction>,
}

impl TransactionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new transaction and return the receiver its outcome arrives on.
    pub fn register(
        &mut self,
        transaction_id: String,
        topic: String,
        started_at: Duration,
    ) -> oneshot::Receiver<TransactionResult> {
        let (sender, receiver) = oneshot::channel();
        self.open.insert(
            transaction_id,
            Transaction {
                topic,
                sender,
                started_at,
            },
        );
        receiver
    }

    /// Remove a transaction without settling it.
    pub fn take(&mut self, transaction_id: &str) -> Option<Transaction> {
        self.open.remove(transaction_id)
    }

    /// Whether the transaction is still open.
    pub fn contains(&self, transaction_id: &str) -> bool {
        self.open.contains_key(transaction_id)
    }

    /// Number of open transactions.
    pub fn len(&self) -> usize {
        self.open.len()
    }

    /// Whether no transaction is open.
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}
