//! Configuration for ports and the window rendezvous.

use std::time::Duration;

/// Tunables shared by every context's transports.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Delay before re-offering a private channel to the other side of the
    /// window bridge when no offer was accepted.
    pub port_offer_retry: Duration,

    /// Maximum number of messages a spoke keeps while their destination is
    /// unreachable. The oldest message is dropped when the limit is hit.
    pub undelivered_queue_limit: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port_offer_retry: Duration::from_millis(300),
            undelivered_queue_limit: 1000,
        }
    }
}

impl BridgeConfig {
    /// Create a configuration with the given parameters.
    pub fn new(port_offer_retry: Duration, undelivered_queue_limit: usize) -> Self {
        Self {
            port_offer_retry,
            undelivered_queue_limit,
        }
    }

    /// Set the window rendezvous retry interval.
    pub fn with_port_offer_retry(mut self, retry: Duration) -> Self {
        self.port_offer_retry = retry;
        self
    }

    /// Set the undelivered queue limit.
    pub fn with_undelivered_queue_limit(mut self, limit: usize) -> Self {
        self.undelivered_queue_limit = limit;
        self
    }

    /// Configuration for tests: quick rendezvous retries and a small queue.
    pub fn testing() -> Self {
        Self {
            port_offer_retry: Duration::from_millis(10),
            undelivered_queue_limit: 64,
        }
    }
}
