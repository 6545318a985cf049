//! Waiters keyed by the event they wait for.
//!
//! Registering stores a waiter under a key; the triggering event drains every
//! waiter for its key. Waiters can be cancelled individually by id.

use std::collections::HashMap;
use std::hash::Hash;

/// Identifies one registered waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterId(u64);

/// Waiters of type `W` grouped by key `K`.
#[derive(Debug)]
pub struct WaiterSet<K, W> {
    next_id: u64,
    waiters: HashMap<K, Vec<(WaiterId, W)>>,
}

impl<K, W> Default for WaiterSet<K, W> {
    fn default() -> Self {
        Self {
            next_id: 0,
            waiters: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash, W> WaiterSet<K, W> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter under `key`.
    pub fn add(&mut self, key: K, waiter: W) -> WaiterId {
        self.next_id += 1;
        let id = WaiterId(self.next_id);
        self.waiters.entry(key).or_default().push((id, waiter));
        id
    }

    /// Remove and return every waiter for `key`, in registration order.
    pub fn drain(&mut self, key: &K) -> Vec<W> {
        self.waiters
            .remove(key)
            .map(|waiters| waiters.into_iter().map(|(_, waiter)| waiter).collect())
            .unwrap_or_default()
    }

    /// Remove one waiter.
    pub fn cancel(&mut self, key: &K, id: WaiterId) -> Option<W> {
        let waiters = self.waiters.get_mut(key)?;
        let index = waiters.iter().position(|(waiter_id, _)| *waiter_id == id)?;
        let (_, waiter) = waiters.remove(index);
        if waiters.is_empty() {
            self.waiters.remove(key);
        }
        Some(waiter)
    }

    /// Number of waiters for `key`.
    pub fn waiting_on(&self, key: &K) -> usize {
        self.waiters.get(key).map_or(0, Vec::len)
    }

    /// Every registered waiter, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &W> {
        self.waiters.values().flatten().map(|(_, waiter)| waiter)
    }

    /// Total number of waiters.
    pub fn len(&self) -> usize {
        self.waiters.values().map(Vec::len).sum()
    }

    /// Whether no waiter is registered.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
