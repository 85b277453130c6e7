//! Execution Manager.
//!
//! Bounded-concurrency admission control for running conversations. Grounded
//! on the teacher's `server::Manager`, which keyed an `Arc<Server>` map
//! behind a `DashMap`; generalized here from "map of running things" to "map
//! of cancellation capabilities" with an admission count compared against a
//! configured ceiling.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Must be strictly positive; enforced at construction, not on every call.
#[derive(Debug, Clone, Copy)]
pub struct MaxConcurrency(usize);

impl MaxConcurrency {
    pub fn new(value: usize) -> Self {
        assert!(value > 0, "max_concurrency must be greater than zero");
        Self(value)
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for MaxConcurrency {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Tracks which conversations are currently running and lets anyone holding
/// an `ExecutionManager` cancel one by id. The `running_count` is kept as a
/// separate atomic rather than `servers.len()` so `can_admit` never needs to
/// walk the map.
pub struct ExecutionManager {
    running: DashMap<String, CancellationToken>,
    running_count: AtomicUsize,
    max_concurrency: MaxConcurrency,
}

impl ExecutionManager {
    pub fn new(max_concurrency: MaxConcurrency) -> Self {
        Self { running: DashMap::new(), running_count: AtomicUsize::new(0), max_concurrency }
    }

    pub fn can_admit(&self) -> bool {
        self.running_count.load(Ordering::SeqCst) < self.max_concurrency.get()
    }

    /// Atomically admits `conv_id` with its cancellation capability iff
    /// there is spare capacity and the id isn't already present. Two
    /// concurrent admissions of the same id race on `DashMap::entry`; only
    /// the one that successfully inserts observes `true`.
    pub fn admit(&self, conv_id: &str, cancel: CancellationToken) -> bool {
        use dashmap::mapref::entry::Entry;

        if self.running_count.load(Ordering::SeqCst) >= self.max_concurrency.get() {
            return false;
        }

        match self.running.entry(conv_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                // Re-check under the shard lock `entry` already holds: two
                // threads can both pass the pre-check above when capacity is
                // exactly one short of `max_concurrency`.
                if self.running_count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < self.max_concurrency.get()).then_some(n + 1)
                }).is_err() {
                    return false;
                }
                slot.insert(cancel);
                true
            }
        }
    }

    /// Idempotent: a second `release` of an already-absent id is a no-op.
    pub fn release(&self, conv_id: &str) {
        if self.running.remove(conv_id).is_some() {
            self.running_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Signals cancellation and releases in one step; safe to race with a
    /// concurrent `release` from the run's own reconciliation block, since
    /// `DashMap::remove` only lets one caller observe `Some`.
    pub fn cancel(&self, conv_id: &str) -> bool {
        if let Some((_, token)) = self.running.remove(conv_id) {
            self.running_count.fetch_sub(1, Ordering::SeqCst);
            token.cancel();
            true
        } else {
            false
        }
    }

    pub fn is_running(&self, conv_id: &str) -> bool {
        self.running.contains_key(conv_id)
    }

    pub fn running_count(&self) -> usize {
        self.running_count.load(Ordering::SeqCst)
    }

    /// Snapshot of every currently-admitted conversation id, for the
    /// shutdown path to cancel each one in turn. A snapshot, not a live
    /// view: entries admitted or released after this call isn't reflected.
    pub fn running_ids(&self) -> Vec<String> {
        self.running.iter().map(|entry| entry.key().clone()).collect()
    }
}

pub type SharedExecutionManager = Arc<ExecutionManager>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn admits_up_to_the_limit_and_then_refuses() {
        let mgr = ExecutionManager::new(MaxConcurrency::new(2));
        assert!(mgr.admit("a", CancellationToken::new()));
        assert!(mgr.admit("b", CancellationToken::new()));
        assert!(!mgr.can_admit());
        assert!(!mgr.admit("c", CancellationToken::new()));
        assert_eq!(mgr.running_count(), 2);
    }

    #[test]
    fn admitting_the_same_id_twice_only_succeeds_once() {
        let mgr = ExecutionManager::new(MaxConcurrency::new(5));
        assert!(mgr.admit("a", CancellationToken::new()));
        assert!(!mgr.admit("a", CancellationToken::new()));
        assert_eq!(mgr.running_count(), 1);
    }

    #[test]
    fn release_is_idempotent() {
        let mgr = ExecutionManager::new(MaxConcurrency::new(1));
        mgr.admit("a", CancellationToken::new());
        mgr.release("a");
        mgr.release("a");
        assert_eq!(mgr.running_count(), 0);
        assert!(!mgr.is_running("a"));
    }

    #[test]
    fn cancel_signals_the_token_and_releases() {
        let mgr = ExecutionManager::new(MaxConcurrency::new(1));
        let token = CancellationToken::new();
        mgr.admit("a", token.clone());
        assert!(mgr.cancel("a"));
        assert!(token.is_cancelled());
        assert!(!mgr.is_running("a"));
        assert!(!mgr.cancel("a"), "second cancel of an absent id is a no-op");
    }

    #[test]
    fn running_ids_snapshots_currently_admitted_conversations() {
        let mgr = ExecutionManager::new(MaxConcurrency::new(3));
        mgr.admit("a", CancellationToken::new());
        mgr.admit("b", CancellationToken::new());
        let mut ids = mgr.running_ids();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

        mgr.release("a");
        assert_eq!(mgr.running_ids(), vec!["b".to_string()]);
    }

    #[test]
    fn concurrent_admissions_of_the_same_id_yield_exactly_one_success() {
        let mgr = Arc::new(ExecutionManager::new(MaxConcurrency::new(8)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgr = mgr.clone();
                std::thread::spawn(move || mgr.admit("contested", CancellationToken::new()))
            })
            .collect();
        let successes = handles.into_iter().filter(|h| h.join().unwrap()).count();
        assert_eq!(successes, 1);
        assert_eq!(mgr.running_count(), 1);
    }
}
