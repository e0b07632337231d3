//! In-memory fixed-window counters.
//!
//! Each partition key maps to a [`Slot`] holding its current window and remaining
//! permits. Every read-modify-write happens inside the map's entry lock, so a take
//! can never land on a slot that eviction has already unlinked, and the lazy reset
//! at a window boundary happens exactly once.
//!
//! When the store is full, stale keys are swept at most once per window of the
//! caller that hit the limit; in between, new keys fail fast with
//! [`StoreError::Capacity`].
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use scc::{HashMap, hash_map::Entry};

use crate::ports::window_store::{StoreError, Window, WindowDecision, WindowStore};

#[derive(Debug, Clone, Copy)]
struct Slot {
    index: u64,
    ends_at_ms: u64,
    remaining: u32,
}

impl Slot {
    fn fresh(window: Window, limit: u32) -> (Self, WindowDecision) {
        let remaining = limit.saturating_sub(1);
        let slot = Self {
            index: window.index,
            ends_at_ms: window.ends_at_ms(),
            remaining,
        };
        (slot, WindowDecision::Taken { remaining })
    }

    fn take(&mut self, window: Window, limit: u32) -> WindowDecision {
        if self.index < window.index {
            // First take in a new window: reset and consume one permit.
            let (slot, decision) = Self::fresh(window, limit);
            *self = slot;
            return decision;
        }
        // Same window, or a newer one stored by a caller with a faster clock.
        if self.remaining == 0 {
            return WindowDecision::Exhausted {
                ends_at_ms: self.ends_at_ms,
            };
        }
        self.remaining -= 1;
        WindowDecision::Taken {
            remaining: self.remaining,
        }
    }
}

pub struct InMemoryWindowStore {
    windows: HashMap<String, Slot>,
    max_keys: usize,
    next_sweep_ms: AtomicU64,
}

impl InMemoryWindowStore {
    pub fn new(max_keys: usize) -> Self {
        Self {
            windows: HashMap::new(),
            max_keys,
            next_sweep_ms: AtomicU64::new(0),
        }
    }

    /// Claim the sweep for `window`. Only one caller wins until the window ends.
    fn claim_sweep(&self, window: Window) -> bool {
        let now = window.starts_at_ms();
        let mut due = self.next_sweep_ms.load(Ordering::Acquire);
        loop {
            if now < due {
                return false;
            }
            match self.next_sweep_ms.compare_exchange_weak(
                due,
                window.ends_at_ms(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => due = actual,
            }
        }
    }

    /// Drop keys whose window ended by the start of `window`.
    async fn evict_stale(&self, window: Window) -> usize {
        let now = window.starts_at_ms();
        let before = self.windows.len();
        self.windows
            .retain_async(|_, slot| slot.ends_at_ms > now)
            .await;
        let evicted = before.saturating_sub(self.windows.len());
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.windows.len(), "evicted stale rate limit windows");
        }
        evicted
    }

    async fn make_room(&self, window: Window) -> Result<(), StoreError> {
        if self.windows.len() < self.max_keys {
            return Ok(());
        }
        if self.claim_sweep(window) {
            self.evict_stale(window).await;
        }
        if self.windows.len() >= self.max_keys {
            return Err(StoreError::Capacity {
                limit: self.max_keys,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn try_take(
        &self,
        key: &str,
        window: Window,
        limit: u32,
    ) -> Result<WindowDecision, StoreError> {
        if let Some(decision) = self
            .windows
            .update_async(key, |_, slot| slot.take(window, limit))
            .await
        {
            return Ok(decision);
        }

        self.make_room(window).await?;

        Ok(match self.windows.entry_async(key.to_string()).await {
            // Inserted by a concurrent caller since the lookup above.
            Entry::Occupied(mut entry) => entry.get_mut().take(window, limit),
            Entry::Vacant(entry) => {
                let (slot, decision) = Slot::fresh(window, limit);
                entry.insert_entry(slot);
                decision
            }
        })
    }

    fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn second(index: u64) -> Window {
        Window {
            index,
            length_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn test_take_until_exhausted_then_reset() {
        let store = InMemoryWindowStore::new(16);

        for expected in (0..3).rev() {
            assert_eq!(
                store.try_take("fixed:1.2.3.4", second(100), 3).await.unwrap(),
                WindowDecision::Taken { remaining: expected }
            );
        }
        assert_eq!(
            store.try_take("fixed:1.2.3.4", second(100), 3).await.unwrap(),
            WindowDecision::Exhausted {
                ends_at_ms: 101_000
            }
        );

        // New window: reset happens once and consumes a permit.
        assert_eq!(
            store.try_take("fixed:1.2.3.4", second(101), 3).await.unwrap(),
            WindowDecision::Taken { remaining: 2 }
        );
    }

    #[tokio::test]
    async fn test_newer_stored_window_counts_against_stored() {
        let store = InMemoryWindowStore::new(16);
        store.try_take("k", second(11), 1).await.unwrap();
        assert_eq!(
            store.try_take("k", second(10), 1).await.unwrap(),
            WindowDecision::Exhausted {
                ends_at_ms: 12_000
            }
        );
    }

    #[tokio::test]
    async fn test_capacity_evicts_stale_keys_first() {
        let store = InMemoryWindowStore::new(2);
        store.try_take("a", second(1), 5).await.unwrap();
        store.try_take("b", second(1), 5).await.unwrap();

        // Both keys are still current: no room for a third.
        assert_eq!(
            store.try_take("c", second(1), 5).await,
            Err(StoreError::Capacity { limit: 2 })
        );

        // Once their window has ended both are evicted.
        assert!(store.try_take("c", second(2), 5).await.is_ok());
        assert_eq!(store.tracked_keys(), 1);
    }

    #[tokio::test]
    async fn test_sweep_runs_at_most_once_per_window() {
        let store = InMemoryWindowStore::new(2);
        let long = |index| Window {
            index,
            length_ms: 10_000,
        };

        // At t=5.5s: a 1s window ending at 6s and a 10s window ending at 10s.
        store.try_take("short", second(5), 5).await.unwrap();
        store.try_take("long", long(0), 5).await.unwrap();

        // Full with nothing stale; this sweep holds off the next until t=10s.
        assert!(store.try_take("x", long(0), 5).await.is_err());

        // At t=6.5s "short" is stale, but no sweep is due yet.
        assert_eq!(
            store.try_take("y", second(6), 5).await,
            Err(StoreError::Capacity { limit: 2 })
        );
        assert_eq!(store.tracked_keys(), 2);

        // At t=10s the sweep runs again; both old windows have ended.
        assert!(store.try_take("y", second(10), 5).await.is_ok());
        assert_eq!(store.tracked_keys(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_takes_do_not_lose_updates() {
        let store = Arc::new(InMemoryWindowStore::new(16));
        let mut tasks = Vec::new();
        for _ in 0..64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                matches!(
                    store.try_take("shared", second(7), 40).await,
                    Ok(WindowDecision::Taken { .. })
                )
            }));
        }

        let mut taken = 0;
        for task in tasks {
            if task.await.unwrap() {
                taken += 1;
            }
        }
        assert_eq!(taken, 40);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_takes_racing_eviction_never_exceed_limit() {
        const LIMIT: u32 = 10;

        for _ in 0..20 {
            let store = Arc::new(InMemoryWindowStore::new(2));
            // Stale keys that the first caller to hit the limit sweeps away.
            store.try_take("old-a", second(1), LIMIT).await.unwrap();
            store.try_take("old-b", second(1), LIMIT).await.unwrap();

            let tasks: Vec<_> = (0..40)
                .map(|_| {
                    let store = store.clone();
                    tokio::spawn(async move {
                        matches!(
                            store.try_take("hot", second(5), LIMIT).await,
                            Ok(WindowDecision::Taken { .. })
                        )
                    })
                })
                .collect();

            let mut taken = 0;
            for task in tasks {
                if task.await.unwrap() {
                    taken += 1;
                }
            }
            // Callers that lost the sweep race may have been turned away; the
            // window as a whole still admits exactly the limit.
            for _ in 0..LIMIT + 5 {
                if let Ok(WindowDecision::Taken { .. }) =
                    store.try_take("hot", second(5), LIMIT).await
                {
                    taken += 1;
                }
            }
            assert_eq!(taken, LIMIT);
        }
    }
}
