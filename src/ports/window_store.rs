use async_trait::async_trait;
use thiserror::Error;

/// Failures of a rate-limit window store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    #[error("window store unavailable: {0}")]
    Unavailable(String),

    /// No room for a new partition key even after evicting stale windows
    #[error("window store is full ({limit} keys tracked)")]
    Capacity { limit: usize },
}

/// An epoch-aligned fixed window: `[index * length_ms, (index + 1) * length_ms)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub index: u64,
    pub length_ms: u64,
}

impl Window {
    /// The window containing `now_ms`. `length_ms` must be non-zero.
    pub fn containing(now_ms: u64, length_ms: u64) -> Self {
        Self {
            index: now_ms / length_ms,
            length_ms,
        }
    }

    pub fn starts_at_ms(&self) -> u64 {
        self.index.saturating_mul(self.length_ms)
    }

    pub fn ends_at_ms(&self) -> u64 {
        self.index.saturating_add(1).saturating_mul(self.length_ms)
    }
}

/// Decision for one permit request against a key's current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    /// A permit was taken; `remaining` permits are left in the window
    Taken { remaining: u32 },
    /// No permits left in the stored window, which ends at `ends_at_ms`
    Exhausted { ends_at_ms: u64 },
}

/// Storage of fixed-window counters, keyed by partition.
///
/// A take is atomic per key: concurrent callers never lose updates and the counter
/// is reset exactly once when a new window starts.
#[async_trait]
pub trait WindowStore: Send + Sync + 'static {
    /// Take one permit from `key`'s counter for `window`, starting the window with
    /// `limit` permits if the stored one is older.
    async fn try_take(
        &self,
        key: &str,
        window: Window,
        limit: u32,
    ) -> Result<WindowDecision, StoreError>;

    /// Number of partition keys currently tracked.
    fn tracked_keys(&self) -> usize;
}
