//! Named rate limit policies over partition keys.
//!
//! The default algorithm is a fixed window: time is cut into epoch-aligned windows
//! of `window_secs`, and each partition key may take `permit_limit` permits per
//! window. Counters live behind the [`WindowStore`] port and are reset lazily by the
//! first request of a new window. A client can therefore get up to twice the limit
//! across a window boundary; the `gcra` algorithm (via `governor`) is available for
//! policies that need smooth admission instead.
//!
//! When the store cannot decide, the configured [`StoreFailurePolicy`] applies.
use std::{collections::HashMap, num::NonZeroU32, sync::Arc, time::Duration};

use governor::{
    Quota,
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
};
use http::StatusCode;
use thiserror::Error;

use crate::{
    config::{
        MAX_WINDOW_SECS, RateLimitAlgorithm, RateLimitPolicyConfig, RateLimiterConfig,
        StoreFailurePolicy,
    },
    core::{clock::TimeSource, error::EdgeError},
    metrics,
    ports::window_store::{StoreError, Window, WindowDecision, WindowStore},
};

type GcraLimiter = governor::RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// `remaining` is unknown for GCRA policies and fail-open decisions
    Allowed { remaining: Option<u32> },
    Rejected {
        retry_after: Duration,
        status: StatusCode,
        message: String,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("unknown rate limit policy '{0}'")]
    UnknownPolicy(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

enum Algorithm {
    FixedWindow,
    Gcra(GcraLimiter),
}

struct Policy {
    window: Duration,
    /// Non-zero, derived from `window` at load
    window_ms: u64,
    limit: u32,
    status: StatusCode,
    message: String,
    algorithm: Algorithm,
}

impl Policy {
    fn from_config(name: &str, config: &RateLimitPolicyConfig) -> Result<Self, EdgeError> {
        let invalid = |message: String| {
            EdgeError::ConfigInvalid(format!("rate limit policy '{name}': {message}"))
        };

        if config.window_secs == 0 {
            return Err(invalid("window_secs must be greater than 0".to_string()));
        }
        if config.window_secs > MAX_WINDOW_SECS {
            return Err(invalid(format!(
                "window_secs must be at most {MAX_WINDOW_SECS}, got {}",
                config.window_secs
            )));
        }
        let limit = NonZeroU32::new(config.permit_limit)
            .ok_or_else(|| invalid("permit_limit must be greater than 0".to_string()))?;
        let status = StatusCode::from_u16(config.status_code)
            .map_err(|_| invalid(format!("invalid status code {}", config.status_code)))?;
        let window = Duration::from_secs(config.window_secs);
        let window_ms = u64::try_from(window.as_millis())
            .map_err(|_| invalid(format!("window of {window:?} does not fit in milliseconds")))?;

        let algorithm = match config.algorithm {
            RateLimitAlgorithm::FixedWindow => Algorithm::FixedWindow,
            RateLimitAlgorithm::Gcra => {
                let quota = Quota::with_period(window / limit.get())
                    .ok_or_else(|| invalid(format!("invalid period for {window:?}")))?
                    .allow_burst(limit);
                Algorithm::Gcra(governor::RateLimiter::keyed(quota))
            }
        };

        tracing::info!(
            policy = name,
            algorithm = ?config.algorithm,
            window_secs = config.window_secs,
            permit_limit = config.permit_limit,
            "rate limit policy loaded"
        );

        Ok(Self {
            window,
            window_ms,
            limit: limit.get(),
            status,
            message: config.message.clone(),
            algorithm,
        })
    }

    fn rejected(&self, retry_after: Duration) -> Admission {
        Admission::Rejected {
            retry_after,
            status: self.status,
            message: self.message.clone(),
        }
    }
}

/// Admission decisions for all configured policies.
pub struct RateLimiter {
    policies: HashMap<String, Policy>,
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn TimeSource>,
    on_store_error: StoreFailurePolicy,
    max_tracked_keys: usize,
}

impl RateLimiter {
    pub fn from_config(
        config: &RateLimiterConfig,
        store: Arc<dyn WindowStore>,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self, EdgeError> {
        let policies = config
            .policies
            .iter()
            .map(|(name, policy)| Ok((name.clone(), Policy::from_config(name, policy)?)))
            .collect::<Result<_, EdgeError>>()?;

        Ok(Self {
            policies,
            store,
            clock,
            on_store_error: config.on_store_error,
            max_tracked_keys: config.max_tracked_keys,
        })
    }

    pub fn has_policy(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    /// Decide whether `partition_key` may proceed under `policy`, applying the
    /// store failure policy when no decision can be made.
    pub async fn admit(&self, policy: &str, partition_key: &str) -> Admission {
        match self.check(policy, partition_key).await {
            Ok(admission) => admission,
            Err(error) => {
                let allow = self.on_store_error == StoreFailurePolicy::Allow;
                tracing::warn!(
                    policy,
                    error = %error,
                    decision = if allow { "allow" } else { "deny" },
                    "rate limiter could not decide, applying failure policy"
                );
                metrics::increment_limiter_store_failure(policy, allow);
                if allow {
                    Admission::Allowed { remaining: None }
                } else {
                    match self.policies.get(policy) {
                        Some(p) => p.rejected(p.window),
                        None => Admission::Rejected {
                            retry_after: Duration::from_secs(1),
                            status: StatusCode::TOO_MANY_REQUESTS,
                            message: "Too Many Requests".to_string(),
                        },
                    }
                }
            }
        }
    }

    /// Raw decision without the failure policy.
    pub async fn check(&self, policy: &str, partition_key: &str) -> Result<Admission, RateLimitError> {
        let p = self
            .policies
            .get(policy)
            .ok_or_else(|| RateLimitError::UnknownPolicy(policy.to_string()))?;

        match &p.algorithm {
            Algorithm::FixedWindow => self.check_fixed(policy, p, partition_key).await,
            Algorithm::Gcra(limiter) => self.check_gcra(p, limiter, partition_key),
        }
    }

    async fn check_fixed(
        &self,
        name: &str,
        policy: &Policy,
        partition_key: &str,
    ) -> Result<Admission, RateLimitError> {
        let now_ms = self.clock.now_millis();
        let window = Window::containing(now_ms, policy.window_ms);
        let key = format!("{name}:{partition_key}");

        match self.store.try_take(&key, window, policy.limit).await? {
            WindowDecision::Taken { remaining } => Ok(Admission::Allowed {
                remaining: Some(remaining),
            }),
            WindowDecision::Exhausted { ends_at_ms } => {
                let wait = Duration::from_millis(ends_at_ms.saturating_sub(now_ms));
                Ok(policy.rejected(wait))
            }
        }
    }

    fn check_gcra(
        &self,
        policy: &Policy,
        limiter: &GcraLimiter,
        partition_key: &str,
    ) -> Result<Admission, RateLimitError> {
        let key = partition_key.to_string();
        if limiter.len() >= self.max_tracked_keys {
            limiter.retain_recent();
            limiter.shrink_to_fit();
            if limiter.len() >= self.max_tracked_keys {
                return Err(StoreError::Capacity {
                    limit: self.max_tracked_keys,
                }
                .into());
            }
        }

        match limiter.check_key(&key) {
            Ok(()) => Ok(Admission::Allowed { remaining: None }),
            Err(not_until) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                Ok(policy.rejected(wait))
            }
        }
    }

    /// Number of tracked partition keys in the window store.
    pub fn tracked_keys(&self) -> usize {
        self.store.tracked_keys()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.policies.keys().collect();
        names.sort();
        f.debug_struct("RateLimiter")
            .field("policies", &names)
            .field("on_store_error", &self.on_store_error)
            .finish_non_exhaustive()
    }
}
