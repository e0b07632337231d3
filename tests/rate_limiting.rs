// Fixed-window admission through the public limiter API
#[cfg(test)]
mod test {
    use std::{
        collections::HashMap,
        sync::Arc,
        time::Duration,
    };

    use async_trait::async_trait;
    use edgeway::{
        adapters::InMemoryWindowStore,
        config::{RateLimitPolicyConfig, RateLimiterConfig, StoreFailurePolicy},
        core::{
            clock::ManualTimeSource,
            rate_limiter::{Admission, RateLimiter},
        },
        ports::window_store::{StoreError, Window, WindowDecision, WindowStore},
    };
    use http::StatusCode;

    /// Start of a 10 s window, in epoch milliseconds.
    const WINDOW_START: u64 = 1_700_000_000_000;

    fn limiter(window_secs: u64, limit: u32, clock: &ManualTimeSource) -> RateLimiter {
        let config = RateLimiterConfig {
            policies: HashMap::from([(
                "fixed".to_string(),
                RateLimitPolicyConfig::fixed(window_secs, limit),
            )]),
            ..Default::default()
        };
        RateLimiter::from_config(
            &config,
            Arc::new(InMemoryWindowStore::new(1024)),
            Arc::new(clock.clone()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_sixth_request_in_window_is_rejected() {
        let clock = ManualTimeSource::new(WINDOW_START);
        let limiter = limiter(10, 5, &clock);

        let mut decisions = Vec::new();
        for _ in 0..6 {
            decisions.push(limiter.admit("fixed", "k").await);
            clock.advance(Duration::from_millis(500));
        }

        assert!(decisions[..5].iter().all(Admission::is_allowed));
        match &decisions[5] {
            Admission::Rejected {
                retry_after,
                status,
                ..
            } => {
                assert_eq!(*status, StatusCode::TOO_MANY_REQUESTS);
                // Sixth admit at +2.5 s, window ends at +10 s
                assert_eq!(*retry_after, Duration::from_millis(7_500));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_new_window_resets_to_limit_minus_one() {
        let clock = ManualTimeSource::new(WINDOW_START);
        let limiter = limiter(10, 5, &clock);

        for _ in 0..12 {
            limiter.admit("fixed", "k").await;
        }
        clock.set(WINDOW_START + 10_000 + 1);

        assert_eq!(
            limiter.admit("fixed", "k").await,
            Admission::Allowed { remaining: Some(4) }
        );
    }

    #[tokio::test]
    async fn test_keys_do_not_share_windows() {
        let clock = ManualTimeSource::new(WINDOW_START);
        let limiter = limiter(10, 1, &clock);

        assert!(limiter.admit("fixed", "alice").await.is_allowed());
        assert!(!limiter.admit("fixed", "alice").await.is_allowed());
        assert!(limiter.admit("fixed", "bob").await.is_allowed());
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admits_never_exceed_limit() {
        let clock = ManualTimeSource::new(WINDOW_START);
        let limiter = Arc::new(limiter(10, 50, &clock));

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.admit("fixed", "shared").await.is_allowed() })
            })
            .collect();

        let mut allowed = 0;
        for task in tasks {
            if task.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 50);
    }

    struct Offline;

    #[async_trait]
    impl WindowStore for Offline {
        async fn try_take(
            &self,
            _key: &str,
            _window: Window,
            _limit: u32,
        ) -> Result<WindowDecision, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        fn tracked_keys(&self) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn test_store_failure_policy() {
        let clock = ManualTimeSource::new(WINDOW_START);
        let mut config = RateLimiterConfig::default();

        let open = RateLimiter::from_config(&config, Arc::new(Offline), Arc::new(clock.clone()))
            .unwrap();
        assert_eq!(
            open.admit("fixed", "k").await,
            Admission::Allowed { remaining: None }
        );

        config.on_store_error = StoreFailurePolicy::Deny;
        let closed = RateLimiter::from_config(&config, Arc::new(Offline), Arc::new(clock))
            .unwrap();
        assert!(!closed.admit("fixed", "k").await.is_allowed());
    }

    #[test]
    fn test_zero_valued_policies_fail_at_load() {
        let clock = ManualTimeSource::new(WINDOW_START);
        for (window, limit) in [(0, 5), (10, 0)] {
            let config = RateLimiterConfig {
                policies: HashMap::from([(
                    "broken".to_string(),
                    RateLimitPolicyConfig::fixed(window, limit),
                )]),
                ..Default::default()
            };
            let result = RateLimiter::from_config(
                &config,
                Arc::new(InMemoryWindowStore::new(16)),
                Arc::new(clock.clone()),
            );
            assert!(result.is_err());
        }
    }
}
