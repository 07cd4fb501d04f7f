use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::{
    config::RateSpec,
    error::{RateLimitError, Result},
    keys::{store_key, RateLimitKey},
    metrics::Metrics,
    store::StoreClient,
};

/// Outcome of evaluating one call against its window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admitted {
        /// Counter value after this call's increment
        count: u64,
    },
    Rejected {
        /// Counter value after this call's increment; always above `limit`
        count: u64,
        limit: u64,
        /// Time until the store expires the window, if it could be read
        reset_after: Option<Duration>,
    },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted { .. })
    }

    pub fn count(&self) -> u64 {
        match self {
            Decision::Admitted { count } | Decision::Rejected { count, .. } => *count,
        }
    }

    /// Turn a rejection into the error `guard` returns
    pub fn into_result(self) -> Result<u64> {
        match self {
            Decision::Admitted { count } => Ok(count),
            Decision::Rejected {
                count,
                limit,
                reset_after,
            } => Err(RateLimitError::RateLimitExceeded {
                count,
                limit,
                reset_after,
            }),
        }
    }
}

/// Counter for one (key, rate) pair in the store.
///
/// Holds no window state of its own; the counter and its expiry live in the store.
#[derive(Debug, Clone)]
pub struct WindowCounter {
    spec: RateSpec,
    key: RateLimitKey,
    store_key: String,
}

impl WindowCounter {
    pub fn new(prefix: &str, key: RateLimitKey, spec: RateSpec) -> Self {
        let store_key = store_key(prefix, &key, &spec);
        Self {
            spec,
            key,
            store_key,
        }
    }

    pub fn spec(&self) -> &RateSpec {
        &self.spec
    }

    pub fn key(&self) -> &RateLimitKey {
        &self.key
    }

    pub fn store_key(&self) -> &str {
        &self.store_key
    }

    /// Count one call and decide whether it fits in the current window.
    ///
    /// The increment is kept even when the call is rejected, so retries against a full
    /// window keep spending budget. Nothing is ever decremented.
    pub async fn evaluate(
        &self,
        store: &dyn StoreClient,
        metrics: Option<&Metrics>,
    ) -> Result<Decision> {
        let started = Instant::now();
        let result = store
            .increment_and_expire(&self.store_key, self.spec.period())
            .await;
        record_store_operation(metrics, store.backend(), "increment_and_expire", started, &result);
        let count = result?;

        if count <= self.spec.limit() {
            debug!("Admitted {} ({}/{})", self.key, count, self.spec.limit());
            return Ok(Decision::Admitted { count });
        }

        let started = Instant::now();
        let ttl = store.remaining_ttl(&self.store_key).await;
        record_store_operation(metrics, store.backend(), "remaining_ttl", started, &ttl);
        let reset_after = match ttl {
            Ok(ttl) => ttl,
            Err(e) => {
                warn!("Failed to read window TTL for {}: {}", self.store_key, e);
                None
            }
        };

        debug!(
            "Rejected {} ({}/{}), window resets in {:?}",
            self.key,
            count,
            self.spec.limit(),
            reset_after
        );
        Ok(Decision::Rejected {
            count,
            limit: self.spec.limit(),
            reset_after,
        })
    }
}

fn record_store_operation<T>(
    metrics: Option<&Metrics>,
    backend: &str,
    operation: &str,
    started: Instant,
    result: &Result<T>,
) {
    if let Some(metrics) = metrics {
        let outcome = match result {
            Ok(_) => "success",
            Err(e) if e.is_indeterminate() => "indeterminate",
            Err(_) => "error",
        };
        metrics.record_store_operation(backend, operation, outcome);
        metrics.record_store_operation_duration(backend, operation, started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replays canned replies and records the calls it receives
    #[derive(Default)]
    struct ScriptedStore {
        counts: Mutex<Vec<Result<u64>>>,
        ttl: Option<Result<Option<Duration>>>,
        calls: Mutex<Vec<(String, String, Option<Duration>)>>,
    }

    impl ScriptedStore {
        fn replying(counts: Vec<Result<u64>>) -> Self {
            Self {
                counts: Mutex::new(counts.into_iter().rev().collect()),
                ..Default::default()
            }
        }

        fn with_ttl(mut self, ttl: Result<Option<Duration>>) -> Self {
            self.ttl = Some(ttl);
            self
        }

        fn calls(&self) -> Vec<(String, String, Option<Duration>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StoreClient for ScriptedStore {
        fn backend(&self) -> &'static str {
            "scripted"
        }

        async fn increment_and_expire(&self, key: &str, ttl: Duration) -> Result<u64> {
            self.calls
                .lock()
                .unwrap()
                .push(("incr".to_string(), key.to_string(), Some(ttl)));
            self.counts.lock().unwrap().pop().expect("no scripted reply left")
        }

        async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
            self.calls
                .lock()
                .unwrap()
                .push(("ttl".to_string(), key.to_string(), None));
            self.ttl.clone().expect("ttl not scripted")
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn counter(limit: u64) -> WindowCounter {
        WindowCounter::new(
            "test",
            RateLimitKey::new("api").unwrap(),
            RateSpec::per_seconds(limit, 10).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_admits_up_to_limit_without_reading_ttl() {
        let store = ScriptedStore::replying(vec![Ok(1), Ok(3)]);
        let counter = counter(3);

        assert_eq!(
            counter.evaluate(&store, None).await.unwrap(),
            Decision::Admitted { count: 1 }
        );
        assert_eq!(
            counter.evaluate(&store, None).await.unwrap(),
            Decision::Admitted { count: 3 }
        );

        let calls = store.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(op, key, ttl)| op == "incr"
            && key == "test:api:3/10000ms"
            && *ttl == Some(Duration::from_secs(10))));
    }

    #[tokio::test]
    async fn test_rejects_above_limit_with_reset_time() {
        let store = ScriptedStore::replying(vec![Ok(4)]).with_ttl(Ok(Some(Duration::from_secs(7))));
        let decision = counter(3).evaluate(&store, None).await.unwrap();

        assert_eq!(
            decision,
            Decision::Rejected {
                count: 4,
                limit: 3,
                reset_after: Some(Duration::from_secs(7)),
            }
        );
        assert_eq!(store.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_ttl_read_keeps_rejection() {
        let store = ScriptedStore::replying(vec![Ok(9)])
            .with_ttl(Err(RateLimitError::Connection("reset".to_string())));
        let decision = counter(3).evaluate(&store, None).await.unwrap();

        assert_eq!(
            decision,
            Decision::Rejected {
                count: 9,
                limit: 3,
                reset_after: None,
            }
        );
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let store = ScriptedStore::replying(vec![Err(RateLimitError::Protocol(
            "unexpected reply".to_string(),
        ))]);
        let metrics = Metrics::new().unwrap();

        let result = counter(3).evaluate(&store, Some(&metrics)).await;
        assert!(matches!(result, Err(RateLimitError::Protocol(_))));
        assert_eq!(
            metrics.store_operations("scripted", "increment_and_expire", "error"),
            1.0
        );
    }

    #[tokio::test]
    async fn test_aborted_increment_is_reported_indeterminate() {
        let store = ScriptedStore::replying(vec![Err(RateLimitError::Indeterminate(
            "Request timed out.".to_string(),
        ))]);
        let metrics = Metrics::new().unwrap();

        let err = counter(3).evaluate(&store, Some(&metrics)).await.unwrap_err();
        assert!(err.is_indeterminate());
        assert_eq!(
            metrics.store_operations("scripted", "increment_and_expire", "indeterminate"),
            1.0
        );
    }

    #[test]
    fn test_decision_into_result() {
        assert_eq!(Decision::Admitted { count: 2 }.into_result().unwrap(), 2);

        let err = Decision::Rejected {
            count: 5,
            limit: 4,
            reset_after: None,
        }
        .into_result()
        .unwrap_err();
        assert!(err.is_rate_limited());
    }
}
