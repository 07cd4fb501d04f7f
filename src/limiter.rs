use std::{future::Future, sync::Arc};
use tracing::warn;

use crate::{
    config::{RateSpec, Settings},
    connection::LazyConnection,
    error::Result,
    keys::RateLimitKey,
    metrics::Metrics,
    store::Connector,
    window::{Decision, WindowCounter},
};

/// Store key prefix used when none is configured
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit";

/// Admits at most `limit` calls per `period` for one key, across every process that
/// shares the store.
///
/// Construction never touches the store; the connection is opened by the first call.
/// Between calls the limiter holds nothing but that connection.
///
/// # Cancellation and timeouts
///
/// Dropping a `guard`/`acquire` future while it awaits the store, or hitting the store
/// command timeout, leaves the window in an unknown state: the server may already have
/// counted the call. The call is neither admitted nor rejected from the caller's point
/// of view, and the budget it may have spent is not given back.
pub struct RateLimiter {
    counter: WindowCounter,
    connection: LazyConnection,
    metrics: Option<Arc<Metrics>>,
}

/// Proof that a call was admitted. There is nothing to release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    pub count: u64,
    pub limit: u64,
}

impl Permit {
    /// Calls still admissible in the current window
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }
}

impl RateLimiter {
    pub fn new(spec: RateSpec, key: RateLimitKey, connector: impl Connector + 'static) -> Self {
        Self::with_connector(spec, key, Arc::new(connector))
    }

    /// Build a limiter over a connector shared with other limiters
    pub fn with_connector(spec: RateSpec, key: RateLimitKey, connector: Arc<dyn Connector>) -> Self {
        Self {
            counter: WindowCounter::new(DEFAULT_KEY_PREFIX, key, spec),
            connection: LazyConnection::new(connector),
            metrics: None,
        }
    }

    /// Build a limiter from process settings: store, backend and key prefix
    pub fn from_settings(settings: &Settings, spec: RateSpec, key: RateLimitKey) -> Self {
        Self::new(spec, key, settings.store.clone()).with_prefix(&settings.key_prefix)
    }

    /// Namespace the store key, e.g. per application
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.counter = WindowCounter::new(prefix, self.counter.key().clone(), *self.counter.spec());
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.connection.set_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn spec(&self) -> &RateSpec {
        self.counter.spec()
    }

    pub fn key(&self) -> &RateLimitKey {
        self.counter.key()
    }

    /// Key of the counter in the store
    pub fn store_key(&self) -> &str {
        self.counter.store_key()
    }

    /// Count this call and return the raw decision.
    pub async fn check(&self) -> Result<Decision> {
        let store = self.connection.get().await?;
        let decision = self
            .counter
            .evaluate(store.as_ref(), self.metrics.as_deref())
            .await?;

        if let Some(metrics) = &self.metrics {
            if decision.is_admitted() {
                metrics.record_admitted(self.counter.key());
            } else {
                metrics.record_rejected(self.counter.key());
            }
        }
        Ok(decision)
    }

    /// Scoped form: admit the block of work that follows, or fail with
    /// [`RateLimitExceeded`](crate::RateLimitError::RateLimitExceeded).
    pub async fn acquire(&self) -> Result<Permit> {
        let count = self.check().await?.into_result()?;
        Ok(Permit {
            count,
            limit: self.counter.spec().limit(),
        })
    }

    /// Run `operation` if the call is admitted.
    ///
    /// On rejection `operation` is never invoked and
    /// [`RateLimitExceeded`](crate::RateLimitError::RateLimitExceeded) is returned with the
    /// observed count, the limit and the time until the window resets.
    pub async fn guard<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire().await?;
        Ok(operation().await)
    }

    /// Wrap an async function so every call goes through this limiter
    pub fn wrap<F>(self: &Arc<Self>, operation: F) -> RateLimited<F> {
        RateLimited::new(self.clone(), operation)
    }

    /// Health check of the store connection, opening it if needed
    pub async fn ping(&self) -> Result<()> {
        self.connection.get().await?.ping().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    /// Close the store connection. Safe to call more than once; a later call through
    /// the limiter reconnects.
    pub async fn close(&self) -> Result<()> {
        self.connection.close().await
    }

    /// Hand the limiter to `f`, then close its connection, whatever `f` returned.
    ///
    /// If `f` panics the connection is still closed when the limiter is dropped.
    pub async fn run<F, Fut, T>(self, f: F) -> T
    where
        F: FnOnce(Arc<RateLimiter>) -> Fut,
        Fut: Future<Output = T>,
    {
        let limiter = Arc::new(self);
        let output = f(limiter.clone()).await;
        if let Err(e) = limiter.close().await {
            warn!("Failed to close store connection for {}: {}", limiter.key(), e);
        }
        output
    }
}

/// An async function guarded by a [`RateLimiter`].
pub struct RateLimited<F> {
    limiter: Arc<RateLimiter>,
    operation: F,
}

impl<F> RateLimited<F> {
    pub fn new(limiter: Arc<RateLimiter>, operation: F) -> Self {
        Self { limiter, operation }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Call the wrapped function with `args` if the call is admitted
    pub async fn call<A, Fut>(&self, args: A) -> Result<Fut::Output>
    where
        F: Fn(A) -> Fut,
        Fut: Future,
    {
        self.limiter.acquire().await?;
        Ok((self.operation)(args).await)
    }
}

/// Rate limit an async function, keying the counter by the function's type path.
///
/// ```no_run
/// # async fn example() -> window_ratelimit::Result<()> {
/// use window_ratelimit::{rate_limit, RateSpec, StoreConfig};
///
/// async fn fetch_quote(symbol: &'static str) -> String {
///     format!("quote for {symbol}")
/// }
///
/// let fetch = rate_limit(RateSpec::per_seconds(1200, 60)?, StoreConfig::default(), fetch_quote);
/// let quote = fetch.call("ACME").await?;
/// # Ok(())
/// # }
/// ```
pub fn rate_limit<F>(spec: RateSpec, connector: impl Connector + 'static, operation: F) -> RateLimited<F> {
    let key = RateLimitKey::for_fn(&operation);
    let limiter = Arc::new(RateLimiter::new(spec, key, connector));
    RateLimited::new(limiter, operation)
}
