//! Capability interface over the store clients.
//!
//! Everything above this module talks to a [`StoreClient`]; the `redis` and `fred`
//! adapters are the only places that know about their client library.

use async_trait::async_trait;
use std::{future::Future, sync::Arc, time::Duration};

use crate::{
    config::{Backend, StoreConfig},
    error::{RateLimitError, Result},
    fred::FredStore,
    redis::RedisStore,
};

/// Increments the counter and arms its expiry in one server-side step.
///
/// `PEXPIRE` only runs on the increment that created the key, so the window end is
/// fixed by the first call. A key found without any TTL gets one as well, which keeps
/// a counter written by something else from living forever.
pub const INCREMENT_AND_EXPIRE_LUA: &str = r#"
local count = redis.call("INCR", KEYS[1])
if count == 1 or redis.call("PTTL", KEYS[1]) == -1 then
    redis.call("PEXPIRE", KEYS[1], ARGV[1])
end
return count
"#;

/// Store operations the counter protocol needs.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Short backend name used in logs and metrics labels
    fn backend(&self) -> &'static str;

    /// Atomically increment `key`, arming `ttl` on the increment that creates it.
    /// Returns the post-increment value.
    async fn increment_and_expire(&self, key: &str, ttl: Duration) -> Result<u64>;

    /// Time until `key` expires; `None` if it is absent or carries no expiry.
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>>;

    async fn ping(&self) -> Result<()>;

    /// Release the underlying connections. Calling it again is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Opens store connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn StoreClient>>;
}

#[async_trait]
impl Connector for StoreConfig {
    async fn connect(&self) -> Result<Arc<dyn StoreClient>> {
        self.validate()?;
        match self.backend {
            Backend::Redis => Ok(Arc::new(RedisStore::connect(self).await?)),
            Backend::Fred => Ok(Arc::new(FredStore::connect(self).await?)),
        }
    }
}

/// Run a store call under an optional deadline.
///
/// An elapsed deadline yields [`RateLimitError::Timeout`]: the command may still have
/// been executed by the server.
pub(crate) async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(RateLimitError::Timeout(limit)),
        },
        None => fut.await,
    }
}

/// Convert a `PTTL` reply into a remaining duration.
///
/// Negative replies mean the key is missing (-2) or has no expiry (-1).
pub(crate) fn ttl_from_millis(pttl: i64) -> Option<Duration> {
    u64::try_from(pttl).ok().map(Duration::from_millis)
}

/// Convert a window length into the millisecond argument of `PEXPIRE`.
///
/// Out-of-range values are refused before anything is sent: a negative or overflowing
/// expiry would delete the counter or leave it without a TTL.
pub(crate) fn ttl_millis(ttl: Duration) -> Result<i64> {
    match i64::try_from(ttl.as_millis()) {
        Ok(ms) if ms > 0 => Ok(ms),
        _ => Err(RateLimitError::Configuration(format!(
            "Window TTL {:?} is out of range for PEXPIRE",
            ttl
        ))),
    }
}

/// Errors from the connect step. Nothing has been counted yet, so an interrupted
/// connect is a plain connection failure rather than an indeterminate one.
pub(crate) fn connect_error(e: RateLimitError) -> RateLimitError {
    match e {
        RateLimitError::Timeout(limit) => RateLimitError::Connection(format!(
            "Timed out connecting to the store after {:?}",
            limit
        )),
        RateLimitError::Indeterminate(msg) => RateLimitError::Connection(msg),
        other => other,
    }
}

/// Convert an `INCR` reply into a count, rejecting impossible values.
pub(crate) fn count_from_reply(count: i64) -> Result<u64> {
    match u64::try_from(count) {
        Ok(count) if count > 0 => Ok(count),
        _ => Err(RateLimitError::Protocol(format!(
            "Expected a positive counter value, got {}",
            count
        ))),
    }
}
