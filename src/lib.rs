//! Window Rate Limit
//!
//! A distributed rate limiter for async call sites. Each limiter admits at most `limit`
//! calls per `period` for a key, across every process sharing the same Redis-compatible
//! store. The counter and its expiry live in the store and are updated by one atomic
//! server-side script, so no client-side locking is involved.
//!
//! Two store clients are supported behind one interface, selected by
//! [`StoreConfig::backend`]: the `redis` crate and the `fred` crate.

pub mod config;
pub mod connection;
pub mod error;
pub mod fred;
pub mod keys;
pub mod limiter;
pub mod metrics;
pub mod redis;
pub mod store;
pub mod window;

// Re-export main types
pub use crate::config::{load_settings_from_file, load_settings_from_yaml, Backend, RateSpec, Settings, StoreConfig};
pub use crate::error::{RateLimitError, Result};
pub use crate::keys::RateLimitKey;
pub use crate::limiter::{rate_limit, Permit, RateLimited, RateLimiter};
pub use crate::metrics::Metrics;
pub use crate::store::{Connector, StoreClient};
pub use crate::window::Decision;
