use std::{fmt, ops::Deref, sync::Arc};

use crate::{
    config::RateSpec,
    error::{RateLimitError, Result},
};

/// Longest accepted [`RateLimitKey`], in bytes
pub const MAX_KEY_LEN: usize = 1024;

/// Identity of a protected resource.
///
/// Every process protecting the same logical resource must use the same key; keeping
/// keys unique within a store keyspace is up to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RateLimitKey(Arc<str>);

impl RateLimitKey {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        Self::try_from(value.into())
    }

    /// Key named after the Rust type path of a function item, e.g.
    /// `billing::invoices::send`.
    ///
    /// Stable across processes running the same build. Closures get compiler-generated
    /// names that include their enclosing function, so prefer named functions here.
    pub fn for_fn<F>(_function: &F) -> Self {
        Self(Arc::from(std::any::type_name::<F>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for RateLimitKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RateLimitKey {
    type Error = RateLimitError;

    fn try_from(value: String) -> Result<Self> {
        if value.is_empty() {
            Err(RateLimitError::Configuration(
                "Rate limit key must not be empty".to_string(),
            ))
        } else if value.len() > MAX_KEY_LEN {
            Err(RateLimitError::Configuration(format!(
                "Rate limit key must not be longer than {} bytes",
                MAX_KEY_LEN
            )))
        } else {
            Ok(Self(Arc::from(value)))
        }
    }
}

impl TryFrom<&str> for RateLimitKey {
    type Error = RateLimitError;

    fn try_from(value: &str) -> Result<Self> {
        Self::try_from(value.to_string())
    }
}

/// Derive the store key holding the window counter for `key` under `spec`.
///
/// The rate specification is part of the key, so changing a limit starts a fresh
/// counter instead of reinterpreting an old one. There is no time-bucket component:
/// a window starts at the first increment and ends when the store expires the key.
pub fn store_key(prefix: &str, key: &RateLimitKey, spec: &RateSpec) -> String {
    if prefix.is_empty() {
        format!("{}:{}", key, spec)
    } else {
        format!("{}:{}:{}", prefix, key, spec)
    }
}
