use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, time::Duration};

use crate::{
    error::{RateLimitError, Result},
    limiter::DEFAULT_KEY_PREFIX,
};

/// Longest accepted window. The store computes `now + period` in signed milliseconds,
/// so the bound stays far below `i64::MAX`.
pub const MAX_PERIOD: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Number of calls admitted per period.
///
/// Validated on construction: `limit >= 1` and `1ms <= period <= MAX_PERIOD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRateSpec", into = "RawRateSpec")]
pub struct RateSpec {
    limit: u64,
    period: Duration,
}

/// Wire form of a [`RateSpec`] in configuration files
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RawRateSpec {
    limit: u64,
    period_ms: u64,
}

impl RateSpec {
    pub fn new(limit: u64, period: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(RateLimitError::Configuration(
                "Rate limit must admit at least one call".to_string(),
            ));
        }
        if period.as_millis() == 0 {
            return Err(RateLimitError::Configuration(
                "Rate limit period must be at least one millisecond".to_string(),
            ));
        }
        if period > MAX_PERIOD {
            return Err(RateLimitError::Configuration(format!(
                "Rate limit period must not exceed {}ms",
                MAX_PERIOD.as_millis()
            )));
        }
        Ok(Self { limit, period })
    }

    /// `limit` calls every `seconds` seconds
    pub fn per_seconds(limit: u64, seconds: u64) -> Result<Self> {
        Self::new(limit, Duration::from_secs(seconds))
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Period in whole milliseconds, the unit the store expiry is armed with
    pub fn period_ms(&self) -> u64 {
        u64::try_from(self.period.as_millis()).unwrap_or(u64::MAX)
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}ms", self.limit, self.period_ms())
    }
}

impl TryFrom<RawRateSpec> for RateSpec {
    type Error = RateLimitError;

    fn try_from(raw: RawRateSpec) -> Result<Self> {
        RateSpec::new(raw.limit, Duration::from_millis(raw.period_ms))
    }
}

impl From<RateSpec> for RawRateSpec {
    fn from(spec: RateSpec) -> Self {
        Self {
            limit: spec.limit,
            period_ms: spec.period_ms(),
        }
    }
}

/// Store client implementation backing a limiter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// `redis` crate, multiplexed `ConnectionManager`
    #[default]
    Redis,
    /// `fred` crate, round-robin client pool
    Fred,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Redis => write!(f, "redis"),
            Backend::Fred => write!(f, "fred"),
        }
    }
}

/// Store connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Connections opened by the fred pool; the redis backend multiplexes one connection.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default)]
    pub connection_timeout_ms: Option<u64>,
    #[serde(default)]
    pub command_timeout_ms: Option<u64>,
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            url: default_url(),
            username: None,
            password: None,
            pool_size: default_pool_size(),
            connection_timeout_ms: Some(5_000),
            command_timeout_ms: Some(1_000),
        }
    }
}

impl StoreConfig {
    pub fn connection_timeout(&self) -> Option<Duration> {
        self.connection_timeout_ms.map(Duration::from_millis)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(RateLimitError::Configuration(
                "Store URL must not be empty".to_string(),
            ));
        }
        if self.pool_size == 0 {
            return Err(RateLimitError::Configuration(
                "Store pool size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level settings shared by all limiters of a process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Named rate specifications, looked up with [`Settings::rate`]
    #[serde(default)]
    pub limits: HashMap<String, RateSpec>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            key_prefix: default_key_prefix(),
            limits: HashMap::new(),
        }
    }
}

impl Settings {
    /// Read settings from `RATELIMIT_*` environment variables, e.g.
    /// `RATELIMIT_STORE__URL` or `RATELIMIT_STORE__BACKEND=fred`.
    pub fn from_env() -> Result<Self> {
        Self::from_environment(
            config::Environment::with_prefix("RATELIMIT")
                .prefix_separator("_")
                .separator("__"),
        )
    }

    fn from_environment(environment: config::Environment) -> Result<Self> {
        let settings: Settings = config::Config::builder()
            .add_source(environment.try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| {
                RateLimitError::Configuration(format!("Failed to load settings: {}", e))
            })?;
        settings.store.validate()?;
        Ok(settings)
    }

    /// Look up a named rate specification
    pub fn rate(&self, name: &str) -> Result<RateSpec> {
        self.limits.get(name).copied().ok_or_else(|| {
            RateLimitError::Configuration(format!("No rate limit named '{}'", name))
        })
    }
}

/// Load settings from YAML string
pub fn load_settings_from_yaml(yaml: &str) -> Result<Settings> {
    let settings: Settings = serde_yaml::from_str(yaml).map_err(|e| {
        RateLimitError::Configuration(format!("Failed to parse YAML: {}", e))
    })?;
    settings.store.validate()?;
    Ok(settings)
}

/// Load settings from YAML file
pub fn load_settings_from_file(path: &str) -> Result<Settings> {
    let content = std::fs::read_to_string(path)?;
    load_settings_from_yaml(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_spec_validation() {
        assert!(RateSpec::per_seconds(3, 10).is_ok());
        assert!(matches!(
            RateSpec::per_seconds(0, 10),
            Err(RateLimitError::Configuration(_))
        ));
        assert!(matches!(
            RateSpec::new(3, Duration::ZERO),
            Err(RateLimitError::Configuration(_))
        ));
        assert!(matches!(
            RateSpec::new(3, Duration::from_micros(500)),
            Err(RateLimitError::Configuration(_))
        ));
    }

    #[test]
    fn test_rate_spec_rejects_unbounded_period() {
        assert_eq!(RateSpec::new(1, MAX_PERIOD).unwrap().period(), MAX_PERIOD);
        assert!(matches!(
            RateSpec::new(1, MAX_PERIOD + Duration::from_millis(1)),
            Err(RateLimitError::Configuration(_))
        ));
        assert!(matches!(
            RateSpec::per_seconds(3, u64::MAX),
            Err(RateLimitError::Configuration(_))
        ));

        let yaml = r#"
limits:
  typo:
    limit: 5
    period_ms: 10000000000000000000
"#;
        let result = load_settings_from_yaml(yaml);
        assert!(matches!(result, Err(RateLimitError::Configuration(msg)) if msg.contains("must not exceed")));
    }

    #[test]
    fn test_rate_spec_display() {
        let spec = RateSpec::per_seconds(1200, 60).unwrap();
        assert_eq!(spec.to_string(), "1200/60000ms");
    }

    #[test]
    fn test_load_settings_from_yaml() {
        let yaml = r#"
key_prefix: billing
store:
  backend: fred
  url: redis://cache.internal:6380
  password: hunter2
  pool_size: 8
  command_timeout_ms: 250
limits:
  invoices:
    limit: 100
    period_ms: 60000
"#;

        let settings = load_settings_from_yaml(yaml).unwrap();
        assert_eq!(settings.key_prefix, "billing");
        assert_eq!(settings.store.backend, Backend::Fred);
        assert_eq!(settings.store.url, "redis://cache.internal:6380");
        assert_eq!(settings.store.password.as_deref(), Some("hunter2"));
        assert_eq!(settings.store.pool_size, 8);
        assert_eq!(settings.store.command_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(settings.store.connection_timeout(), None);

        let invoices = settings.rate("invoices").unwrap();
        assert_eq!(invoices.limit(), 100);
        assert_eq!(invoices.period(), Duration::from_secs(60));
        assert!(settings.rate("missing").is_err());
    }

    #[test]
    fn test_yaml_defaults() {
        let settings = load_settings_from_yaml("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.key_prefix, DEFAULT_KEY_PREFIX);
        assert_eq!(settings.store.command_timeout(), Some(Duration::from_secs(1)));

        // Fields omitted inside an explicit store section fall back per field.
        let settings = load_settings_from_yaml("store:\n  url: redis://db:6379\n").unwrap();
        assert_eq!(settings.store.backend, Backend::Redis);
        assert_eq!(settings.store.pool_size, 4);
        assert_eq!(settings.store.command_timeout(), None);
    }

    #[test]
    fn test_invalid_rate_in_yaml_fails_fast() {
        let yaml = r#"
limits:
  broken:
    limit: 0
    period_ms: 1000
"#;
        let result = load_settings_from_yaml(yaml);
        assert!(matches!(result, Err(RateLimitError::Configuration(msg)) if msg.contains("at least one call")));
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let yaml = "store:\n  pool_size: 0\n";
        assert!(load_settings_from_yaml(yaml).is_err());
    }

    #[test]
    fn test_settings_from_environment() {
        let vars: HashMap<String, String> = [
            ("RATELIMIT_STORE__BACKEND", "fred"),
            ("RATELIMIT_STORE__URL", "redis://10.0.0.5:6379"),
            ("RATELIMIT_STORE__USERNAME", "limiter"),
            ("RATELIMIT_KEY_PREFIX", "edge"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let environment = config::Environment::with_prefix("RATELIMIT")
            .prefix_separator("_")
            .separator("__")
            .source(Some(vars));
        let settings = Settings::from_environment(environment).unwrap();

        assert_eq!(settings.store.backend, Backend::Fred);
        assert_eq!(settings.store.url, "redis://10.0.0.5:6379");
        assert_eq!(settings.store.username.as_deref(), Some("limiter"));
        assert_eq!(settings.key_prefix, "edge");
    }
}
