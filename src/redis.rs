use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, ErrorKind, IntoConnectionInfo, RedisError};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{
    config::StoreConfig,
    error::{RateLimitError, Result},
    store::{
        connect_error, count_from_reply, ttl_from_millis, ttl_millis, with_timeout, StoreClient,
        INCREMENT_AND_EXPIRE_LUA,
    },
};

/// Store client backed by the `redis` crate.
///
/// A single multiplexed [`ConnectionManager`] is shared by all callers; it reconnects
/// on its own after the connection drops.
pub struct RedisStore {
    connection: RwLock<Option<ConnectionManager>>,
    script: redis::Script,
    command_timeout: Option<Duration>,
}

impl RedisStore {
    /// Open a connection manager and check it with `PING`
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        info!("Creating Redis client for URL: {}", config.url);

        let mut connection_info = config
            .url
            .as_str()
            .into_connection_info()
            .map_err(map_redis_error)?;
        if config.username.is_some() {
            connection_info.redis.username = config.username.clone();
        }
        if config.password.is_some() {
            connection_info.redis.password = config.password.clone();
        }

        let client = redis::Client::open(connection_info).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            map_redis_error(e)
        })?;

        let connection = with_timeout(config.connection_timeout(), async {
            client.get_connection_manager().await.map_err(map_redis_error)
        })
        .await
        .map_err(connect_error)?;

        let store = Self {
            connection: RwLock::new(Some(connection)),
            script: redis::Script::new(INCREMENT_AND_EXPIRE_LUA),
            command_timeout: config.command_timeout(),
        };
        store.ping().await.map_err(|e| {
            warn!("Redis PING failed: {}", e);
            connect_error(e)
        })?;

        info!("Redis client initialized successfully");
        Ok(store)
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or_else(|| RateLimitError::Connection("connection closed".to_string()))
    }
}

#[async_trait]
impl StoreClient for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn increment_and_expire(&self, key: &str, ttl: Duration) -> Result<u64> {
        let ttl_ms = ttl_millis(ttl)?;
        let mut conn = self.connection().await?;

        // EVALSHA, loading the script first if the server does not know it yet
        let count: i64 = with_timeout(self.command_timeout, async {
            self.script
                .key(key)
                .arg(ttl_ms)
                .invoke_async(&mut conn)
                .await
                .map_err(map_redis_error)
        })
        .await?;

        count_from_reply(count)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.connection().await?;
        let pttl: i64 = with_timeout(self.command_timeout, async {
            conn.pttl(key).await.map_err(map_redis_error)
        })
        .await?;

        Ok(ttl_from_millis(pttl))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        with_timeout(self.command_timeout, async {
            redis::cmd("PING")
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(map_redis_error)
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        // Dropping the last manager clone shuts the multiplexed connection down.
        if self.connection.write().await.take().is_some() {
            info!("Redis connection closed");
        }
        Ok(())
    }
}

/// Translate a `redis` crate error into the crate taxonomy
pub(crate) fn map_redis_error(e: RedisError) -> RateLimitError {
    // The command may have reached the server before the client gave up on it.
    if e.is_timeout() {
        return RateLimitError::Indeterminate(format!("Redis command timed out: {}", e));
    }
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        return RateLimitError::Connection(e.to_string());
    }

    match e.kind() {
        ErrorKind::AuthenticationFailed => {
            RateLimitError::Connection(format!("Redis authentication failed: {}", e))
        }
        ErrorKind::InvalidClientConfig => RateLimitError::Configuration(e.to_string()),
        _ => RateLimitError::Protocol(e.to_string()),
    }
}
