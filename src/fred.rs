use async_trait::async_trait;
use fred::prelude::{
    Builder, ClientLike, Config, Error as FredError, ErrorKind as FredErrorKind, KeysInterface,
    LuaInterface, Pool,
};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tracing::{info, warn};

use crate::{
    config::StoreConfig,
    error::{RateLimitError, Result},
    store::{
        connect_error, count_from_reply, ttl_from_millis, ttl_millis, with_timeout, StoreClient,
        INCREMENT_AND_EXPIRE_LUA,
    },
};

/// Store client backed by a `fred` connection pool.
///
/// Commands are spread round-robin over `pool_size` connections.
pub struct FredStore {
    pool: Pool,
    closed: AtomicBool,
    command_timeout: Option<Duration>,
}

impl FredStore {
    /// Build the pool, connect every client and check the pool with `PING`
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        info!(
            "Creating fred pool of {} connections for URL: {}",
            config.pool_size, config.url
        );

        let mut fred_config = Config::from_url(&config.url).map_err(map_fred_error)?;
        if config.username.is_some() {
            fred_config.username = config.username.clone();
        }
        if config.password.is_some() {
            fred_config.password = config.password.clone();
        }

        let mut builder = Builder::from_config(fred_config);
        if let Some(timeout) = config.connection_timeout() {
            builder.with_connection_config(|connection| {
                connection.connection_timeout = timeout;
            });
        }
        let pool = builder.build_pool(config.pool_size).map_err(map_fred_error)?;

        // `init` spawns the connection tasks before it resolves. Until the pool is handed
        // out, any exit from this function, including the future being dropped, must quit it.
        let mut guard = QuitOnDrop::new(pool.clone());

        let init = with_timeout(config.connection_timeout(), async {
            pool.init().await.map_err(map_fred_error)
        })
        .await;
        if let Err(e) = init {
            warn!("Failed to initialize fred pool: {}", e);
            guard.quit().await;
            return Err(connect_error(e));
        }

        let store = Self {
            pool,
            closed: AtomicBool::new(false),
            command_timeout: config.command_timeout(),
        };
        if let Err(e) = store.ping().await {
            warn!("fred PING failed: {}", e);
            guard.quit().await;
            return Err(connect_error(e));
        }

        guard.disarm();
        info!("fred pool initialized successfully");
        Ok(store)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(RateLimitError::Connection("connection closed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StoreClient for FredStore {
    fn backend(&self) -> &'static str {
        "fred"
    }

    async fn increment_and_expire(&self, key: &str, ttl: Duration) -> Result<u64> {
        self.ensure_open()?;
        let ttl_ms = ttl_millis(ttl)?;

        let count: i64 = with_timeout(self.command_timeout, async {
            self.pool
                .eval(INCREMENT_AND_EXPIRE_LUA, key, vec![ttl_ms])
                .await
                .map_err(map_fred_error)
        })
        .await?;

        count_from_reply(count)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.ensure_open()?;
        let pttl: i64 = with_timeout(self.command_timeout, async {
            self.pool.pttl(key).await.map_err(map_fred_error)
        })
        .await?;

        Ok(ttl_from_millis(pttl))
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_open()?;
        with_timeout(self.command_timeout, async {
            self.pool.ping::<()>(None).await.map_err(map_fred_error)
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.pool.quit().await.map_err(map_fred_error)?;
        info!("fred pool closed");
        Ok(())
    }
}

const QUIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Quits a pool that never made it out of [`FredStore::connect`].
struct QuitOnDrop {
    pool: Option<Pool>,
}

impl QuitOnDrop {
    fn new(pool: Pool) -> Self {
        Self { pool: Some(pool) }
    }

    async fn quit(&mut self) {
        if let Some(pool) = self.pool.take() {
            quit_abandoned(pool).await;
        }
    }

    fn disarm(&mut self) {
        self.pool = None;
    }
}

impl Drop for QuitOnDrop {
    fn drop(&mut self) {
        let Some(pool) = self.pool.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(quit_abandoned(pool));
            }
            Err(_) => {
                warn!("fred pool abandoned outside a tokio runtime; connections not quit");
            }
        }
    }
}

async fn quit_abandoned(pool: Pool) {
    match tokio::time::timeout(QUIT_TIMEOUT, pool.quit()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to quit fred pool: {}", e),
        Err(_) => warn!("Timed out quitting fred pool after {:?}", QUIT_TIMEOUT),
    }
}

/// Translate a `fred` error into the crate taxonomy
pub(crate) fn map_fred_error(e: FredError) -> RateLimitError {
    match e.kind() {
        FredErrorKind::Config | FredErrorKind::Url => RateLimitError::Configuration(e.to_string()),
        // The command may have been written before fred gave up on it.
        FredErrorKind::Timeout | FredErrorKind::Canceled => {
            RateLimitError::Indeterminate(e.to_string())
        }
        FredErrorKind::IO
        | FredErrorKind::Auth
        | FredErrorKind::Routing
        | FredErrorKind::Cluster
        | FredErrorKind::Sentinel
        | FredErrorKind::Backpressure => RateLimitError::Connection(e.to_string()),
        _ => RateLimitError::Protocol(e.to_string()),
    }
}
