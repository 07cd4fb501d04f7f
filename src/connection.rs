use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    metrics::Metrics,
    store::{Connector, StoreClient},
};

/// One store connection per limiter, opened on first use.
///
/// The connection is reused by every call made through the owning limiter and closed
/// by [`LazyConnection::close`], or on drop if it is still open.
pub struct LazyConnection {
    connector: Arc<dyn Connector>,
    slot: Mutex<Option<Arc<dyn StoreClient>>>,
    metrics: Option<Arc<Metrics>>,
}

impl LazyConnection {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            slot: Mutex::new(None),
            metrics: None,
        }
    }

    pub(crate) fn set_metrics(&mut self, metrics: Arc<Metrics>) {
        self.metrics = Some(metrics);
    }

    /// The open client, connecting first if needed.
    ///
    /// Concurrent first callers wait for a single connection attempt. A failed attempt
    /// leaves the slot empty, so the next call tries again.
    pub async fn get(&self) -> Result<Arc<dyn StoreClient>> {
        let mut slot = self.slot.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        debug!("Opening store connection");
        let client = self.connector.connect().await?;
        info!("Store connection established ({})", client.backend());
        if let Some(metrics) = &self.metrics {
            metrics.connection_opened(client.backend());
        }

        *slot = Some(client.clone());
        Ok(client)
    }

    pub async fn is_connected(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Close the connection if one is open. A later [`get`](Self::get) reconnects.
    pub async fn close(&self) -> Result<()> {
        let client = self.slot.lock().await.take();
        match client {
            Some(client) => {
                if let Some(metrics) = &self.metrics {
                    metrics.connection_closed(client.backend());
                }
                client.close().await
            }
            None => Ok(()),
        }
    }
}

impl Drop for LazyConnection {
    fn drop(&mut self) {
        let Some(client) = self.slot.get_mut().take() else {
            return;
        };
        if let Some(metrics) = &self.metrics {
            metrics.connection_closed(client.backend());
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.close().await {
                        warn!("Failed to close store connection on drop: {}", e);
                    }
                });
            }
            Err(_) => {
                warn!("Store connection dropped outside a tokio runtime; closing without QUIT");
            }
        }
    }
}
