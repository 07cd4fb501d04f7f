#![allow(dead_code)]

use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::time::Instant;

use window_ratelimit::{Connector, Result, StoreClient};

struct Entry {
    count: u64,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    increments: AtomicUsize,
}

/// Store double with the same atomic increment-and-expire semantics as the Lua script.
///
/// Expiry follows tokio's clock, so tests can run with paused time. Clones share state,
/// which is how several limiters simulate processes sharing one store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live counter value for `key`, honouring expiry
    pub fn count(&self, key: &str) -> Option<u64> {
        let mut entries = self.inner.entries.lock().unwrap();
        purge_expired(&mut entries, key);
        entries.get(key).map(|e| e.count)
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    pub fn increments(&self) -> usize {
        self.inner.increments.load(Ordering::SeqCst)
    }
}

fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str) {
    let expired = entries
        .get(key)
        .and_then(|e| e.expires_at)
        .map_or(false, |at| at <= Instant::now());
    if expired {
        entries.remove(key);
    }
}

#[async_trait]
impl Connector for MemoryStore {
    async fn connect(&self) -> Result<Arc<dyn StoreClient>> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn increment_and_expire(&self, key: &str, ttl: Duration) -> Result<u64> {
        // Let other callers run between round-trips, as a network hop would.
        tokio::task::yield_now().await;

        self.inner.increments.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.inner.entries.lock().unwrap();
        purge_expired(&mut entries, key);

        let entry = entries.entry(key.to_string()).or_insert(Entry {
            count: 0,
            expires_at: None,
        });
        entry.count += 1;
        if entry.count == 1 || entry.expires_at.is_none() {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(entry.count)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut entries = self.inner.entries.lock().unwrap();
        purge_expired(&mut entries, key);
        Ok(entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
