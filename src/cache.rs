use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::debug;

/// A complete upstream response held for later delivery: either an aggregated
/// disconnect-recovery result (keyed by request id, consumed exactly once via
/// `take`) or a dedup entry (keyed by content fingerprint, re-readable via
/// `get` until TTL expiry).
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

struct Slot {
    entry: CachedResponse,
    expires_at: Instant,
    generation: u64,
}

/// In-memory TTL cache. The runtime is multi-threaded, so the map sits behind
/// a mutex to keep the same consistency guarantees the single-threaded
/// original got for free; `take` is atomic, so at most one caller ever
/// observes a given entry.
pub struct ResultCache {
    entries: Mutex<HashMap<String, Slot>>,
    generation: AtomicU64,
}

impl ResultCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        })
    }

    pub async fn put(self: &Arc<Self>, key: String, entry: CachedResponse, ttl: Duration) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let expires_at = Instant::now() + ttl;
        self.entries.lock().await.insert(
            key.clone(),
            Slot {
                entry,
                expires_at,
                generation,
            },
        );

        // Per-entry expiry timer. The generation check keeps a stale timer
        // from deleting a newer entry stored under the same key.
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            sleep(ttl).await;
            let mut entries = cache.entries.lock().await;
            if entries
                .get(&key)
                .is_some_and(|slot| slot.generation == generation)
            {
                entries.remove(&key);
                debug!("cache entry expired: {key}");
            }
        });
    }

    /// Non-destructive lookup. Absent or expired keys are simply `None`.
    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|slot| slot.expires_at > Instant::now())
            .map(|slot| slot.entry.clone())
    }

    /// Read-and-delete. A second `take` on the same key always reports
    /// not-found.
    pub async fn take(&self, key: &str) -> Option<CachedResponse> {
        let mut entries = self.entries.lock().await;
        match entries.remove(key) {
            Some(slot) if slot.expires_at > Instant::now() => Some(slot.entry),
            _ => None,
        }
    }
}
