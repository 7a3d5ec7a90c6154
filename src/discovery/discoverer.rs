//! Service discovery
//!
//! A `Discoverer` mirrors the store's contents under a set of watched
//! prefixes into a local `ServiceCache`. Each prefix is bootstrapped with
//! one consistent scan, then kept in sync by a background task applying
//! the watch stream. Duplicate subscriptions are de-duplicated by exact
//! prefix string; overlapping-but-unequal prefixes may double-deliver for
//! their intersection, which the idempotent cache absorbs.

use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cache::ServiceCache;
use crate::models::{RegistryError, RegistryResult};
use crate::store::{EventKind, KeyValueStore};

/// Maintains a local, concurrently readable view of registered services
pub struct Discoverer {
    store: Arc<dyn KeyValueStore>,
    cache: ServiceCache,
    // Keyed by prefix; None marks a subscription still being set up.
    watch_tasks: Mutex<HashMap<String, Option<JoinHandle<()>>>>,
    closed: AtomicBool,
    lost_tx: watch::Sender<bool>,
    lost_rx: watch::Receiver<bool>,
}

impl Discoverer {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let (lost_tx, lost_rx) = watch::channel(false);
        Discoverer {
            store,
            cache: ServiceCache::new(),
            watch_tasks: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            lost_tx,
            lost_rx,
        }
    }

    /// Scan the prefix into the cache, then keep it in sync from the watch
    /// stream. Watching the same prefix again is a no-op.
    ///
    /// The scan completes before the subscription starts; an event that
    /// races the scan is re-applied harmlessly because upsert and remove
    /// are idempotent.
    pub async fn watch_prefix(&self, prefix: &str) -> RegistryResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }

        {
            let mut tasks = self.watch_tasks.lock();
            if tasks.contains_key(prefix) {
                debug!(%prefix, "prefix already watched, skipping");
                return Ok(());
            }
            // Reserve the slot so a concurrent call for the same prefix
            // dedups instead of double-subscribing.
            tasks.insert(prefix.to_string(), None);
        }

        let result = self.subscribe(prefix).await;
        match result {
            Ok(handle) => {
                // close() may have drained the map while the scan ran
                if self.closed.load(Ordering::Acquire) {
                    handle.abort();
                    return Err(RegistryError::Closed);
                }
                self.watch_tasks
                    .lock()
                    .insert(prefix.to_string(), Some(handle));
                Ok(())
            }
            Err(e) => {
                self.watch_tasks.lock().remove(prefix);
                Err(e)
            }
        }
    }

    async fn subscribe(&self, prefix: &str) -> RegistryResult<JoinHandle<()>> {
        let pairs = self.store.get(prefix, true).await?;
        for kv in pairs {
            self.cache.upsert(kv.key, kv.value);
        }

        let mut events = self.store.watch(prefix, true).await?;
        info!(%prefix, entries = self.cache.len(), "watching prefix");

        let cache = self.cache.clone();
        let lost_tx = self.lost_tx.clone();
        let watched = prefix.to_string();

        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event.kind {
                    EventKind::Put => match event.value {
                        Some(value) => {
                            debug!(key = %event.key, %value, "service updated");
                            cache.upsert(event.key, value);
                        }
                        None => warn!(key = %event.key, "put event without value, ignoring"),
                    },
                    EventKind::Delete => {
                        debug!(key = %event.key, "service removed");
                        cache.remove(&event.key);
                    }
                }
            }
            // The store ended the stream: the view under this prefix stops
            // converging until a supervisor resubscribes.
            warn!(prefix = %watched, "watch stream closed");
            let _ = lost_tx.send(true);
        });

        Ok(handle)
    }

    /// Point-in-time copy of the cache grouped by service name.
    /// One independent address list per service, ordered by key.
    pub fn get_services(&self) -> HashMap<String, Vec<String>> {
        self.cache.services()
    }

    /// Point-in-time copy of the raw key→value entries
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.cache.snapshot()
    }

    /// Prefixes currently subscribed
    pub fn watched_prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self.watch_tasks.lock().keys().cloned().collect();
        prefixes.sort();
        prefixes
    }

    /// Receiver that flips to `true` when any watch stream terminates on
    /// its own. A supervising layer can await `changed()` and rebuild the
    /// discoverer against a fresh connection.
    pub fn lost(&self) -> watch::Receiver<bool> {
        self.lost_rx.clone()
    }

    /// Stop all subscriptions. The cache is frozen at its last contents:
    /// `get_services` and `snapshot` keep answering, `watch_prefix` fails
    /// with `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut tasks = self.watch_tasks.lock();
        for (prefix, handle) in tasks.drain() {
            if let Some(handle) = handle {
                handle.abort();
            }
            debug!(%prefix, "watch stopped");
        }
        info!("discoverer closed");
    }
}

impl Drop for Discoverer {
    fn drop(&mut self) {
        for (_, handle) in self.watch_tasks.lock().drain() {
            if let Some(handle) = handle {
                handle.abort();
            }
        }
    }
}

impl std::fmt::Debug for Discoverer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discoverer")
            .field("entries", &self.cache.len())
            .field("prefixes", &self.watched_prefixes())
            .finish_non_exhaustive()
    }
}
