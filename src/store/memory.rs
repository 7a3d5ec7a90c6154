//! In-process store backend
//!
//! Implements the full `KeyValueStore` contract without a network: leased
//! keys really expire (a sweeper task deletes them and emits synthetic
//! Delete events) and watches really stream. Used by the test suite and as
//! a local development backend.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

use super::{Event, EventStream, KeepAliveAck, KeepAliveStream, KeyValue, KeyValueStore, LeaseId};
use crate::models::{RegistryError, RegistryResult};

/// How often the sweeper checks for expired leases
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

struct StoredValue {
    value: String,
    lease: Option<LeaseId>,
}

struct LeaseState {
    ttl: Duration,
    deadline: Instant,
}

struct WatchSub {
    key: String,
    with_prefix: bool,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, StoredValue>,
    leases: HashMap<LeaseId, LeaseState>,
    watchers: Vec<WatchSub>,
    next_lease: LeaseId,
}

impl Inner {
    fn notify(&mut self, event: Event) {
        self.watchers.retain(|w| {
            let matches = if w.with_prefix {
                event.key.starts_with(&w.key)
            } else {
                event.key == w.key
            };
            if !matches {
                return true;
            }
            // A failed send means the subscriber is gone
            w.tx.send(event.clone()).is_ok()
        });
    }

    /// Delete every key bound to the lease, emitting Delete events.
    fn drop_lease_keys(&mut self, lease: LeaseId) {
        let keys: Vec<String> = self
            .data
            .iter()
            .filter(|(_, v)| v.lease == Some(lease))
            .map(|(k, _)| k.clone())
            .collect();

        for key in keys {
            self.data.remove(&key);
            self.notify(Event::delete(key));
        }
    }
}

/// In-memory store with real lease expiry
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create an empty store. Spawns the expiry sweeper, so this must run
    /// inside a tokio runtime.
    pub fn new() -> Self {
        let inner = Arc::new(Mutex::new(Inner::default()));
        Self::spawn_sweeper(Arc::downgrade(&inner));
        MemoryStore { inner }
    }

    /// Whether a lease is still live. Intended for assertions in tests and
    /// diagnostics; the production backend has no equivalent.
    pub fn has_lease(&self, lease: LeaseId) -> bool {
        self.inner.lock().leases.contains_key(&lease)
    }

    fn spawn_sweeper(inner: Weak<Mutex<Inner>>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else { break };

                let mut guard = inner.lock();
                let now = Instant::now();
                let expired: Vec<LeaseId> = guard
                    .leases
                    .iter()
                    .filter(|(_, state)| state.deadline <= now)
                    .map(|(id, _)| *id)
                    .collect();

                for lease in expired {
                    debug!(lease, "lease expired");
                    guard.leases.remove(&lease);
                    guard.drop_lease_keys(lease);
                }
            }
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str, with_prefix: bool) -> RegistryResult<Vec<KeyValue>> {
        let guard = self.inner.lock();
        let pairs = guard
            .data
            .iter()
            .filter(|(k, _)| {
                if with_prefix {
                    k.starts_with(key)
                } else {
                    k.as_str() == key
                }
            })
            .map(|(k, v)| KeyValue {
                key: k.clone(),
                value: v.value.clone(),
            })
            .collect();
        Ok(pairs)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> RegistryResult<()> {
        let mut guard = self.inner.lock();

        if let Some(id) = lease {
            if !guard.leases.contains_key(&id) {
                return Err(RegistryError::write(key, format!("lease {id} not found")));
            }
        }

        guard.data.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                lease,
            },
        );
        guard.notify(Event::put(key, value));
        Ok(())
    }

    async fn grant_lease(&self, ttl_secs: i64) -> RegistryResult<LeaseId> {
        if ttl_secs <= 0 {
            return Err(RegistryError::LeaseGrant(format!(
                "ttl must be positive, got {ttl_secs}"
            )));
        }

        let mut guard = self.inner.lock();
        guard.next_lease += 1;
        let id = guard.next_lease;
        let ttl = Duration::from_secs(ttl_secs as u64);
        guard.leases.insert(
            id,
            LeaseState {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> RegistryResult<KeepAliveStream> {
        let ttl = {
            let guard = self.inner.lock();
            match guard.leases.get(&lease) {
                Some(state) => state.ttl,
                None => {
                    return Err(RegistryError::LeaseGrant(format!("lease {lease} not found")))
                }
            }
        };

        let (tx, rx) = mpsc::channel(16);
        let inner = Arc::downgrade(&self.inner);
        let interval = (ttl / 3).max(Duration::from_millis(10));

        // Renewal loop standing in for the store client's own cadence.
        // Dropping the returned stream stops renewal, so the lease runs out.
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else { break };

                let renewed = {
                    let mut guard = inner.lock();
                    match guard.leases.get_mut(&lease) {
                        Some(state) => {
                            state.deadline = Instant::now() + state.ttl;
                            true
                        }
                        None => false,
                    }
                };

                if !renewed {
                    trace!(lease, "lease gone, closing keepalive stream");
                    break;
                }

                let ack = KeepAliveAck {
                    lease,
                    ttl_secs: ttl.as_secs() as i64,
                };
                // A slow ack consumer must not stall renewal; only a
                // dropped receiver ends the loop.
                match tx.try_send(ack) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn revoke_lease(&self, lease: LeaseId) -> RegistryResult<()> {
        let mut guard = self.inner.lock();
        if guard.leases.remove(&lease).is_none() {
            return Err(RegistryError::Revoke(format!("lease {lease} not found")));
        }
        guard.drop_lease_keys(lease);
        Ok(())
    }

    async fn watch(&self, key: &str, with_prefix: bool) -> RegistryResult<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().watchers.push(WatchSub {
            key: key.to_string(),
            with_prefix,
            tx,
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.inner.lock();
        f.debug_struct("MemoryStore")
            .field("keys", &guard.data.len())
            .field("leases", &guard.leases.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventKind;
    use futures::StreamExt;
    use tokio::time::{advance, timeout};

    #[tokio::test]
    async fn test_prefix_scan_is_ordered() {
        let store = MemoryStore::new();
        store.put("/svc/b", "2", None).await.unwrap();
        store.put("/svc/a", "1", None).await.unwrap();
        store.put("/other/x", "9", None).await.unwrap();

        let pairs = store.get("/svc/", true).await.unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].key, "/svc/a");
        assert_eq!(pairs[1].key, "/svc/b");

        let exact = store.get("/svc/a", false).await.unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].value, "1");
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails() {
        let store = MemoryStore::new();
        let err = store.put("/svc/a", "1", Some(42)).await.unwrap_err();
        assert!(matches!(err, RegistryError::Write { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrenewed_lease_expires_and_deletes_key() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(2).await.unwrap();
        store.put("/svc/a", "addr", Some(lease)).await.unwrap();

        let mut events = store.watch("/svc/", true).await.unwrap();

        // No keepalive: the key must be gone within the TTL bound.
        advance(Duration::from_secs(3)).await;

        let event = timeout(Duration::from_secs(1), events.next())
            .await
            .expect("expected an expiry event")
            .unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert_eq!(event.key, "/svc/a");
        assert!(!store.has_lease(lease));
        assert!(store.get("/svc/a", false).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_holds_lease_open() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(2).await.unwrap();
        store.put("/svc/a", "addr", Some(lease)).await.unwrap();

        let mut acks = store.keep_alive(lease).await.unwrap();

        // Well past the TTL, but the renewal loop keeps extending it.
        for _ in 0..10 {
            advance(Duration::from_secs(1)).await;
        }
        let ack = acks.next().await.unwrap();
        assert_eq!(ack.lease, lease);

        assert!(store.has_lease(lease));
        assert_eq!(store.get("/svc/a", false).await.unwrap().len(), 1);

        // Dropping the ack stream stops renewal; expiry follows.
        drop(acks);
        advance(Duration::from_secs(5)).await;
        assert!(!store.has_lease(lease));
    }

    #[tokio::test]
    async fn test_revoke_deletes_bound_keys_and_notifies() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(10).await.unwrap();
        store.put("/svc/a", "1", Some(lease)).await.unwrap();
        store.put("/svc/b", "2", Some(lease)).await.unwrap();
        store.put("/svc/c", "3", None).await.unwrap();

        let mut events = store.watch("/svc/", true).await.unwrap();
        store.revoke_lease(lease).await.unwrap();

        let first = events.next().await.unwrap();
        let second = events.next().await.unwrap();
        assert!(first.kind == EventKind::Delete && second.kind == EventKind::Delete);
        let mut deleted = vec![first.key, second.key];
        deleted.sort();
        assert_eq!(deleted, vec!["/svc/a", "/svc/b"]);

        // Unleased key survives
        assert_eq!(store.get("/svc/c", false).await.unwrap().len(), 1);

        let err = store.revoke_lease(lease).await.unwrap_err();
        assert!(matches!(err, RegistryError::Revoke(_)));
    }

    #[tokio::test]
    async fn test_watch_delivers_per_key_order() {
        let store = MemoryStore::new();
        let mut events = store.watch("/svc/a", false).await.unwrap();

        store.put("/svc/a", "v1", None).await.unwrap();
        store.put("/svc/b", "other", None).await.unwrap();
        store.put("/svc/a", "v2", None).await.unwrap();

        let first = events.next().await.unwrap();
        let second = events.next().await.unwrap();
        assert_eq!(first.value.as_deref(), Some("v1"));
        assert_eq!(second.value.as_deref(), Some("v2"));
    }
}
