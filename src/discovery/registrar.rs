//! Service registration
//!
//! A `Registrar` keeps one instance's address alive in the store: it owns
//! a lease, binds its key to it, and consumes the renewal-ack stream in a
//! background task. When that stream closes the instance is no longer
//! discoverable; the registrar surfaces this through a done signal instead
//! of retrying, leaving reconnect policy to the caller.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::RegistryResult;
use crate::store::{KeyValueStore, LeaseId};

/// Keeps one service instance registered for as long as its lease renews
pub struct Registrar {
    store: Arc<dyn KeyValueStore>,
    lease_id: LeaseId,
    key: String,
    value: String,
    renewal_task: JoinHandle<()>,
    done_rx: watch::Receiver<bool>,
}

impl Registrar {
    /// Grant a lease, bind `(key, value)` to it and start the renewal loop.
    ///
    /// If the bound put or the keepalive setup fails, the granted lease is
    /// revoked before the error is returned, so no half-registered state
    /// is left behind.
    pub async fn register(
        store: Arc<dyn KeyValueStore>,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl_secs: i64,
    ) -> RegistryResult<Self> {
        let key = key.into();
        let value = value.into();

        let lease_id = store.grant_lease(ttl_secs).await?;

        if let Err(e) = store.put(&key, &value, Some(lease_id)).await {
            rollback(&store, lease_id).await;
            return Err(e);
        }

        let mut acks = match store.keep_alive(lease_id).await {
            Ok(acks) => acks,
            Err(e) => {
                rollback(&store, lease_id).await;
                return Err(e);
            }
        };

        let (done_tx, done_rx) = watch::channel(false);
        let task_key = key.clone();

        let renewal_task = tokio::spawn(async move {
            use futures::StreamExt;

            while let Some(ack) = acks.next().await {
                debug!(key = %task_key, lease = ack.lease, ttl = ack.ttl_secs, "lease renewed");
            }
            // Stream close means the lease is gone or the store is
            // unreachable; either way this instance will drop out of the
            // registry within one TTL.
            warn!(key = %task_key, lease = lease_id, "renewal stream closed");
            let _ = done_tx.send(true);
        });

        info!(%key, %value, lease = lease_id, ttl = ttl_secs, "service registered");

        Ok(Registrar {
            store,
            lease_id,
            key,
            value,
            renewal_task,
            done_rx,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    /// Receiver that flips to `true` when the renewal loop terminates.
    /// A supervising layer can await `changed()` and decide whether to
    /// re-register with a fresh lease.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// Whether the renewal loop has already terminated
    pub fn is_done(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Deregister: stop the renewal loop and revoke the lease, which
    /// deletes the bound key synchronously.
    pub async fn close(self) -> RegistryResult<()> {
        self.renewal_task.abort();
        self.store.revoke_lease(self.lease_id).await?;
        info!(key = %self.key, lease = self.lease_id, "service deregistered");
        Ok(())
    }
}

impl Drop for Registrar {
    /// Dropping without `close` stops renewal; the record then expires in
    /// the store within one TTL, which watchers observe as a delete.
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}

impl std::fmt::Debug for Registrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registrar")
            .field("key", &self.key)
            .field("lease_id", &self.lease_id)
            .finish_non_exhaustive()
    }
}

async fn rollback(store: &Arc<dyn KeyValueStore>, lease_id: LeaseId) {
    if let Err(e) = store.revoke_lease(lease_id).await {
        warn!(lease = lease_id, error = %e, "failed to revoke lease during rollback");
    }
}
