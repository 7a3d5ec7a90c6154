//! etcd-backed store
//!
//! Thin adapter from the `KeyValueStore` contract onto `etcd-client`.
//! Connecting retries with exponential backoff; everything after the dial
//! is a single call that surfaces its error to the caller.

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace, warn};

use super::{Event, EventStream, KeepAliveAck, KeepAliveStream, KeyValue, KeyValueStore, LeaseId};
use crate::config::StoreSettings;
use crate::models::{RegistryError, RegistryResult};

/// Store backend speaking the etcd v3 API
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to etcd with exponential backoff.
    ///
    /// Retries transient dial failures until `backoff_max_elapsed_secs` is
    /// exhausted, then fails with `Connection`.
    pub async fn connect(endpoints: &[String], settings: &StoreSettings) -> RegistryResult<Self> {
        let options = ConnectOptions::new().with_connect_timeout(settings.dial_timeout());

        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(settings.backoff_initial_ms),
            max_interval: Duration::from_millis(settings.backoff_max_ms),
            max_elapsed_time: Some(Duration::from_secs(settings.backoff_max_elapsed_secs)),
            multiplier: settings.backoff_multiplier,
            ..Default::default()
        };

        let client = retry(backoff, || async {
            match Client::connect(endpoints, Some(options.clone())).await {
                Ok(client) => {
                    debug!("Connected to etcd");
                    Ok(client)
                }
                Err(e) => {
                    warn!(error = %e, "etcd connection failed, retrying");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await
        .map_err(|e| RegistryError::Connection(format!("failed to connect to etcd: {e}")))?;

        Ok(EtcdStore { client })
    }
}

#[async_trait]
impl KeyValueStore for EtcdStore {
    async fn get(&self, key: &str, with_prefix: bool) -> RegistryResult<Vec<KeyValue>> {
        let options = with_prefix.then(|| GetOptions::new().with_prefix());

        let response = self
            .client
            .kv_client()
            .get(key, options)
            .await
            .map_err(|e| RegistryError::Connection(format!("get {key} failed: {e}")))?;

        let mut pairs = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            pairs.push(KeyValue {
                key: kv
                    .key_str()
                    .map_err(|e| RegistryError::Connection(format!("non-utf8 key: {e}")))?
                    .to_string(),
                value: kv
                    .value_str()
                    .map_err(|e| RegistryError::Connection(format!("non-utf8 value: {e}")))?
                    .to_string(),
            });
        }
        Ok(pairs)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> RegistryResult<()> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));

        self.client
            .kv_client()
            .put(key, value, options)
            .await
            .map_err(|e| RegistryError::write(key, e.to_string()))?;
        Ok(())
    }

    async fn grant_lease(&self, ttl_secs: i64) -> RegistryResult<LeaseId> {
        let response = self
            .client
            .lease_client()
            .grant(ttl_secs, None)
            .await
            .map_err(|e| RegistryError::LeaseGrant(e.to_string()))?;
        Ok(response.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> RegistryResult<KeepAliveStream> {
        let mut lease_client = self.client.lease_client();

        // etcd leaves the renewal cadence to the client; query the granted
        // TTL and renew at a third of it, like the Go client does.
        let ttl = lease_client
            .time_to_live(lease, None)
            .await
            .map_err(|e| RegistryError::LeaseGrant(format!("lease {lease} ttl lookup: {e}")))?
            .granted_ttl();

        let (mut keeper, mut acks) = lease_client
            .keep_alive(lease)
            .await
            .map_err(|e| RegistryError::LeaseGrant(format!("keepalive for lease {lease}: {e}")))?;

        let (tx, rx) = mpsc::channel(16);
        let interval = Duration::from_secs((ttl / 3).max(1) as u64);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate first tick

            loop {
                ticker.tick().await;

                if let Err(e) = keeper.keep_alive().await {
                    warn!(lease, error = %e, "keepalive send failed");
                    break;
                }

                match acks.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        trace!(lease, ttl = resp.ttl(), "keepalive ack");
                        let ack = KeepAliveAck {
                            lease,
                            ttl_secs: resp.ttl(),
                        };
                        if tx.send(ack).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(_)) => {
                        // TTL of zero means the lease no longer exists
                        warn!(lease, "lease expired or revoked");
                        break;
                    }
                    Ok(None) => {
                        warn!(lease, "keepalive stream closed by store");
                        break;
                    }
                    Err(e) => {
                        warn!(lease, error = %e, "keepalive stream failed");
                        break;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn revoke_lease(&self, lease: LeaseId) -> RegistryResult<()> {
        self.client
            .lease_client()
            .revoke(lease)
            .await
            .map_err(|e| RegistryError::Revoke(e.to_string()))?;
        Ok(())
    }

    async fn watch(&self, key: &str, with_prefix: bool) -> RegistryResult<EventStream> {
        let options = with_prefix.then(|| WatchOptions::new().with_prefix());

        let (watcher, mut responses) = self
            .client
            .watch_client()
            .watch(key, options)
            .await
            .map_err(|e| RegistryError::watch(key, e.to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        let watched = key.to_string();

        tokio::spawn(async move {
            // The watcher handle must outlive the stream or etcd cancels it.
            let _watcher = watcher;

            loop {
                let response = match responses.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => {
                        warn!(prefix = %watched, "watch stream closed by store");
                        break;
                    }
                    Err(e) => {
                        warn!(prefix = %watched, error = %e, "watch stream failed");
                        break;
                    }
                };

                for ev in response.events() {
                    let Some(kv) = ev.kv() else { continue };
                    let Ok(key) = kv.key_str() else {
                        warn!(prefix = %watched, "skipping event with non-utf8 key");
                        continue;
                    };

                    let event = match ev.event_type() {
                        EventType::Put => match kv.value_str() {
                            Ok(value) => Event::put(key, value),
                            Err(_) => {
                                warn!(%key, "skipping put event with non-utf8 value");
                                continue;
                            }
                        },
                        EventType::Delete => Event::delete(key),
                    };

                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore").finish_non_exhaustive()
    }
}
