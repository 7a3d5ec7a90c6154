//! Abstract key-value store interface
//!
//! The registry client only assumes a store offering linearizable get/put
//! with prefix scans, time-limited leases with a keepalive stream, and
//! per-key-ordered watch events. `EtcdStore` is the production backend;
//! `MemoryStore` implements the same contract in-process for tests and
//! local development.

mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::models::RegistryResult;

/// Opaque lease handle issued by the store
pub type LeaseId = i64;

/// One key-value pair as returned by a read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Kind of a watch event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Put,
    Delete,
}

/// A single create/update/delete notification under a watched prefix.
///
/// Delete events carry no value; lease expiry surfaces as a synthetic
/// Delete for every key bound to the expired lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub key: String,
    pub value: Option<String>,
}

impl Event {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Event {
            kind: EventKind::Put,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Event {
            kind: EventKind::Delete,
            key: key.into(),
            value: None,
        }
    }
}

/// One acknowledged lease renewal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveAck {
    pub lease: LeaseId,
    pub ttl_secs: i64,
}

/// Stream of watch events; closes only on connection loss or store shutdown
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Stream of renewal acknowledgements; closes on connection loss or revoke
pub type KeepAliveStream = Pin<Box<dyn Stream<Item = KeepAliveAck> + Send>>;

/// Store operations the registry client depends on.
///
/// Connections are released when the implementing value is dropped.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read one key, or all keys under a prefix when `with_prefix` is set.
    /// Results are ordered by key.
    async fn get(&self, key: &str, with_prefix: bool) -> RegistryResult<Vec<KeyValue>>;

    /// Write a key, optionally bound to a lease. A leased key is deleted
    /// by the store when its lease expires or is revoked.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> RegistryResult<()>;

    /// Request a new lease with the given TTL.
    async fn grant_lease(&self, ttl_secs: i64) -> RegistryResult<LeaseId>;

    /// Start renewing a lease. The backend drives the renewal cadence
    /// (TTL/3) itself; the returned stream yields one ack per renewal and
    /// ends when the lease is gone or the connection is lost.
    async fn keep_alive(&self, lease: LeaseId) -> RegistryResult<KeepAliveStream>;

    /// Revoke a lease, deleting every key bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> RegistryResult<()>;

    /// Subscribe to events for one key, or for all keys under a prefix
    /// when `with_prefix` is set. Events for a single key arrive in store
    /// order.
    async fn watch(&self, key: &str, with_prefix: bool) -> RegistryResult<EventStream>;
}
