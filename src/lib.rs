//! Signpost - Lease-Based Service Registry Client
//!
//! A client for service registration and discovery over a consistent
//! key-value store with leases and watches (etcd), providing:
//! - Registration kept alive by continuous lease renewal
//! - Failure detection through lease expiry rather than explicit deregistration
//! - A locally cached, concurrently readable view of all registered services

pub mod config;
pub mod models;
pub mod store;
pub mod discovery;

// Re-export commonly used types
pub use config::Settings;
pub use models::{RegistryError, RegistryResult};
pub use store::{EtcdStore, Event, EventKind, KeyValue, KeyValueStore, LeaseId, MemoryStore};
pub use discovery::{Discoverer, Registrar, ServiceCache};

/// Version of signpost
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
