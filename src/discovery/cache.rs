//! Local service cache
//!
//! The one piece of shared mutable state in the client: a key→address map
//! fed by watch events and read through copy-out snapshots. A single lock
//! covers both paths; readers never receive a live reference.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Concurrently readable key→value view of the watched prefixes
#[derive(Debug, Default)]
pub struct ServiceCache {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl ServiceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry. Applying the same event twice leaves
    /// the cache unchanged, which makes snapshot/watch overlap harmless.
    pub fn upsert(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut entries = self.entries.write();
        entries.insert(key.into(), value.into());
    }

    /// Remove an entry. Removing an absent key is a no-op: a delete may
    /// race the bootstrap scan and arrive for a key never seen.
    pub fn remove(&self, key: &str) {
        let mut entries = self.entries.write();
        entries.remove(key);
    }

    /// Point-in-time copy of the raw key→value entries
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.entries.read().clone()
    }

    /// Point-in-time copy grouped by service name, addresses ordered by key.
    ///
    /// The service name is the path segment before the instance segment:
    /// `/web/node1` belongs to service `web`. Keys without an instance
    /// segment form a service of their own. Every service gets its own
    /// address list.
    pub fn services(&self) -> HashMap<String, Vec<String>> {
        let entries = self.entries.read();

        let mut keys: Vec<&String> = entries.keys().collect();
        keys.sort();

        let mut services: HashMap<String, Vec<String>> = HashMap::new();
        for key in keys {
            let name = service_name(key);
            services
                .entry(name.to_string())
                .or_default()
                .push(entries[key].clone());
        }
        services
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Clone for ServiceCache {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

/// Derive the service name from an instance key: everything between the
/// leading slash and the final path separator.
fn service_name(key: &str) -> &str {
    let trimmed = key.trim_start_matches('/');
    match trimmed.rsplit_once('/') {
        Some((name, _instance)) => name,
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_is_idempotent() {
        let cache = ServiceCache::new();
        cache.upsert("/web/node1", "10.0.0.1");
        let once = cache.snapshot();

        cache.upsert("/web/node1", "10.0.0.1");
        assert_eq!(cache.snapshot(), once);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_upsert_replaces_value() {
        let cache = ServiceCache::new();
        cache.upsert("/web/node1", "10.0.0.1");
        cache.upsert("/web/node1", "10.0.0.2");
        assert_eq!(cache.snapshot()["/web/node1"], "10.0.0.2");
    }

    #[test]
    fn test_remove_absent_key_is_noop() {
        let cache = ServiceCache::new();
        cache.upsert("/web/node1", "10.0.0.1");

        cache.remove("/web/never-seen");
        assert_eq!(cache.len(), 1);

        cache.remove("/web/node1");
        cache.remove("/web/node1");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_grouping_keeps_one_list_per_service() {
        let cache = ServiceCache::new();
        cache.upsert("/svcA/1", "10.0.0.1");
        cache.upsert("/svcA/2", "10.0.0.2");
        cache.upsert("/svcB/1", "10.0.1.1");

        let services = cache.services();
        assert_eq!(services.len(), 2);
        assert_eq!(services["svcA"], vec!["10.0.0.1", "10.0.0.2"]);
        // svcB must not have inherited svcA's addresses
        assert_eq!(services["svcB"], vec!["10.0.1.1"]);
    }

    #[test]
    fn test_grouping_nested_and_flat_keys() {
        let cache = ServiceCache::new();
        cache.upsert("/ns/web/node1", "a:1");
        cache.upsert("/ns/web/node2", "a:2");
        cache.upsert("standalone", "b:1");

        let services = cache.services();
        assert_eq!(services["ns/web"], vec!["a:1", "a:2"]);
        assert_eq!(services["standalone"], vec!["b:1"]);
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let cache = ServiceCache::new();
        cache.upsert("/web/node1", "10.0.0.1");

        let snapshot = cache.snapshot();
        cache.upsert("/web/node2", "10.0.0.2");
        cache.remove("/web/node1");

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["/web/node1"], "10.0.0.1");
    }

    #[test]
    fn test_snapshot_isolation_under_concurrent_mutation() {
        let cache = ServiceCache::new();
        let writer_cache = cache.clone();

        let writer = std::thread::spawn(move || {
            for i in 0..1000 {
                writer_cache.upsert("/web/node1", format!("10.0.0.{}", i % 250));
                writer_cache.upsert(format!("/web/extra{i}"), "x");
                writer_cache.remove(&format!("/web/extra{i}"));
            }
        });

        for _ in 0..200 {
            let services = cache.services();
            if let Some(addrs) = services.get("web") {
                // Every observed entry is a complete pre- or post-event
                // value, never a torn one.
                for addr in addrs {
                    assert!(addr == "x" || addr.starts_with("10.0.0."));
                }
            }
        }

        writer.join().unwrap();
    }
}
