//! End-to-end registration and discovery lifecycle
//!
//! Runs both client roles against the in-process store, covering the
//! put-via-watch path and the expiry-via-delete path, under tokio's
//! paused clock so the lease-TTL bounds are checked in virtual time.

use std::sync::Arc;
use std::time::Duration;

use signpost::discovery::{Discoverer, Registrar};
use signpost::store::{KeyValueStore, MemoryStore};
use tokio::time::{sleep, Instant};

/// Poll until `condition` holds, returning how long it took. Panics after
/// `max` elapsed. Under a paused clock the sleeps auto-advance.
async fn wait_for<F: Fn() -> bool>(condition: F, max: Duration) -> Duration {
    let start = Instant::now();
    loop {
        if condition() {
            return start.elapsed();
        }
        if start.elapsed() > max {
            panic!("condition not met within {max:?}");
        }
        sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn registered_instance_appears_then_expires_after_crash() {
    let store = MemoryStore::new();

    let discoverer = Discoverer::new(Arc::new(store.clone()));
    discoverer.watch_prefix("/web/").await.unwrap();
    assert!(discoverer.get_services().is_empty());

    let registrar = Registrar::register(Arc::new(store.clone()), "/web/node1", "host:8080", 2)
        .await
        .unwrap();

    // Registration must be visible through the watch path within a second.
    let appeared = wait_for(
        || {
            discoverer
                .get_services()
                .get("web")
                .is_some_and(|addrs| addrs == &["host:8080".to_string()])
        },
        Duration::from_secs(1),
    )
    .await;
    assert!(appeared <= Duration::from_secs(1));

    // Crash the instance: renewal stops, nobody deregisters explicitly.
    let crashed_at = Instant::now();
    drop(registrar);

    // The lease expires and the delete reaches the discoverer within the
    // TTL bound (2s TTL, 3s allowance).
    wait_for(
        || !discoverer.snapshot().contains_key("/web/node1"),
        Duration::from_secs(3),
    )
    .await;
    assert!(crashed_at.elapsed() <= Duration::from_secs(3));
    assert!(discoverer.get_services().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unrenewed_lease_is_deleted_within_ttl() {
    let store = MemoryStore::new();

    let discoverer = Discoverer::new(Arc::new(store.clone()));
    discoverer.watch_prefix("/web/").await.unwrap();

    // Bind a key to a lease and never renew it.
    let lease = store.grant_lease(2).await.unwrap();
    store.put("/web/node1", "host:8080", Some(lease)).await.unwrap();

    let registered_at = Instant::now();
    wait_for(
        || discoverer.snapshot().contains_key("/web/node1"),
        Duration::from_secs(1),
    )
    .await;

    wait_for(
        || !discoverer.snapshot().contains_key("/web/node1"),
        Duration::from_secs(3),
    )
    .await;
    assert!(registered_at.elapsed() <= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn explicit_close_deregisters_immediately() {
    let store = MemoryStore::new();

    let discoverer = Discoverer::new(Arc::new(store.clone()));
    discoverer.watch_prefix("/web/").await.unwrap();

    let registrar = Registrar::register(Arc::new(store.clone()), "/web/node1", "host:8080", 30)
        .await
        .unwrap();
    wait_for(
        || discoverer.snapshot().contains_key("/web/node1"),
        Duration::from_secs(1),
    )
    .await;

    // Revoke deletes the key synchronously; no need to wait out the TTL.
    registrar.close().await.unwrap();
    wait_for(
        || !discoverer.snapshot().contains_key("/web/node1"),
        Duration::from_secs(1),
    )
    .await;
}

#[tokio::test(start_paused = true)]
async fn discoverer_tracks_multiple_services() {
    let store = MemoryStore::new();

    let discoverer = Discoverer::new(Arc::new(store.clone()));
    discoverer.watch_prefix("/svcA/").await.unwrap();
    discoverer.watch_prefix("/svcB/").await.unwrap();

    let a1 = Registrar::register(Arc::new(store.clone()), "/svcA/1", "10.0.0.1", 10)
        .await
        .unwrap();
    let _a2 = Registrar::register(Arc::new(store.clone()), "/svcA/2", "10.0.0.2", 10)
        .await
        .unwrap();
    let _b1 = Registrar::register(Arc::new(store.clone()), "/svcB/1", "10.0.1.1", 10)
        .await
        .unwrap();

    wait_for(|| discoverer.snapshot().len() == 3, Duration::from_secs(1)).await;

    let services = discoverer.get_services();
    assert_eq!(services["svcA"], vec!["10.0.0.1", "10.0.0.2"]);
    assert_eq!(services["svcB"], vec!["10.0.1.1"]);

    // One instance leaving must not disturb the other service's list.
    a1.close().await.unwrap();
    wait_for(|| discoverer.snapshot().len() == 2, Duration::from_secs(1)).await;

    let services = discoverer.get_services();
    assert_eq!(services["svcA"], vec!["10.0.0.2"]);
    assert_eq!(services["svcB"], vec!["10.0.1.1"]);
}
