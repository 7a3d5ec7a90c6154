//! Signpost - Main Entry Point
//!
//! Connects to the store, watches the configured prefixes and, when
//! enabled, registers this instance under a lease.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use signpost::config::Settings;
use signpost::discovery::{Discoverer, Registrar};
use signpost::store::EtcdStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with RUST_LOG environment variable support
    // Default: info level for signpost, warn for everything else
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,signpost=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .init();

    // Load configuration
    let settings = Settings::load().unwrap_or_else(|e| {
        warn!("Failed to load config: {}, using defaults", e);
        Settings::default()
    });

    info!("Starting signpost v{}", signpost::VERSION);
    info!("Store endpoints: {:?}", settings.store.endpoints);

    let store = Arc::new(EtcdStore::connect(&settings.store.endpoints, &settings.store).await?);

    // Discovery side: watch every configured prefix
    let discoverer = Discoverer::new(store.clone());
    for prefix in &settings.discovery.prefixes {
        discoverer.watch_prefix(prefix).await?;
    }
    let mut lost = discoverer.lost();

    // Registration side, when this process advertises itself
    let registrar = if settings.registration.enabled {
        let registrar = Registrar::register(
            store.clone(),
            settings.registration.key.clone(),
            settings.registration.value.clone(),
            settings.registration.lease_ttl_secs,
        )
        .await?;
        Some(registrar)
    } else {
        None
    };

    let mut registrar_done = registrar.as_ref().map(|r| r.done());

    let mut ticker =
        tokio::time::interval(Duration::from_secs(settings.discovery.log_interval_secs));
    ticker.tick().await;

    loop {
        let done_changed = async {
            match registrar_done.as_mut() {
                Some(done) => {
                    let _ = done.changed().await;
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = ticker.tick() => {
                let services = discoverer.get_services();
                let rendered = serde_json::to_string(&services).unwrap_or_default();
                info!(services = %rendered, "known endpoints");
            }
            _ = lost.changed() => {
                error!("watch stream lost, shutting down");
                break;
            }
            _ = done_changed => {
                error!("registration lease lost, shutting down");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    if let Some(registrar) = registrar {
        if let Err(e) = registrar.close().await {
            warn!("Deregistration failed: {}", e);
        }
    }
    discoverer.close();

    Ok(())
}
