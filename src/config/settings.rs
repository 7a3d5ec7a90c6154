//! Registry client configuration settings

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub store: StoreSettings,
    #[serde(default)]
    pub registration: RegistrationSettings,
    #[serde(default)]
    pub discovery: DiscoverySettings,
}

/// Store connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    /// Store endpoints (host:port)
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    /// Dial timeout in seconds
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    /// Initial connect-retry backoff in milliseconds
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    /// Maximum connect-retry backoff in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Give up connecting after this many seconds
    #[serde(default = "default_backoff_max_elapsed")]
    pub backoff_max_elapsed_secs: u64,
    /// Backoff multiplier between retries
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_endpoints() -> Vec<String> {
    vec!["localhost:2379".to_string()]
}

fn default_dial_timeout() -> u64 {
    5
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

fn default_backoff_max_elapsed() -> u64 {
    60
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl StoreSettings {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            endpoints: default_endpoints(),
            dial_timeout_secs: default_dial_timeout(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_max_elapsed_secs: default_backoff_max_elapsed(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Self-registration settings
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationSettings {
    /// Register this instance on startup
    #[serde(default)]
    pub enabled: bool,
    /// Key the instance is registered under
    #[serde(default = "default_registration_key")]
    pub key: String,
    /// Advertised address
    #[serde(default = "default_registration_value")]
    pub value: String,
    /// Lease TTL in seconds
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: i64,
}

fn default_registration_key() -> String {
    format!("/services/web/{}", uuid::Uuid::new_v4())
}

fn default_registration_value() -> String {
    "localhost:8080".to_string()
}

fn default_lease_ttl() -> i64 {
    10
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        RegistrationSettings {
            enabled: false,
            key: default_registration_key(),
            value: default_registration_value(),
            lease_ttl_secs: default_lease_ttl(),
        }
    }
}

/// Discovery settings
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySettings {
    /// Key prefixes to watch
    #[serde(default = "default_prefixes")]
    pub prefixes: Vec<String>,
    /// Interval between snapshot log lines, in seconds
    #[serde(default = "default_log_interval")]
    pub log_interval_secs: u64,
}

fn default_prefixes() -> Vec<String> {
    vec!["/services/".to_string()]
}

fn default_log_interval() -> u64 {
    5
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        DiscoverySettings {
            prefixes: default_prefixes(),
            log_interval_secs: default_log_interval(),
        }
    }
}

impl Settings {
    /// Load settings from file and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load settings from a specific config file path (without extension)
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("store.endpoints", default_endpoints())?
            .set_default("store.dial_timeout_secs", default_dial_timeout())?
            .set_default("store.backoff_initial_ms", default_backoff_initial_ms())?
            .set_default("store.backoff_max_ms", default_backoff_max_ms())?
            .set_default("store.backoff_max_elapsed_secs", default_backoff_max_elapsed())?
            .set_default("store.backoff_multiplier", default_backoff_multiplier())?
            .set_default("registration.enabled", false)?
            .set_default("registration.lease_ttl_secs", default_lease_ttl())?
            .set_default("discovery.prefixes", default_prefixes())?
            .set_default("discovery.log_interval_secs", default_log_interval())?
            // Add config file if it exists
            .add_source(File::with_name(config_path.to_str().unwrap_or("config")).required(false))
            // Add environment variables with prefix SIGNPOST_
            .add_source(Environment::with_prefix("SIGNPOST").separator("__"));

        builder.build()?.try_deserialize()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            store: StoreSettings::default(),
            registration: RegistrationSettings::default(),
            discovery: DiscoverySettings::default(),
        }
    }
}
