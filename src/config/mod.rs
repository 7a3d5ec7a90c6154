//! Configuration module

mod settings;

pub use settings::{DiscoverySettings, RegistrationSettings, Settings, StoreSettings};
