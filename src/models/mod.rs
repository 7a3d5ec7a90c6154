//! Shared types for the registry client

mod error;

pub use error::{RegistryError, RegistryResult};
