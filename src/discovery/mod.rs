//! Service registration and discovery
//!
//! The two client roles: a `Registrar` keeping one instance alive via
//! lease renewal, and a `Discoverer` mirroring the store into a local
//! cache. They share nothing but the store interface.

mod cache;
mod discoverer;
mod registrar;

pub use cache::ServiceCache;
pub use discoverer::Discoverer;
pub use registrar::Registrar;
