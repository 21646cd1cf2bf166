//! Typed caches applying per-entity TTL policy over the freshness layer.

mod profile;
mod timeline;

pub use profile::ProfileCache;
pub use timeline::TimelineCache;
