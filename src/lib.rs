//! Layered read-through cache for social-feed data.
//!
//! The [`cache`] module holds the layers; [`config`] resolves deployment settings;
//! [`infra`] carries telemetry, the origin client and the HTTP surface.

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
