//! Core of the `dlcache` download proxy.
//!
//! This crate contains everything except the HTTP listener itself: the allowlist [`policy`], the
//! file-system [`caching`] layer with its per-key locks and expiry sweeps, the origin
//! [`download`]er, the [`bandwidth`] counter, and the [`service::ProxyService`] which ties all of
//! these together.

#[macro_use]
pub mod metrics;

pub mod bandwidth;
pub mod caching;
pub mod config;
pub mod download;
pub mod error;
pub mod logging;
pub mod policy;
pub mod service;
pub mod utils;
