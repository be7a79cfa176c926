//! Streaming time-series data API backed by a lease-coordinated blob response cache.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
