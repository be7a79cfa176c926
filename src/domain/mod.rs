//! Domain types: request descriptors, the metric catalogue, and domain errors.

pub mod error;
pub mod metrics;
pub mod request;
