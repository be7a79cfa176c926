//! Infrastructure adapters and runtime bootstrap.

pub mod db;
pub mod dependency;
pub mod error;
pub mod http;
pub mod storage;
pub mod telemetry;
