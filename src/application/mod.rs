//! Application services: request handling, result production and response formatting.

pub mod data;
pub mod error;
pub mod format;
pub mod producer;
pub mod repos;
