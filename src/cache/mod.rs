//! Distributed response cache.
//!
//! Finished responses live in a blob store under a key derived from the request.
//! Concurrent requests for the same key agree on a single producer through the
//! store's lease primitive:
//!
//! - **Coordinator**: resolves a key to cached bytes, a redirect, a lease to
//!   produce under, or a fallback when waiting took too long.
//! - **Writer**: persists chunks under the lease and publishes the entry only
//!   once its full content is uploaded.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! poll_interval_seconds = 10
//! max_wait_cycles = 29
//! lease_seconds = 15
//! # ... see config.rs for all options
//! ```

pub mod blob;
pub mod clock;
mod config;
mod coordinator;
mod keys;
mod lock;
mod memory;
mod writer;

pub use blob::{
    BlobError, BlobProperties, BlobStore, BlobTags, LeaseHandle, LeaseStatus, TAG_DONE,
    TAG_IN_PROGRESS, TAG_METRICS,
};
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::CacheConfig;
pub use coordinator::{CacheCoordinator, CoordinatorError, CoordinatorState, Resolution};
pub use keys::{CacheKey, MetricOrdering};
pub use memory::MemoryBlobStore;
pub use writer::{CacheWriter, WriterError};
