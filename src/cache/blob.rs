//! Blob store capability used by the cache coordinator and writer.
//!
//! The contract mirrors an object store with leases and index tags: leases are
//! exclusive and time bounded, and every mutation of a leased blob must present
//! the matching lease id.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

pub const TAG_IN_PROGRESS: &str = "in_progress";
pub const TAG_DONE: &str = "done";
pub const TAG_METRICS: &str = "metrics";

pub type BlobTags = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{path}` not found")]
    NotFound { path: String },
    #[error("blob `{path}` already exists")]
    AlreadyExists { path: String },
    #[error("blob `{path}` is leased by another holder")]
    LeaseConflict { path: String },
    #[error("lease on blob `{path}` was lost")]
    LeaseLost { path: String },
    #[error("blob storage failure: {message}")]
    Storage { message: String },
}

impl BlobError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound { .. })
    }
}

impl From<std::io::Error> for BlobError {
    fn from(err: std::io::Error) -> Self {
        Self::storage(err.to_string())
    }
}

/// Proof of an exclusive lease on one blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseHandle {
    path: String,
    id: Uuid,
    duration: Duration,
}

impl LeaseHandle {
    pub fn new(path: impl Into<String>, id: Uuid, duration: Duration) -> Self {
        Self {
            path: path.into(),
            id,
            duration,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Unlocked,
    Locked { owner: Uuid },
    Expired,
}

impl LeaseStatus {
    pub fn is_locked(self) -> bool {
        matches!(self, LeaseStatus::Locked { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobProperties {
    pub size: u64,
    pub lease: LeaseStatus,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool, BlobError>;

    /// Creates an empty blob, failing with `AlreadyExists` when one is present.
    async fn create_empty(&self, path: &str) -> Result<(), BlobError>;

    /// Replaces the content of a blob, creating it when absent and unleased.
    async fn upload(
        &self,
        path: &str,
        content: Bytes,
        lease: Option<&LeaseHandle>,
    ) -> Result<(), BlobError>;

    async fn download(&self, path: &str) -> Result<Bytes, BlobError>;

    async fn delete(&self, path: &str, lease: Option<&LeaseHandle>) -> Result<(), BlobError>;

    async fn acquire_lease(&self, path: &str, duration: Duration)
    -> Result<LeaseHandle, BlobError>;

    async fn renew_lease(&self, lease: &LeaseHandle) -> Result<(), BlobError>;

    async fn release_lease(&self, lease: &LeaseHandle) -> Result<(), BlobError>;

    async fn get_tags(&self, path: &str) -> Result<BlobTags, BlobError>;

    async fn set_tags(
        &self,
        path: &str,
        tags: BlobTags,
        lease: Option<&LeaseHandle>,
    ) -> Result<(), BlobError>;

    async fn get_properties(&self, path: &str) -> Result<BlobProperties, BlobError>;

    /// Public URL clients are redirected to for a finished blob.
    fn public_location(&self, path: &str) -> String;

    async fn health_check(&self) -> Result<(), BlobError>;
}

/// Tags written when a producer claims an entry.
pub fn in_progress_tags() -> BlobTags {
    BlobTags::from([
        (TAG_IN_PROGRESS.to_string(), "1".to_string()),
        (TAG_DONE.to_string(), "0".to_string()),
    ])
}

/// Tags written once the full content has been uploaded.
pub fn done_tags(metrics: &str) -> BlobTags {
    BlobTags::from([
        (TAG_IN_PROGRESS.to_string(), "0".to_string()),
        (TAG_DONE.to_string(), "1".to_string()),
        (TAG_METRICS.to_string(), metrics.to_string()),
    ])
}

pub fn is_done(tags: &BlobTags) -> bool {
    tags.get(TAG_DONE).is_some_and(|value| value == "1")
}

/// Joins a container-relative path onto a public base URL.
pub fn join_location(base: &str, container: &str, path: &str) -> String {
    format!(
        "{}/downloads/{}/{}",
        base.trim_end_matches('/'),
        container.trim_matches('/'),
        path.trim_start_matches('/')
    )
}
