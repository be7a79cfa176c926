//! In-process blob store with lease expiry driven by an injected clock.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    blob::{
        BlobError, BlobProperties, BlobStore, BlobTags, LeaseHandle, LeaseStatus, join_location,
    },
    clock::Clock,
    lock::mutex_lock,
};

const LOCK_TARGET: &str = "cache::memory";

#[derive(Debug, Clone)]
struct ActiveLease {
    id: Uuid,
    expires_at: Instant,
}

#[derive(Debug, Clone, Default)]
struct StoredBlob {
    content: Bytes,
    tags: BlobTags,
    lease: Option<ActiveLease>,
}

impl StoredBlob {
    fn lease_status(&self, now: Instant) -> LeaseStatus {
        match &self.lease {
            Some(lease) if now < lease.expires_at => LeaseStatus::Locked { owner: lease.id },
            Some(_) => LeaseStatus::Expired,
            None => LeaseStatus::Unlocked,
        }
    }

    /// A live lease admits only its holder; a lapsed one still admits its former holder.
    fn check_mutation(
        &self,
        path: &str,
        lease: Option<&LeaseHandle>,
        now: Instant,
    ) -> Result<(), BlobError> {
        match (self.lease_status(now), lease) {
            (LeaseStatus::Locked { owner }, Some(handle)) if handle.id() == owner => Ok(()),
            (LeaseStatus::Locked { .. }, _) => Err(BlobError::LeaseConflict {
                path: path.to_string(),
            }),
            (_, None) => Ok(()),
            (_, Some(handle)) => match &self.lease {
                Some(current) if current.id == handle.id() => Ok(()),
                _ => Err(BlobError::LeaseLost {
                    path: path.to_string(),
                }),
            },
        }
    }
}

pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, StoredBlob>>,
    clock: Arc<dyn Clock>,
    public_base_url: String,
    container: String,
}

impl MemoryBlobStore {
    pub fn new(
        clock: Arc<dyn Clock>,
        public_base_url: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            clock,
            public_base_url: public_base_url.into(),
            container: container.into(),
        }
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.blobs, LOCK_TARGET, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn not_found(path: &str) -> BlobError {
        BlobError::NotFound {
            path: path.to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn exists(&self, path: &str) -> Result<bool, BlobError> {
        Ok(mutex_lock(&self.blobs, LOCK_TARGET, "exists").contains_key(path))
    }

    async fn create_empty(&self, path: &str) -> Result<(), BlobError> {
        let mut blobs = mutex_lock(&self.blobs, LOCK_TARGET, "create_empty");
        if blobs.contains_key(path) {
            return Err(BlobError::AlreadyExists {
                path: path.to_string(),
            });
        }
        blobs.insert(path.to_string(), StoredBlob::default());
        Ok(())
    }

    async fn upload(
        &self,
        path: &str,
        content: Bytes,
        lease: Option<&LeaseHandle>,
    ) -> Result<(), BlobError> {
        let now = self.clock.now();
        let mut blobs = mutex_lock(&self.blobs, LOCK_TARGET, "upload");
        match blobs.get_mut(path) {
            Some(blob) => {
                blob.check_mutation(path, lease, now)?;
                blob.content = content;
                Ok(())
            }
            None if lease.is_some() => Err(BlobError::LeaseLost {
                path: path.to_string(),
            }),
            None => {
                blobs.insert(
                    path.to_string(),
                    StoredBlob {
                        content,
                        ..StoredBlob::default()
                    },
                );
                Ok(())
            }
        }
    }

    async fn download(&self, path: &str) -> Result<Bytes, BlobError> {
        mutex_lock(&self.blobs, LOCK_TARGET, "download")
            .get(path)
            .map(|blob| blob.content.clone())
            .ok_or_else(|| Self::not_found(path))
    }

    async fn delete(&self, path: &str, lease: Option<&LeaseHandle>) -> Result<(), BlobError> {
        let now = self.clock.now();
        let mut blobs = mutex_lock(&self.blobs, LOCK_TARGET, "delete");
        let blob = blobs.get(path).ok_or_else(|| Self::not_found(path))?;
        blob.check_mutation(path, lease, now)?;
        blobs.remove(path);
        Ok(())
    }

    async fn acquire_lease(
        &self,
        path: &str,
        duration: Duration,
    ) -> Result<LeaseHandle, BlobError> {
        let now = self.clock.now();
        let mut blobs = mutex_lock(&self.blobs, LOCK_TARGET, "acquire_lease");
        let blob = blobs.get_mut(path).ok_or_else(|| Self::not_found(path))?;
        if blob.lease_status(now).is_locked() {
            return Err(BlobError::LeaseConflict {
                path: path.to_string(),
            });
        }

        let id = Uuid::new_v4();
        blob.lease = Some(ActiveLease {
            id,
            expires_at: now + duration,
        });
        Ok(LeaseHandle::new(path, id, duration))
    }

    async fn renew_lease(&self, lease: &LeaseHandle) -> Result<(), BlobError> {
        let now = self.clock.now();
        let mut blobs = mutex_lock(&self.blobs, LOCK_TARGET, "renew_lease");
        match blobs
            .get_mut(lease.path())
            .and_then(|blob| blob.lease.as_mut())
        {
            Some(current) if current.id == lease.id() => {
                current.expires_at = now + lease.duration();
                Ok(())
            }
            _ => Err(BlobError::LeaseLost {
                path: lease.path().to_string(),
            }),
        }
    }

    async fn release_lease(&self, lease: &LeaseHandle) -> Result<(), BlobError> {
        let mut blobs = mutex_lock(&self.blobs, LOCK_TARGET, "release_lease");
        match blobs.get_mut(lease.path()) {
            Some(blob) if blob.lease.as_ref().is_some_and(|l| l.id == lease.id()) => {
                blob.lease = None;
                Ok(())
            }
            _ => Err(BlobError::LeaseLost {
                path: lease.path().to_string(),
            }),
        }
    }

    async fn get_tags(&self, path: &str) -> Result<BlobTags, BlobError> {
        mutex_lock(&self.blobs, LOCK_TARGET, "get_tags")
            .get(path)
            .map(|blob| blob.tags.clone())
            .ok_or_else(|| Self::not_found(path))
    }

    async fn set_tags(
        &self,
        path: &str,
        tags: BlobTags,
        lease: Option<&LeaseHandle>,
    ) -> Result<(), BlobError> {
        let now = self.clock.now();
        let mut blobs = mutex_lock(&self.blobs, LOCK_TARGET, "set_tags");
        let blob = blobs.get_mut(path).ok_or_else(|| Self::not_found(path))?;
        blob.check_mutation(path, lease, now)?;
        blob.tags = tags;
        Ok(())
    }

    async fn get_properties(&self, path: &str) -> Result<BlobProperties, BlobError> {
        let now = self.clock.now();
        mutex_lock(&self.blobs, LOCK_TARGET, "get_properties")
            .get(path)
            .map(|blob| BlobProperties {
                size: blob.content.len() as u64,
                lease: blob.lease_status(now),
            })
            .ok_or_else(|| Self::not_found(path))
    }

    fn public_location(&self, path: &str) -> String {
        join_location(&self.public_base_url, &self.container, path)
    }

    async fn health_check(&self) -> Result<(), BlobError> {
        Ok(())
    }
}
