//! Filesystem blob store.
//!
//! Each blob is a file under `{root}/{container}/{path}` with two sidecars:
//! `.tags` holds the index tags as JSON and `.lease` holds the active lease.
//! Every sidecar update that depends on the current lease runs under an
//! exclusive `flock` on the container's lock file, so processes sharing the
//! directory see at most one live lease per blob. Sidecars are replaced by
//! rename and are never observed half written.

use std::{
    fs::File as StdFile,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::debug;
use uuid::Uuid;

use crate::cache::{
    BlobError, BlobProperties, BlobStore, BlobTags, LeaseHandle, LeaseStatus, blob::join_location,
};

const TAGS_SUFFIX: &str = ".tags";
const LEASE_SUFFIX: &str = ".lease";
const LOCK_FILE: &str = ".lease.lock";
/// How long an unreadable lease file blocks takeover, counted from its mtime.
const TORN_LEASE_GRACE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    id: Uuid,
    /// Unix timestamp in milliseconds.
    expires_at_ms: i64,
}

impl LeaseRecord {
    fn new(id: Uuid, duration: Duration) -> Self {
        let duration_ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self {
            id,
            expires_at_ms: now_ms().saturating_add(duration_ms),
        }
    }

    fn status(&self) -> LeaseStatus {
        if now_ms() < self.expires_at_ms {
            LeaseStatus::Locked { owner: self.id }
        } else {
            LeaseStatus::Expired
        }
    }
}

fn now_ms() -> i64 {
    to_ms(OffsetDateTime::now_utc())
}

fn to_ms(at: OffsetDateTime) -> i64 {
    i64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

/// Cross-process exclusive lock on a container's lease table, released on drop.
struct ContainerLock(StdFile);

impl Drop for ContainerLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

#[derive(Debug)]
pub struct FsBlobStore {
    root: PathBuf,
    container: String,
    public_base_url: String,
    /// Serialises sidecar updates within this process ahead of the file lock.
    guard: Mutex<()>,
}

impl FsBlobStore {
    /// Initialise storage rooted at the provided directory, creating it if necessary.
    pub fn new(
        root: impl Into<PathBuf>,
        container: impl Into<String>,
        public_base_url: impl Into<String>,
    ) -> Result<Self, std::io::Error> {
        let container = container.into();
        let root = root.into();
        std::fs::create_dir_all(root.join(&container))?;
        Ok(Self {
            root,
            container,
            public_base_url: public_base_url.into(),
            guard: Mutex::new(()),
        })
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Resolve the absolute filesystem path for a blob.
    fn resolve(&self, path: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(path);
        if path.is_empty()
            || relative.is_absolute()
            || relative.components().any(|component| {
                matches!(
                    component,
                    Component::ParentDir | Component::Prefix(_) | Component::RootDir
                )
            })
        {
            return Err(BlobError::storage(format!("invalid blob path `{path}`")));
        }
        Ok(self.root.join(&self.container).join(relative))
    }

    async fn lock_container(&self) -> Result<ContainerLock, BlobError> {
        let path = self.root.join(&self.container).join(LOCK_FILE);
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<StdFile> {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|err| BlobError::storage(format!("lease lock task failed: {err}")))??;
        Ok(ContainerLock(file))
    }

    /// Reads the lease sidecar. A file that exists but does not parse is held
    /// by nobody in particular until [`TORN_LEASE_GRACE`] after its mtime.
    async fn read_lease(&self, blob: &Path) -> Result<Option<LeaseRecord>, BlobError> {
        let lease_file = sidecar(blob, LEASE_SUFFIX);
        let raw = match fs::read(&lease_file).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if let Ok(record) = serde_json::from_slice::<LeaseRecord>(&raw) {
            return Ok(Some(record));
        }

        let modified = match fs::metadata(&lease_file).await {
            Ok(metadata) => to_ms(OffsetDateTime::from(metadata.modified()?)),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let grace_ms = i64::try_from(TORN_LEASE_GRACE.as_millis()).unwrap_or(i64::MAX);
        debug!(
            target = "ondata::infra::storage",
            lease_file = %lease_file.display(),
            "unreadable lease file treated as held"
        );
        Ok(Some(LeaseRecord {
            id: Uuid::nil(),
            expires_at_ms: modified.saturating_add(grace_ms),
        }))
    }

    async fn lease_status(&self, blob: &Path) -> Result<LeaseStatus, BlobError> {
        Ok(match self.read_lease(blob).await? {
            Some(record) => record.status(),
            None => LeaseStatus::Unlocked,
        })
    }

    async fn ensure_exists(&self, path: &str, blob: &Path) -> Result<(), BlobError> {
        if fs::try_exists(blob).await? {
            Ok(())
        } else {
            Err(not_found(path))
        }
    }

    /// A live lease admits only its holder; a lapsed one still admits its former holder.
    async fn check_mutation(
        &self,
        path: &str,
        blob: &Path,
        lease: Option<&LeaseHandle>,
    ) -> Result<(), BlobError> {
        let current = self.read_lease(blob).await?;
        let status = current
            .as_ref()
            .map_or(LeaseStatus::Unlocked, LeaseRecord::status);
        match (status, lease) {
            (LeaseStatus::Locked { owner }, Some(handle)) if handle.id() == owner => Ok(()),
            (LeaseStatus::Locked { .. }, _) => Err(BlobError::LeaseConflict {
                path: path.to_string(),
            }),
            (_, None) => Ok(()),
            (_, Some(handle)) => match current {
                Some(record) if record.id == handle.id() => Ok(()),
                _ => Err(BlobError::LeaseLost {
                    path: path.to_string(),
                }),
            },
        }
    }
}

fn sidecar(blob: &Path, suffix: &str) -> PathBuf {
    let mut name = blob.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn not_found(path: &str) -> BlobError {
    BlobError::NotFound {
        path: path.to_string(),
    }
}

/// Writes through a temporary sibling and renames it into place.
async fn replace_file(target: &Path, content: &[u8]) -> Result<(), std::io::Error> {
    let mut staging = target.as_os_str().to_os_string();
    staging.push(format!(".{}.part", Uuid::new_v4().simple()));
    let staging = PathBuf::from(staging);

    let mut file = fs::File::create(&staging).await?;
    file.write_all(content).await?;
    file.flush().await?;
    drop(file);

    if let Err(err) = fs::rename(&staging, target).await {
        let _ = fs::remove_file(&staging).await;
        return Err(err);
    }
    Ok(())
}

async fn remove_if_present(path: &Path) -> Result<(), std::io::Error> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn exists(&self, path: &str) -> Result<bool, BlobError> {
        Ok(fs::try_exists(self.resolve(path)?).await?)
    }

    async fn create_empty(&self, path: &str) -> Result<(), BlobError> {
        let blob = self.resolve(path)?;
        if let Some(parent) = blob.parent() {
            fs::create_dir_all(parent).await?;
        }
        match OpenOptions::new().write(true).create_new(true).open(&blob).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Err(BlobError::AlreadyExists {
                path: path.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn upload(
        &self,
        path: &str,
        content: Bytes,
        lease: Option<&LeaseHandle>,
    ) -> Result<(), BlobError> {
        let blob = self.resolve(path)?;
        let _guard = self.guard.lock().await;
        let _lock = self.lock_container().await?;
        if fs::try_exists(&blob).await? {
            self.check_mutation(path, &blob, lease).await?;
        } else if lease.is_some() {
            return Err(BlobError::LeaseLost {
                path: path.to_string(),
            });
        } else if let Some(parent) = blob.parent() {
            fs::create_dir_all(parent).await?;
        }
        replace_file(&blob, &content).await?;
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Bytes, BlobError> {
        match fs::read(self.resolve(path)?).await {
            Ok(content) => Ok(Bytes::from(content)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(not_found(path)),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, path: &str, lease: Option<&LeaseHandle>) -> Result<(), BlobError> {
        let blob = self.resolve(path)?;
        let _guard = self.guard.lock().await;
        let _lock = self.lock_container().await?;
        self.ensure_exists(path, &blob).await?;
        self.check_mutation(path, &blob, lease).await?;

        match fs::remove_file(&blob).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(not_found(path)),
            Err(err) => return Err(err.into()),
        }
        remove_if_present(&sidecar(&blob, TAGS_SUFFIX)).await?;
        remove_if_present(&sidecar(&blob, LEASE_SUFFIX)).await?;
        Ok(())
    }

    async fn acquire_lease(
        &self,
        path: &str,
        duration: Duration,
    ) -> Result<LeaseHandle, BlobError> {
        let blob = self.resolve(path)?;
        let lease_file = sidecar(&blob, LEASE_SUFFIX);
        let _guard = self.guard.lock().await;
        let _lock = self.lock_container().await?;
        self.ensure_exists(path, &blob).await?;

        if self.lease_status(&blob).await?.is_locked() {
            return Err(BlobError::LeaseConflict {
                path: path.to_string(),
            });
        }

        let record = LeaseRecord::new(Uuid::new_v4(), duration);
        let encoded = serde_json::to_vec(&record)
            .map_err(|err| BlobError::storage(format!("failed to encode lease: {err}")))?;
        replace_file(&lease_file, &encoded).await?;
        debug!(
            target = "ondata::infra::storage",
            cache_path = path,
            lease = %record.id,
            "lease acquired"
        );
        Ok(LeaseHandle::new(path, record.id, duration))
    }

    async fn renew_lease(&self, lease: &LeaseHandle) -> Result<(), BlobError> {
        let blob = self.resolve(lease.path())?;
        let _guard = self.guard.lock().await;
        let _lock = self.lock_container().await?;
        match self.read_lease(&blob).await? {
            Some(current) if current.id == lease.id() => {
                let renewed = LeaseRecord::new(lease.id(), lease.duration());
                let encoded = serde_json::to_vec(&renewed)
                    .map_err(|err| BlobError::storage(format!("failed to encode lease: {err}")))?;
                replace_file(&sidecar(&blob, LEASE_SUFFIX), &encoded).await?;
                Ok(())
            }
            _ => Err(BlobError::LeaseLost {
                path: lease.path().to_string(),
            }),
        }
    }

    async fn release_lease(&self, lease: &LeaseHandle) -> Result<(), BlobError> {
        let blob = self.resolve(lease.path())?;
        let _guard = self.guard.lock().await;
        let _lock = self.lock_container().await?;
        match self.read_lease(&blob).await? {
            Some(current) if current.id == lease.id() => {
                remove_if_present(&sidecar(&blob, LEASE_SUFFIX)).await?;
                Ok(())
            }
            _ => Err(BlobError::LeaseLost {
                path: lease.path().to_string(),
            }),
        }
    }

    async fn get_tags(&self, path: &str) -> Result<BlobTags, BlobError> {
        let blob = self.resolve(path)?;
        self.ensure_exists(path, &blob).await?;
        match fs::read(sidecar(&blob, TAGS_SUFFIX)).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|err| BlobError::storage(format!("corrupt tags for `{path}`: {err}"))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(BlobTags::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn set_tags(
        &self,
        path: &str,
        tags: BlobTags,
        lease: Option<&LeaseHandle>,
    ) -> Result<(), BlobError> {
        let blob = self.resolve(path)?;
        let _guard = self.guard.lock().await;
        let _lock = self.lock_container().await?;
        self.ensure_exists(path, &blob).await?;
        self.check_mutation(path, &blob, lease).await?;
        let encoded = serde_json::to_vec(&tags)
            .map_err(|err| BlobError::storage(format!("failed to encode tags: {err}")))?;
        replace_file(&sidecar(&blob, TAGS_SUFFIX), &encoded).await?;
        Ok(())
    }

    async fn get_properties(&self, path: &str) -> Result<BlobProperties, BlobError> {
        let blob = self.resolve(path)?;
        let metadata = match fs::metadata(&blob).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(not_found(path)),
            Err(err) => return Err(err.into()),
        };
        Ok(BlobProperties {
            size: metadata.len(),
            lease: self.lease_status(&blob).await?,
        })
    }

    fn public_location(&self, path: &str) -> String {
        join_location(&self.public_base_url, &self.container, path)
    }

    async fn health_check(&self) -> Result<(), BlobError> {
        let directory = self.root.join(&self.container);
        let metadata = fs::metadata(&directory).await?;
        if metadata.is_dir() {
            Ok(())
        } else {
            Err(BlobError::storage(format!(
                "`{}` is not a directory",
                directory.display()
            )))
        }
    }
}
