//! Lease-bound persistence of a response while it is being produced.
//!
//! Chunks land in a per-request scratch file in index order. The blob itself is
//! written once, in full, by [`CacheWriter::finish`], and only then tagged done.

use std::{io::SeekFrom, sync::Arc};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};
use tracing::{debug, warn};

use super::blob::{BlobError, BlobStore, LeaseHandle, done_tags};

#[derive(Debug, Error)]
pub enum WriterError {
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("scratch file failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("chunk {index} was written twice")]
    DuplicateChunk { index: u64 },
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    index: u64,
    len: u64,
}

struct Scratch {
    file: File,
    segments: Vec<Segment>,
}

impl Scratch {
    /// Byte offset at which chunk `index` belongs, and its position among segments.
    fn slot(&self, index: u64) -> Result<(usize, u64), WriterError> {
        let position = self.segments.partition_point(|segment| segment.index < index);
        if self
            .segments
            .get(position)
            .is_some_and(|segment| segment.index == index)
        {
            return Err(WriterError::DuplicateChunk { index });
        }
        let offset = self.segments[..position].iter().map(|s| s.len).sum();
        Ok((position, offset))
    }

    fn total_len(&self) -> u64 {
        self.segments.iter().map(|s| s.len).sum()
    }

    async fn insert(&mut self, index: u64, bytes: &[u8]) -> Result<(), WriterError> {
        let (position, offset) = self.slot(index)?;
        let end = self.total_len();

        let mut tail = Vec::new();
        if offset < end {
            self.file.seek(SeekFrom::Start(offset)).await?;
            tail.reserve((end - offset) as usize);
            (&mut self.file).take(end - offset).read_to_end(&mut tail).await?;
        }

        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(bytes).await?;
        self.file.write_all(&tail).await?;
        self.file.flush().await?;

        self.segments.insert(
            position,
            Segment {
                index,
                len: bytes.len() as u64,
            },
        );
        Ok(())
    }

    async fn contents(&mut self) -> Result<Bytes, WriterError> {
        let len = self.total_len();
        let mut buffer = Vec::with_capacity(len as usize);
        self.file.seek(SeekFrom::Start(0)).await?;
        (&mut self.file).take(len).read_to_end(&mut buffer).await?;
        Ok(Bytes::from(buffer))
    }
}

pub struct CacheWriter {
    store: Arc<dyn BlobStore>,
    lease: LeaseHandle,
    metrics_tag: String,
    scratch: Mutex<Scratch>,
}

impl CacheWriter {
    pub async fn new(
        store: Arc<dyn BlobStore>,
        lease: LeaseHandle,
        metrics_tag: impl Into<String>,
    ) -> Result<Self, WriterError> {
        let file = tokio::task::spawn_blocking(tempfile::tempfile)
            .await
            .map_err(std::io::Error::other)??;

        Ok(Self {
            store,
            lease,
            metrics_tag: metrics_tag.into(),
            scratch: Mutex::new(Scratch {
                file: File::from_std(file),
                segments: Vec::new(),
            }),
        })
    }

    pub fn path(&self) -> &str {
        self.lease.path()
    }

    /// Stores a chunk at its ordered position, then renews the lease.
    pub async fn write_chunk(&self, index: u64, bytes: &[u8]) -> Result<(), WriterError> {
        {
            let mut scratch = self.scratch.lock().await;
            scratch.insert(index, bytes).await?;
        }
        self.store.renew_lease(&self.lease).await?;
        debug!(
            target = "ondata::cache::writer",
            cache_path = self.path(),
            index,
            len = bytes.len(),
            "chunk persisted"
        );
        Ok(())
    }

    /// Uploads the assembled content, marks the entry done, and releases the lease.
    pub async fn finish(self) -> Result<u64, WriterError> {
        let content = self.scratch.lock().await.contents().await?;
        let size = content.len() as u64;
        let path = self.lease.path().to_string();

        self.store
            .upload(&path, content, Some(&self.lease))
            .await?;
        self.store
            .set_tags(&path, done_tags(&self.metrics_tag), Some(&self.lease))
            .await?;

        if let Err(err) = self.store.release_lease(&self.lease).await {
            warn!(
                target = "ondata::cache::writer",
                cache_path = %path,
                error = %err,
                "entry completed but lease release failed; it will lapse"
            );
        }

        Ok(size)
    }

    /// Removes the partial entry so the next request recomputes it.
    pub async fn abort(self) -> Result<(), WriterError> {
        match self
            .store
            .delete(self.lease.path(), Some(&self.lease))
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::{
        blob::{TAG_DONE, TAG_METRICS},
        clock::ManualClock,
        memory::MemoryBlobStore,
    };

    const PATH: &str = "2021-03-10/nation/complete/450517ad32.csv";

    async fn leased_store() -> (Arc<ManualClock>, Arc<MemoryBlobStore>, LeaseHandle) {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryBlobStore::new(
            clock.clone(),
            "http://localhost:3000",
            "apiv2cache",
        ));
        store.create_empty(PATH).await.expect("create");
        let lease = store
            .acquire_lease(PATH, Duration::from_secs(15))
            .await
            .expect("lease");
        (clock, store, lease)
    }

    #[tokio::test]
    async fn late_chunks_are_reassembled_in_index_order() {
        let (_, store, lease) = leased_store().await;
        let writer = CacheWriter::new(store.clone(), lease, "newCasesByPublishDate")
            .await
            .expect("writer");

        writer.write_chunk(1, b"b").await.expect("chunk 1");
        writer.write_chunk(0, b"a").await.expect("chunk 0");
        writer.write_chunk(2, b"c").await.expect("chunk 2");
        writer.finish().await.expect("finish");

        assert_eq!(store.download(PATH).await.expect("download"), "abc");
        let tags = store.get_tags(PATH).await.expect("tags");
        assert_eq!(tags.get(TAG_DONE).map(String::as_str), Some("1"));
        assert_eq!(
            tags.get(TAG_METRICS).map(String::as_str),
            Some("newCasesByPublishDate")
        );
        let props = store.get_properties(PATH).await.expect("props");
        assert!(!props.lease.is_locked());
    }

    #[tokio::test]
    async fn gaps_between_indices_are_allowed() {
        let (_, store, lease) = leased_store().await;
        let writer = CacheWriter::new(store.clone(), lease, "m").await.expect("writer");

        writer.write_chunk(7, b"tail").await.expect("chunk");
        writer.write_chunk(3, b"mid-").await.expect("chunk");
        writer.write_chunk(0, b"head-").await.expect("chunk");
        writer.finish().await.expect("finish");

        assert_eq!(store.download(PATH).await.expect("download"), "head-mid-tail");
    }

    #[tokio::test]
    async fn duplicate_index_is_rejected() {
        let (_, store, lease) = leased_store().await;
        let writer = CacheWriter::new(store, lease, "m").await.expect("writer");

        writer.write_chunk(0, b"a").await.expect("chunk");
        assert!(matches!(
            writer.write_chunk(0, b"again").await,
            Err(WriterError::DuplicateChunk { index: 0 })
        ));
    }

    #[tokio::test]
    async fn content_stays_hidden_until_finish() {
        let (_, store, lease) = leased_store().await;
        let writer = CacheWriter::new(store.clone(), lease, "m").await.expect("writer");

        writer.write_chunk(0, b"partial").await.expect("chunk");
        assert!(store.download(PATH).await.expect("download").is_empty());
        assert!(store.get_tags(PATH).await.expect("tags").get(TAG_DONE).is_none());
    }

    #[tokio::test]
    async fn chunk_writes_keep_the_lease_alive() {
        let (clock, store, lease) = leased_store().await;
        let writer = CacheWriter::new(store.clone(), lease, "m").await.expect("writer");

        for index in 0..4 {
            clock.advance(Duration::from_secs(10));
            writer.write_chunk(index, b"x").await.expect("chunk");
        }
        let props = store.get_properties(PATH).await.expect("props");
        assert!(props.lease.is_locked());
    }

    #[tokio::test]
    async fn abort_deletes_the_entry() {
        let (_, store, lease) = leased_store().await;
        let writer = CacheWriter::new(store.clone(), lease, "m").await.expect("writer");

        writer.write_chunk(0, b"a").await.expect("chunk");
        writer.abort().await.expect("abort");
        assert!(!store.exists(PATH).await.expect("exists"));
    }
}
