//! The data request pipeline: descriptor, cache resolution, production, fan-out.

use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    application::{
        error::AppError,
        producer::{ChunkStream, Heartbeat, ResultProducer},
    },
    cache::{
        BlobError, BlobStore, CacheCoordinator, CacheKey, CacheWriter, LeaseHandle, Resolution,
    },
    domain::request::{RequestDescriptor, RequestMethod, RequestParams},
};

pub type BodyStream = BoxStream<'static, Result<Bytes, AppError>>;

pub enum DataBody {
    /// The finished entry lives elsewhere; send the client there.
    Redirect(String),
    Inline(Bytes),
    Stream(BodyStream),
    /// Headers only, for `HEAD` requests that match data.
    Empty,
}

impl std::fmt::Debug for DataBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataBody::Redirect(location) => f.debug_tuple("Redirect").field(location).finish(),
            DataBody::Inline(bytes) => f.debug_tuple("Inline").field(&bytes.len()).finish(),
            DataBody::Stream(_) => f.write_str("Stream"),
            DataBody::Empty => f.write_str("Empty"),
        }
    }
}

#[derive(Debug)]
pub struct DataResponse {
    pub descriptor: RequestDescriptor,
    pub body: DataBody,
}

#[derive(Clone)]
pub struct DataService {
    cache: Arc<CacheCoordinator>,
    producer: ResultProducer,
}

impl DataService {
    pub fn new(cache: Arc<CacheCoordinator>, producer: ResultProducer) -> Self {
        Self { cache, producer }
    }

    pub fn producer(&self) -> &ResultProducer {
        &self.producer
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        self.cache.store()
    }

    pub async fn handle(
        &self,
        params: &RequestParams,
        method: RequestMethod,
    ) -> Result<DataResponse, AppError> {
        let descriptor = RequestDescriptor::from_params(params, method)?;

        if method == RequestMethod::Head {
            return if self.producer.exists(&descriptor).await? {
                Ok(DataResponse {
                    descriptor,
                    body: DataBody::Empty,
                })
            } else {
                Err(AppError::NotAvailable)
            };
        }

        let config = self.cache.config();
        if !config.enabled {
            let body = self.compute_directly(&descriptor).await?;
            return Ok(DataResponse { descriptor, body });
        }

        let key = CacheKey::derive(&descriptor, config.key_metric_order)?;
        let body = match self.cache.resolve(&key).await? {
            Resolution::ServeFromCache(bytes) => DataBody::Inline(bytes),
            Resolution::Redirect(location) => DataBody::Redirect(location),
            Resolution::Fallback => self.compute_directly(&descriptor).await?,
            Resolution::BecomeProducer(lease) => self.produce_and_cache(&descriptor, lease).await?,
        };

        Ok(DataResponse { descriptor, body })
    }

    async fn compute_directly(&self, descriptor: &RequestDescriptor) -> Result<DataBody, AppError> {
        let chunks = self.producer.produce(descriptor).await?;
        let body = chunks.map(|item| item.map(|chunk| chunk.bytes).map_err(AppError::from));
        Ok(DataBody::Stream(Box::pin(body)))
    }

    /// Streams to the client while a detached task persists the same chunks.
    async fn produce_and_cache(
        &self,
        descriptor: &RequestDescriptor,
        lease: LeaseHandle,
    ) -> Result<DataBody, AppError> {
        let heartbeat = LeaseHeartbeat {
            store: self.store().as_ref(),
            lease: &lease,
        };
        let chunks = match self.producer.produce_with(descriptor, Some(&heartbeat)).await {
            Ok(chunks) => chunks,
            Err(err) => {
                self.discard(&lease).await;
                return Err(err.into());
            }
        };

        let writer = match CacheWriter::new(
            Arc::clone(self.store()),
            lease.clone(),
            descriptor.metrics.tag_value(),
        )
        .await
        {
            Ok(writer) => writer,
            Err(err) => {
                self.discard(&lease).await;
                return Err(err.into());
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let span = info_span!("cache_fill", cache_path = lease.path());
        tokio::spawn(fill(chunks, writer, tx).instrument(span));

        let body = stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
        Ok(DataBody::Stream(Box::pin(body)))
    }

    async fn discard(&self, lease: &LeaseHandle) {
        match self.store().delete(lease.path(), Some(lease)).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => warn!(
                target = "ondata::application::data",
                cache_path = lease.path(),
                error = %err,
                "failed to remove unproduced entry; it will be reclaimed after the lease lapses"
            ),
        }
    }
}

/// Renews the producer's lease while no chunk has been written yet.
struct LeaseHeartbeat<'a> {
    store: &'a dyn BlobStore,
    lease: &'a LeaseHandle,
}

#[async_trait]
impl Heartbeat for LeaseHeartbeat<'_> {
    async fn beat(&self) -> Result<(), BlobError> {
        self.store.renew_lease(self.lease).await
    }
}

/// Drives production to completion, forwarding chunks to the client while it listens.
async fn fill(
    mut chunks: ChunkStream,
    writer: CacheWriter,
    tx: mpsc::UnboundedSender<Result<Bytes, AppError>>,
) {
    let mut listening = true;

    while let Some(item) = chunks.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(err) => {
                error!(
                    target = "ondata::application::data",
                    error = %err,
                    "production failed; discarding partial entry"
                );
                abandon(writer).await;
                if listening {
                    let _ = tx.send(Err(err.into()));
                }
                return;
            }
        };

        if let Err(err) = writer.write_chunk(chunk.index, &chunk.bytes).await {
            error!(
                target = "ondata::application::data",
                index = chunk.index,
                error = %err,
                "cache write failed; discarding partial entry"
            );
            abandon(writer).await;
            if listening {
                let _ = tx.send(Err(err.into()));
            }
            return;
        }

        if listening && tx.send(Ok(chunk.bytes)).is_err() {
            listening = false;
            debug!(
                target = "ondata::application::data",
                "client went away; continuing to fill the cache"
            );
        }
    }

    let path = writer.path().to_string();
    match writer.finish().await {
        Ok(size) => info!(
            target = "ondata::application::data",
            cache_path = %path,
            size,
            "cache entry completed"
        ),
        Err(err) => error!(
            target = "ondata::application::data",
            cache_path = %path,
            error = %err,
            "failed to complete cache entry"
        ),
    }
}

async fn abandon(writer: CacheWriter) {
    let path = writer.path().to_string();
    if let Err(err) = writer.abort().await {
        warn!(
            target = "ondata::application::data",
            cache_path = %path,
            error = %err,
            "failed to delete partial entry"
        );
    }
}
