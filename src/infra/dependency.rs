//! Dependency interceptors: every outbound blob and database call runs inside a
//! `dependency` span and is counted and timed.

use std::{fmt::Display, future::Future, sync::Arc, time::Duration, time::Instant};

use async_trait::async_trait;
use bytes::Bytes;
use metrics::{counter, histogram};
use tracing::{Instrument, debug, info_span};

use crate::{
    application::repos::{
        ParentIndex, QueryPlan, RepoError, SeriesCursor, SeriesPage, SeriesRow, SeriesSource,
    },
    cache::{BlobError, BlobProperties, BlobStore, BlobTags, LeaseHandle},
    domain::request::AreaType,
};

const BLOB_DEPENDENCY: &str = "blob";
const DATABASE_DEPENDENCY: &str = "postgres";

async fn observe<T, E, F>(
    dependency: &'static str,
    action: &'static str,
    target: &str,
    call: F,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    let span = info_span!("dependency", dependency, action, call_target = target);
    let started = Instant::now();
    let result = call.instrument(span).await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
    let success = if result.is_ok() { "true" } else { "false" };

    counter!(
        "ondata_dependency_calls_total",
        "dependency" => dependency,
        "action" => action,
        "success" => success
    )
    .increment(1);
    histogram!(
        "ondata_dependency_latency_ms",
        "dependency" => dependency,
        "action" => action
    )
    .record(elapsed_ms);

    if let Err(err) = &result {
        debug!(
            target = "ondata::infra::dependency",
            dependency,
            action,
            call_target = target,
            elapsed_ms,
            error = %err,
            "dependency call failed"
        );
    }

    result
}

pub struct TracedBlobStore {
    inner: Arc<dyn BlobStore>,
}

impl TracedBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl BlobStore for TracedBlobStore {
    async fn exists(&self, path: &str) -> Result<bool, BlobError> {
        observe(BLOB_DEPENDENCY, "exists", path, self.inner.exists(path)).await
    }

    async fn create_empty(&self, path: &str) -> Result<(), BlobError> {
        observe(
            BLOB_DEPENDENCY,
            "create_empty",
            path,
            self.inner.create_empty(path),
        )
        .await
    }

    async fn upload(
        &self,
        path: &str,
        content: Bytes,
        lease: Option<&LeaseHandle>,
    ) -> Result<(), BlobError> {
        observe(
            BLOB_DEPENDENCY,
            "upload",
            path,
            self.inner.upload(path, content, lease),
        )
        .await
    }

    async fn download(&self, path: &str) -> Result<Bytes, BlobError> {
        observe(BLOB_DEPENDENCY, "download", path, self.inner.download(path)).await
    }

    async fn delete(&self, path: &str, lease: Option<&LeaseHandle>) -> Result<(), BlobError> {
        observe(
            BLOB_DEPENDENCY,
            "delete",
            path,
            self.inner.delete(path, lease),
        )
        .await
    }

    async fn acquire_lease(
        &self,
        path: &str,
        duration: Duration,
    ) -> Result<LeaseHandle, BlobError> {
        observe(
            BLOB_DEPENDENCY,
            "acquire_lease",
            path,
            self.inner.acquire_lease(path, duration),
        )
        .await
    }

    async fn renew_lease(&self, lease: &LeaseHandle) -> Result<(), BlobError> {
        observe(
            BLOB_DEPENDENCY,
            "renew_lease",
            lease.path(),
            self.inner.renew_lease(lease),
        )
        .await
    }

    async fn release_lease(&self, lease: &LeaseHandle) -> Result<(), BlobError> {
        observe(
            BLOB_DEPENDENCY,
            "release_lease",
            lease.path(),
            self.inner.release_lease(lease),
        )
        .await
    }

    async fn get_tags(&self, path: &str) -> Result<BlobTags, BlobError> {
        observe(BLOB_DEPENDENCY, "get_tags", path, self.inner.get_tags(path)).await
    }

    async fn set_tags(
        &self,
        path: &str,
        tags: BlobTags,
        lease: Option<&LeaseHandle>,
    ) -> Result<(), BlobError> {
        observe(
            BLOB_DEPENDENCY,
            "set_tags",
            path,
            self.inner.set_tags(path, tags, lease),
        )
        .await
    }

    async fn get_properties(&self, path: &str) -> Result<BlobProperties, BlobError> {
        observe(
            BLOB_DEPENDENCY,
            "get_properties",
            path,
            self.inner.get_properties(path),
        )
        .await
    }

    fn public_location(&self, path: &str) -> String {
        self.inner.public_location(path)
    }

    async fn health_check(&self) -> Result<(), BlobError> {
        observe(
            BLOB_DEPENDENCY,
            "health_check",
            "",
            self.inner.health_check(),
        )
        .await
    }
}

pub struct TracedSeriesSource {
    inner: Arc<dyn SeriesSource>,
}

impl TracedSeriesSource {
    pub fn new(inner: Arc<dyn SeriesSource>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl SeriesSource for TracedSeriesSource {
    async fn area_ids(
        &self,
        area_type: AreaType,
        area_code: Option<&str>,
    ) -> Result<Vec<i32>, RepoError> {
        observe(
            DATABASE_DEPENDENCY,
            "area_ids",
            area_type.as_str(),
            self.inner.area_ids(area_type, area_code),
        )
        .await
    }

    async fn fetch_batch(
        &self,
        plan: &QueryPlan,
        area_ids: &[i32],
    ) -> Result<Vec<SeriesRow>, RepoError> {
        observe(
            DATABASE_DEPENDENCY,
            "fetch_batch",
            &plan.partition,
            self.inner.fetch_batch(plan, area_ids),
        )
        .await
    }

    async fn fetch_page(
        &self,
        plan: &QueryPlan,
        after: Option<&SeriesCursor>,
        limit: u32,
    ) -> Result<SeriesPage, RepoError> {
        observe(
            DATABASE_DEPENDENCY,
            "fetch_page",
            &plan.partition,
            self.inner.fetch_page(plan, after, limit),
        )
        .await
    }

    async fn exists(&self, plan: &QueryPlan, area_ids: &[i32]) -> Result<bool, RepoError> {
        observe(
            DATABASE_DEPENDENCY,
            "exists",
            &plan.partition,
            self.inner.exists(plan, area_ids),
        )
        .await
    }

    async fn area_parents(&self, area_codes: &[String]) -> Result<ParentIndex, RepoError> {
        observe(
            DATABASE_DEPENDENCY,
            "area_parents",
            "area_relation",
            self.inner.area_parents(area_codes),
        )
        .await
    }

    async fn health_check(&self) -> Result<String, RepoError> {
        observe(
            DATABASE_DEPENDENCY,
            "health_check",
            "",
            self.inner.health_check(),
        )
        .await
    }
}
