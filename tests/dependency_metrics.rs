mod support;

use std::{collections::HashSet, sync::Arc};

use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use once_cell::sync::Lazy;
use ondata::{
    application::{
        data::DataService,
        producer::{ProducerConfig, ResultProducer},
        repos::SeriesSource,
    },
    cache::{BlobStore, CacheConfig, CacheCoordinator, MemoryBlobStore, TokioClock},
    infra::{
        dependency::{TracedBlobStore, TracedSeriesSource},
        http::{HttpState, build_router},
    },
};
use serial_test::serial;
use tower::ServiceExt;

use support::{CONTAINER, MemorySource, PUBLIC_BASE_URL, nation_rows};

static SNAPSHOTTER: Lazy<Snapshotter> = Lazy::new(|| {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    snapshotter
});

fn traced_router() -> axum::Router {
    let store: Arc<dyn BlobStore> = Arc::new(TracedBlobStore::new(Arc::new(
        MemoryBlobStore::new(Arc::new(TokioClock), PUBLIC_BASE_URL, CONTAINER),
    )));
    let source: Arc<dyn SeriesSource> = Arc::new(TracedSeriesSource::new(Arc::new(
        MemorySource::new(nation_rows()),
    )));
    let coordinator = Arc::new(CacheCoordinator::new(
        store.clone(),
        Arc::new(TokioClock),
        CacheConfig::default(),
    ));
    let producer = ResultProducer::new(source.clone(), ProducerConfig::default());

    build_router(HttpState {
        data: Arc::new(DataService::new(coordinator, producer)),
        store,
        source,
        public_url: "https://api.example.org".to_string(),
        container: CONTAINER.to_string(),
    })
}

async fn get(router: &axum::Router, uri: &str) -> StatusCode {
    let request = Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request should build");
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    let status = response.status();
    to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should collect");
    status
}

#[tokio::test]
#[serial]
async fn served_requests_emit_cache_and_dependency_metrics() {
    let snapshotter = &*SNAPSHOTTER;
    let router = traced_router();
    let uri = "/api/v2/data?areaType=nation&release=2021-03-10&metric=newCasesByPublishDate&format=csv";

    assert_eq!(get(&router, uri).await, StatusCode::OK);
    assert_eq!(get(&router, uri).await, StatusCode::TEMPORARY_REDIRECT);

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "ondata_cache_resolve_total",
        "ondata_cache_wait_cycles",
        "ondata_dependency_calls_total",
        "ondata_dependency_latency_ms",
        "ondata_producer_chunks_total",
    ];
    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}

#[tokio::test]
#[serial]
async fn dependency_calls_are_labelled_by_outcome() {
    let snapshotter = &*SNAPSHOTTER;
    let router = traced_router();

    let missing = format!("/downloads/{CONTAINER}/2021-03-10/nation/complete/absent.csv");
    assert_eq!(get(&router, &missing).await, StatusCode::NOT_FOUND);

    let failed_lookups = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(composite_key, _, _, _)| {
            let key = composite_key.key();
            key.name() == "ondata_dependency_calls_total"
                && key
                    .labels()
                    .any(|label| label.key() == "action" && label.value() == "get_tags")
                && key
                    .labels()
                    .any(|label| label.key() == "success" && label.value() == "false")
        })
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(count) => count,
            _ => 0,
        })
        .sum::<u64>();
    assert!(failed_lookups >= 1);
}
