#![allow(dead_code)]

use std::{
    cmp::Reverse,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use axum::Router;
use serde_json::json;
use tokio::sync::watch;

use ondata::{
    application::{
        data::DataService,
        producer::{ProducerConfig, ResultProducer},
        repos::{
            ParentIndex, QueryPlan, RepoError, SeriesCursor, SeriesPage, SeriesRow, SeriesSource,
        },
    },
    cache::{BlobStore, CacheConfig, CacheCoordinator, MemoryBlobStore, TokioClock},
    domain::request::AreaType,
    infra::http::{HttpState, build_router},
};

pub const PUBLIC_BASE_URL: &str = "http://localhost:3000";
pub const CONTAINER: &str = "apiv2cache";

/// Time-series rows held in memory, in `(date DESC, area_code ASC, metric ASC)` order.
pub struct MemorySource {
    rows: Vec<SeriesRow>,
    parents: ParentIndex,
    gate: watch::Receiver<bool>,
    fetches: AtomicUsize,
    /// Row queries beyond this many fail.
    fail_after: Option<usize>,
}

/// Holds every fetch until opened.
pub struct Gate(watch::Sender<bool>);

impl Gate {
    pub fn open(&self) {
        let _ = self.0.send(true);
    }
}

impl MemorySource {
    pub fn new(rows: Vec<SeriesRow>) -> Self {
        let (_, gate) = watch::channel(true);
        Self::with_receiver(rows, gate)
    }

    pub fn gated(rows: Vec<SeriesRow>) -> (Self, Gate) {
        let (tx, rx) = watch::channel(false);
        (Self::with_receiver(rows, rx), Gate(tx))
    }

    /// Serves `successful` row queries, then fails every later one.
    pub fn failing_after(rows: Vec<SeriesRow>, successful: usize) -> Self {
        Self {
            fail_after: Some(successful),
            ..Self::new(rows)
        }
    }

    pub fn with_parents(self, parents: ParentIndex) -> Self {
        Self { parents, ..self }
    }

    fn with_receiver(mut rows: Vec<SeriesRow>, gate: watch::Receiver<bool>) -> Self {
        rows.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        Self {
            rows,
            parents: ParentIndex::new(),
            gate,
            fetches: AtomicUsize::new(0),
            fail_after: None,
        }
    }

    /// Number of row queries served so far.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    async fn pass_gate(&self) -> Result<(), RepoError> {
        let mut gate = self.gate.clone();
        let _ = gate.wait_for(|open| *open).await;
        let served = self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.fail_after {
            Some(limit) if served >= limit => Err(RepoError::from_persistence(
                "canceling statement due to statement timeout",
            )),
            _ => Ok(()),
        }
    }

    fn matching<'a>(&'a self, plan: &'a QueryPlan) -> impl Iterator<Item = &'a SeriesRow> + 'a {
        self.rows.iter().filter(move |row| {
            row.area_type == plan.area_type.as_str()
                && plan.metrics.contains(&row.metric)
                && plan
                    .area_code
                    .as_deref()
                    .is_none_or(|code| code == row.area_code)
        })
    }

    fn codes(&self, area_type: AreaType) -> Vec<String> {
        let mut codes: Vec<String> = self
            .rows
            .iter()
            .filter(|row| row.area_type == area_type.as_str())
            .map(|row| row.area_code.clone())
            .collect();
        codes.sort();
        codes.dedup();
        codes
    }

    fn area_id(&self, area_type: AreaType, code: &str) -> Option<i32> {
        self.codes(area_type)
            .iter()
            .position(|candidate| candidate == code)
            .and_then(|index| i32::try_from(index + 1).ok())
    }
}

fn sort_key(row: &SeriesRow) -> (Reverse<&str>, &str, &str) {
    (Reverse(&row.date), &row.area_code, &row.metric)
}

#[async_trait]
impl SeriesSource for MemorySource {
    async fn area_ids(
        &self,
        area_type: AreaType,
        area_code: Option<&str>,
    ) -> Result<Vec<i32>, RepoError> {
        let codes = self.codes(area_type);
        Ok(codes
            .iter()
            .filter(|code| area_code.is_none_or(|wanted| wanted == code.as_str()))
            .filter_map(|code| self.area_id(area_type, code))
            .collect())
    }

    async fn fetch_batch(
        &self,
        plan: &QueryPlan,
        area_ids: &[i32],
    ) -> Result<Vec<SeriesRow>, RepoError> {
        self.pass_gate().await?;
        Ok(self
            .matching(plan)
            .filter(|row| {
                self.area_id(plan.area_type, &row.area_code)
                    .is_some_and(|id| area_ids.contains(&id))
            })
            .cloned()
            .collect())
    }

    async fn fetch_page(
        &self,
        plan: &QueryPlan,
        after: Option<&SeriesCursor>,
        limit: u32,
    ) -> Result<SeriesPage, RepoError> {
        self.pass_gate().await?;
        let rows: Vec<SeriesRow> = self
            .matching(plan)
            .filter(|row| match after {
                Some(cursor) => {
                    sort_key(row)
                        > (
                            Reverse(cursor.date.as_str()),
                            cursor.area_code.as_str(),
                            cursor.metric.as_str(),
                        )
                }
                None => true,
            })
            .take(limit as usize)
            .cloned()
            .collect();
        let next = if rows.len() == limit as usize {
            rows.last().map(SeriesCursor::after)
        } else {
            None
        };
        Ok(SeriesPage { rows, next })
    }

    async fn exists(&self, plan: &QueryPlan, area_ids: &[i32]) -> Result<bool, RepoError> {
        Ok(self.matching(plan).any(|row| {
            area_ids.is_empty()
                || self
                    .area_id(plan.area_type, &row.area_code)
                    .is_some_and(|id| area_ids.contains(&id))
        }))
    }

    async fn area_parents(&self, area_codes: &[String]) -> Result<ParentIndex, RepoError> {
        Ok(area_codes
            .iter()
            .filter_map(|code| {
                self.parents
                    .get(code)
                    .map(|parents| (code.clone(), parents.clone()))
            })
            .collect())
    }

    async fn health_check(&self) -> Result<String, RepoError> {
        Ok("2021-03-10 16:00:00+00".to_string())
    }
}

pub fn row(area_type: &str, code: &str, name: &str, date: &str, metric: &str, value: i64) -> SeriesRow {
    SeriesRow {
        area_type: area_type.to_string(),
        area_code: code.to_string(),
        area_name: name.to_string(),
        date: date.to_string(),
        metric: metric.to_string(),
        value: json!(value),
    }
}

/// Two nations over two days, new cases by publish date.
pub fn nation_rows() -> Vec<SeriesRow> {
    vec![
        row("nation", "E92000001", "England", "2021-03-10", "newCasesByPublishDate", 5_926),
        row("nation", "S92000003", "Scotland", "2021-03-10", "newCasesByPublishDate", 555),
        row("nation", "E92000001", "England", "2021-03-09", "newCasesByPublishDate", 4_712),
        row("nation", "S92000003", "Scotland", "2021-03-09", "newCasesByPublishDate", 493),
    ]
}

/// One day of new cases for `count` lower-tier authorities, `E06000001` upwards.
pub fn ltla_rows(count: usize) -> Vec<SeriesRow> {
    (1..=count)
        .map(|n| {
            let code = format!("E06{n:06}");
            let name = format!("Authority {n}");
            row("ltla", &code, &name, "2021-03-10", "newCasesByPublishDate", n as i64 * 10)
        })
        .collect()
}

pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryBlobStore>,
    pub source: Arc<MemorySource>,
}

pub fn app(source: MemorySource, cache: CacheConfig) -> TestApp {
    let source = Arc::new(source);
    let store = Arc::new(MemoryBlobStore::new(
        Arc::new(TokioClock),
        PUBLIC_BASE_URL,
        CONTAINER,
    ));
    let blob: Arc<dyn BlobStore> = store.clone();
    let series: Arc<dyn SeriesSource> = source.clone();

    let coordinator = Arc::new(CacheCoordinator::new(
        blob.clone(),
        Arc::new(TokioClock),
        cache,
    ));
    let producer = ResultProducer::new(series.clone(), ProducerConfig::default());
    let data = Arc::new(DataService::new(coordinator, producer));

    let router = build_router(HttpState {
        data,
        store: blob,
        source: series,
        public_url: "https://api.example.org".to_string(),
        container: CONTAINER.to_string(),
    });

    TestApp {
        router,
        store,
        source,
    }
}
