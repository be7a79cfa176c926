//! Result production: runs the query pipeline and yields formatted chunks.
//!
//! Two strategies exist. Area types with many areas (and single-area requests)
//! are fetched in fixed-size batches of area identifiers; the rest are read
//! with keyset pagination. Either way `produce` only returns once the first
//! non-empty chunk is in hand, so "no data" is known before a response starts.

use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use metrics::counter;
use thiserror::Error;
use tracing::debug;

use crate::{
    application::{
        format::{FormatError, ResponseFormatter},
        repos::{ParentIndex, QueryPlan, RepoError, SeriesCursor, SeriesRow, SeriesSource},
    },
    cache::BlobError,
    domain::{
        error::DomainError,
        request::{AreaType, RequestDescriptor},
    },
};

const DEFAULT_BATCH_SIZE: usize = 15;
const DEFAULT_PAGE_SIZE: u32 = 10_000;

#[derive(Debug, Error)]
pub enum ProduceError {
    #[error("no data is available for the request")]
    NotAvailable,
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Lease(#[from] BlobError),
}

/// Keeps the caller's claim on the result alive while batches come back empty.
#[async_trait]
pub trait Heartbeat: Send + Sync {
    async fn beat(&self) -> Result<(), BlobError>;
}

/// A formatted slice of the response, tagged with its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u64,
    pub bytes: Bytes,
}

pub type ChunkStream = BoxStream<'static, Result<Chunk, ProduceError>>;

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub batch_size: usize,
    pub page_size: u32,
    pub batched_area_types: Vec<AreaType>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            batched_area_types: vec![
                AreaType::Utla,
                AreaType::Ltla,
                AreaType::NhsTrust,
                AreaType::Msoa,
            ],
        }
    }
}

impl From<&crate::config::ProducerSettings> for ProducerConfig {
    fn from(settings: &crate::config::ProducerSettings) -> Self {
        Self {
            batch_size: settings.batch_size.get() as usize,
            page_size: settings.page_size.get(),
            batched_area_types: settings.batched_area_types.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ResultProducer {
    source: Arc<dyn SeriesSource>,
    config: ProducerConfig,
}

impl ResultProducer {
    pub fn new(source: Arc<dyn SeriesSource>, config: ProducerConfig) -> Self {
        Self { source, config }
    }

    pub fn source(&self) -> &Arc<dyn SeriesSource> {
        &self.source
    }

    fn uses_batches(&self, descriptor: &RequestDescriptor) -> bool {
        descriptor.area_code.is_some()
            || self
                .config
                .batched_area_types
                .contains(&descriptor.area_type)
    }

    pub async fn produce(
        &self,
        descriptor: &RequestDescriptor,
    ) -> Result<ChunkStream, ProduceError> {
        self.produce_with(descriptor, None).await
    }

    /// As [`Self::produce`], beating `heartbeat` after each empty leading batch.
    pub async fn produce_with(
        &self,
        descriptor: &RequestDescriptor,
        heartbeat: Option<&dyn Heartbeat>,
    ) -> Result<ChunkStream, ProduceError> {
        let plan = QueryPlan::from_descriptor(descriptor)?;
        let formatter = ResponseFormatter::for_descriptor(descriptor)?;

        if self.uses_batches(descriptor) {
            self.produce_batched(plan, formatter, heartbeat).await
        } else {
            self.produce_paginated(plan, formatter).await
        }
    }

    /// Whether any row matches the request, without fetching the data.
    pub async fn exists(&self, descriptor: &RequestDescriptor) -> Result<bool, ProduceError> {
        let plan = QueryPlan::from_descriptor(descriptor)?;
        let area_ids = self
            .source
            .area_ids(plan.area_type, plan.area_code.as_deref())
            .await?;
        if area_ids.is_empty() {
            return Ok(false);
        }
        Ok(self.source.exists(&plan, &area_ids).await?)
    }

    async fn produce_batched(
        &self,
        plan: QueryPlan,
        formatter: ResponseFormatter,
        heartbeat: Option<&dyn Heartbeat>,
    ) -> Result<ChunkStream, ProduceError> {
        let area_ids = self
            .source
            .area_ids(plan.area_type, plan.area_code.as_deref())
            .await?;
        let batches: Vec<Vec<i32>> = area_ids
            .chunks(self.config.batch_size.max(1))
            .map(<[i32]>::to_vec)
            .collect();
        let closing_index = batches.len() as u64;
        debug!(
            target = "ondata::application::producer",
            partition = %plan.partition,
            areas = area_ids.len(),
            batches = batches.len(),
            "producing in batches"
        );

        let mut pending = batches.into_iter().enumerate();
        let mut opening = None;
        for (index, ids) in pending.by_ref() {
            let rows = self.source.fetch_batch(&plan, &ids).await?;
            if !rows.is_empty() {
                let chunk =
                    render(self.source.as_ref(), &formatter, index as u64, &rows, true).await?;
                opening = Some(chunk);
                break;
            }
            if let Some(heartbeat) = heartbeat {
                heartbeat.beat().await?;
            }
        }
        let opening = opening.ok_or(ProduceError::NotAvailable)?;
        let remaining: Vec<(usize, Vec<i32>)> = pending.collect();

        let source = Arc::clone(&self.source);
        let stream = stream! {
            yield Ok::<Chunk, ProduceError>(opening);

            for (index, ids) in remaining {
                let rows = match source.fetch_batch(&plan, &ids).await {
                    Ok(rows) => rows,
                    Err(err) => {
                        yield Err(ProduceError::from(err));
                        return;
                    }
                };
                if rows.is_empty() {
                    continue;
                }
                match render(source.as_ref(), &formatter, index as u64, &rows, false).await {
                    Ok(chunk) => yield Ok(chunk),
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }

            if let Some(chunk) = closing(&formatter, closing_index) {
                yield Ok(chunk);
            }
        };

        Ok(Box::pin(stream))
    }

    async fn produce_paginated(
        &self,
        plan: QueryPlan,
        formatter: ResponseFormatter,
    ) -> Result<ChunkStream, ProduceError> {
        let page_size = self.config.page_size.max(1);
        let mut pages = PageCursor::default();
        debug!(
            target = "ondata::application::producer",
            partition = %plan.partition,
            page_size,
            "producing by keyset pages"
        );

        let first = pages
            .next_rows(self.source.as_ref(), &plan, page_size)
            .await?
            .ok_or(ProduceError::NotAvailable)?;
        let opening = render(self.source.as_ref(), &formatter, 0, &first, true).await?;

        let source = Arc::clone(&self.source);
        let stream = stream! {
            yield Ok::<Chunk, ProduceError>(opening);

            let mut index: u64 = 1;
            loop {
                let rows = match pages.next_rows(source.as_ref(), &plan, page_size).await {
                    Ok(Some(rows)) => rows,
                    Ok(None) => break,
                    Err(err) => {
                        yield Err(ProduceError::from(err));
                        return;
                    }
                };
                match render(source.as_ref(), &formatter, index, &rows, false).await {
                    Ok(chunk) => yield Ok(chunk),
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
                index += 1;
            }

            if let Some(chunk) = closing(&formatter, index) {
                yield Ok(chunk);
            }
        };

        Ok(Box::pin(stream))
    }
}

async fn render(
    source: &dyn SeriesSource,
    formatter: &ResponseFormatter,
    index: u64,
    rows: &[SeriesRow],
    first: bool,
) -> Result<Chunk, ProduceError> {
    let parents = if formatter.needs_parents() {
        let mut codes: Vec<String> = rows.iter().map(|row| row.area_code.clone()).collect();
        codes.sort_unstable();
        codes.dedup();
        source.area_parents(&codes).await?
    } else {
        ParentIndex::new()
    };

    let lead = if first {
        formatter.prefix()
    } else {
        formatter.separator()
    };
    let mut body = String::from(lead);
    body.push_str(&formatter.format_batch(rows, &parents, first)?);
    counter!("ondata_producer_chunks_total").increment(1);
    Ok(Chunk {
        index,
        bytes: Bytes::from(body),
    })
}

fn closing(formatter: &ResponseFormatter, index: u64) -> Option<Chunk> {
    let suffix = formatter.suffix();
    (!suffix.is_empty()).then(|| Chunk {
        index,
        bytes: Bytes::from_static(suffix.as_bytes()),
    })
}

/// Keyset pagination state. Rows of the trailing (date, area) group of a page
/// are held back until the next page so a pivoted record never straddles chunks.
#[derive(Debug, Default)]
struct PageCursor {
    after: Option<SeriesCursor>,
    carry: Vec<SeriesRow>,
    finished: bool,
}

impl PageCursor {
    async fn next_rows(
        &mut self,
        source: &dyn SeriesSource,
        plan: &QueryPlan,
        limit: u32,
    ) -> Result<Option<Vec<SeriesRow>>, RepoError> {
        while !self.finished {
            let page = source.fetch_page(plan, self.after.as_ref(), limit).await?;
            let mut rows = std::mem::take(&mut self.carry);
            rows.extend(page.rows);

            match page.next {
                None => {
                    self.finished = true;
                    if !rows.is_empty() {
                        return Ok(Some(rows));
                    }
                }
                Some(next) => {
                    self.after = Some(next);
                    let split = trailing_group_start(&rows);
                    self.carry = rows.split_off(split);
                    if !rows.is_empty() {
                        return Ok(Some(rows));
                    }
                }
            }
        }
        Ok(None)
    }
}

fn trailing_group_start(rows: &[SeriesRow]) -> usize {
    let Some(last) = rows.last() else {
        return 0;
    };
    rows.iter()
        .rposition(|row| row.date != last.date || row.area_code != last.area_code)
        .map_or(0, |position| position + 1)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::TryStreamExt;
    use serde_json::json;
    use tokio::sync::Mutex;

    use super::*;
    use crate::{
        application::repos::{AreaParents, SeriesPage},
        domain::request::{RequestMethod, RequestParams},
    };

    /// Serves fixed batches by call order and a fixed row set for pagination.
    #[derive(Default)]
    struct ScriptedSource {
        area_ids: Vec<i32>,
        batches: Mutex<Vec<Vec<SeriesRow>>>,
        rows: Vec<SeriesRow>,
        batch_calls: Mutex<Vec<Vec<i32>>>,
    }

    #[async_trait]
    impl SeriesSource for ScriptedSource {
        async fn area_ids(
            &self,
            _area_type: AreaType,
            _area_code: Option<&str>,
        ) -> Result<Vec<i32>, RepoError> {
            Ok(self.area_ids.clone())
        }

        async fn fetch_batch(
            &self,
            _plan: &QueryPlan,
            area_ids: &[i32],
        ) -> Result<Vec<SeriesRow>, RepoError> {
            self.batch_calls.lock().await.push(area_ids.to_vec());
            let mut batches = self.batches.lock().await;
            if batches.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(batches.remove(0))
            }
        }

        async fn fetch_page(
            &self,
            _plan: &QueryPlan,
            after: Option<&SeriesCursor>,
            limit: u32,
        ) -> Result<SeriesPage, RepoError> {
            let start = match after {
                Some(cursor) => {
                    self.rows
                        .iter()
                        .position(|row| SeriesCursor::after(row) == *cursor)
                        .map_or(self.rows.len(), |position| position + 1)
                }
                None => 0,
            };
            let rows: Vec<SeriesRow> = self
                .rows
                .iter()
                .skip(start)
                .take(limit as usize)
                .cloned()
                .collect();
            let next = (rows.len() == limit as usize)
                .then(|| rows.last().map(SeriesCursor::after))
                .flatten();
            Ok(SeriesPage { rows, next })
        }

        async fn exists(&self, _plan: &QueryPlan, _area_ids: &[i32]) -> Result<bool, RepoError> {
            Ok(!self.rows.is_empty())
        }

        async fn area_parents(&self, area_codes: &[String]) -> Result<ParentIndex, RepoError> {
            Ok(area_codes
                .iter()
                .map(|code| {
                    let mut parents = AreaParents::default();
                    parents.assign(AreaType::Ltla, format!("L-{code}"), format!("Ltla of {code}"));
                    (code.clone(), parents)
                })
                .collect())
        }

        async fn health_check(&self) -> Result<String, RepoError> {
            Ok("ok".to_string())
        }
    }

    fn row(code: &str, date: &str, metric: &str, value: i64) -> SeriesRow {
        SeriesRow {
            area_type: "ltla".to_string(),
            area_code: code.to_string(),
            area_name: format!("Area {code}"),
            date: date.to_string(),
            metric: metric.to_string(),
            value: json!(value),
        }
    }

    fn descriptor(area_type: &str, format: &str, metrics: &[&str]) -> RequestDescriptor {
        let params = RequestParams {
            area_type: Some(area_type.to_string()),
            release: Some("2021-03-10".to_string()),
            metric: metrics.iter().map(|m| m.to_string()).collect(),
            format: Some(format.to_string()),
            area_code: None,
        };
        RequestDescriptor::from_params(&params, RequestMethod::Get).expect("descriptor")
    }

    async fn collect(stream: ChunkStream) -> Vec<Chunk> {
        stream.try_collect().await.expect("stream")
    }

    fn body(chunks: &[Chunk]) -> String {
        chunks
            .iter()
            .map(|chunk| String::from_utf8_lossy(&chunk.bytes).into_owned())
            .collect()
    }

    #[tokio::test]
    async fn batches_of_fifteen_skip_empty_ones_and_keep_batch_indices() {
        let source = Arc::new(ScriptedSource {
            area_ids: (1..=40).collect(),
            batches: Mutex::new(vec![
                Vec::new(),
                vec![row("E06000001", "2021-03-10", "newCasesByPublishDate", 3)],
                vec![row("E06000002", "2021-03-10", "newCasesByPublishDate", 4)],
            ]),
            ..ScriptedSource::default()
        });
        let producer = ResultProducer::new(source.clone(), ProducerConfig::default());

        let chunks = collect(
            producer
                .produce(&descriptor("ltla", "csv", &["newCasesByPublishDate"]))
                .await
                .expect("produce"),
        )
        .await;

        let calls = source.batch_calls.lock().await;
        assert_eq!(calls.iter().map(Vec::len).collect::<Vec<_>>(), vec![15, 15, 10]);
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(
            body(&chunks),
            "areaCode,areaName,areaType,date,newCasesByPublishDate\n\
             E06000001,Area E06000001,ltla,2021-03-10,3\n\
             E06000002,Area E06000002,ltla,2021-03-10,4\n"
        );
    }

    #[tokio::test]
    async fn json_batches_are_enveloped_and_comma_separated() {
        let source = Arc::new(ScriptedSource {
            area_ids: (1..=30).collect(),
            batches: Mutex::new(vec![
                vec![row("E06000001", "2021-03-10", "newCasesByPublishDate", 3)],
                vec![row("E06000002", "2021-03-10", "newCasesByPublishDate", 4)],
            ]),
            ..ScriptedSource::default()
        });
        let producer = ResultProducer::new(source, ProducerConfig::default());

        let chunks = collect(
            producer
                .produce(&descriptor("ltla", "json", &["newCasesByPublishDate"]))
                .await
                .expect("produce"),
        )
        .await;

        assert_eq!(chunks.last().map(|c| c.index), Some(2));
        let parsed: serde_json::Value =
            serde_json::from_str(&body(&chunks)).expect("valid json document");
        assert_eq!(parsed["body"].as_array().map(Vec::len), Some(2));
    }

    #[derive(Default)]
    struct CountingHeartbeat(AtomicUsize);

    #[async_trait]
    impl Heartbeat for CountingHeartbeat {
        async fn beat(&self) -> Result<(), BlobError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn empty_leading_batches_keep_the_claim_alive() {
        let source = Arc::new(ScriptedSource {
            area_ids: (1..=60).collect(),
            batches: Mutex::new(vec![
                Vec::new(),
                Vec::new(),
                Vec::new(),
                vec![row("E06000001", "2021-03-10", "newCasesByPublishDate", 3)],
            ]),
            ..ScriptedSource::default()
        });
        let producer = ResultProducer::new(source, ProducerConfig::default());
        let heartbeat = CountingHeartbeat::default();

        let chunks = collect(
            producer
                .produce_with(
                    &descriptor("ltla", "csv", &["newCasesByPublishDate"]),
                    Some(&heartbeat),
                )
                .await
                .expect("produce"),
        )
        .await;

        assert_eq!(heartbeat.0.load(Ordering::SeqCst), 3);
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![3]);
    }

    struct FailingHeartbeat;

    #[async_trait]
    impl Heartbeat for FailingHeartbeat {
        async fn beat(&self) -> Result<(), BlobError> {
            Err(BlobError::LeaseLost {
                path: "2021-03-10/ltla/complete/abc.csv".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn lost_claim_stops_production() {
        let source = Arc::new(ScriptedSource {
            area_ids: (1..=30).collect(),
            ..ScriptedSource::default()
        });
        let producer = ResultProducer::new(source.clone(), ProducerConfig::default());

        let result = producer
            .produce_with(
                &descriptor("ltla", "csv", &["newCasesByPublishDate"]),
                Some(&FailingHeartbeat),
            )
            .await;

        assert!(matches!(result, Err(ProduceError::Lease(BlobError::LeaseLost { .. }))));
        assert_eq!(source.batch_calls.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn msoa_chunks_carry_parent_geographies() {
        let metric = "newCasesBySpecimenDateRollingSum";
        let source = Arc::new(ScriptedSource {
            area_ids: (1..=2).collect(),
            batches: Mutex::new(vec![vec![SeriesRow {
                area_type: "msoa".to_string(),
                ..row("E02000001", "2021-03-06", metric, 12)
            }]]),
            ..ScriptedSource::default()
        });
        let producer = ResultProducer::new(source, ProducerConfig::default());

        let chunks = collect(
            producer
                .produce(&descriptor("msoa", "csv", &[metric]))
                .await
                .expect("produce"),
        )
        .await;

        assert_eq!(
            body(&chunks),
            "regionCode,regionName,UtlaCode,UtlaName,LtlaCode,LtlaName,\
             areaCode,areaName,areaType,date,newCasesBySpecimenDateRollingSum\n\
             ,,,,L-E02000001,Ltla of E02000001,E02000001,Area E02000001,msoa,2021-03-06,12\n"
        );
    }

    #[tokio::test]
    async fn all_empty_batches_mean_not_available() {
        let source = Arc::new(ScriptedSource {
            area_ids: (1..=20).collect(),
            ..ScriptedSource::default()
        });
        let producer = ResultProducer::new(source, ProducerConfig::default());

        let result = producer
            .produce(&descriptor("ltla", "csv", &["newCasesByPublishDate"]))
            .await;
        assert!(matches!(result, Err(ProduceError::NotAvailable)));
    }

    #[tokio::test]
    async fn pagination_never_splits_a_record_across_chunks() {
        let rows = vec![
            row("E92000001", "2021-03-10", "cumCasesByPublishDate", 100),
            row("E92000001", "2021-03-10", "newCasesByPublishDate", 10),
            row("S92000003", "2021-03-10", "cumCasesByPublishDate", 50),
            row("S92000003", "2021-03-10", "newCasesByPublishDate", 5),
            row("E92000001", "2021-03-09", "cumCasesByPublishDate", 90),
            row("E92000001", "2021-03-09", "newCasesByPublishDate", 9),
        ];
        let source = Arc::new(ScriptedSource {
            rows,
            ..ScriptedSource::default()
        });
        let config = ProducerConfig {
            page_size: 3,
            ..ProducerConfig::default()
        };
        let producer = ResultProducer::new(source, config);

        let chunks = collect(
            producer
                .produce(&descriptor(
                    "nation",
                    "csv",
                    &["newCasesByPublishDate", "cumCasesByPublishDate"],
                ))
                .await
                .expect("produce"),
        )
        .await;

        assert_eq!(
            body(&chunks),
            "areaCode,areaName,areaType,date,cumCasesByPublishDate,newCasesByPublishDate\n\
             E92000001,Area E92000001,ltla,2021-03-10,100,10\n\
             S92000003,Area S92000003,ltla,2021-03-10,50,5\n\
             E92000001,Area E92000001,ltla,2021-03-09,90,9\n"
        );
        let indices: Vec<u64> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, (0..indices.len() as u64).collect::<Vec<_>>());
    }

    #[test]
    fn trailing_group_is_held_back() {
        let rows = vec![
            row("A", "2021-03-10", "m1", 1),
            row("B", "2021-03-10", "m1", 1),
            row("B", "2021-03-10", "m2", 1),
        ];
        assert_eq!(trailing_group_start(&rows), 1);
        assert_eq!(trailing_group_start(&rows[..1]), 0);
        assert_eq!(trailing_group_start(&[]), 0);
    }
}
