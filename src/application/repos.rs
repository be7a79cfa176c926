//! Repository traits describing the time-series source.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::{
    error::DomainError,
    request::{AreaType, QueryKind, RequestDescriptor},
};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// One long-format value: a metric for an area on a date.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRow {
    pub area_type: String,
    pub area_code: String,
    pub area_name: String,
    pub date: String,
    pub metric: String,
    pub value: Value,
}

/// Keyset position after the last row of a page, in `(date DESC, area_code ASC, metric ASC)` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesCursor {
    pub date: String,
    pub area_code: String,
    pub metric: String,
}

impl SeriesCursor {
    pub fn after(row: &SeriesRow) -> Self {
        Self {
            date: row.date.clone(),
            area_code: row.area_code.clone(),
            metric: row.metric.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SeriesPage {
    pub rows: Vec<SeriesRow>,
    /// `None` once the final page has been returned.
    pub next: Option<SeriesCursor>,
}

/// Region, UTLA and LTLA enclosing an MSOA.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AreaParents {
    pub region_code: Option<String>,
    pub region_name: Option<String>,
    pub utla_code: Option<String>,
    pub utla_name: Option<String>,
    pub ltla_code: Option<String>,
    pub ltla_name: Option<String>,
}

impl AreaParents {
    /// Output columns, in the order they precede the base columns.
    pub const COLUMNS: [&'static str; 6] = [
        "regionCode",
        "regionName",
        "UtlaCode",
        "UtlaName",
        "LtlaCode",
        "LtlaName",
    ];

    pub fn values(&self) -> [Option<&str>; 6] {
        [
            self.region_code.as_deref(),
            self.region_name.as_deref(),
            self.utla_code.as_deref(),
            self.utla_name.as_deref(),
            self.ltla_code.as_deref(),
            self.ltla_name.as_deref(),
        ]
    }

    /// Records one enclosing area by its type; other types are ignored.
    pub fn assign(&mut self, area_type: AreaType, code: String, name: String) {
        let (code_slot, name_slot) = match area_type {
            AreaType::Region => (&mut self.region_code, &mut self.region_name),
            AreaType::Utla => (&mut self.utla_code, &mut self.utla_name),
            AreaType::Ltla => (&mut self.ltla_code, &mut self.ltla_name),
            _ => return,
        };
        *code_slot = Some(code);
        *name_slot = Some(name);
    }
}

/// Parent geographies keyed by child area code.
pub type ParentIndex = HashMap<String, AreaParents>;

/// Everything a source needs to run one request's queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    pub partition: String,
    pub area_type: AreaType,
    pub area_code: Option<String>,
    pub metrics: Vec<String>,
    pub kind: QueryKind,
}

impl QueryPlan {
    pub fn from_descriptor(descriptor: &RequestDescriptor) -> Result<Self, DomainError> {
        Ok(Self {
            partition: descriptor.partition_id(),
            area_type: descriptor.area_type,
            area_code: descriptor.area_code.clone(),
            metrics: descriptor.db_metrics(),
            kind: descriptor.query_kind()?,
        })
    }
}

#[async_trait]
pub trait SeriesSource: Send + Sync {
    /// Area identifiers for an area type, narrowed to one area when a code is given.
    /// For MSOA requests the code may name any enclosing area, so it is matched
    /// regardless of type.
    async fn area_ids(
        &self,
        area_type: AreaType,
        area_code: Option<&str>,
    ) -> Result<Vec<i32>, RepoError>;

    async fn fetch_batch(&self, plan: &QueryPlan, area_ids: &[i32])
    -> Result<Vec<SeriesRow>, RepoError>;

    async fn fetch_page(
        &self,
        plan: &QueryPlan,
        after: Option<&SeriesCursor>,
        limit: u32,
    ) -> Result<SeriesPage, RepoError>;

    async fn exists(&self, plan: &QueryPlan, area_ids: &[i32]) -> Result<bool, RepoError>;

    /// Enclosing region, UTLA and LTLA of each given area code.
    async fn area_parents(&self, area_codes: &[String]) -> Result<ParentIndex, RepoError>;

    /// Returns a short description of the store's health.
    async fn health_check(&self) -> Result<String, RepoError>;
}
