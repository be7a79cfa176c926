use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};

use crate::{
    application::repos::{
        AreaParents, ParentIndex, QueryPlan, RepoError, SeriesCursor, SeriesPage, SeriesRow,
        SeriesSource,
    },
    domain::request::{AreaType, QueryKind},
};

use super::{PostgresRepositories, map_sqlx_error};

const SCHEMA: &str = "covid19";
const PLAIN_METRIC: &str = "mr.metric";
/// MSOA payloads are objects; each key becomes a metric suffixed to the stored name.
const EXPANDED_METRIC: &str = "mr.metric || UPPER(LEFT(ts_obj.key, 1)) || RIGHT(ts_obj.key, -1)";
const UNWRAPPED_VALUE: &str =
    "CASE WHEN (ts.payload ? 'value') THEN (ts.payload -> 'value') ELSE ts.payload::JSONB END";

#[derive(sqlx::FromRow)]
struct SeriesRecord {
    area_type: String,
    area_code: String,
    area_name: String,
    date: String,
    metric: String,
    value: Option<Value>,
}

impl From<SeriesRecord> for SeriesRow {
    fn from(record: SeriesRecord) -> Self {
        Self {
            area_type: record.area_type,
            area_code: record.area_code,
            area_name: record.area_name,
            date: record.date,
            metric: record.metric,
            value: record.value.unwrap_or(Value::Null),
        }
    }
}

/// Partition names are derived from validated descriptors; anything else is refused.
fn partition_table(partition: &str) -> Result<String, RepoError> {
    let valid = !partition.is_empty()
        && partition
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(RepoError::InvalidInput {
            message: format!("invalid partition `{partition}`"),
        });
    }
    Ok(format!("{SCHEMA}.time_series_p{partition}"))
}

/// Whether rows come from expanding MSOA object payloads.
fn expands_objects(plan: &QueryPlan) -> bool {
    match plan.kind {
        QueryKind::MsoaObject | QueryKind::MsoaObjectWithAreaCode => true,
        QueryKind::Exists => plan.area_type == AreaType::Msoa,
        QueryKind::Main | QueryKind::NestedArray { .. } => false,
    }
}

fn metric_expr(plan: &QueryPlan) -> &'static str {
    if expands_objects(plan) {
        EXPANDED_METRIC
    } else {
        PLAIN_METRIC
    }
}

fn from_clause(plan: &QueryPlan) -> Result<String, RepoError> {
    let table = partition_table(&plan.partition)?;
    let expansion = if expands_objects(plan) {
        ", JSONB_EACH(ts.payload) AS ts_obj"
    } else {
        ""
    };
    Ok(format!(
        " FROM {table} AS ts \
         JOIN {SCHEMA}.metric_reference AS mr ON mr.id = ts.metric_id \
         JOIN {SCHEMA}.release_reference AS rr ON rr.id = ts.release_id \
         JOIN {SCHEMA}.area_reference AS ar ON ar.id = ts.area_id{expansion}"
    ))
}

fn ordering(plan: &QueryPlan) -> String {
    format!(
        " ORDER BY ts.date DESC, ar.area_code ASC, {} ASC",
        metric_expr(plan)
    )
}

impl PostgresRepositories {
    /// `SELECT ... FROM partition JOIN references WHERE metric/type filters`, ready for more predicates.
    fn select_series<'q>(&self, plan: &'q QueryPlan) -> Result<QueryBuilder<'q, Postgres>, RepoError> {
        let value = match plan.kind {
            QueryKind::NestedArray { .. } => "ts.payload",
            _ if expands_objects(plan) => "ts_obj.value",
            _ => UNWRAPPED_VALUE,
        };

        let mut qb = QueryBuilder::new(format!(
            "SELECT ar.area_type AS area_type, ar.area_code AS area_code, \
             ar.area_name AS area_name, ts.date::VARCHAR AS date, {metric} AS metric, \
             {value} AS value{from}",
            metric = metric_expr(plan),
            from = from_clause(plan)?,
        ));
        self.push_filters(&mut qb, plan);
        Ok(qb)
    }

    fn push_filters<'q>(&self, qb: &mut QueryBuilder<'q, Postgres>, plan: &'q QueryPlan) {
        qb.push(" WHERE ");
        qb.push(metric_expr(plan));
        qb.push(" = ANY(");
        qb.push_bind(&plan.metrics);
        qb.push("::VARCHAR[]) AND rr.released IS TRUE AND ar.area_type = ");
        qb.push_bind(plan.area_type.as_str());
        if self.released_only() {
            qb.push(" AND mr.released IS TRUE");
        }
        // MSOA area codes select through the area hierarchy instead; see `push_area_ids`.
        if plan.area_type != AreaType::Msoa {
            if let Some(code) = plan.area_code.as_ref() {
                qb.push(" AND ar.area_code = ");
                qb.push_bind(code);
            }
        }
    }

    /// Restricts rows to the given areas, or for MSOA requests with an area
    /// code, to those areas and the MSOAs they contain.
    fn push_area_ids<'q>(qb: &mut QueryBuilder<'q, Postgres>, plan: &QueryPlan, area_ids: &'q [i32]) {
        qb.push(" AND (ts.area_id = ANY(");
        qb.push_bind(area_ids);
        qb.push("::INT[])");
        if plan.area_type == AreaType::Msoa && plan.area_code.is_some() {
            qb.push(format!(
                " OR ts.area_id IN (SELECT child_id FROM {SCHEMA}.area_relation WHERE parent_id = ANY("
            ));
            qb.push_bind(area_ids);
            qb.push("::INT[]))");
        }
        qb.push(")");
    }

    async fn fetch_rows(&self, mut qb: QueryBuilder<'_, Postgres>) -> Result<Vec<SeriesRow>, RepoError> {
        let records = qb
            .build_query_as::<SeriesRecord>()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(records.into_iter().map(SeriesRow::from).collect())
    }
}

#[async_trait]
impl SeriesSource for PostgresRepositories {
    async fn area_ids(
        &self,
        area_type: AreaType,
        area_code: Option<&str>,
    ) -> Result<Vec<i32>, RepoError> {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "SELECT MIN(id) AS id FROM {SCHEMA}.area_reference WHERE "
        ));
        match area_code {
            Some(code) if area_type == AreaType::Msoa => {
                qb.push("area_code = ");
                qb.push_bind(code);
            }
            Some(code) => {
                qb.push("area_type = ");
                qb.push_bind(area_type.as_str());
                qb.push(" AND area_code = ");
                qb.push_bind(code);
            }
            None => {
                qb.push("area_type = ");
                qb.push_bind(area_type.as_str());
            }
        }
        qb.push(" GROUP BY area_code ORDER BY area_code");

        let ids: Vec<(Option<i32>,)> = qb
            .build_query_as()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(ids.into_iter().filter_map(|(id,)| id).collect())
    }

    async fn fetch_batch(
        &self,
        plan: &QueryPlan,
        area_ids: &[i32],
    ) -> Result<Vec<SeriesRow>, RepoError> {
        let mut qb = self.select_series(plan)?;
        Self::push_area_ids(&mut qb, plan, area_ids);
        qb.push(ordering(plan));
        self.fetch_rows(qb).await
    }

    async fn fetch_page(
        &self,
        plan: &QueryPlan,
        after: Option<&SeriesCursor>,
        limit: u32,
    ) -> Result<SeriesPage, RepoError> {
        let mut qb = self.select_series(plan)?;
        if let Some(cursor) = after {
            qb.push(" AND (ts.date < ");
            qb.push_bind(&cursor.date);
            qb.push("::DATE OR (ts.date = ");
            qb.push_bind(&cursor.date);
            qb.push(format!("::DATE AND (ar.area_code, {}) > (", metric_expr(plan)));
            qb.push_bind(&cursor.area_code);
            qb.push(", ");
            qb.push_bind(&cursor.metric);
            qb.push(")))");
        }
        qb.push(ordering(plan));
        qb.push(" LIMIT ");
        qb.push_bind(i64::from(limit));

        let rows = self.fetch_rows(qb).await?;
        let next = if rows.len() == limit as usize {
            rows.last().map(SeriesCursor::after)
        } else {
            None
        };
        Ok(SeriesPage { rows, next })
    }

    async fn exists(&self, plan: &QueryPlan, area_ids: &[i32]) -> Result<bool, RepoError> {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT 1 AS found{}", from_clause(plan)?));
        self.push_filters(&mut qb, plan);
        Self::push_area_ids(&mut qb, plan, area_ids);
        qb.push(" FETCH FIRST 1 ROW ONLY");

        let found: Option<(i32,)> = qb
            .build_query_as()
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(found.is_some())
    }

    async fn area_parents(&self, area_codes: &[String]) -> Result<ParentIndex, RepoError> {
        let mut index = ParentIndex::new();
        if area_codes.is_empty() {
            return Ok(index);
        }

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "WITH RECURSIVE ancestry (child_code, parent_id) AS ( \
               SELECT child.area_code, rel.parent_id \
               FROM {SCHEMA}.area_reference AS child \
               JOIN {SCHEMA}.area_relation AS rel ON rel.child_id = child.id \
               WHERE child.area_code = ANY("
        ));
        qb.push_bind(area_codes);
        qb.push(format!(
            "::VARCHAR[]) \
             UNION \
               SELECT ancestry.child_code, rel.parent_id \
               FROM ancestry \
               JOIN {SCHEMA}.area_relation AS rel ON rel.child_id = ancestry.parent_id \
             ) \
             SELECT ancestry.child_code, parent.area_type, parent.area_code, parent.area_name \
             FROM ancestry \
             JOIN {SCHEMA}.area_reference AS parent ON parent.id = ancestry.parent_id \
             WHERE parent.area_type IN ('region', 'utla', 'ltla')"
        ));

        let rows: Vec<(String, String, String, String)> = qb
            .build_query_as()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        for (child, parent_type, code, name) in rows {
            if let Ok(parent_type) = AreaType::from_str(&parent_type) {
                index
                    .entry(child)
                    .or_insert_with(AreaParents::default)
                    .assign(parent_type, code, name);
            }
        }
        Ok(index)
    }

    async fn health_check(&self) -> Result<String, RepoError> {
        let (now,): (String,) = sqlx::query_as("SELECT NOW()::TEXT")
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(now)
    }
}
