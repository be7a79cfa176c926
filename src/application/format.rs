//! Response formatting: long-format rows in, CSV / JSON / JSONL text out.
//!
//! Rows arrive one per (area, date, metric). The formatter pivots them into one
//! record per (area, date), newest date first, then area code ascending.
//! MSOA records are led by their enclosing region, UTLA and LTLA.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
    fmt::Write as _,
};

use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    application::repos::{AreaParents, ParentIndex, SeriesRow},
    domain::{
        error::DomainError,
        metrics::{self, MetricKind},
        request::{AreaType, QueryKind, RequestDescriptor, ResponseFormat},
    },
};

const CSV_BASE_COLUMNS: [&str; 4] = ["areaCode", "areaName", "areaType", "date"];
const JSON_ENVELOPE_PREFIX: &str = "{\"body\":[";
const JSON_ENVELOPE_SUFFIX: &str = "]}";

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("failed to encode JSON value: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to write output: {0}")]
    Write(#[from] std::fmt::Error),
}

/// A pivoted record: one area on one date.
struct Record<'a> {
    area_type: &'a str,
    area_code: &'a str,
    area_name: &'a str,
    date: &'a str,
    values: HashMap<&'a str, &'a Value>,
}

type RecordKey<'a> = (Reverse<&'a str>, &'a str);

#[derive(Debug, Clone)]
pub struct ResponseFormatter {
    format: ResponseFormat,
    metrics: Vec<String>,
    nested: Option<String>,
    with_parents: bool,
}

impl ResponseFormatter {
    pub fn for_descriptor(descriptor: &RequestDescriptor) -> Result<Self, DomainError> {
        let nested = match descriptor.query_kind()? {
            QueryKind::NestedArray { metric } => Some(metric),
            _ => None,
        };
        Ok(Self {
            format: descriptor.format,
            metrics: descriptor.db_metrics(),
            nested,
            with_parents: descriptor.area_type == AreaType::Msoa,
        })
    }

    pub fn format(&self) -> ResponseFormat {
        self.format
    }

    /// Whether records carry parent geography columns.
    pub fn needs_parents(&self) -> bool {
        self.with_parents
    }

    /// Opening bytes of the whole response, before the first batch.
    pub fn prefix(&self) -> &'static str {
        if self.format.is_enveloped() {
            JSON_ENVELOPE_PREFIX
        } else {
            ""
        }
    }

    /// Bytes placed between two non-empty batches.
    pub fn separator(&self) -> &'static str {
        if self.format.is_enveloped() { "," } else { "" }
    }

    /// Closing bytes of the whole response.
    pub fn suffix(&self) -> &'static str {
        if self.format.is_enveloped() {
            JSON_ENVELOPE_SUFFIX
        } else {
            ""
        }
    }

    /// Formats one batch. JSON output carries no surrounding brackets.
    /// `parents` is consulted only when [`Self::needs_parents`] holds.
    pub fn format_batch(
        &self,
        rows: &[SeriesRow],
        parents: &ParentIndex,
        include_header: bool,
    ) -> Result<String, FormatError> {
        let records = pivot(rows);
        let mut out = String::new();

        match (self.format, self.nested.as_deref()) {
            (ResponseFormat::Csv, None) => {
                if include_header {
                    self.write_csv_header(&mut out, &self.metrics)?;
                }
                for record in records.values() {
                    self.write_csv_lead(&mut out, record, parents)?;
                    for metric in &self.metrics {
                        out.push(',');
                        let value = record.values.get(metric.as_str()).copied();
                        out.push_str(&csv_field(&csv_value(metric, value)));
                    }
                    out.push('\n');
                }
            }
            (ResponseFormat::Csv, Some(nested)) => {
                self.write_nested_csv(&mut out, nested, &records, parents, include_header)?;
            }
            (format, _) => {
                let objects = records
                    .values()
                    .map(|record| self.json_object(record, parents))
                    .collect::<Result<Vec<_>, _>>()?;
                if format == ResponseFormat::Jsonl {
                    for object in objects {
                        out.push_str(&object);
                        out.push('\n');
                    }
                } else {
                    out.push_str(&objects.join(","));
                }
            }
        }

        Ok(out)
    }

    /// One CSV row per element of the nested array.
    fn write_nested_csv(
        &self,
        out: &mut String,
        metric: &str,
        records: &BTreeMap<RecordKey<'_>, Record<'_>>,
        parents: &ParentIndex,
        include_header: bool,
    ) -> Result<(), FormatError> {
        let fields: Vec<String> = match metrics::nested_fields(metric) {
            Some(fields) => fields.iter().map(|f| f.to_string()).collect(),
            None => discover_fields(metric, records),
        };

        if include_header {
            self.write_csv_header(out, &fields)?;
        }

        for record in records.values() {
            let Some(Value::Array(elements)) = record.values.get(metric).copied() else {
                continue;
            };
            for element in elements {
                self.write_csv_lead(out, record, parents)?;
                for field in &fields {
                    out.push(',');
                    out.push_str(&csv_field(&csv_scalar(element.get(field))));
                }
                out.push('\n');
            }
        }
        Ok(())
    }

    fn parents_of<'p>(
        &self,
        record: &Record<'_>,
        parents: &'p ParentIndex,
    ) -> Option<&'p AreaParents> {
        parents.get(record.area_code)
    }

    fn json_object(
        &self,
        record: &Record<'_>,
        parents: &ParentIndex,
    ) -> Result<String, FormatError> {
        let mut object = Map::new();
        if self.with_parents {
            let values = self
                .parents_of(record, parents)
                .map(AreaParents::values)
                .unwrap_or_default();
            for (column, value) in AreaParents::COLUMNS.iter().zip(values) {
                object.insert((*column).to_string(), value.map_or(Value::Null, Value::from));
            }
        }
        object.insert("areaType".to_string(), Value::from(record.area_type));
        object.insert("areaCode".to_string(), Value::from(record.area_code));
        object.insert("areaName".to_string(), Value::from(record.area_name));
        object.insert("date".to_string(), Value::from(record.date));

        let columns: Vec<&str> = match self.nested.as_deref() {
            Some(nested) => vec![nested],
            None => self.metrics.iter().map(String::as_str).collect(),
        };
        for metric in columns {
            let value = json_value(metric, record.values.get(metric).copied());
            object.insert(metric.to_string(), value);
        }

        Ok(serde_json::to_string(&object)?)
    }

    fn write_csv_header(&self, out: &mut String, columns: &[String]) -> Result<(), FormatError> {
        let parent_columns: &[&str] = if self.with_parents {
            &AreaParents::COLUMNS
        } else {
            &[]
        };
        let header: Vec<String> = parent_columns
            .iter()
            .chain(CSV_BASE_COLUMNS.iter())
            .map(csv_field)
            .chain(columns.iter().map(csv_field))
            .collect();
        writeln!(out, "{}", header.join(","))?;
        Ok(())
    }

    /// Parent columns when applicable, then the base columns, without a trailing comma.
    fn write_csv_lead(
        &self,
        out: &mut String,
        record: &Record<'_>,
        parents: &ParentIndex,
    ) -> Result<(), FormatError> {
        if self.with_parents {
            let values = self
                .parents_of(record, parents)
                .map(AreaParents::values)
                .unwrap_or_default();
            for value in values {
                out.push_str(&csv_field(value.unwrap_or_default()));
                out.push(',');
            }
        }
        write!(
            out,
            "{},{},{},{}",
            csv_field(record.area_code),
            csv_field(record.area_name),
            csv_field(record.area_type),
            csv_field(record.date)
        )?;
        Ok(())
    }
}

fn pivot(rows: &[SeriesRow]) -> BTreeMap<RecordKey<'_>, Record<'_>> {
    let mut records: BTreeMap<RecordKey<'_>, Record<'_>> = BTreeMap::new();
    for row in rows {
        let record = records
            .entry((Reverse(row.date.as_str()), row.area_code.as_str()))
            .or_insert_with(|| Record {
                area_type: &row.area_type,
                area_code: &row.area_code,
                area_name: &row.area_name,
                date: &row.date,
                values: HashMap::new(),
            });
        record.values.entry(row.metric.as_str()).or_insert(&row.value);
    }
    records
}

/// Union of element keys, in first-seen order, for nested metrics without a published structure.
fn discover_fields(metric: &str, records: &BTreeMap<RecordKey<'_>, Record<'_>>) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    for record in records.values() {
        if let Some(Value::Array(elements)) = record.values.get(metric).copied() {
            for element in elements {
                if let Value::Object(map) = element {
                    for key in map.keys() {
                        if !fields.contains(key) {
                            fields.push(key.clone());
                        }
                    }
                }
            }
        }
    }
    fields
}

fn is_null(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text == "null",
        Value::Number(number) => number.as_f64().is_some_and(f64::is_nan),
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim_matches('"').parse().ok(),
        _ => None,
    }
}

/// Integral values of integer metrics, or `None` when the value has a fraction.
fn as_integer(value: &Value) -> Option<i64> {
    if let Value::Number(number) = value {
        if let Some(int) = number.as_i64() {
            return Some(int);
        }
    }
    as_number(value)
        .filter(|float| float.fract() == 0.0 && float.abs() < i64::MAX as f64)
        .map(|float| float as i64)
}

fn csv_value(metric: &str, value: Option<&Value>) -> String {
    let Some(value) = value.filter(|value| !is_null(value)) else {
        return String::new();
    };

    match metrics::kind_of(metric) {
        MetricKind::Integer => match as_integer(value) {
            Some(int) => int.to_string(),
            None => csv_scalar(Some(value)),
        },
        MetricKind::Text => match value {
            Value::String(text) => text.trim_matches('"').to_string(),
            other => other.to_string(),
        },
        MetricKind::Float | MetricKind::Nested => csv_scalar(Some(value)),
    }
}

fn csv_scalar(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(value) if is_null(value) => String::new(),
        Some(Value::Number(number)) => match number.as_i64() {
            Some(int) => int.to_string(),
            None => number
                .as_f64()
                .map(|float| format!("{float:.1}"))
                .unwrap_or_default(),
        },
        Some(Value::String(text)) => text.trim_matches('"').to_string(),
        Some(Value::Bool(flag)) => String::from(if *flag { "True" } else { "False" }),
        Some(other) => other.to_string(),
    }
}

fn json_value(metric: &str, value: Option<&Value>) -> Value {
    let Some(value) = value.filter(|value| !is_null(value)) else {
        return Value::Null;
    };

    match metrics::kind_of(metric) {
        MetricKind::Integer => match as_integer(value) {
            Some(int) => Value::from(int),
            None => as_number(value).map(Value::from).unwrap_or(Value::Null),
        },
        MetricKind::Float => match value {
            Value::Number(_) => value.clone(),
            other => as_number(other).map(Value::from).unwrap_or_else(|| other.clone()),
        },
        MetricKind::Text => match value {
            Value::String(text) => Value::String(text.trim_matches('"').to_string()),
            other => other.clone(),
        },
        MetricKind::Nested => value.clone(),
    }
}

/// RFC 4180 quoting: only fields containing a delimiter, quote, or line break are quoted.
fn csv_field(value: impl AsRef<str>) -> String {
    let value = value.as_ref();
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
